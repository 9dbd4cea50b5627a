//! A backend that fabricates media instead of reading it.
//!
//! Sources are registered by path with their duration and track layout. Video
//! samples carry the index of the source frame, so the output written to the
//! muxer tells which source frame every output frame came from. Faults can be
//! injected to exercise error paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::{Demuxer, MediaBackend, Muxer};
use crate::codec::{BufferedCodec, Codec, Payload, Transform};
use crate::media::{
    BufferFlags, EncoderCapabilities, MICROS_PER_SECOND, MediaFormat, Sample, SourceInfo, TrackKind,
    VideoFrame,
};
use crate::surface::FrameRenderer;

#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub rotation: i32,
}

#[derive(Debug, Clone)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: Option<u64>,
    /// Duration covered by one demuxed chunk.
    pub chunk_us: i64,
    pub chunk_bytes: usize,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            bitrate: Some(128_000),
            chunk_us: 23_220,
            chunk_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub duration_us: i64,
    pub bitrate: Option<u64>,
    pub video: Option<SyntheticVideo>,
    pub audio: Option<SyntheticAudio>,
    /// Slows every demuxed sample down, to keep a job running for a while.
    pub sample_delay: Duration,
}

impl SyntheticSource {
    /// A source with a video track only.
    pub fn video(duration_us: i64, fps: f64, width: u32, height: u32, bitrate: u64) -> Self {
        Self {
            duration_us,
            bitrate: Some(bitrate),
            video: Some(SyntheticVideo {
                fps,
                width,
                height,
                rotation: 0,
            }),
            audio: None,
            sample_delay: Duration::ZERO,
        }
    }

    /// A source with an audio track only.
    pub fn audio(duration_us: i64, bitrate: u64, audio: SyntheticAudio) -> Self {
        Self {
            duration_us,
            bitrate: Some(bitrate),
            video: None,
            audio: Some(audio),
            sample_delay: Duration::ZERO,
        }
    }

    pub fn with_audio(mut self, audio: SyntheticAudio) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_rotation(mut self, rotation: i32) -> Self {
        if let Some(video) = self.video.as_mut() {
            video.rotation = rotation;
        }
        self
    }

    pub fn with_sample_delay(mut self, delay: Duration) -> Self {
        self.sample_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The encoder of this track refuses its configuration.
    EncoderConfigure(TrackKind),
    /// The decoder of this track fails on the sample with this index.
    DecodeAt(TrackKind, usize),
}

/// What the backend observed, for assertions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyntheticStats {
    pub demuxers_opened: usize,
    pub decoders_created: usize,
    pub encoders_created: usize,
    pub codecs_released: usize,
    pub frames_rendered: usize,
    pub muxers_created: usize,
    pub muxers_started: usize,
    /// Output time and source frame index of every written video sample.
    pub video_samples: Vec<(i64, u64)>,
    pub audio_samples: Vec<i64>,
}

impl SyntheticStats {
    pub fn codecs_created(&self) -> usize {
        self.decoders_created + self.encoders_created
    }
}

#[derive(Default)]
struct Shared {
    sources: HashMap<PathBuf, SyntheticSource>,
    faults: Vec<Fault>,
    capabilities: EncoderCapabilities,
    stats: SyntheticStats,
}

#[derive(Clone, Default)]
pub struct SyntheticBackend {
    shared: Arc<Mutex<Shared>>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, path: impl Into<PathBuf>, source: SyntheticSource) {
        self.shared.lock().sources.insert(path.into(), source);
    }

    pub fn inject(&self, fault: Fault) {
        self.shared.lock().faults.push(fault);
    }

    pub fn set_capabilities(&self, capabilities: EncoderCapabilities) {
        self.shared.lock().capabilities = capabilities;
    }

    pub fn stats(&self) -> SyntheticStats {
        self.shared.lock().stats.clone()
    }

    fn source(&self, path: &Path) -> anyhow::Result<SyntheticSource> {
        self.shared
            .lock()
            .sources
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("{}: no such source", path.display()))
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.shared.lock().faults.contains(&fault)
    }

    fn decode_fault(&self, kind: TrackKind) -> Option<usize> {
        self.shared.lock().faults.iter().find_map(|fault| match fault {
            Fault::DecodeAt(faulty, index) if *faulty == kind => Some(*index),
            _ => None,
        })
    }
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn probe(&self, path: &Path) -> anyhow::Result<SourceInfo> {
        let source = self.source(path)?;
        let size_bytes = source
            .bitrate
            .map(|bitrate| (bitrate as i128 * source.duration_us as i128 / 8 / MICROS_PER_SECOND as i128) as u64)
            .unwrap_or_default();
        let video = source.video.as_ref();
        Ok(SourceInfo {
            path: path.to_path_buf(),
            duration_us: source.duration_us,
            bitrate: source.bitrate,
            frame_rate: video.map(|video| video.fps),
            width: video.map(|video| video.width).unwrap_or_default(),
            height: video.map(|video| video.height).unwrap_or_default(),
            rotation: video.map(|video| video.rotation).unwrap_or_default(),
            size_bytes,
            has_video: source.video.is_some(),
            has_audio: source.audio.is_some(),
        })
    }

    fn open_demuxer(&self, path: &Path, kind: TrackKind) -> anyhow::Result<Option<Box<dyn Demuxer>>> {
        let source = self.source(path)?;
        let demuxer = match kind {
            TrackKind::Video => source.video.as_ref().map(|video| SyntheticDemuxer {
                format: MediaFormat::video("synthetic-video", video.width, video.height)
                    .with_frame_rate(video.fps)
                    .with_duration(source.duration_us)
                    .with_rotation(video.rotation),
                samples_per_second: video.fps.max(1.0),
                chunk_bytes: 8,
                duration_us: source.duration_us,
                index: 0,
                delay: source.sample_delay,
            }),
            TrackKind::Audio => source.audio.as_ref().map(|audio| {
                let mut format = MediaFormat::audio(
                    "synthetic-audio",
                    Some(audio.sample_rate),
                    Some(audio.channels),
                )
                .with_duration(source.duration_us);
                format.bitrate = audio.bitrate;
                SyntheticDemuxer {
                    format,
                    samples_per_second: MICROS_PER_SECOND as f64 / audio.chunk_us.max(1) as f64,
                    chunk_bytes: audio.chunk_bytes,
                    duration_us: source.duration_us,
                    index: 0,
                    delay: source.sample_delay,
                }
            }),
        };
        let Some(demuxer) = demuxer else {
            return Ok(None);
        };
        self.shared.lock().stats.demuxers_opened += 1;
        Ok(Some(Box::new(demuxer)))
    }

    fn create_decoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>> {
        self.shared.lock().stats.decoders_created += 1;
        let transform = SyntheticDecoder {
            kind: format.kind,
            fail_at: self.decode_fault(format.kind),
            decoded: 0,
            backend: self.clone(),
        };
        Ok(Box::new(BufferedCodec::new(
            format!("synthetic-{}-decoder", format.kind),
            Box::new(transform),
        )))
    }

    fn create_encoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>> {
        self.shared.lock().stats.encoders_created += 1;
        let transform = SyntheticEncoder {
            kind: format.kind,
            refuse: self.has_fault(Fault::EncoderConfigure(format.kind)),
            config_sent: false,
            backend: self.clone(),
        };
        Ok(Box::new(BufferedCodec::new(
            format!("synthetic-{}-encoder", format.kind),
            Box::new(transform),
        )))
    }

    fn video_encoder_capabilities(&self) -> EncoderCapabilities {
        self.shared.lock().capabilities.clone()
    }

    fn create_renderer(
        &self,
        _source: &MediaFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Box<dyn FrameRenderer>> {
        Ok(Box::new(SyntheticRenderer {
            width,
            height,
            backend: self.clone(),
        }))
    }

    fn create_muxer(&self, path: &Path) -> anyhow::Result<Box<dyn Muxer>> {
        if !path.exists() {
            bail!("{} does not exist", path.display());
        }
        self.shared.lock().stats.muxers_created += 1;
        Ok(Box::new(SyntheticMuxer {
            path: path.to_path_buf(),
            tracks: Vec::new(),
            written: 0,
            backend: self.clone(),
        }))
    }
}

struct SyntheticDemuxer {
    format: MediaFormat,
    samples_per_second: f64,
    chunk_bytes: usize,
    duration_us: i64,
    index: u64,
    delay: Duration,
}

impl Demuxer for SyntheticDemuxer {
    fn format(&self) -> &MediaFormat {
        &self.format
    }

    fn read_sample(&mut self) -> anyhow::Result<Option<Sample>> {
        let pts_us = (self.index as f64 * MICROS_PER_SECOND as f64 / self.samples_per_second).round() as i64;
        if pts_us >= self.duration_us {
            return Ok(None);
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut data = vec![0u8; self.chunk_bytes.max(8)];
        data[..8].copy_from_slice(&self.index.to_le_bytes());
        let flags = if self.index == 0 {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        };
        self.index += 1;
        Ok(Some(Sample::new(data, pts_us, flags)))
    }
}

fn sample_tag(data: &[u8]) -> anyhow::Result<u64> {
    let bytes: [u8; 8] = data
        .get(..8)
        .and_then(|head| head.try_into().ok())
        .context("sample too short to carry a tag")?;
    Ok(u64::from_le_bytes(bytes))
}

struct SyntheticDecoder {
    kind: TrackKind,
    fail_at: Option<usize>,
    decoded: usize,
    backend: SyntheticBackend,
}

impl Transform for SyntheticDecoder {
    fn open(&mut self, format: &MediaFormat) -> anyhow::Result<MediaFormat> {
        Ok(match self.kind {
            TrackKind::Video => MediaFormat::video("raw", format.width, format.height),
            TrackKind::Audio => MediaFormat::audio("pcm_s16le", format.sample_rate, format.channels),
        })
    }

    fn push(&mut self, input: Payload) -> anyhow::Result<Vec<Payload>> {
        let Payload::Sample(sample) = input else {
            bail!("decoder takes samples");
        };
        if self.fail_at == Some(self.decoded) {
            bail!("corrupt {} sample {}", self.kind, self.decoded);
        }
        self.decoded += 1;
        Ok(vec![match self.kind {
            TrackKind::Video => Payload::Frame(VideoFrame {
                width: 0,
                height: 0,
                pts_us: sample.pts_us,
                tag: sample_tag(&sample.data)?,
                data: Bytes::new(),
            }),
            TrackKind::Audio => Payload::Sample(Sample::new(sample.data, sample.pts_us, BufferFlags::NONE)),
        }])
    }

    fn flush(&mut self) -> anyhow::Result<Vec<Payload>> {
        Ok(Vec::new())
    }

    fn close(&mut self) {
        self.backend.shared.lock().stats.codecs_released += 1;
    }
}

struct SyntheticEncoder {
    kind: TrackKind,
    refuse: bool,
    config_sent: bool,
    backend: SyntheticBackend,
}

impl Transform for SyntheticEncoder {
    fn open(&mut self, format: &MediaFormat) -> anyhow::Result<MediaFormat> {
        if self.refuse {
            bail!("{} encoder rejected the configuration", self.kind);
        }
        Ok(match self.kind {
            TrackKind::Video => MediaFormat::video("h264", format.width, format.height),
            TrackKind::Audio => MediaFormat::audio("aac", format.sample_rate, format.channels),
        })
    }

    fn push(&mut self, input: Payload) -> anyhow::Result<Vec<Payload>> {
        let mut produced = Vec::new();
        if !self.config_sent {
            self.config_sent = true;
            produced.push(Payload::Sample(Sample::new(
                vec![0u8, 0, 0, 1],
                0,
                BufferFlags::CODEC_CONFIG,
            )));
        }
        produced.push(Payload::Sample(match input {
            Payload::Frame(frame) => Sample::new(frame.tag.to_le_bytes().to_vec(), frame.pts_us, BufferFlags::KEY_FRAME),
            Payload::Sample(sample) => {
                Sample::new(sample.data.slice(..sample.len().min(16)), sample.pts_us, BufferFlags::NONE)
            }
        }));
        Ok(produced)
    }

    fn flush(&mut self) -> anyhow::Result<Vec<Payload>> {
        Ok(Vec::new())
    }

    fn close(&mut self) {
        self.backend.shared.lock().stats.codecs_released += 1;
    }
}

struct SyntheticRenderer {
    width: u32,
    height: u32,
    backend: SyntheticBackend,
}

impl FrameRenderer for SyntheticRenderer {
    fn draw(&mut self, frame: &VideoFrame) -> anyhow::Result<VideoFrame> {
        self.backend.shared.lock().stats.frames_rendered += 1;
        Ok(VideoFrame {
            width: self.width,
            height: self.height,
            ..frame.clone()
        })
    }
}

#[derive(Serialize)]
struct Summary<'a> {
    tracks: Vec<&'a str>,
    samples: usize,
}

struct SyntheticMuxer {
    path: PathBuf,
    tracks: Vec<MediaFormat>,
    written: usize,
    backend: SyntheticBackend,
}

impl Muxer for SyntheticMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        self.tracks.push(format.clone());
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.backend.shared.lock().stats.muxers_started += 1;
        debug!(path = %self.path.display(), tracks = self.tracks.len(), "synthetic muxer started");
        Ok(())
    }

    fn write_sample(&mut self, track: usize, sample: &Sample) -> anyhow::Result<()> {
        let format = self
            .tracks
            .get(track)
            .ok_or_else(|| anyhow!("unknown track {track}"))?;
        let mut shared = self.backend.shared.lock();
        match format.kind {
            TrackKind::Video => {
                let tag = sample_tag(&sample.data)?;
                shared.stats.video_samples.push((sample.pts_us, tag));
            }
            TrackKind::Audio => shared.stats.audio_samples.push(sample.pts_us),
        }
        self.written += 1;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let summary = Summary {
            tracks: self.tracks.iter().map(|track| track.codec.as_str()).collect(),
            samples: self.written,
        };
        std::fs::write(&self.path, serde_json::to_vec(&summary)?)
            .with_context(|| format!("write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_and_demux() {
        let backend = SyntheticBackend::new();
        backend.add_source("/src/a.mp4", SyntheticSource::video(1_000_000, 10.0, 640, 480, 800_000));

        let info = backend.probe(Path::new("/src/a.mp4")).unwrap();
        assert_eq!(info.frame_rate, Some(10.0));
        assert_eq!(info.size_bytes, 100_000);
        assert!(info.has_video && !info.has_audio);

        assert!(backend.open_demuxer(Path::new("/src/a.mp4"), TrackKind::Audio).unwrap().is_none());
        let mut demuxer = backend
            .open_demuxer(Path::new("/src/a.mp4"), TrackKind::Video)
            .unwrap()
            .unwrap();
        let mut pts = Vec::new();
        while let Some(sample) = demuxer.read_sample().unwrap() {
            assert_eq!(sample_tag(&sample.data).unwrap(), pts.len() as u64);
            pts.push(sample.pts_us);
        }
        assert_eq!(pts.len(), 10);
        assert_eq!(pts[9], 900_000);
    }

    #[test]
    fn test_unknown_source() {
        let backend = SyntheticBackend::new();
        assert!(backend.probe(Path::new("/missing.mp4")).is_err());
    }
}
