use bytes::Bytes;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::ops::{BitOr, BitOrAssign, RangeInclusive};
use std::path::PathBuf;
use std::sync::Arc;

pub const MICROS_PER_SECOND: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-buffer flags carried alongside samples and codec output buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const KEY_FRAME: BufferFlags = BufferFlags(1);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(1 << 1);
    pub const END_OF_STREAM: BufferFlags = BufferFlags(1 << 2);

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn without(self, other: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 & !other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

/// An encoded packet or a chunk of raw audio, timestamped in microseconds.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub data: Bytes,
    pub pts_us: i64,
    pub flags: BufferFlags,
}

impl Sample {
    pub fn new(data: impl Into<Bytes>, pts_us: i64, flags: BufferFlags) -> Self {
        Self {
            data: data.into(),
            pts_us,
            flags,
        }
    }

    /// A zero-length buffer that only hands an input slot back to the codec.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn end_of_stream(pts_us: i64) -> Self {
        Self {
            data: Bytes::new(),
            pts_us,
            flags: BufferFlags::END_OF_STREAM,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Metadata describing one codec output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: usize,
    pub pts_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }
}

/// A decoded or rendered picture in packed planar YUV 4:2:0.
///
/// `tag` identifies the decoded source picture the frame originates from, so a
/// repeated picture keeps the tag of the frame it duplicates.
#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pts_us: i64,
    pub tag: u64,
    pub data: Bytes,
}

/// Backend-private payload attached to a [`MediaFormat`], e.g. codec parameters
/// that the muxer needs to describe a track.
#[derive(Clone)]
pub struct BackendData(Arc<dyn Any + Send + Sync>);

impl BackendData {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for BackendData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackendData(..)")
    }
}

#[derive(Debug, Clone)]
pub struct MediaFormat {
    pub kind: TrackKind,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub bitrate: Option<u64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub max_input_size: Option<usize>,
    pub duration_us: Option<i64>,
    pub rotation: i32,
    pub backend: Option<BackendData>,
}

impl MediaFormat {
    pub fn video(codec: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            kind: TrackKind::Video,
            codec: codec.into(),
            width,
            height,
            frame_rate: None,
            bitrate: None,
            sample_rate: None,
            channels: None,
            max_input_size: None,
            duration_us: None,
            rotation: 0,
            backend: None,
        }
    }

    pub fn audio(codec: impl Into<String>, sample_rate: Option<u32>, channels: Option<u16>) -> Self {
        Self {
            kind: TrackKind::Audio,
            codec: codec.into(),
            width: 0,
            height: 0,
            frame_rate: None,
            bitrate: None,
            sample_rate,
            channels,
            max_input_size: None,
            duration_us: None,
            rotation: 0,
            backend: None,
        }
    }

    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.frame_rate = Some(fps);
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_duration(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn with_rotation(mut self, rotation: i32) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_max_input_size(mut self, size: usize) -> Self {
        self.max_input_size = Some(size);
        self
    }

    pub fn with_backend(mut self, data: BackendData) -> Self {
        self.backend = Some(data);
        self
    }
}

/// What a probe learns about a source file before any codec is opened.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub duration_us: i64,
    pub bitrate: Option<u64>,
    pub frame_rate: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub rotation: i32,
    pub size_bytes: u64,
    pub has_video: bool,
    pub has_audio: bool,
}

/// Parameter ranges a video encoder accepts.
#[derive(Debug, Clone)]
pub struct EncoderCapabilities {
    pub frame_rate: RangeInclusive<u32>,
    pub width: RangeInclusive<u32>,
    pub height: RangeInclusive<u32>,
    pub bitrate: RangeInclusive<u64>,
}

impl Default for EncoderCapabilities {
    fn default() -> Self {
        Self {
            frame_rate: 1..=120,
            width: 16..=4096,
            height: 16..=4096,
            bitrate: 16_000..=100_000_000,
        }
    }
}

impl EncoderCapabilities {
    /// Returns a description of the first parameter outside the supported ranges.
    pub fn check(&self, fps: u32, width: u32, height: u32, bitrate: u64) -> Result<(), String> {
        if !self.frame_rate.contains(&fps) {
            return Err(format!(
                "frame rate {fps} outside {}..={}",
                self.frame_rate.start(),
                self.frame_rate.end()
            ));
        }
        if !self.width.contains(&width) || !self.height.contains(&height) {
            return Err(format!(
                "size {width}x{height} outside {}..={} x {}..={}",
                self.width.start(),
                self.width.end(),
                self.height.start(),
                self.height.end()
            ));
        }
        if !self.bitrate.contains(&bitrate) {
            return Err(format!(
                "bitrate {bitrate} outside {}..={}",
                self.bitrate.start(),
                self.bitrate.end()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM;
        assert!(flags.contains(BufferFlags::END_OF_STREAM));
        assert!(!flags.contains(BufferFlags::CODEC_CONFIG));
        assert!(!flags.contains(BufferFlags::NONE));
        assert!(!flags.without(BufferFlags::END_OF_STREAM).contains(BufferFlags::END_OF_STREAM));
    }

    #[test]
    fn test_end_of_stream_sample() {
        let sample = Sample::end_of_stream(42);
        assert!(sample.is_end_of_stream());
        assert!(sample.is_empty());
        assert!(!Sample::empty().is_end_of_stream());
    }

    #[test]
    fn test_capabilities_check() {
        let caps = EncoderCapabilities::default();
        assert!(caps.check(30, 1280, 720, 1_500_000).is_ok());
        assert!(caps.check(0, 1280, 720, 1_500_000).unwrap_err().contains("frame rate"));
        assert!(caps.check(30, 8, 720, 1_500_000).unwrap_err().contains("size"));
        assert!(caps.check(30, 1280, 720, 1).unwrap_err().contains("bitrate"));
    }

    #[test]
    fn test_backend_data_downcast() {
        let format = MediaFormat::video("h264", 2, 2).with_backend(BackendData::new(7u32));
        let data = format.backend.as_ref().unwrap();
        assert_eq!(data.downcast_ref::<u32>(), Some(&7));
        assert!(data.downcast_ref::<u64>().is_none());
    }
}
