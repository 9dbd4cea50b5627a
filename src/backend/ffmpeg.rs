//! FFmpeg backend: libavformat demuxing and muxing, libavcodec codecs and
//! swscale rendering behind the buffer-driven codec interface.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context as _, anyhow, bail};
use bytes::Bytes;
use ffmpeg_next::format::Pixel::YUV420P;
use ffmpeg_next::format::context::{Input as InputContext, Output as OutputContext};
use ffmpeg_next::software::resampling::Context as SamplerContext;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::{ChannelLayout, Dictionary, Packet, Rational, codec, format, frame, media, threading};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Demuxer, MediaBackend, Muxer};
use crate::codec::{BufferedCodec, Codec, Payload, Transform};
use crate::media::{
    BackendData, BufferFlags, EncoderCapabilities, MICROS_PER_SECOND, MediaFormat, Sample, SourceInfo, TrackKind,
    VideoFrame,
};
use crate::surface::FrameRenderer;

const PCM_FORMAT: format::Sample = format::Sample::I16(format::sample::Type::Packed);
const AAC_FORMAT: format::Sample = format::Sample::F32(format::sample::Type::Planar);
const MAX_PCM_RATE: u32 = 48_000;
const AAC_FALLBACK_FRAME_SIZE: usize = 1024;

static NUM_CPUS: LazyLock<usize> = LazyLock::new(|| {
    let n = num_cpus::get();
    let num = if n > 16 { 16 } else { n };
    info!(num, "Detecting CPU cores");
    num
});

fn micros() -> Rational {
    Rational::new(1, MICROS_PER_SECOND as i32)
}

fn to_micros(ts: i64, time_base: Rational) -> i64 {
    if time_base.denominator() == 0 {
        return ts;
    }
    (ts as i128 * time_base.numerator() as i128 * MICROS_PER_SECOND as i128 / time_base.denominator() as i128) as i64
}

fn is_rational_valid(r: Rational) -> bool {
    r.numerator() > 0 && r.denominator() > 0
}

fn stream_frame_rate(stream: &ffmpeg_next::Stream) -> Option<f64> {
    [stream.avg_frame_rate(), stream.rate()]
        .into_iter()
        .find(|rate| is_rational_valid(*rate))
        .map(f64::from)
}

/// Clockwise rotation from the stream's `rotate` tag, normalized to 0..360.
fn stream_rotation(stream: &ffmpeg_next::Stream) -> i32 {
    stream
        .metadata()
        .get("rotate")
        .and_then(|value| value.trim().parse::<i32>().ok())
        .map(|degrees| degrees.rem_euclid(360))
        .unwrap_or_default()
}

/// Codec parameters and time base of a stream, carried in a format's
/// [`BackendData`] so decoders and the muxer can describe it.
struct StreamParameters {
    parameters: codec::Parameters,
    time_base: Rational,
}

fn backend_data(parameters: codec::Parameters, time_base: Rational) -> BackendData {
    BackendData::new(Mutex::new(StreamParameters {
        parameters,
        time_base,
    }))
}

fn stream_parameters(format: &MediaFormat) -> anyhow::Result<(codec::Parameters, Rational)> {
    let shared = format
        .backend
        .as_ref()
        .and_then(|data| data.downcast_ref::<Mutex<StreamParameters>>())
        .ok_or_else(|| anyhow!("{} format carries no ffmpeg parameters", format.codec))?;
    let stream = shared.lock();
    Ok((stream.parameters.clone(), stream.time_base))
}

pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn probe(&self, path: &Path) -> anyhow::Result<SourceInfo> {
        let ictx = format::input(path).map_err(|e| anyhow!("Failed to open {}: {e}", path.display()))?;
        let size_bytes = std::fs::metadata(path)?.len();
        let duration_us = ictx.duration();
        let bitrate = u64::try_from(ictx.bit_rate()).ok().filter(|bitrate| *bitrate > 0);

        let mut info = SourceInfo {
            path: path.to_path_buf(),
            duration_us,
            bitrate,
            frame_rate: None,
            width: 0,
            height: 0,
            rotation: 0,
            size_bytes,
            has_video: false,
            has_audio: ictx.streams().best(media::Type::Audio).is_some(),
        };
        if let Some(stream) = ictx.streams().best(media::Type::Video) {
            let decoder = codec::context::Context::from_parameters(stream.parameters())?
                .decoder()
                .video()?;
            info.has_video = true;
            info.width = decoder.width();
            info.height = decoder.height();
            info.frame_rate = stream_frame_rate(&stream);
            info.rotation = stream_rotation(&stream);
        }
        debug!(path = %path.display(), ?info, "probed source");
        Ok(info)
    }

    fn open_demuxer(&self, path: &Path, kind: TrackKind) -> anyhow::Result<Option<Box<dyn Demuxer>>> {
        let ictx = format::input(path).map_err(|e| anyhow!("Failed to open {}: {e}", path.display()))?;
        let medium = match kind {
            TrackKind::Video => media::Type::Video,
            TrackKind::Audio => media::Type::Audio,
        };
        let Some(stream) = ictx.streams().best(medium) else {
            return Ok(None);
        };

        let stream_index = stream.index();
        let time_base = stream.time_base();
        let parameters = stream.parameters().clone();
        let codec_name = parameters.id().name();
        let duration_us = ictx.duration();
        let context = codec::context::Context::from_parameters(parameters.clone())?;
        let format = match kind {
            TrackKind::Video => {
                let decoder = context.decoder().video()?;
                let mut format = MediaFormat::video(codec_name, decoder.width(), decoder.height())
                    .with_duration(duration_us)
                    .with_rotation(stream_rotation(&stream));
                format.frame_rate = stream_frame_rate(&stream);
                format
            }
            TrackKind::Audio => {
                let decoder = context.decoder().audio()?;
                let mut format = MediaFormat::audio(codec_name, Some(decoder.rate()), Some(decoder.channels()))
                    .with_duration(duration_us);
                format.bitrate = u64::try_from(decoder.bit_rate()).ok().filter(|bitrate| *bitrate > 0);
                format
            }
        }
        .with_backend(backend_data(parameters, time_base));

        debug!(path = %path.display(), %kind, codec = codec_name, stream_index, "demuxer opened");
        Ok(Some(Box::new(FfmpegDemuxer {
            input: Some(ictx),
            format,
            stream_index,
            time_base,
        })))
    }

    fn create_decoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>> {
        let transform: Box<dyn Transform> = match format.kind {
            TrackKind::Video => Box::new(VideoDecoder {
                decoder: None,
                scaler: None,
                decoded: 0,
            }),
            TrackKind::Audio => Box::new(AudioDecoder {
                decoder: None,
                resampler: None,
                target_rate: 0,
                next_pts_us: 0,
            }),
        };
        Ok(Box::new(BufferedCodec::new(
            format!("ffmpeg-{}-decoder-{}", format.kind, format.codec),
            transform,
        )))
    }

    fn create_encoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>> {
        let transform: Box<dyn Transform> = match format.kind {
            TrackKind::Video => Box::new(VideoEncoder { encoder: None }),
            TrackKind::Audio => Box::new(AudioEncoder {
                encoder: None,
                resampler: None,
                layout: ChannelLayout::STEREO,
                rate: 0,
                channels: 0,
                frame_size: AAC_FALLBACK_FRAME_SIZE,
                pending: Vec::new(),
                next_pts: 0,
            }),
        };
        Ok(Box::new(BufferedCodec::new(
            format!("ffmpeg-{}-encoder-{}", format.kind, format.codec),
            transform,
        )))
    }

    fn video_encoder_capabilities(&self) -> EncoderCapabilities {
        EncoderCapabilities::default()
    }

    fn create_renderer(
        &self,
        source: &MediaFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Box<dyn FrameRenderer>> {
        Ok(Box::new(ScaleRenderer {
            rotation: source.rotation.rem_euclid(360),
            width,
            height,
            scaler: None,
        }))
    }

    fn create_muxer(&self, path: &Path) -> anyhow::Result<Box<dyn Muxer>> {
        let octx = format::output(path).map_err(|e| anyhow!("Failed to create output context: {e}"))?;
        Ok(Box::new(FfmpegMuxer {
            path: path.to_path_buf(),
            output: Some(octx),
            started: false,
        }))
    }
}

struct FfmpegDemuxer {
    input: Option<InputContext>,
    format: MediaFormat,
    stream_index: usize,
    time_base: Rational,
}

impl Demuxer for FfmpegDemuxer {
    fn format(&self) -> &MediaFormat {
        &self.format
    }

    fn read_sample(&mut self) -> anyhow::Result<Option<Sample>> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };
        loop {
            let mut packet = Packet::empty();
            match packet.read(input) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(e) => bail!("Failed to read packet: {e}"),
            }
            if packet.stream() != self.stream_index {
                continue;
            }
            let Some(ts) = packet.pts().or(packet.dts()) else {
                warn!(codec = %self.format.codec, "Packet without timestamp, skipping.");
                continue;
            };
            let flags = if packet.is_key() {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::NONE
            };
            return Ok(Some(Sample::new(
                Bytes::copy_from_slice(packet.data().unwrap_or_default()),
                to_micros(ts, self.time_base),
                flags,
            )));
        }
    }

    fn release(&mut self) {
        if self.input.take().is_some() {
            debug!(codec = %self.format.codec, "demuxer released");
        }
    }
}

fn packet_from(sample: &Sample) -> Packet {
    let mut packet = Packet::copy(&sample.data);
    packet.set_pts(Some(sample.pts_us));
    packet.set_dts(Some(sample.pts_us));
    if sample.flags.contains(BufferFlags::KEY_FRAME) {
        packet.set_flags(codec::packet::Flags::KEY);
    }
    packet
}

fn plane_sizes(width: u32, height: u32) -> [(usize, usize); 3] {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    [(w, h), (cw, ch), (cw, ch)]
}

/// Copies a YUV 4:2:0 frame into one tightly packed buffer.
fn pack_frame(frame: &frame::Video) -> Vec<u8> {
    let planes = plane_sizes(frame.width(), frame.height());
    let mut packed = Vec::with_capacity(planes.iter().map(|(w, h)| w * h).sum());
    for (index, (width, height)) in planes.into_iter().enumerate() {
        let stride = frame.stride(index);
        let data = frame.data(index);
        for row in 0..height {
            packed.extend_from_slice(&data[row * stride..row * stride + width]);
        }
    }
    packed
}

fn unpack_frame(data: &[u8], width: u32, height: u32) -> anyhow::Result<frame::Video> {
    let planes = plane_sizes(width, height);
    let expected: usize = planes.iter().map(|(w, h)| w * h).sum();
    if data.len() < expected {
        bail!("frame of {} bytes is too small for {width}x{height}", data.len());
    }
    let mut frame = frame::Video::new(YUV420P, width, height);
    let mut offset = 0;
    for (index, (plane_width, plane_height)) in planes.into_iter().enumerate() {
        let stride = frame.stride(index);
        let plane = frame.data_mut(index);
        for row in 0..plane_height {
            plane[row * stride..row * stride + plane_width]
                .copy_from_slice(&data[offset..offset + plane_width]);
            offset += plane_width;
        }
    }
    Ok(frame)
}

/// Rotates one packed plane clockwise by a multiple of 90 degrees.
fn rotate_plane(src: &[u8], width: usize, height: usize, rotation: i32, dst: &mut Vec<u8>) {
    match rotation {
        90 => {
            for y in 0..width {
                for x in 0..height {
                    dst.push(src[(height - 1 - x) * width + y]);
                }
            }
        }
        180 => dst.extend(src[..width * height].iter().rev()),
        270 => {
            for y in 0..width {
                for x in 0..height {
                    dst.push(src[x * width + (width - 1 - y)]);
                }
            }
        }
        _ => dst.extend_from_slice(&src[..width * height]),
    }
}

fn rotate_frame(data: &[u8], width: u32, height: u32, rotation: i32) -> Vec<u8> {
    let mut rotated = Vec::with_capacity(data.len());
    let mut offset = 0;
    for (plane_width, plane_height) in plane_sizes(width, height) {
        let len = plane_width * plane_height;
        rotate_plane(&data[offset..offset + len], plane_width, plane_height, rotation, &mut rotated);
        offset += len;
    }
    rotated
}

struct VideoDecoder {
    decoder: Option<codec::decoder::Video>,
    /// Converts whatever the decoder emits to YUV 4:2:0.
    scaler: Option<Scaler>,
    decoded: u64,
}

impl VideoDecoder {
    fn receive(&mut self) -> anyhow::Result<Vec<Payload>> {
        let decoder = self.decoder.as_mut().ok_or_else(|| anyhow!("video decoder is not open"))?;
        let mut produced = Vec::new();
        let mut decoded = frame::Video::empty();
        loop {
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => break,
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => break,
                Err(e) => return Err(anyhow!("Video Decoder: Error receiving frame: {e}")),
            }
            let pts_us = decoded.timestamp().or(decoded.pts()).unwrap_or_default();
            let data = if decoded.format() == YUV420P {
                pack_frame(&decoded)
            } else {
                let scaler = match &mut self.scaler {
                    Some(scaler) => scaler,
                    scaler => scaler.insert(Scaler::get(
                        decoded.format(),
                        decoded.width(),
                        decoded.height(),
                        YUV420P,
                        decoded.width(),
                        decoded.height(),
                        Flags::BILINEAR,
                    )?),
                };
                let mut converted = frame::Video::empty();
                scaler.run(&decoded, &mut converted)?;
                pack_frame(&converted)
            };
            produced.push(Payload::Frame(VideoFrame {
                width: decoded.width(),
                height: decoded.height(),
                pts_us,
                tag: self.decoded,
                data: data.into(),
            }));
            self.decoded += 1;
        }
        Ok(produced)
    }
}

impl Transform for VideoDecoder {
    #[allow(clippy::field_reassign_with_default)]
    fn open(&mut self, format: &MediaFormat) -> anyhow::Result<MediaFormat> {
        let (parameters, _) = stream_parameters(format)?;
        let mut context = codec::context::Context::from_parameters(parameters)?;
        let mut threading_config = threading::Config::default();
        threading_config.count = *NUM_CPUS;
        context.set_threading(threading_config);
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| anyhow!("Video Decoder: Failed to open {}: {e}", format.codec))?;
        let output = MediaFormat::video("rawvideo", decoder.width(), decoder.height()).with_rotation(format.rotation);
        self.decoder = Some(decoder);
        Ok(output)
    }

    fn push(&mut self, input: Payload) -> anyhow::Result<Vec<Payload>> {
        let Payload::Sample(sample) = input else {
            bail!("video decoder takes encoded samples");
        };
        let decoder = self.decoder.as_mut().ok_or_else(|| anyhow!("video decoder is not open"))?;
        decoder
            .send_packet(&packet_from(&sample))
            .map_err(|e| anyhow!("Video Decoder: Error sending packet: {e}"))?;
        self.receive()
    }

    fn flush(&mut self) -> anyhow::Result<Vec<Payload>> {
        let decoder = self.decoder.as_mut().ok_or_else(|| anyhow!("video decoder is not open"))?;
        decoder.send_eof()?;
        self.receive()
    }

    fn close(&mut self) {
        self.decoder = None;
        self.scaler = None;
    }
}

/// Decodes audio into interleaved 16-bit PCM at no more than 48 kHz.
struct AudioDecoder {
    decoder: Option<codec::decoder::Audio>,
    resampler: Option<SamplerContext>,
    target_rate: u32,
    next_pts_us: i64,
}

impl AudioDecoder {
    fn resample(&mut self, decoded: &mut frame::Audio) -> anyhow::Result<Option<Sample>> {
        let channels = decoded.channels();
        if decoded.channel_layout().is_empty() || decoded.channel_layout().channels() != channels as i32 {
            decoded.set_channel_layout(ChannelLayout::default(channels.into()));
        }
        let resampler = match &mut self.resampler {
            Some(resampler) => resampler,
            resampler => resampler.insert(
                SamplerContext::get(
                    decoded.format(),
                    decoded.channel_layout(),
                    decoded.rate(),
                    PCM_FORMAT,
                    decoded.channel_layout(),
                    self.target_rate,
                )
                .map_err(|e| anyhow!("Audio Resampler: Failed to create: {e}"))?,
            ),
        };

        let mut resampled = frame::Audio::empty();
        resampler
            .run(decoded, &mut resampled)
            .map_err(|e| anyhow!("Audio Resampler: Error during run: {e}"))?;
        if let Some(pts) = decoded.pts() {
            self.next_pts_us = pts;
        }
        Ok(self.chunk(&resampled, channels as usize))
    }

    fn chunk(&mut self, resampled: &frame::Audio, channels: usize) -> Option<Sample> {
        let samples = resampled.samples();
        if samples == 0 {
            return None;
        }
        let len = samples * channels * 2;
        let chunk = Sample::new(
            Bytes::copy_from_slice(&resampled.data(0)[..len]),
            self.next_pts_us,
            BufferFlags::NONE,
        );
        self.next_pts_us += samples as i64 * MICROS_PER_SECOND / self.target_rate.max(1) as i64;
        Some(chunk)
    }

    fn receive(&mut self) -> anyhow::Result<Vec<Payload>> {
        let mut produced = Vec::new();
        let mut decoded = frame::Audio::empty();
        loop {
            let decoder = self.decoder.as_mut().ok_or_else(|| anyhow!("audio decoder is not open"))?;
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => break,
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => break,
                Err(e) => return Err(anyhow!("Audio Decoder: Error receiving frame: {e}")),
            }
            if let Some(chunk) = self.resample(&mut decoded)? {
                produced.push(Payload::Sample(chunk));
            }
        }
        Ok(produced)
    }
}

impl Transform for AudioDecoder {
    fn open(&mut self, format: &MediaFormat) -> anyhow::Result<MediaFormat> {
        let (parameters, _) = stream_parameters(format)?;
        let decoder = codec::context::Context::from_parameters(parameters)?
            .decoder()
            .audio()
            .map_err(|e| anyhow!("Audio Decoder: Failed to open {}: {e}", format.codec))?;
        self.target_rate = decoder.rate().min(MAX_PCM_RATE);
        let output = MediaFormat::audio("pcm_s16le", Some(self.target_rate), Some(decoder.channels()));
        self.decoder = Some(decoder);
        Ok(output)
    }

    fn push(&mut self, input: Payload) -> anyhow::Result<Vec<Payload>> {
        let Payload::Sample(sample) = input else {
            bail!("audio decoder takes encoded samples");
        };
        let decoder = self.decoder.as_mut().ok_or_else(|| anyhow!("audio decoder is not open"))?;
        decoder
            .send_packet(&packet_from(&sample))
            .map_err(|e| anyhow!("Audio Decoder: Error sending packet: {e}"))?;
        self.receive()
    }

    fn flush(&mut self) -> anyhow::Result<Vec<Payload>> {
        let decoder = self.decoder.as_mut().ok_or_else(|| anyhow!("audio decoder is not open"))?;
        decoder.send_eof()?;
        let mut produced = self.receive()?;

        if let Some(resampler) = self.resampler.as_mut() {
            let input = resampler.input();
            let channels = input.channel_layout.channels().max(1) as usize;
            let empty = frame::Audio::new(input.format, 0, input.channel_layout);
            let mut resampled = frame::Audio::empty();
            if resampler.run(&empty, &mut resampled).is_ok()
                && let Some(chunk) = self.chunk(&resampled, channels)
            {
                produced.push(Payload::Sample(chunk));
            }
        }
        Ok(produced)
    }

    fn close(&mut self) {
        self.decoder = None;
        self.resampler = None;
    }
}

fn encoded_payload(packet: &Packet, time_base: Rational) -> Payload {
    let flags = if packet.is_key() {
        BufferFlags::KEY_FRAME
    } else {
        BufferFlags::NONE
    };
    let pts_us = packet.pts().or(packet.dts()).map(|ts| to_micros(ts, time_base)).unwrap_or_default();
    Payload::Sample(Sample::new(
        Bytes::copy_from_slice(packet.data().unwrap_or_default()),
        pts_us,
        flags,
    ))
}

/// H.264 encoder fed with rendered frames.
struct VideoEncoder {
    encoder: Option<codec::encoder::video::Encoder>,
}

impl VideoEncoder {
    fn receive(&mut self) -> anyhow::Result<Vec<Payload>> {
        let encoder = self.encoder.as_mut().ok_or_else(|| anyhow!("video encoder is not open"))?;
        let mut produced = Vec::new();
        let mut packet = Packet::empty();
        loop {
            match encoder.receive_packet(&mut packet) {
                Ok(()) => produced.push(encoded_payload(&packet, micros())),
                Err(ffmpeg_next::Error::Eof) => break,
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => break,
                Err(e) => return Err(anyhow!("H264 Encoder: Error receiving packet: {e}")),
            }
        }
        Ok(produced)
    }
}

impl Transform for VideoEncoder {
    #[allow(clippy::field_reassign_with_default)]
    fn open(&mut self, format: &MediaFormat) -> anyhow::Result<MediaFormat> {
        let h264 = codec::encoder::find(codec::Id::H264).ok_or_else(|| anyhow!("H264 Encoder: Codec not found"))?;
        let mut enc_config = codec::Context::new_with_codec(h264)
            .encoder()
            .video()
            .map_err(|e| anyhow!("H264 Encoder: Failed to create config: {e}"))?;

        enc_config.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut threading_config = threading::Config::default();
        threading_config.count = *NUM_CPUS;
        threading_config.kind = threading::Type::Slice;
        enc_config.set_threading(threading_config);

        let fps = format.frame_rate.unwrap_or(30.0).round().max(1.0) as i32;
        let bitrate = format.bitrate.ok_or_else(|| anyhow!("H264 Encoder: Bitrate is required"))?;
        enc_config.set_format(YUV420P);
        enc_config.set_width(format.width);
        enc_config.set_height(format.height);
        enc_config.set_time_base(micros());
        enc_config.set_frame_rate(Some(Rational::new(fps, 1)));
        enc_config.set_bit_rate(bitrate as usize);
        enc_config.set_max_b_frames(0);
        enc_config.set_gop(fps as u32);

        let mut opts = Dictionary::new();
        opts.set("preset", "veryfast");

        let opened_encoder = enc_config.open_with(opts).map_err(|e| {
            anyhow!(
                "H264 Encoder: Failed to open: {e}. Params were {}x{} @ {fps} fps, {bitrate} bps.",
                format.width,
                format.height
            )
        })?;
        debug!(width = format.width, height = format.height, fps, bitrate, "H264 encoder opened");

        let parameters = codec::Parameters::from(&opened_encoder);
        self.encoder = Some(opened_encoder);
        Ok(MediaFormat::video("h264", format.width, format.height)
            .with_frame_rate(fps as f64)
            .with_bitrate(bitrate)
            .with_backend(backend_data(parameters, micros())))
    }

    fn push(&mut self, input: Payload) -> anyhow::Result<Vec<Payload>> {
        let Payload::Frame(picture) = input else {
            bail!("video encoder takes rendered frames");
        };
        let mut frame = unpack_frame(&picture.data, picture.width, picture.height)?;
        frame.set_pts(Some(picture.pts_us));
        let encoder = self.encoder.as_mut().ok_or_else(|| anyhow!("video encoder is not open"))?;
        encoder
            .send_frame(&frame)
            .map_err(|e| anyhow!("H264 Encoder: Error sending frame: {e}"))?;
        self.receive()
    }

    fn flush(&mut self) -> anyhow::Result<Vec<Payload>> {
        let encoder = self.encoder.as_mut().ok_or_else(|| anyhow!("video encoder is not open"))?;
        encoder.send_eof()?;
        self.receive()
    }

    fn close(&mut self) {
        self.encoder = None;
    }
}

/// AAC encoder fed with interleaved 16-bit PCM chunks of any length.
struct AudioEncoder {
    encoder: Option<codec::encoder::audio::Encoder>,
    /// Interleaved 16-bit PCM to planar float.
    resampler: Option<SamplerContext>,
    layout: ChannelLayout,
    rate: u32,
    channels: usize,
    frame_size: usize,
    pending: Vec<u8>,
    /// Next frame pts in samples.
    next_pts: i64,
}

impl AudioEncoder {
    fn frame_bytes(&self) -> usize {
        self.frame_size * self.channels * 2
    }

    /// Encodes one frame of PCM, padding a short tail with silence.
    fn encode(&mut self, pcm: &[u8]) -> anyhow::Result<Vec<Payload>> {
        let mut input = frame::Audio::new(PCM_FORMAT, self.frame_size, self.layout);
        input.set_rate(self.rate);
        let plane = input.data_mut(0);
        plane[..pcm.len()].copy_from_slice(pcm);
        plane[pcm.len()..self.frame_bytes()].fill(0);

        let resampler = self.resampler.as_mut().ok_or_else(|| anyhow!("audio encoder is not open"))?;
        let mut planar = frame::Audio::empty();
        resampler
            .run(&input, &mut planar)
            .map_err(|e| anyhow!("Audio Resampler: Error during run: {e}"))?;
        planar.set_pts(Some(self.next_pts));
        self.next_pts += self.frame_size as i64;

        let encoder = self.encoder.as_mut().ok_or_else(|| anyhow!("audio encoder is not open"))?;
        encoder
            .send_frame(&planar)
            .map_err(|e| anyhow!("AAC Encoder: Error sending frame: {e}"))?;
        self.receive()
    }

    fn receive(&mut self) -> anyhow::Result<Vec<Payload>> {
        let time_base = Rational::new(1, self.rate as i32);
        let encoder = self.encoder.as_mut().ok_or_else(|| anyhow!("audio encoder is not open"))?;
        let mut produced = Vec::new();
        let mut packet = Packet::empty();
        loop {
            match encoder.receive_packet(&mut packet) {
                Ok(()) => produced.push(encoded_payload(&packet, time_base)),
                Err(ffmpeg_next::Error::Eof) => break,
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => break,
                Err(e) => return Err(anyhow!("AAC Encoder: Error receiving packet: {e}")),
            }
        }
        Ok(produced)
    }
}

impl Transform for AudioEncoder {
    fn open(&mut self, format: &MediaFormat) -> anyhow::Result<MediaFormat> {
        let aac = codec::encoder::find(codec::Id::AAC).ok_or_else(|| anyhow!("AAC Encoder: Codec not found"))?;
        let mut enc_config = codec::Context::new_with_codec(aac)
            .encoder()
            .audio()
            .map_err(|e| anyhow!("AAC Encoder: Failed to create config: {e}"))?;

        let rate = format.sample_rate.ok_or_else(|| anyhow!("AAC Encoder: Sample rate is required"))?;
        let channels = format.channels.ok_or_else(|| anyhow!("AAC Encoder: Channel count is required"))?;
        let bitrate = format.bitrate.ok_or_else(|| anyhow!("AAC Encoder: Bitrate is required"))?;
        let layout = ChannelLayout::default(channels.into());

        enc_config.set_flags(codec::Flags::GLOBAL_HEADER);
        enc_config.set_format(AAC_FORMAT);
        enc_config.set_rate(rate as i32);
        enc_config.set_channel_layout(layout);
        enc_config.set_bit_rate(bitrate as usize);
        enc_config.set_time_base(Rational::new(1, rate as i32));

        let opened_encoder = enc_config
            .open_with(Dictionary::new())
            .map_err(|e| anyhow!("AAC Encoder: Failed to open: {e}"))?;

        let frame_size = match opened_encoder.frame_size() {
            0 => {
                warn!("AAC encoder reported frame_size 0. Defaulting to {AAC_FALLBACK_FRAME_SIZE}.");
                AAC_FALLBACK_FRAME_SIZE
            }
            size => size as usize,
        };
        let resampler = SamplerContext::get(PCM_FORMAT, layout, rate, AAC_FORMAT, layout, rate)
            .map_err(|e| anyhow!("Audio Resampler: Failed to create: {e}"))?;
        debug!(rate, channels, bitrate, frame_size, "AAC encoder opened");

        let parameters = codec::Parameters::from(&opened_encoder);
        self.encoder = Some(opened_encoder);
        self.resampler = Some(resampler);
        self.layout = layout;
        self.rate = rate;
        self.channels = channels as usize;
        self.frame_size = frame_size;
        Ok(MediaFormat::audio("aac", Some(rate), Some(channels))
            .with_bitrate(bitrate)
            .with_backend(backend_data(parameters, Rational::new(1, rate as i32))))
    }

    fn push(&mut self, input: Payload) -> anyhow::Result<Vec<Payload>> {
        let Payload::Sample(chunk) = input else {
            bail!("audio encoder takes PCM samples");
        };
        self.pending.extend_from_slice(&chunk.data);
        let frame_bytes = self.frame_bytes();
        let mut produced = Vec::new();
        while self.pending.len() >= frame_bytes {
            let pcm: Vec<u8> = self.pending.drain(..frame_bytes).collect();
            produced.extend(self.encode(&pcm)?);
        }
        Ok(produced)
    }

    fn flush(&mut self) -> anyhow::Result<Vec<Payload>> {
        let mut produced = Vec::new();
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            produced.extend(self.encode(&tail)?);
        }
        let encoder = self.encoder.as_mut().ok_or_else(|| anyhow!("audio encoder is not open"))?;
        encoder.send_eof()?;
        produced.extend(self.receive()?);
        Ok(produced)
    }

    fn close(&mut self) {
        self.encoder = None;
        self.resampler = None;
        self.pending.clear();
    }
}

/// Scales decoded pictures to the output size and applies the source rotation.
struct ScaleRenderer {
    rotation: i32,
    width: u32,
    height: u32,
    scaler: Option<(u32, u32, Scaler)>,
}

impl FrameRenderer for ScaleRenderer {
    fn draw(&mut self, frame: &VideoFrame) -> anyhow::Result<VideoFrame> {
        // scale first, so the rotated picture lands on the output size
        let (scaled_width, scaled_height) = match self.rotation {
            90 | 270 => (self.height, self.width),
            _ => (self.width, self.height),
        };
        let stale = !matches!(
            &self.scaler,
            Some((width, height, _)) if (*width, *height) == (frame.width, frame.height)
        );
        if stale {
            let scaler = Scaler::get(
                YUV420P,
                frame.width,
                frame.height,
                YUV420P,
                scaled_width,
                scaled_height,
                Flags::BILINEAR,
            )
            .context("create scaler")?;
            self.scaler = Some((frame.width, frame.height, scaler));
        }
        let Some((_, _, scaler)) = self.scaler.as_mut() else {
            bail!("renderer has no scaler");
        };

        let input = unpack_frame(&frame.data, frame.width, frame.height)?;
        let mut scaled = frame::Video::empty();
        scaler.run(&input, &mut scaled)?;
        let packed = pack_frame(&scaled);
        let data = match self.rotation {
            0 => packed,
            rotation => rotate_frame(&packed, scaled_width, scaled_height, rotation),
        };
        Ok(VideoFrame {
            width: self.width,
            height: self.height,
            pts_us: frame.pts_us,
            tag: frame.tag,
            data: data.into(),
        })
    }

    fn release(&mut self) {
        self.scaler = None;
    }
}

struct FfmpegMuxer {
    path: PathBuf,
    output: Option<OutputContext>,
    started: bool,
}

impl FfmpegMuxer {
    fn output(&mut self) -> anyhow::Result<&mut OutputContext> {
        self.output.as_mut().ok_or_else(|| anyhow!("muxer is released"))
    }
}

impl Muxer for FfmpegMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        let (parameters, time_base) = stream_parameters(format)?;
        let octx = self.output.as_mut().ok_or_else(|| anyhow!("muxer is released"))?;
        let mut stream = octx.add_stream(parameters.id())?;
        stream.set_parameters(parameters);
        stream.set_time_base(time_base);
        debug!(path = %self.path.display(), codec = %format.codec, index = stream.index(), "track added");
        Ok(stream.index())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.output()?
            .write_header()
            .map_err(|e| anyhow!("Output: Failed to write context header: {e}"))?;
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, sample: &Sample) -> anyhow::Result<()> {
        let octx = self.output()?;
        let time_base = octx
            .stream(track)
            .ok_or_else(|| anyhow!("Output: no track {track}"))?
            .time_base();
        let mut packet = packet_from(sample);
        packet.set_stream(track);
        packet.rescale_ts(micros(), time_base);
        packet
            .write_interleaved(octx)
            .map_err(|e| anyhow!("Output: Error writing interleaved packet: {e}"))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if !std::mem::take(&mut self.started) {
            return Ok(());
        }
        self.output()?
            .write_trailer()
            .map_err(|e| anyhow!("Output: Failed to write trailer: {e}"))?;
        info!(path = %self.path.display(), "output finalized");
        Ok(())
    }

    fn release(&mut self) {
        self.output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_micros() {
        assert_eq!(to_micros(90_000, Rational::new(1, 90_000)), 1_000_000);
        assert_eq!(to_micros(1024, Rational::new(1, 44_100)), 23_219);
        assert_eq!(to_micros(7, Rational::new(1, 0)), 7);
    }

    #[test]
    fn test_rotate_plane() {
        // 1 2 3
        // 4 5 6
        let plane = [1, 2, 3, 4, 5, 6];
        let mut out = Vec::new();
        rotate_plane(&plane, 3, 2, 90, &mut out);
        assert_eq!(out, [4, 1, 5, 2, 6, 3]);

        out.clear();
        rotate_plane(&plane, 3, 2, 180, &mut out);
        assert_eq!(out, [6, 5, 4, 3, 2, 1]);

        out.clear();
        rotate_plane(&plane, 3, 2, 270, &mut out);
        assert_eq!(out, [3, 6, 2, 5, 1, 4]);
    }

    #[test]
    fn test_rotate_frame_keeps_size() {
        let data: Vec<u8> = (0..(4 * 2 + 2 * 2)).map(|v| v as u8).collect();
        let rotated = rotate_frame(&data, 4, 2, 90);
        assert_eq!(rotated.len(), data.len());
        assert_eq!(plane_sizes(4, 2), [(4, 2), (2, 1), (2, 1)]);
    }
}
