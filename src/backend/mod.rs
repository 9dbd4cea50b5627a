//! Media backends: where probes, demuxers, codecs, renderers and muxers come from.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod synthetic;

use std::path::Path;

use crate::codec::Codec;
use crate::media::{EncoderCapabilities, MediaFormat, Sample, SourceInfo, TrackKind};
use crate::surface::FrameRenderer;

/// Reads the encoded samples of one track of a source.
pub trait Demuxer: Send {
    fn format(&self) -> &MediaFormat;

    /// Next sample in decode order, `None` at end of stream.
    fn read_sample(&mut self) -> anyhow::Result<Option<Sample>>;

    fn release(&mut self) {}
}

/// Assembles encoded samples from one or more tracks into a container.
pub trait Muxer: Send {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize>;

    fn start(&mut self) -> anyhow::Result<()>;

    fn write_sample(&mut self, track: usize, sample: &Sample) -> anyhow::Result<()>;

    fn stop(&mut self) -> anyhow::Result<()>;

    fn release(&mut self) {}
}

pub trait MediaBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn probe(&self, path: &Path) -> anyhow::Result<SourceInfo>;

    /// Opens the first track of `kind`, or returns `None` if the source has none.
    fn open_demuxer(&self, path: &Path, kind: TrackKind) -> anyhow::Result<Option<Box<dyn Demuxer>>>;

    fn create_decoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>>;

    fn create_encoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>>;

    fn video_encoder_capabilities(&self) -> EncoderCapabilities;

    fn create_renderer(
        &self,
        source: &MediaFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Box<dyn FrameRenderer>>;

    fn create_muxer(&self, path: &Path) -> anyhow::Result<Box<dyn Muxer>>;
}
