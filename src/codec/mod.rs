//! Codec driver interface and the worker that gives each codec its own thread.

mod buffered;
mod worker;

pub use buffered::{BufferedCodec, Payload, Transform};
pub use worker::{CodecHandler, CodecSlot, CodecWorker};

use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::media::{BufferInfo, MediaFormat, Sample, VideoFrame};
use crate::surface::FrameSink;

/// Notifications a started codec posts to its worker.
#[derive(Debug, Clone)]
pub enum CodecEvent {
    /// The input buffer with this id may be filled.
    InputReady(usize),
    /// The output buffer with this id holds data described by the info.
    OutputReady(usize, BufferInfo),
    /// The codec settled on its output format; posted once, before any output.
    FormatChanged(MediaFormat),
    Error(String),
}

/// Where a codec takes its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecInput {
    /// Input buffers offered through [`CodecEvent::InputReady`].
    Buffers,
    /// Frames pushed through an input surface.
    Surface,
}

/// A decoder or encoder driven through numbered input and output buffers.
///
/// Implementations must only be touched from their [`CodecWorker`]'s thread or
/// while holding the worker's lock.
pub trait Codec: Send {
    fn name(&self) -> &str;

    fn configure(
        &mut self,
        format: &MediaFormat,
        sink: Option<FrameSink>,
        input: CodecInput,
    ) -> anyhow::Result<()>;

    fn start(&mut self, events: Sender<CodecEvent>) -> anyhow::Result<()>;

    /// Returns an input buffer. An empty sample without flags only hands the
    /// buffer back.
    fn queue_input(&mut self, buffer: usize, sample: Sample) -> anyhow::Result<()>;

    /// Surface input: feeds one rendered frame.
    fn queue_frame(&mut self, frame: VideoFrame) -> anyhow::Result<()>;

    fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()>;

    /// Payload of an output buffer; frames rendered to a sink have none.
    fn output(&self, buffer: usize) -> Option<Bytes>;

    /// Gives an output buffer back. With `render`, a decoded frame is posted to
    /// the sink the codec was configured with.
    fn release_output(&mut self, buffer: usize, render: bool) -> anyhow::Result<()>;

    fn stop(&mut self);

    fn release(&mut self);
}
