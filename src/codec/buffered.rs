use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

use super::{Codec, CodecEvent, CodecInput};
use crate::media::{BufferFlags, BufferInfo, MediaFormat, Sample, VideoFrame};
use crate::surface::FrameSink;

const INPUT_BUFFERS: usize = 2;
const OUTPUT_BUFFERS: usize = 4;

/// Data moving into or out of a [`Transform`].
#[derive(Debug, Clone)]
pub enum Payload {
    Sample(Sample),
    Frame(VideoFrame),
}

impl Payload {
    fn info(&self) -> BufferInfo {
        match self {
            Payload::Sample(sample) => BufferInfo {
                size: sample.len(),
                pts_us: sample.pts_us,
                flags: sample.flags,
            },
            Payload::Frame(frame) => BufferInfo {
                size: frame.data.len().max(1),
                pts_us: frame.pts_us,
                flags: BufferFlags::NONE,
            },
        }
    }
}

/// A synchronous decode or encode step supplied by a media backend.
pub trait Transform: Send {
    /// Opens the underlying codec and returns the format of what it emits.
    fn open(&mut self, format: &MediaFormat) -> anyhow::Result<MediaFormat>;

    fn push(&mut self, input: Payload) -> anyhow::Result<Vec<Payload>>;

    /// Drains everything still buffered after the last input.
    fn flush(&mut self) -> anyhow::Result<Vec<Payload>>;

    fn close(&mut self) {}
}

struct OutputBuffer {
    payload: Option<Payload>,
    info: BufferInfo,
}

/// Drives a [`Transform`] through the numbered-buffer protocol of [`Codec`].
///
/// Input buffers are only handed back once every produced output found a free
/// output buffer, so a consumer that holds on to output buffers (the video
/// render loop) throttles decoding.
pub struct BufferedCodec {
    name: String,
    transform: Box<dyn Transform>,
    input: CodecInput,
    sink: Option<FrameSink>,
    events: Option<Sender<CodecEvent>>,
    output_format: Option<MediaFormat>,
    format_announced: bool,
    ready: VecDeque<OutputBuffer>,
    outputs: HashMap<usize, OutputBuffer>,
    free_outputs: Vec<usize>,
    held_inputs: Vec<usize>,
    last_pts_us: i64,
    input_ended: bool,
    failed: bool,
    released: bool,
}

impl BufferedCodec {
    pub fn new(name: impl Into<String>, transform: Box<dyn Transform>) -> Self {
        Self {
            name: name.into(),
            transform,
            input: CodecInput::Buffers,
            sink: None,
            events: None,
            output_format: None,
            format_announced: false,
            ready: VecDeque::new(),
            outputs: HashMap::new(),
            free_outputs: (0..OUTPUT_BUFFERS).rev().collect(),
            held_inputs: Vec::new(),
            last_pts_us: 0,
            input_ended: false,
            failed: false,
            released: false,
        }
    }

    fn emit(&self, event: CodecEvent) {
        if let Some(events) = &self.events {
            // the worker may already be gone during teardown
            _ = events.send(event);
        }
    }

    fn fail(&mut self, error: anyhow::Error) {
        warn!(codec = %self.name, %error, "codec failed");
        self.failed = true;
        self.emit(CodecEvent::Error(format!("{}: {error:#}", self.name)));
    }

    fn ensure_running(&self) -> anyhow::Result<()> {
        if self.released {
            bail!("{} used after release", self.name);
        }
        if self.events.is_none() {
            bail!("{} is not started", self.name);
        }
        Ok(())
    }

    fn feed(&mut self, payload: Payload) {
        if self.failed {
            return;
        }
        match self.transform.push(payload) {
            Ok(produced) => self.enqueue(produced),
            Err(error) => self.fail(error),
        }
    }

    /// Flushes the transform and queues the end-of-stream buffer.
    fn finish(&mut self, pts_us: i64) {
        if self.failed {
            return;
        }
        match self.transform.flush() {
            Ok(rest) => self.enqueue(rest),
            Err(error) => return self.fail(error),
        }
        self.enqueue(vec![Payload::Sample(Sample::end_of_stream(pts_us))]);
    }

    fn enqueue(&mut self, produced: Vec<Payload>) {
        for payload in produced {
            let info = payload.info();
            self.last_pts_us = self.last_pts_us.max(info.pts_us);
            self.ready.push_back(OutputBuffer {
                payload: Some(payload),
                info,
            });
        }
        self.drain();
    }

    /// Moves produced output into free output buffers.
    fn drain(&mut self) {
        while !self.ready.is_empty() {
            let Some(buffer) = self.free_outputs.pop() else {
                break;
            };
            if !self.format_announced {
                self.format_announced = true;
                if let Some(format) = self.output_format.clone() {
                    self.emit(CodecEvent::FormatChanged(format));
                }
            }
            let Some(output) = self.ready.pop_front() else {
                break;
            };
            let info = output.info;
            trace!(codec = %self.name, buffer, pts_us = info.pts_us, size = info.size, "output ready");
            self.outputs.insert(buffer, output);
            self.emit(CodecEvent::OutputReady(buffer, info));
        }
        if self.ready.is_empty() {
            for buffer in std::mem::take(&mut self.held_inputs) {
                self.emit(CodecEvent::InputReady(buffer));
            }
        }
    }

    fn return_input(&mut self, buffer: usize) {
        if self.input_ended {
            return;
        }
        if self.ready.is_empty() {
            self.emit(CodecEvent::InputReady(buffer));
        } else {
            self.held_inputs.push(buffer);
        }
    }
}

impl Codec for BufferedCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(
        &mut self,
        format: &MediaFormat,
        sink: Option<FrameSink>,
        input: CodecInput,
    ) -> anyhow::Result<()> {
        if self.released {
            bail!("{} configured after release", self.name);
        }
        let output_format = self.transform.open(format)?;
        debug!(codec = %self.name, ?input, output = %output_format.codec, "codec configured");
        self.output_format = Some(output_format);
        self.sink = sink;
        self.input = input;
        Ok(())
    }

    fn start(&mut self, events: Sender<CodecEvent>) -> anyhow::Result<()> {
        if self.output_format.is_none() {
            bail!("{} started before configure", self.name);
        }
        self.events = Some(events);
        if self.input == CodecInput::Buffers {
            for buffer in 0..INPUT_BUFFERS {
                self.emit(CodecEvent::InputReady(buffer));
            }
        }
        Ok(())
    }

    fn queue_input(&mut self, buffer: usize, sample: Sample) -> anyhow::Result<()> {
        self.ensure_running()?;
        if self.input != CodecInput::Buffers || buffer >= INPUT_BUFFERS {
            bail!("{}: invalid input buffer {buffer}", self.name);
        }
        if self.input_ended {
            bail!("{}: input after end of stream", self.name);
        }
        if sample.is_end_of_stream() {
            self.input_ended = true;
            let pts_us = sample.pts_us;
            if !sample.is_empty() {
                let flags = sample.flags.without(BufferFlags::END_OF_STREAM);
                self.feed(Payload::Sample(Sample { flags, ..sample }));
            }
            self.finish(pts_us);
        } else if !sample.is_empty() {
            self.feed(Payload::Sample(sample));
        }
        self.return_input(buffer);
        Ok(())
    }

    fn queue_frame(&mut self, frame: VideoFrame) -> anyhow::Result<()> {
        self.ensure_running()?;
        if self.input != CodecInput::Surface {
            bail!("{} does not take surface input", self.name);
        }
        if self.input_ended {
            bail!("{}: frame after end of stream", self.name);
        }
        self.feed(Payload::Frame(frame));
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()> {
        self.ensure_running()?;
        if self.input_ended {
            return Ok(());
        }
        self.input_ended = true;
        self.finish(self.last_pts_us);
        Ok(())
    }

    fn output(&self, buffer: usize) -> Option<Bytes> {
        match self.outputs.get(&buffer)?.payload.as_ref()? {
            Payload::Sample(sample) => Some(sample.data.clone()),
            Payload::Frame(frame) => Some(frame.data.clone()),
        }
    }

    fn release_output(&mut self, buffer: usize, render: bool) -> anyhow::Result<()> {
        self.ensure_running()?;
        let output = self
            .outputs
            .remove(&buffer)
            .ok_or_else(|| anyhow!("{}: output buffer {buffer} is not held", self.name))?;
        if render {
            match (output.payload, &self.sink) {
                (Some(Payload::Frame(frame)), Some(sink)) => sink.post(frame),
                (_, None) => bail!("{}: render requested without a sink", self.name),
                _ => {}
            }
        }
        self.free_outputs.push(buffer);
        self.drain();
        Ok(())
    }

    fn stop(&mut self) {
        self.events = None;
        self.ready.clear();
        self.outputs.clear();
        self.held_inputs.clear();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.stop();
        self.transform.close();
        self.sink = None;
        self.released = true;
        debug!(codec = %self.name, "codec released");
    }
}
