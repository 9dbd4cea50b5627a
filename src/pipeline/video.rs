use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::bail;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::{PipelineContext, SharedDemuxer};
use crate::backend::{Demuxer, MediaBackend};
use crate::codec::{Codec, CodecEvent, CodecHandler, CodecInput, CodecWorker};
use crate::error::CompressError;
use crate::frame_selector::{self, PendingFrame, Rendered, Selection};
use crate::job::JobParams;
use crate::media::{MediaFormat, TrackKind, VideoFrame};
use crate::surface::{InputSurface, OutputSurface};

/// Decoded frames waiting for the render loop.
#[derive(Default)]
struct DecodedFrames {
    pending: VecDeque<PendingFrame>,
    last: Option<Rendered>,
    decode_eos: bool,
}

pub(crate) struct VideoTrack {
    job_id: String,
    decoder: Arc<CodecWorker>,
    encoder: Arc<CodecWorker>,
    demuxer: SharedDemuxer,
    output_surface: Arc<Mutex<OutputSurface>>,
    input_surface: Arc<Mutex<InputSurface>>,
    render_loop: Option<JoinHandle<()>>,
}

impl VideoTrack {
    pub fn start(
        context: &Arc<PipelineContext>,
        backend: &dyn MediaBackend,
        demuxer: Box<dyn Demuxer>,
        params: &JobParams,
        width: u32,
        height: u32,
    ) -> Result<Self, CompressError> {
        let job_id = context.job_id.clone();
        let source = demuxer.format().clone();
        let duration_us = source.duration_us.unwrap_or(params.duration_us);
        let demuxer = SharedDemuxer::new(demuxer);

        let encoder_format = MediaFormat::video("h264", width, height)
            .with_bitrate(params.bitrate)
            .with_frame_rate(f64::from(params.fps));
        let encoder_codec = backend
            .create_encoder(&encoder_format)
            .map_err(|error| CompressError::configuration(error.context("create video encoder")))?;
        let encoder = Arc::new(
            CodecWorker::spawn(
                format!("video-encoder-{job_id}"),
                encoder_codec,
                Box::new(VideoEncodeHandler {
                    context: context.clone(),
                }),
            )
            .map_err(CompressError::internal)?,
        );
        encoder.configure(encoder_format, None, CodecInput::Surface)?;
        encoder.start()?;
        let input_surface = Arc::new(Mutex::new(InputSurface::new(encoder.clone())));

        let renderer = backend
            .create_renderer(&source, width, height)
            .map_err(|error| CompressError::configuration(error.context("create renderer")))?;
        let output_surface = Arc::new(Mutex::new(OutputSurface::new(renderer)));
        let sink = output_surface.lock().sink();

        let frames = Arc::new(Mutex::new(DecodedFrames::default()));
        let (notify, frame_ready) = bounded(1);
        let decoder_codec = backend
            .create_decoder(&source)
            .map_err(|error| CompressError::configuration(error.context("create video decoder")))?;
        let decoder = Arc::new(
            CodecWorker::spawn(
                format!("video-decoder-{job_id}"),
                decoder_codec,
                Box::new(VideoDecodeHandler {
                    context: context.clone(),
                    demuxer: demuxer.clone(),
                    frames: frames.clone(),
                    notify,
                    input_ended: false,
                }),
            )
            .map_err(CompressError::internal)?,
        );
        decoder.configure(source, Some(sink), CodecInput::Buffers)?;
        decoder.start()?;

        let render_loop = std::thread::Builder::new()
            .name(format!("video-render-{job_id}"))
            .spawn({
                let render = RenderLoop {
                    context: context.clone(),
                    decoder: decoder.clone(),
                    frames,
                    frame_ready,
                    output_surface: output_surface.clone(),
                    input_surface: input_surface.clone(),
                    fps: params.fps,
                    duration_us,
                };
                move || render.run()
            })
            .map_err(|error| CompressError::internal(error.into()))?;
        info!(job_id = %job_id, duration_us, "video track started");

        Ok(Self {
            job_id,
            decoder,
            encoder,
            demuxer,
            output_surface,
            input_surface,
            render_loop: Some(render_loop),
        })
    }

    pub fn release_codecs(&self) {
        self.decoder.release();
        self.encoder.release();
    }

    pub fn release_demuxer(&self) {
        self.demuxer.release();
    }

    /// Releases both surfaces and waits for the render loop to exit.
    pub fn release_surfaces(mut self) {
        self.output_surface.lock().release();
        self.input_surface.lock().release();
        if let Some(render_loop) = self.render_loop.take()
            && render_loop.join().is_err()
        {
            tracing::error!(job_id = %self.job_id, "video render loop panicked");
        }
    }
}

struct VideoDecodeHandler {
    context: Arc<PipelineContext>,
    demuxer: SharedDemuxer,
    frames: Arc<Mutex<DecodedFrames>>,
    notify: Sender<()>,
    input_ended: bool,
}

impl CodecHandler for VideoDecodeHandler {
    fn on_event(&mut self, codec: &mut dyn Codec, event: CodecEvent) -> anyhow::Result<()> {
        match event {
            CodecEvent::InputReady(buffer) => {
                if self.input_ended || self.context.is_cancelled() {
                    return Ok(());
                }
                let sample = self.demuxer.next_sample()?;
                self.input_ended = sample.is_end_of_stream();
                codec.queue_input(buffer, sample)?;
            }
            CodecEvent::OutputReady(buffer, info) => {
                if info.is_end_of_stream() {
                    codec.release_output(buffer, false)?;
                    self.frames.lock().decode_eos = true;
                    debug!(job_id = %self.context.job_id, "video decode finished");
                } else {
                    self.frames.lock().pending.push_back(PendingFrame {
                        buffer,
                        pts_us: info.pts_us,
                    });
                }
                _ = self.notify.try_send(());
            }
            CodecEvent::FormatChanged(format) => {
                debug!(job_id = %self.context.job_id, width = format.width, height = format.height, "video decoder output format");
            }
            CodecEvent::Error(reason) => bail!(reason),
        }
        Ok(())
    }

    fn on_failure(&mut self, error: anyhow::Error) {
        self.context.fail("video decoder", error);
    }
}

struct VideoEncodeHandler {
    context: Arc<PipelineContext>,
}

impl CodecHandler for VideoEncodeHandler {
    fn on_event(&mut self, codec: &mut dyn Codec, event: CodecEvent) -> anyhow::Result<()> {
        match event {
            CodecEvent::InputReady(_) => {}
            CodecEvent::OutputReady(buffer, info) => {
                self.context.write_encoded(TrackKind::Video, codec, buffer, info)?;
            }
            CodecEvent::FormatChanged(format) => {
                self.context.muxer.add_track(TrackKind::Video, &format)?;
            }
            CodecEvent::Error(reason) => bail!(reason),
        }
        Ok(())
    }

    fn on_failure(&mut self, error: anyhow::Error) {
        self.context.fail("video encoder", error);
    }
}

enum Step {
    Rendered,
    Wait,
    Finished,
}

/// Resamples decoded frames onto the output frame grid and feeds the encoder.
struct RenderLoop {
    context: Arc<PipelineContext>,
    decoder: Arc<CodecWorker>,
    frames: Arc<Mutex<DecodedFrames>>,
    frame_ready: Receiver<()>,
    output_surface: Arc<Mutex<OutputSurface>>,
    input_surface: Arc<Mutex<InputSurface>>,
    fps: u32,
    duration_us: i64,
}

impl RenderLoop {
    fn run(self) {
        let job_id = self.context.job_id.clone();
        let mut index = 0u64;
        debug!(job_id = %job_id, fps = self.fps, "render loop started");
        loop {
            if self.context.is_cancelled() {
                break;
            }
            let step = {
                let mut slot = self.decoder.lock();
                let Some(decoder) = slot.codec() else {
                    break;
                };
                self.step(decoder, index)
            };
            match step {
                Ok(Step::Rendered) => index += 1,
                Ok(Step::Wait) => {
                    _ = self.frame_ready.recv_timeout(self.context.settings.render_poll);
                }
                Ok(Step::Finished) => {
                    info!(job_id = %job_id, frames = index, "render loop finished");
                    break;
                }
                Err(error) => {
                    self.context.fail("video render", error);
                    break;
                }
            }
        }
        debug!(job_id = %job_id, "render loop exited");
    }

    fn step(&self, decoder: &mut dyn Codec, index: u64) -> anyhow::Result<Step> {
        let target_us = frame_selector::output_time_us(index, self.fps);
        if target_us >= self.duration_us {
            self.input_surface.lock().signal_end_of_input_stream()?;
            return Ok(Step::Finished);
        }

        let decision = {
            let mut guard = self.frames.lock();
            let frames = &mut *guard;
            frame_selector::select(&mut frames.pending, frames.last, frames.decode_eos, target_us)
        };
        for dropped in decision.dropped {
            trace!(pts_us = dropped.pts_us, target_us, "dropping frame");
            decoder.release_output(dropped.buffer, false)?;
        }

        match decision.selection {
            Selection::Consume(frame) => {
                decoder.release_output(frame.buffer, true)?;
                let picture = {
                    let mut surface = self.output_surface.lock();
                    surface.await_new_image(self.context.settings.frame_wait)?;
                    surface.draw_image()?
                };
                self.encode(picture, target_us)?;
                self.frames.lock().last = Some(Rendered {
                    output_us: target_us,
                    source_pts_us: frame.pts_us,
                });
                Ok(Step::Rendered)
            }
            Selection::Repeat => {
                let picture = self.output_surface.lock().draw_image()?;
                self.encode(picture, target_us)?;
                if let Some(last) = self.frames.lock().last.as_mut() {
                    last.output_us = target_us;
                }
                Ok(Step::Rendered)
            }
            Selection::Wait => Ok(Step::Wait),
            Selection::Exhausted => {
                self.input_surface.lock().signal_end_of_input_stream()?;
                Ok(Step::Finished)
            }
        }
    }

    fn encode(&self, picture: VideoFrame, target_us: i64) -> anyhow::Result<()> {
        let mut surface = self.input_surface.lock();
        surface.set_presentation_time(target_us);
        surface.swap_buffers(picture)
    }
}
