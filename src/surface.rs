//! Render targets between the video decoder and the video encoder.
//!
//! The decoder posts a frame to its [`FrameSink`] when an output buffer is
//! released with `render = true`. The [`OutputSurface`] picks it up, a
//! [`FrameRenderer`] scales and rotates it, and the [`InputSurface`] stamps the
//! output time and hands the picture to the encoder.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::debug;

use crate::codec::CodecWorker;
use crate::media::VideoFrame;

/// Draws a decoded picture at the output size and orientation.
pub trait FrameRenderer: Send {
    fn draw(&mut self, frame: &VideoFrame) -> anyhow::Result<VideoFrame>;

    fn release(&mut self) {}
}

/// Where a decoder delivers rendered frames.
#[derive(Clone)]
pub struct FrameSink(Sender<VideoFrame>);

impl FrameSink {
    pub fn channel() -> (FrameSink, Receiver<VideoFrame>) {
        let (tx, rx) = unbounded();
        (FrameSink(tx), rx)
    }

    pub fn post(&self, frame: VideoFrame) {
        // a released surface no longer listens
        _ = self.0.send(frame);
    }
}

pub struct OutputSurface {
    sink: FrameSink,
    frames: Receiver<VideoFrame>,
    renderer: Option<Box<dyn FrameRenderer>>,
    image: Option<VideoFrame>,
}

impl OutputSurface {
    pub fn new(renderer: Box<dyn FrameRenderer>) -> Self {
        let (sink, frames) = FrameSink::channel();
        Self {
            sink,
            frames,
            renderer: Some(renderer),
            image: None,
        }
    }

    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Waits for the frame the decoder was just asked to render.
    pub fn await_new_image(&mut self, timeout: Duration) -> anyhow::Result<()> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => {
                self.image = Some(frame);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => bail!("frame wait timed out after {timeout:?}"),
            Err(RecvTimeoutError::Disconnected) => bail!("output surface disconnected"),
        }
    }

    /// Renders the latest image; called again without a new image it repeats it.
    pub fn draw_image(&mut self) -> anyhow::Result<VideoFrame> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| anyhow!("no image to draw"))?;
        let renderer = self
            .renderer
            .as_mut()
            .ok_or_else(|| anyhow!("output surface is released"))?;
        renderer.draw(image)
    }

    pub fn release(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            renderer.release();
            debug!("output surface released");
        }
        self.image = None;
    }
}

/// Encoder input: frames swapped in here are queued on the encoder under its
/// worker lock.
pub struct InputSurface {
    encoder: Option<Arc<CodecWorker>>,
    presentation_time_us: i64,
}

impl InputSurface {
    pub fn new(encoder: Arc<CodecWorker>) -> Self {
        Self {
            encoder: Some(encoder),
            presentation_time_us: 0,
        }
    }

    pub fn set_presentation_time(&mut self, pts_us: i64) {
        self.presentation_time_us = pts_us;
    }

    pub fn swap_buffers(&mut self, mut frame: VideoFrame) -> anyhow::Result<()> {
        frame.pts_us = self.presentation_time_us;
        self.encoder()?
            .with_codec(|codec| codec.queue_frame(frame))
            .ok_or_else(|| anyhow!("video encoder is released"))?
    }

    pub fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()> {
        self.encoder()?
            .with_codec(|codec| codec.signal_end_of_input_stream())
            .ok_or_else(|| anyhow!("video encoder is released"))?
    }

    fn encoder(&self) -> anyhow::Result<&CodecWorker> {
        self.encoder
            .as_deref()
            .ok_or_else(|| anyhow!("input surface is released"))
    }

    pub fn release(&mut self) {
        if self.encoder.take().is_some() {
            debug!("input surface released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Halve {
        draws: Vec<u64>,
    }

    impl FrameRenderer for Halve {
        fn draw(&mut self, frame: &VideoFrame) -> anyhow::Result<VideoFrame> {
            self.draws.push(frame.tag);
            Ok(VideoFrame {
                width: frame.width / 2,
                height: frame.height / 2,
                ..frame.clone()
            })
        }
    }

    #[test]
    fn test_draw_repeats_last_image() {
        let mut surface = OutputSurface::new(Box::new(Halve { draws: Vec::new() }));
        assert!(surface.draw_image().is_err());

        surface.sink().post(VideoFrame {
            width: 640,
            height: 360,
            tag: 3,
            ..Default::default()
        });
        surface.await_new_image(Duration::from_millis(100)).unwrap();
        let first = surface.draw_image().unwrap();
        let again = surface.draw_image().unwrap();
        assert_eq!((first.width, first.height), (320, 180));
        assert_eq!(again.tag, 3);
    }

    #[test]
    fn test_await_times_out() {
        let mut surface = OutputSurface::new(Box::new(Halve { draws: Vec::new() }));
        let error = surface.await_new_image(Duration::from_millis(5)).unwrap_err();
        assert!(error.to_string().contains("timed out"));
    }

    #[test]
    fn test_released_surface_refuses_to_draw() {
        let mut surface = OutputSurface::new(Box::new(Halve { draws: Vec::new() }));
        surface.sink().post(VideoFrame::default());
        surface.await_new_image(Duration::from_millis(100)).unwrap();
        surface.release();
        surface.release();
        assert!(surface.draw_image().is_err());
    }
}
