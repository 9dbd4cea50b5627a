//! One job's transcode: video and audio tracks, the shared muxer, progress and
//! the single teardown.

mod audio;
mod muxer;
mod progress;
mod video;

pub use muxer::SharedMuxer;
pub use progress::Progress;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{Demuxer, MediaBackend};
use crate::codec::Codec;
use crate::error::CompressError;
use crate::job::{JobParams, JobReporter};
use crate::media::{BufferFlags, BufferInfo, Sample, TrackKind};
use audio::AudioTrack;
use video::VideoTrack;

/// Timing knobs of a running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Tick of the wait for the muxer to start.
    pub muxer_poll: Duration,
    /// How long the render loop sleeps when no decoded frame is ready.
    pub render_poll: Duration,
    /// How long the audio encoder waits for a decoded chunk before feeding an
    /// empty buffer.
    pub queue_poll: Duration,
    /// Upper bound for a rendered frame to reach the output surface.
    pub frame_wait: Duration,
    pub audio_queue_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            muxer_poll: Duration::from_millis(50),
            render_poll: Duration::from_millis(5),
            queue_poll: Duration::from_millis(10),
            frame_wait: Duration::from_secs(1),
            audio_queue_capacity: 100,
        }
    }
}

/// Asks the owner of a pipeline to tear it down.
pub struct CompletionHandle(Box<dyn Fn() + Send + Sync>);

impl CompletionHandle {
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(notify))
    }

    fn notify(&self) {
        (self.0)()
    }
}

/// State shared by every thread of one pipeline.
pub(crate) struct PipelineContext {
    pub job_id: String,
    pub settings: PipelineSettings,
    pub muxer: SharedMuxer,
    pub cancelled: AtomicBool,
    progress: Mutex<Progress>,
    reporter: JobReporter,
    completion: CompletionHandle,
    stop_requested: AtomicBool,
    error: Mutex<Option<CompressError>>,
}

impl PipelineContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Records a failure and asks for teardown. Failures after the pipeline
    /// began stopping are side effects of the stop and are only logged.
    pub fn fail(&self, stage: &str, error: anyhow::Error) {
        if self.is_cancelled() {
            debug!(job_id = %self.job_id, stage, error = %format!("{error:#}"), "ignoring failure while stopping");
            return;
        }
        let error = match error.downcast::<CompressError>() {
            Ok(error) => error,
            Err(error) => CompressError::internal(error.context(stage.to_string())),
        };
        error!(job_id = %self.job_id, stage, %error, "transcode failed");
        self.record_error(error);
        self.request_stop();
    }

    fn record_error(&self, error: CompressError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn request_stop(&self) {
        self.cancelled.store(true, Ordering::Release);
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            self.completion.notify();
        }
    }

    pub fn on_sample_written(&self, kind: TrackKind, pts_us: Option<i64>, end_of_stream: bool) {
        let all_ended = {
            let mut progress = self.progress.lock();
            if let Some(pts_us) = pts_us {
                progress.record(kind, pts_us);
            }
            let all_ended = end_of_stream && progress.mark_end(kind);
            if let Some(percent) = progress.update() {
                self.reporter.progress(percent);
            }
            all_ended
        };
        if end_of_stream {
            info!(job_id = %self.job_id, %kind, "track finished");
        }
        if all_ended {
            info!(job_id = %self.job_id, "all tracks drained");
            self.request_stop();
        }
    }

    /// Writes one encoder output buffer to the muxer and gives it back.
    pub fn write_encoded(
        &self,
        kind: TrackKind,
        codec: &mut dyn Codec,
        buffer: usize,
        info: BufferInfo,
    ) -> anyhow::Result<()> {
        if info.is_codec_config() {
            return codec.release_output(buffer, false);
        }
        let mut written = None;
        if info.size > 0 {
            if !self.muxer.wait_started(self.settings.muxer_poll, &self.cancelled) {
                debug!(job_id = %self.job_id, %kind, "dropping output, pipeline is stopping");
                return codec.release_output(buffer, false);
            }
            let Some(data) = codec.output(buffer) else {
                bail!("{kind} encoder output buffer {buffer} holds no data");
            };
            let sample = Sample {
                data,
                pts_us: info.pts_us,
                flags: info.flags.without(BufferFlags::END_OF_STREAM),
            };
            self.muxer
                .write_sample(kind, &sample)
                .map_err(|error| CompressError::Io(std::io::Error::other(format!("{error:#}"))))?;
            written = Some(info.pts_us);
        }
        codec.release_output(buffer, false)?;
        self.on_sample_written(kind, written, info.is_end_of_stream());
        Ok(())
    }
}

/// A demuxer shared between a decoder's worker and the teardown.
#[derive(Clone)]
pub(crate) struct SharedDemuxer(Arc<Mutex<Option<Box<dyn Demuxer>>>>);

impl SharedDemuxer {
    fn new(demuxer: Box<dyn Demuxer>) -> Self {
        Self(Arc::new(Mutex::new(Some(demuxer))))
    }

    /// Next sample, or an end-of-stream sample once the track (or the demuxer)
    /// is gone.
    fn next_sample(&self) -> anyhow::Result<Sample> {
        let mut demuxer = self.0.lock();
        let Some(demuxer) = demuxer.as_mut() else {
            return Ok(Sample::end_of_stream(0));
        };
        Ok(demuxer
            .read_sample()?
            .unwrap_or_else(|| Sample::end_of_stream(0)))
    }

    fn release(&self) {
        if let Some(mut demuxer) = self.0.lock().take() {
            demuxer.release();
        }
    }
}

/// Output size after applying the source rotation.
pub fn output_size(params: &JobParams) -> (u32, u32) {
    match params.rotation.rem_euclid(360) {
        90 | 270 => (params.height, params.width),
        _ => (params.width, params.height),
    }
}

pub struct TranscodePipeline {
    context: Arc<PipelineContext>,
    video: Mutex<Option<VideoTrack>>,
    audio: Mutex<Option<AudioTrack>>,
    torn_down: AtomicBool,
    teardowns: Arc<AtomicUsize>,
    aborted: AtomicBool,
}

impl TranscodePipeline {
    /// Opens the source tracks, checks encoder limits, creates the output and
    /// starts every codec. Nothing keeps running if this fails.
    pub fn start(
        job_id: &str,
        params: &JobParams,
        backend: &dyn MediaBackend,
        settings: &PipelineSettings,
        reporter: JobReporter,
        completion: CompletionHandle,
        teardowns: Arc<AtomicUsize>,
    ) -> Result<Self, CompressError> {
        let unreadable = |error: anyhow::Error| CompressError::SourceUnreadable(format!("{error:#}"));
        let video_demuxer = backend
            .open_demuxer(&params.source, TrackKind::Video)
            .map_err(unreadable)?;
        let audio_demuxer = backend
            .open_demuxer(&params.source, TrackKind::Audio)
            .map_err(unreadable)?;
        if video_demuxer.is_none() && audio_demuxer.is_none() {
            return Err(CompressError::NoMediaTrack);
        }

        let (width, height) = output_size(params);
        if video_demuxer.is_some() {
            backend
                .video_encoder_capabilities()
                .check(params.fps, width, height, params.bitrate)
                .map_err(CompressError::UnsupportedParameters)?;
        }

        let muxer = backend.create_muxer(&params.output_path).map_err(|error| {
            CompressError::Io(std::io::Error::other(format!(
                "create {}: {error:#}",
                params.output_path.display()
            )))
        })?;
        let expected = usize::from(video_demuxer.is_some()) + usize::from(audio_demuxer.is_some());
        info!(
            job_id,
            video = video_demuxer.is_some(),
            audio = audio_demuxer.is_some(),
            width,
            height,
            fps = params.fps,
            bitrate = params.bitrate,
            "starting pipeline"
        );

        let context = Arc::new(PipelineContext {
            job_id: job_id.to_string(),
            settings: settings.clone(),
            muxer: SharedMuxer::new(job_id, muxer, expected),
            cancelled: AtomicBool::new(false),
            progress: Mutex::new(Progress::new(
                params.duration_us,
                video_demuxer.is_some(),
                audio_demuxer.is_some(),
            )),
            reporter,
            completion,
            stop_requested: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        let pipeline = Self {
            context: context.clone(),
            video: Mutex::new(None),
            audio: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            teardowns,
            aborted: AtomicBool::new(false),
        };

        let started = (|| -> Result<(), CompressError> {
            if let Some(demuxer) = video_demuxer {
                let track = VideoTrack::start(&context, backend, demuxer, params, width, height)?;
                *pipeline.video.lock() = Some(track);
            }
            if let Some(demuxer) = audio_demuxer {
                let track = AudioTrack::start(&context, backend, demuxer)?;
                *pipeline.audio.lock() = Some(track);
            }
            Ok(())
        })();

        match started {
            Ok(()) => Ok(pipeline),
            Err(error) => {
                warn!(job_id, %error, "pipeline failed to start");
                pipeline.stop_and_release();
                Err(error)
            }
        }
    }

    pub fn job_id(&self) -> &str {
        &self.context.job_id
    }

    /// Marks the run as cancelled by its owner; the teardown then reports failure.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.context.cancelled.store(true, Ordering::Release);
    }

    pub fn take_error(&self) -> Option<CompressError> {
        self.context.error.lock().take()
    }

    /// Stops and releases everything once. Returns `None` when the teardown
    /// already ran, otherwise whether the job fully drained without error or
    /// abort.
    pub fn stop_and_release(&self) -> Option<bool> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            debug!(job_id = %self.context.job_id, "teardown already ran");
            return None;
        }
        self.teardowns.fetch_add(1, Ordering::AcqRel);
        info!(job_id = %self.context.job_id, "stopping and releasing pipeline");
        self.context.cancelled.store(true, Ordering::Release);

        if let Err(error) = self.context.muxer.stop_and_release() {
            self.context.record_error(CompressError::Io(std::io::Error::other(format!(
                "finalize output: {error:#}"
            ))));
        }

        let video = self.video.lock().take();
        let audio = self.audio.lock().take();
        if let Some(video) = &video {
            video.release_codecs();
        }
        if let Some(audio) = &audio {
            audio.release_codecs();
        }
        if let Some(video) = &video {
            video.release_demuxer();
        }
        if let Some(audio) = &audio {
            audio.release_demuxer();
        }
        if let Some(video) = video {
            video.release_surfaces();
        }
        drop(audio);

        let drained = self.context.progress.lock().is_drained();
        let success = drained
            && !self.aborted.load(Ordering::Acquire)
            && self.context.error.lock().is_none();
        info!(job_id = %self.context.job_id, drained, success, "pipeline released");
        Some(success)
    }
}

impl Drop for TranscodePipeline {
    fn drop(&mut self) {
        self.stop_and_release();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use crossbeam_channel::Sender;

    use super::*;
    use crate::backend::Muxer;
    use crate::codec::{CodecEvent, CodecInput};
    use crate::error::ErrorKind;
    use crate::job::Job;
    use crate::media::{MediaFormat, VideoFrame};
    use crate::surface::FrameSink;

    /// Counts written samples.
    struct Counting(Arc<AtomicUsize>);

    impl Muxer for Counting {
        fn add_track(&mut self, _format: &MediaFormat) -> anyhow::Result<usize> {
            Ok(0)
        }

        fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn write_sample(&mut self, _track: usize, _sample: &Sample) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// An encoder that announces output buffers it has no payload for.
    #[derive(Default)]
    struct Hollow {
        released: Vec<usize>,
    }

    impl Codec for Hollow {
        fn name(&self) -> &str {
            "hollow"
        }

        fn configure(&mut self, _: &MediaFormat, _: Option<FrameSink>, _: CodecInput) -> anyhow::Result<()> {
            Ok(())
        }

        fn start(&mut self, _events: Sender<CodecEvent>) -> anyhow::Result<()> {
            Ok(())
        }

        fn queue_input(&mut self, _buffer: usize, _sample: Sample) -> anyhow::Result<()> {
            Ok(())
        }

        fn queue_frame(&mut self, _frame: VideoFrame) -> anyhow::Result<()> {
            Ok(())
        }

        fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn output(&self, _buffer: usize) -> Option<Bytes> {
            None
        }

        fn release_output(&mut self, buffer: usize, _render: bool) -> anyhow::Result<()> {
            self.released.push(buffer);
            Ok(())
        }

        fn stop(&mut self) {}

        fn release(&mut self) {}
    }

    fn context(written: Arc<AtomicUsize>) -> PipelineContext {
        let (job, _events) = Job::new();
        let muxer = SharedMuxer::new("job", Box::new(Counting(written)), 1);
        muxer.add_track(TrackKind::Video, &MediaFormat::video("h264", 2, 2)).unwrap();
        PipelineContext {
            job_id: "job".to_string(),
            settings: PipelineSettings::default(),
            muxer,
            cancelled: AtomicBool::new(false),
            progress: Mutex::new(Progress::new(1_000_000, true, false)),
            reporter: job.reporter().clone(),
            completion: CompletionHandle::new(|| {}),
            stop_requested: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    #[test]
    fn test_missing_encoder_output_fails_the_pipeline() {
        let written = Arc::new(AtomicUsize::new(0));
        let context = context(written.clone());
        let mut codec = Hollow::default();
        let info = BufferInfo {
            size: 16,
            pts_us: 0,
            flags: BufferFlags::NONE,
        };

        let error = context
            .write_encoded(TrackKind::Video, &mut codec, 3, info)
            .unwrap_err();
        assert_eq!(written.load(Ordering::Acquire), 0);
        assert!(codec.released.is_empty());

        context.fail("video encoder", error);
        assert!(context.is_cancelled());
        let recorded = context.error.lock().take().unwrap();
        assert_eq!(recorded.kind(), ErrorKind::InternalTranscodeError);
    }

    fn params(rotation: i32) -> JobParams {
        JobParams {
            source: "in.mp4".into(),
            bitrate: 1,
            fps: 30,
            width: 1280,
            height: 720,
            rotation,
            duration_us: 1,
            output_path: "out.mp4".into(),
        }
    }

    #[test]
    fn test_output_size_follows_rotation() {
        assert_eq!(output_size(&params(0)), (1280, 720));
        assert_eq!(output_size(&params(90)), (720, 1280));
        assert_eq!(output_size(&params(180)), (1280, 720));
        assert_eq!(output_size(&params(270)), (720, 1280));
        assert_eq!(output_size(&params(-90)), (720, 1280));
    }
}
