use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use video_compress::backend::synthetic::{Fault, SyntheticAudio, SyntheticBackend, SyntheticSource};
use video_compress::media::TrackKind;
use video_compress::{
    CompressRequest, Compressor, CompressorSettings, EncoderCapabilities, ErrorKind, JobEvent, JobHandle, JobState,
    PipelineSettings, SchedulerSettings,
};

const SECOND: i64 = 1_000_000;

/// A compressor over the synthetic backend writing into a temporary directory.
struct Harness {
    backend: SyntheticBackend,
    compressor: Compressor,
    output_dir: PathBuf,
    _workspace: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_queue_capacity(100)
    }

    fn with_queue_capacity(queue_capacity: usize) -> Self {
        // Only open when debugging
        // tracing_subscriber::fmt::init();

        let workspace = tempfile::tempdir().unwrap();
        let output_dir = workspace.path().join("out");
        let backend = SyntheticBackend::new();
        let settings = CompressorSettings {
            output_dir: output_dir.clone(),
            default_fps: 30,
            scheduler: SchedulerSettings {
                queue_capacity,
                pipeline: PipelineSettings {
                    muxer_poll: Duration::from_millis(5),
                    render_poll: Duration::from_millis(1),
                    queue_poll: Duration::from_millis(2),
                    ..PipelineSettings::default()
                },
            },
        };
        let compressor = Compressor::new(Arc::new(backend.clone()), settings).unwrap();
        Self {
            backend,
            compressor,
            output_dir,
            _workspace: workspace,
        }
    }

    fn source(&self, name: &str, source: SyntheticSource) -> PathBuf {
        let path = PathBuf::from("/videos").join(name);
        self.backend.add_source(&path, source);
        path
    }

    async fn submit(&self, request: CompressRequest) -> JobHandle {
        let handle = self.compressor.create_job();
        self.compressor.compress(&handle, request).await.unwrap();
        handle
    }

    fn outputs(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries.map(|entry| entry.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn request(source: &Path) -> CompressRequest {
    CompressRequest {
        source: source.to_path_buf(),
        ..Default::default()
    }
}

/// Every event of a job, up to and including the terminal one.
async fn events(handle: &JobHandle) -> Vec<JobEvent> {
    let receiver = handle.events();
    timeout(Duration::from_secs(20), async move {
        let mut events = Vec::new();
        while let Ok(event) = receiver.recv().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("job did not finish in time")
}

fn terminal(events: &[JobEvent]) -> &JobEvent {
    let last = events.last().expect("no event received");
    assert!(last.is_terminal(), "stream closed without a terminal event: {events:?}");
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
    last
}

fn failure_kind(events: &[JobEvent]) -> ErrorKind {
    match terminal(events) {
        JobEvent::Failed { kind, .. } => *kind,
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_compress_halves_frame_rate() {
    let harness = Harness::new();
    let source = harness.source("clip.mp4", SyntheticSource::video(10 * SECOND, 30.0, 1280, 720, 2_000_000));

    let handle = harness
        .submit(CompressRequest {
            bitrate: Some(1_500_000),
            fps: Some(15),
            ..request(&source)
        })
        .await;
    let events = events(&handle).await;

    let JobEvent::Completed(result) = terminal(&events) else {
        panic!("expected completion, got {events:?}");
    };
    assert_eq!((result.width, result.height), (1280, 720));
    assert!(result.size_bytes > 0);
    assert!(result.name.starts_with("clip_"));
    assert!(result.output_path.exists());
    assert_eq!(handle.state(), JobState::Succeeded);

    let percents: Vec<u8> = events
        .iter()
        .filter_map(|event| match event {
            JobEvent::Progress { percent } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|pair| pair[0] < pair[1]));

    let stats = harness.backend.stats();
    assert_eq!(stats.video_samples.len(), 150);
    for (index, (pts_us, _)) in stats.video_samples.iter().enumerate() {
        assert_eq!(*pts_us, index as i64 * SECOND / 15);
    }
    let tags: Vec<u64> = stats.video_samples.iter().map(|(_, tag)| *tag).collect();
    assert_eq!(tags[0], 0);
    assert!(tags.windows(2).all(|pair| pair[0] < pair[1]), "frames must only be dropped");
    assert_eq!(stats.codecs_created(), stats.codecs_released);
    assert_eq!(harness.compressor.teardown_count(), 1);
}

#[tokio::test]
async fn test_upsampling_repeats_frames() {
    let harness = Harness::new();
    let source = harness.source("slow.mp4", SyntheticSource::video(2 * SECOND, 10.0, 640, 360, 1_000_000));

    let handle = harness
        .submit(CompressRequest {
            fps: Some(20),
            ..request(&source)
        })
        .await;
    let events = events(&handle).await;
    assert!(matches!(terminal(&events), JobEvent::Completed(_)));

    let stats = harness.backend.stats();
    assert_eq!(stats.video_samples.len(), 40);
    let tags: Vec<u64> = stats.video_samples.iter().map(|(_, tag)| *tag).collect();
    assert!(tags.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(tags.windows(2).any(|pair| pair[0] == pair[1]), "no frame was repeated: {tags:?}");
    assert_eq!(*tags.last().unwrap(), 19);
}

#[tokio::test]
async fn test_default_bitrate_is_half_the_source() {
    let harness = Harness::new();
    let source = harness.source("half.mp4", SyntheticSource::video(SECOND, 30.0, 640, 360, 3_000_000));

    let handle = harness.submit(request(&source)).await;
    let events = events(&handle).await;
    assert!(matches!(terminal(&events), JobEvent::Completed(_)));
    assert_eq!(harness.backend.stats().video_samples.len(), 30);
}

#[tokio::test]
async fn test_target_bitrate_above_source_is_rejected() {
    let harness = Harness::new();
    let source = harness.source("clip.mp4", SyntheticSource::video(10 * SECOND, 30.0, 1280, 720, 2_000_000));

    let handle = harness.compressor.create_job();
    let error = harness
        .compressor
        .compress(
            &handle,
            CompressRequest {
                bitrate: Some(2_500_000),
                ..request(&source)
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    assert_eq!(handle.state(), JobState::Created);

    let stats = harness.backend.stats();
    assert_eq!(stats.codecs_created(), 0);
    assert_eq!(stats.demuxers_opened, 0);
    assert!(harness.outputs().is_empty());
}

#[tokio::test]
async fn test_odd_dimensions_are_rejected() {
    let harness = Harness::new();
    let source = harness.source("clip.mp4", SyntheticSource::video(SECOND, 30.0, 1280, 720, 2_000_000));

    let handle = harness.compressor.create_job();
    let error = harness
        .compressor
        .compress(
            &handle,
            CompressRequest {
                width: Some(641),
                ..request(&source)
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    assert_eq!(harness.backend.stats().codecs_created(), 0);
}

#[tokio::test]
async fn test_unknown_source_is_unreadable() {
    let harness = Harness::new();
    let handle = harness.compressor.create_job();
    let error = harness
        .compressor
        .compress(&handle, request(Path::new("/videos/missing.mp4")))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::SourceUnreadable);
}

#[tokio::test]
async fn test_job_accepts_parameters_once() {
    let harness = Harness::new();
    let source = harness.source("clip.mp4", SyntheticSource::video(SECOND, 30.0, 640, 360, 2_000_000));

    let handle = harness.submit(request(&source)).await;
    let error = harness.compressor.compress(&handle, request(&source)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AlreadyScheduled);
    assert!(matches!(terminal(&events(&handle).await), JobEvent::Completed(_)));
}

#[tokio::test]
async fn test_source_without_tracks() {
    let harness = Harness::new();
    let mut empty = SyntheticSource::video(SECOND, 30.0, 640, 360, 2_000_000);
    empty.video = None;
    let source = harness.source("empty.mp4", empty);

    let handle = harness
        .submit(CompressRequest {
            bitrate: Some(1_000_000),
            fps: Some(30),
            width: Some(640),
            height: Some(360),
            ..request(&source)
        })
        .await;
    let events = events(&handle).await;
    assert_eq!(failure_kind(&events), ErrorKind::NoMediaTrack);
    assert_eq!(handle.state(), JobState::Aborted);
    assert!(harness.outputs().is_empty());
}

#[tokio::test]
async fn test_unsupported_parameters() {
    let harness = Harness::new();
    harness.backend.set_capabilities(EncoderCapabilities {
        width: 16..=1920,
        height: 16..=1080,
        ..EncoderCapabilities::default()
    });
    let source = harness.source("uhd.mp4", SyntheticSource::video(SECOND, 30.0, 3840, 2160, 20_000_000));

    let handle = harness.submit(request(&source)).await;
    let events = events(&handle).await;
    assert_eq!(failure_kind(&events), ErrorKind::UnsupportedParameters);
    assert_eq!(harness.backend.stats().codecs_created(), 0);
    assert!(harness.outputs().is_empty());
}

#[tokio::test]
async fn test_encoder_configuration_failure() {
    let harness = Harness::new();
    harness.backend.inject(Fault::EncoderConfigure(TrackKind::Video));
    let source = harness.source("clip.mp4", SyntheticSource::video(SECOND, 30.0, 640, 360, 2_000_000));

    let handle = harness.submit(request(&source)).await;
    let events = events(&handle).await;
    assert_eq!(failure_kind(&events), ErrorKind::ConfigurationError);
    assert!(harness.outputs().is_empty());

    let stats = harness.backend.stats();
    assert_eq!(stats.muxers_started, 0);
    assert_eq!(stats.codecs_created(), stats.codecs_released);
}

#[tokio::test]
async fn test_audio_encoder_configuration_failure() {
    let harness = Harness::new();
    harness.backend.inject(Fault::EncoderConfigure(TrackKind::Audio));
    let source = harness.source(
        "talk.mp4",
        SyntheticSource::video(SECOND, 30.0, 640, 360, 2_000_000).with_audio(SyntheticAudio::default()),
    );

    let handle = harness.submit(request(&source)).await;
    let events = events(&handle).await;
    assert_eq!(failure_kind(&events), ErrorKind::ConfigurationError);
    assert!(harness.outputs().is_empty());
}

#[tokio::test]
async fn test_decode_failure_mid_stream() {
    let harness = Harness::new();
    harness.backend.inject(Fault::DecodeAt(TrackKind::Video, 5));
    let source = harness.source("broken.mp4", SyntheticSource::video(2 * SECOND, 30.0, 640, 360, 2_000_000));

    let handle = harness.submit(request(&source)).await;
    let events = events(&handle).await;
    assert_eq!(failure_kind(&events), ErrorKind::InternalTranscodeError);
    assert_eq!(handle.state(), JobState::Aborted);
    assert!(harness.outputs().is_empty());
    assert_eq!(harness.compressor.teardown_count(), 1);
}

#[tokio::test]
async fn test_audio_and_video() {
    let harness = Harness::new();
    let source = harness.source(
        "talk.mp4",
        SyntheticSource::video(2 * SECOND, 30.0, 640, 360, 2_000_000).with_audio(SyntheticAudio::default()),
    );

    let handle = harness.submit(request(&source)).await;
    let events = events(&handle).await;
    assert!(matches!(terminal(&events), JobEvent::Completed(_)));

    let stats = harness.backend.stats();
    assert_eq!(stats.video_samples.len(), 60);
    assert!(!stats.audio_samples.is_empty());
    assert!(stats.audio_samples.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(stats.muxers_started, 1);
}

#[tokio::test]
async fn test_audio_only() {
    let harness = Harness::new();
    let audio = SyntheticAudio::default();
    let chunks = (SECOND as f64 / audio.chunk_us as f64).ceil() as usize;
    let source = harness.source("voice.m4a", SyntheticSource::audio(SECOND, 128_000, audio));

    let handle = harness.submit(request(&source)).await;
    let events = events(&handle).await;
    let JobEvent::Completed(result) = terminal(&events) else {
        panic!("expected completion, got {events:?}");
    };
    assert_eq!((result.width, result.height), (0, 0));

    let stats = harness.backend.stats();
    assert!(stats.video_samples.is_empty());
    assert_eq!(stats.audio_samples.len(), chunks);
    assert_eq!(stats.frames_rendered, 0);
}

#[tokio::test]
async fn test_rotation_swaps_output_size() {
    let harness = Harness::new();
    let source = harness.source(
        "portrait.mp4",
        SyntheticSource::video(SECOND, 30.0, 1280, 720, 2_000_000).with_rotation(90),
    );

    let handle = harness.submit(request(&source)).await;
    let events = events(&handle).await;
    let JobEvent::Completed(result) = terminal(&events) else {
        panic!("expected completion, got {events:?}");
    };
    assert_eq!((result.width, result.height), (720, 1280));
}

#[tokio::test]
async fn test_abort_queued_job_never_starts_it() {
    let harness = Harness::new();
    let slow = harness.source(
        "slow.mp4",
        SyntheticSource::video(2 * SECOND, 30.0, 640, 360, 2_000_000).with_sample_delay(Duration::from_millis(20)),
    );
    let other = harness.source("other.mp4", SyntheticSource::video(SECOND, 30.0, 640, 360, 2_000_000));

    let running = harness.submit(request(&slow)).await;
    let queued = harness.submit(request(&other)).await;
    assert_eq!(running.state(), JobState::Running);
    assert_eq!(queued.state(), JobState::Queued);

    harness.compressor.abort(&queued).await.unwrap();
    assert!(matches!(terminal(&events(&queued).await), JobEvent::Aborted));
    assert_eq!(queued.state(), JobState::Aborted);

    harness.compressor.abort(&running).await.unwrap();
    assert!(matches!(terminal(&events(&running).await), JobEvent::Aborted));

    let stats = harness.backend.stats();
    assert_eq!(stats.decoders_created, 1);
    assert_eq!(stats.encoders_created, 1);
    assert_eq!(harness.compressor.teardown_count(), 1);
    assert!(harness.outputs().is_empty());
}

#[tokio::test]
async fn test_abort_running_job_tears_down_once() {
    let harness = Harness::new();
    let slow = harness.source(
        "slow.mp4",
        SyntheticSource::video(2 * SECOND, 30.0, 640, 360, 2_000_000).with_sample_delay(Duration::from_millis(20)),
    );

    let handle = harness.submit(request(&slow)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.compressor.abort(&handle).await.unwrap();

    let events = events(&handle).await;
    assert!(matches!(terminal(&events), JobEvent::Aborted));
    assert_eq!(handle.state(), JobState::Aborted);
    assert_eq!(harness.compressor.teardown_count(), 1);
    assert!(harness.outputs().is_empty());

    let error = harness.compressor.abort(&handle).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AlreadyAborted);
    assert_eq!(harness.compressor.teardown_count(), 1);

    let stats = harness.backend.stats();
    assert_eq!(stats.codecs_created(), stats.codecs_released);
}

#[tokio::test]
async fn test_abort_before_submission() {
    let harness = Harness::new();
    let source = harness.source("clip.mp4", SyntheticSource::video(SECOND, 30.0, 640, 360, 2_000_000));

    let handle = harness.compressor.create_job();
    harness.compressor.abort(&handle).await.unwrap();
    assert!(matches!(terminal(&events(&handle).await), JobEvent::Aborted));

    let error = harness.compressor.compress(&handle, request(&source)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AlreadyAborted);
}

#[tokio::test]
async fn test_full_queue_rejects_jobs() {
    let harness = Harness::with_queue_capacity(1);
    let slow = harness.source(
        "slow.mp4",
        SyntheticSource::video(2 * SECOND, 30.0, 640, 360, 2_000_000).with_sample_delay(Duration::from_millis(20)),
    );
    let other = harness.source("other.mp4", SyntheticSource::video(SECOND, 30.0, 640, 360, 2_000_000));

    let running = harness.submit(request(&slow)).await;
    let queued = harness.submit(request(&other)).await;

    let rejected = harness.compressor.create_job();
    let error = harness
        .compressor
        .compress(&rejected, request(&other))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::QueueFull);
    assert_eq!(rejected.state(), JobState::Aborted);
    assert!(events(&rejected).await.is_empty());
    assert_eq!(harness.outputs().len(), 2);

    harness.compressor.abort(&running).await.unwrap();
    assert!(matches!(terminal(&events(&running).await), JobEvent::Aborted));
    assert!(matches!(terminal(&events(&queued).await), JobEvent::Completed(_)));
}

#[tokio::test]
async fn test_aborted_queued_job_keeps_its_slot() {
    let harness = Harness::with_queue_capacity(1);
    let slow = harness.source(
        "slow.mp4",
        SyntheticSource::video(2 * SECOND, 30.0, 640, 360, 2_000_000).with_sample_delay(Duration::from_millis(20)),
    );
    let other = harness.source("other.mp4", SyntheticSource::video(SECOND, 30.0, 640, 360, 2_000_000));

    let running = harness.submit(request(&slow)).await;
    let queued = harness.submit(request(&other)).await;
    harness.compressor.abort(&queued).await.unwrap();
    assert!(matches!(terminal(&events(&queued).await), JobEvent::Aborted));

    for _ in 0..5 {
        let rejected = harness.compressor.create_job();
        let error = harness
            .compressor
            .compress(&rejected, request(&other))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::QueueFull);
        assert!(events(&rejected).await.is_empty());
    }
    assert_eq!(harness.outputs().len(), 1);

    harness.compressor.abort(&running).await.unwrap();
    assert!(matches!(terminal(&events(&running).await), JobEvent::Aborted));

    // the skipped entry frees the queue for the next job
    let next = harness.submit(request(&other)).await;
    assert!(matches!(terminal(&events(&next).await), JobEvent::Completed(_)));
    assert_eq!(harness.backend.stats().decoders_created, 2);
}

#[tokio::test]
async fn test_shutdown_aborts_everything() {
    let harness = Harness::new();
    let slow = harness.source(
        "slow.mp4",
        SyntheticSource::video(2 * SECOND, 30.0, 640, 360, 2_000_000).with_sample_delay(Duration::from_millis(20)),
    );

    let running = harness.submit(request(&slow)).await;
    let first = harness.submit(request(&slow)).await;
    let second = harness.submit(request(&slow)).await;

    harness.compressor.shutdown().await;
    for handle in [&running, &first, &second] {
        assert!(matches!(terminal(&events(handle).await), JobEvent::Aborted));
        assert_eq!(handle.state(), JobState::Aborted);
    }
    assert_eq!(harness.compressor.teardown_count(), 1);
    assert!(harness.outputs().is_empty());
}

#[tokio::test]
async fn test_video_info() {
    let harness = Harness::new();
    let source = harness.source(
        "info.mp4",
        SyntheticSource::video(4 * SECOND, 24.0, 1920, 1080, 4_000_000).with_rotation(270),
    );

    let info = harness.compressor.video_info(&source).await.unwrap();
    assert_eq!(info.duration_us, 4 * SECOND);
    assert_eq!(info.frame_rate, Some(24.0));
    assert_eq!((info.width, info.height, info.rotation), (1920, 1080, 270));
    assert_eq!(info.size_bytes, 2_000_000);
    assert!(info.has_video && !info.has_audio);
}
