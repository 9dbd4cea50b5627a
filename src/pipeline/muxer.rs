use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::Muxer;
use crate::media::{MediaFormat, Sample, TrackKind};

struct MuxerState {
    muxer: Option<Box<dyn Muxer>>,
    expected: usize,
    video_track: Option<usize>,
    audio_track: Option<usize>,
}

impl MuxerState {
    fn added(&self) -> usize {
        usize::from(self.video_track.is_some()) + usize::from(self.audio_track.is_some())
    }

    fn track(&self, kind: TrackKind) -> Option<usize> {
        match kind {
            TrackKind::Video => self.video_track,
            TrackKind::Audio => self.audio_track,
        }
    }
}

/// The output container shared by both tracks. It starts once every expected
/// track was added; writers wait for that.
pub struct SharedMuxer {
    job_id: String,
    state: Mutex<MuxerState>,
    started: AtomicBool,
    released: AtomicBool,
}

impl SharedMuxer {
    pub fn new(job_id: &str, muxer: Box<dyn Muxer>, expected: usize) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: Mutex::new(MuxerState {
                muxer: Some(muxer),
                expected,
                video_track: None,
                audio_track: None,
            }),
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn add_track(&self, kind: TrackKind, format: &MediaFormat) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if self.released.load(Ordering::Acquire) {
            return Ok(());
        }
        if state.track(kind).is_some() {
            bail!("{kind} track added twice");
        }
        let muxer = state
            .muxer
            .as_mut()
            .ok_or_else(|| anyhow!("muxer is released"))?;
        let track = muxer.add_track(format)?;
        match kind {
            TrackKind::Video => state.video_track = Some(track),
            TrackKind::Audio => state.audio_track = Some(track),
        }
        debug!(job_id = %self.job_id, %kind, track, "muxer track added");

        if state.added() == state.expected {
            if let Some(muxer) = state.muxer.as_mut() {
                muxer.start()?;
            }
            self.started.store(true, Ordering::Release);
            info!(job_id = %self.job_id, tracks = state.expected, "muxer started");
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Polls until the muxer started. Returns false if it was released or
    /// `cancelled` turned true first.
    pub fn wait_started(&self, poll: Duration, cancelled: &AtomicBool) -> bool {
        while !self.is_started() {
            if self.is_released() || cancelled.load(Ordering::Acquire) {
                return false;
            }
            debug!(job_id = %self.job_id, "waiting for muxer start");
            std::thread::sleep(poll);
        }
        !self.is_released()
    }

    pub fn write_sample(&self, kind: TrackKind, sample: &Sample) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if self.released.load(Ordering::Acquire) {
            return Ok(());
        }
        let track = state
            .track(kind)
            .ok_or_else(|| anyhow!("{kind} sample before its track was added"))?;
        let muxer = state
            .muxer
            .as_mut()
            .ok_or_else(|| anyhow!("muxer is released"))?;
        muxer.write_sample(track, sample)
    }

    /// Stops the muxer if it started and releases it. Later calls do nothing.
    pub fn stop_and_release(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        self.released.store(true, Ordering::Release);
        let Some(mut muxer) = state.muxer.take() else {
            return Ok(());
        };
        let result = if self.is_started() {
            muxer.stop()
        } else {
            Ok(())
        };
        muxer.release();
        if let Err(error) = &result {
            warn!(job_id = %self.job_id, %error, "muxer stop failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Log {
        tracks: usize,
        started: bool,
        stopped: bool,
        released: bool,
        written: Vec<(usize, i64)>,
    }

    struct Recording(Arc<Mutex<Log>>);

    impl Muxer for Recording {
        fn add_track(&mut self, _format: &MediaFormat) -> anyhow::Result<usize> {
            let mut log = self.0.lock();
            log.tracks += 1;
            Ok(log.tracks - 1)
        }

        fn start(&mut self) -> anyhow::Result<()> {
            self.0.lock().started = true;
            Ok(())
        }

        fn write_sample(&mut self, track: usize, sample: &Sample) -> anyhow::Result<()> {
            self.0.lock().written.push((track, sample.pts_us));
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.0.lock().stopped = true;
            Ok(())
        }

        fn release(&mut self) {
            self.0.lock().released = true;
        }
    }

    fn shared(expected: usize) -> (Arc<SharedMuxer>, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let muxer = SharedMuxer::new("job", Box::new(Recording(log.clone())), expected);
        (Arc::new(muxer), log)
    }

    #[test]
    fn test_starts_when_all_tracks_added() {
        let (muxer, log) = shared(2);
        muxer.add_track(TrackKind::Audio, &MediaFormat::audio("aac", Some(48_000), Some(2))).unwrap();
        assert!(!muxer.is_started());
        muxer.add_track(TrackKind::Video, &MediaFormat::video("h264", 2, 2)).unwrap();
        assert!(muxer.is_started());
        assert!(log.lock().started);

        muxer.write_sample(TrackKind::Video, &Sample::new(vec![1u8], 5, Default::default())).unwrap();
        assert_eq!(log.lock().written, vec![(1, 5)]);
    }

    #[test]
    fn test_writer_waits_for_start() {
        let (muxer, log) = shared(2);
        muxer.add_track(TrackKind::Video, &MediaFormat::video("h264", 2, 2)).unwrap();
        let cancelled = AtomicBool::new(false);

        let adder = {
            let muxer = muxer.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                muxer
                    .add_track(TrackKind::Audio, &MediaFormat::audio("aac", None, None))
                    .unwrap();
            })
        };
        assert!(muxer.wait_started(Duration::from_millis(2), &cancelled));
        adder.join().unwrap();
        assert!(log.lock().started);
    }

    #[test]
    fn test_wait_ends_on_release() {
        let (muxer, log) = shared(2);
        let cancelled = AtomicBool::new(false);
        muxer.stop_and_release().unwrap();
        assert!(!muxer.wait_started(Duration::from_millis(1), &cancelled));
        let log = log.lock();
        assert!(log.released);
        assert!(!log.stopped);
    }

    #[test]
    fn test_stop_only_when_started_and_once() {
        let (muxer, log) = shared(1);
        muxer.add_track(TrackKind::Video, &MediaFormat::video("h264", 2, 2)).unwrap();
        muxer.stop_and_release().unwrap();
        muxer.stop_and_release().unwrap();
        assert!(log.lock().stopped);
        // writes after release are dropped
        muxer.write_sample(TrackKind::Video, &Sample::new(vec![1u8], 1, Default::default())).unwrap();
        assert!(log.lock().written.is_empty());
    }
}
