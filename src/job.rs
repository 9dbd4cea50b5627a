use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CompressError, ErrorKind};

/// What a caller asks for. Every target is optional and defaults from the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressRequest {
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Resolved parameters a job runs with.
#[derive(Debug, Clone, Serialize)]
pub struct JobParams {
    pub source: PathBuf,
    pub bitrate: u64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub rotation: i32,
    pub duration_us: i64,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Parameterized,
    Queued,
    Running,
    Succeeded,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Aborted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressResult {
    pub output_path: PathBuf,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Progress { percent: u8 },
    Completed(CompressResult),
    Failed { kind: ErrorKind, message: String },
    Aborted,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }
}

/// Sends a job's events to its observer. Nothing is delivered after the first
/// terminal event.
#[derive(Clone)]
pub struct JobReporter {
    job_id: Arc<str>,
    events: Sender<JobEvent>,
    finished: Arc<AtomicBool>,
}

impl JobReporter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn progress(&self, percent: u8) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        debug!(job_id = %self.job_id, percent, "progress");
        _ = self.events.try_send(JobEvent::Progress { percent });
    }

    /// Delivers the terminal event and closes the stream. Returns false if the
    /// job had already finished.
    pub fn finish(&self, event: JobEvent) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(job_id = %self.job_id, ?event, "job finished");
        _ = self.events.try_send(event);
        self.events.close();
        true
    }

    /// Ends the stream without an event, for rejections already returned to the
    /// caller.
    pub fn close(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.events.close();
        }
    }
}

struct JobInner {
    id: Arc<str>,
    params: OnceLock<JobParams>,
    state: Mutex<JobState>,
    reporter: JobReporter,
}

/// A compression job. Clones share the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new() -> (Job, Receiver<JobEvent>) {
        let id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
        let (events, receiver) = unbounded();
        let reporter = JobReporter {
            job_id: id.clone(),
            events,
            finished: Arc::new(AtomicBool::new(false)),
        };
        let job = Job {
            inner: Arc::new(JobInner {
                id,
                params: OnceLock::new(),
                state: Mutex::new(JobState::Created),
                reporter,
            }),
        };
        (job, receiver)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> JobState {
        *self.inner.state.lock()
    }

    pub fn set_state(&self, state: JobState) {
        *self.inner.state.lock() = state;
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == JobState::Aborted
    }

    pub fn params(&self) -> Option<&JobParams> {
        self.inner.params.get()
    }

    pub fn reporter(&self) -> &JobReporter {
        &self.inner.reporter
    }

    /// Fails when the job is aborted or already carries parameters.
    pub fn check_parameterizable(&self) -> Result<(), CompressError> {
        match self.state() {
            JobState::Aborted => Err(CompressError::AlreadyAborted(
                self.id().to_string(),
                "compression has been aborted",
            )),
            JobState::Created if self.params().is_none() => Ok(()),
            _ => Err(CompressError::AlreadyScheduled(self.id().to_string())),
        }
    }

    /// Attaches parameters; a job accepts them once.
    pub fn parameterize(&self, params: JobParams) -> Result<(), CompressError> {
        let mut state = self.inner.state.lock();
        match *state {
            JobState::Aborted => {
                return Err(CompressError::AlreadyAborted(
                    self.id().to_string(),
                    "compression has been aborted",
                ));
            }
            JobState::Created => {}
            _ => return Err(CompressError::AlreadyScheduled(self.id().to_string())),
        }
        self.inner
            .params
            .set(params)
            .map_err(|_| CompressError::AlreadyScheduled(self.id().to_string()))?;
        *state = JobState::Parameterized;
        Ok(())
    }
}

/// The caller's side of a job: its identity and its event stream.
pub struct JobHandle {
    job: Job,
    events: Receiver<JobEvent>,
}

impl JobHandle {
    pub(crate) fn new() -> Self {
        let (job, events) = Job::new();
        Self { job, events }
    }

    pub fn id(&self) -> &str {
        self.job.id()
    }

    pub fn state(&self) -> JobState {
        self.job.state()
    }

    pub fn events(&self) -> Receiver<JobEvent> {
        self.events.clone()
    }

    pub(crate) fn job(&self) -> &Job {
        &self.job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> JobParams {
        JobParams {
            source: "in.mp4".into(),
            bitrate: 1_000_000,
            fps: 30,
            width: 640,
            height: 360,
            rotation: 0,
            duration_us: 1_000_000,
            output_path: "out.mp4".into(),
        }
    }

    #[test]
    fn test_parameterize_once() {
        let handle = JobHandle::new();
        let job = handle.job();
        job.parameterize(params()).unwrap();
        assert_eq!(job.state(), JobState::Parameterized);
        let error = job.parameterize(params()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AlreadyScheduled);
        assert_eq!(job.check_parameterizable().unwrap_err().kind(), ErrorKind::AlreadyScheduled);
    }

    #[test]
    fn test_aborted_job_rejects_parameters() {
        let handle = JobHandle::new();
        handle.job().set_state(JobState::Aborted);
        let error = handle.job().parameterize(params()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AlreadyAborted);
    }

    #[test]
    fn test_nothing_after_terminal_event() {
        let handle = JobHandle::new();
        let reporter = handle.job().reporter().clone();
        let events = handle.events();
        reporter.progress(10);
        assert!(reporter.finish(JobEvent::Aborted));
        reporter.progress(20);
        assert!(!reporter.finish(JobEvent::Aborted));

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], JobEvent::Progress { percent: 10 }));
        assert!(received[1].is_terminal());
        assert!(events.is_closed());
    }

    #[test]
    fn test_request_from_json() {
        let request: CompressRequest =
            serde_json::from_str(r#"{"source":"/tmp/a.mp4","bitrate":1500000,"fps":15}"#).unwrap();
        assert_eq!(request.bitrate, Some(1_500_000));
        assert_eq!(request.fps, Some(15));
        assert!(request.width.is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(JobEvent::Failed {
            kind: ErrorKind::QueueFull,
            message: "full".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["kind"], "queue_full");
    }
}
