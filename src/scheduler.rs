//! Runs one job at a time on a dedicated thread; later jobs wait in a FIFO.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use anyhow::anyhow;
use async_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::MediaBackend;
use crate::error::CompressError;
use crate::job::{CompressResult, Job, JobEvent, JobParams, JobState};
use crate::pipeline::{CompletionHandle, PipelineSettings, TranscodePipeline, output_size};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub queue_capacity: usize,
    pub pipeline: PipelineSettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            pipeline: PipelineSettings::default(),
        }
    }
}

enum Command {
    Submit {
        job: Job,
        reply: Sender<Result<(), CompressError>>,
    },
    Finish {
        job_id: String,
    },
    Abort {
        job: Job,
        reply: Sender<Result<(), CompressError>>,
    },
    ShutdownAll {
        reply: Sender<()>,
    },
}

pub struct JobScheduler {
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    teardowns: Arc<AtomicUsize>,
}

impl JobScheduler {
    pub fn spawn(backend: Arc<dyn MediaBackend>, settings: SchedulerSettings) -> anyhow::Result<Self> {
        let (commands, receiver) = unbounded();
        let teardowns = Arc::new(AtomicUsize::new(0));
        let state = Scheduler {
            backend,
            settings,
            commands: commands.clone(),
            queue: VecDeque::new(),
            running: None,
            teardowns: teardowns.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("compress-scheduler".to_string())
            .spawn(move || state.run(receiver))?;

        Ok(Self {
            commands,
            thread: Mutex::new(Some(thread)),
            teardowns,
        })
    }

    /// Starts the job now, or queues it behind the running one.
    pub async fn submit(&self, job: Job) -> Result<(), CompressError> {
        let (reply, result) = bounded(1);
        self.send(Command::Submit { job, reply })?;
        result.recv().await.map_err(|_| stopped())?
    }

    pub async fn abort(&self, job: Job) -> Result<(), CompressError> {
        let (reply, result) = bounded(1);
        self.send(Command::Abort { job, reply })?;
        result.recv().await.map_err(|_| stopped())?
    }

    /// Tears down the running job, reports every queued job as aborted and
    /// stops the scheduler thread.
    pub async fn shutdown_all(&self) {
        let (reply, done) = bounded(1);
        if self.send(Command::ShutdownAll { reply }).is_ok() {
            _ = done.recv().await;
        }
        if let Some(thread) = self.thread.lock().take() {
            _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }

    /// How many pipeline teardowns actually ran.
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) -> Result<(), CompressError> {
        self.commands.try_send(command).map_err(|_| stopped())
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let (reply, _done) = bounded(1);
        _ = self.commands.try_send(Command::ShutdownAll { reply });
        if thread.join().is_err() {
            error!("scheduler thread panicked");
        }
    }
}

fn stopped() -> CompressError {
    CompressError::internal(anyhow!("scheduler has stopped"))
}

struct Running {
    job: Job,
    pipeline: TranscodePipeline,
}

/// State owned by the scheduler thread.
struct Scheduler {
    backend: Arc<dyn MediaBackend>,
    settings: SchedulerSettings,
    commands: Sender<Command>,
    queue: VecDeque<Job>,
    running: Option<Running>,
    teardowns: Arc<AtomicUsize>,
}

impl Scheduler {
    fn run(mut self, commands: Receiver<Command>) {
        info!(capacity = self.settings.queue_capacity, "scheduler started");
        while let Ok(command) = commands.recv_blocking() {
            match command {
                Command::Submit { job, reply } => {
                    _ = reply.try_send(self.submit(job));
                }
                Command::Finish { job_id } => self.finish(&job_id),
                Command::Abort { job, reply } => {
                    _ = reply.try_send(self.abort(job));
                }
                Command::ShutdownAll { reply } => {
                    self.shutdown_all();
                    _ = reply.try_send(());
                    break;
                }
            }
        }
        info!("scheduler stopped");
    }

    fn submit(&mut self, job: Job) -> Result<(), CompressError> {
        match job.state() {
            JobState::Parameterized => {}
            JobState::Aborted => {
                return Err(CompressError::AlreadyAborted(
                    job.id().to_string(),
                    "compression has been aborted",
                ));
            }
            _ => return Err(CompressError::AlreadyScheduled(job.id().to_string())),
        }

        if self.running.is_none() && self.queue.is_empty() {
            self.start(job);
            return Ok(());
        }

        // Aborted entries keep their slot until the queue is popped past them.
        let waiting = self.queue.len();
        if waiting >= self.settings.queue_capacity {
            warn!(job_id = %job.id(), waiting, "queue is full, rejecting job");
            job.set_state(JobState::Aborted);
            remove_output(&job);
            job.reporter().close();
            return Err(CompressError::QueueFull(self.settings.queue_capacity));
        }

        job.set_state(JobState::Queued);
        info!(job_id = %job.id(), position = waiting + 1, "job queued");
        self.queue.push_back(job);
        self.start_next();
        Ok(())
    }

    fn start(&mut self, job: Job) {
        let Some(params) = job.params().cloned() else {
            error!(job_id = %job.id(), "job has no parameters");
            job.set_state(JobState::Aborted);
            job.reporter().finish(JobEvent::Aborted);
            return;
        };
        job.set_state(JobState::Running);
        info!(job_id = %job.id(), source = %params.source.display(), "starting job");

        let completion = {
            let commands = self.commands.clone();
            let job_id = job.id().to_string();
            CompletionHandle::new(move || {
                _ = commands.try_send(Command::Finish {
                    job_id: job_id.clone(),
                });
            })
        };
        match TranscodePipeline::start(
            job.id(),
            &params,
            self.backend.as_ref(),
            &self.settings.pipeline,
            job.reporter().clone(),
            completion,
            self.teardowns.clone(),
        ) {
            Ok(pipeline) => self.running = Some(Running { job, pipeline }),
            Err(error) => {
                error!(job_id = %job.id(), %error, "job failed to start");
                job.set_state(JobState::Aborted);
                remove_output(&job);
                job.reporter().finish(JobEvent::Failed {
                    kind: error.kind(),
                    message: error.to_string(),
                });
            }
        }
    }

    /// Starts queued jobs until one runs, skipping the ones aborted while waiting.
    fn start_next(&mut self) {
        while self.running.is_none() {
            let Some(job) = self.queue.pop_front() else {
                return;
            };
            if job.is_aborted() {
                debug!(job_id = %job.id(), "skipping aborted job");
                continue;
            }
            self.start(job);
        }
    }

    fn finish(&mut self, job_id: &str) {
        match &self.running {
            Some(running) if running.job.id() == job_id => {}
            _ => {
                debug!(job_id, "ignoring completion of a job that is not running");
                return;
            }
        }
        self.complete_running(false);
        self.start_next();
    }

    /// Tears the running pipeline down and delivers the job's terminal event.
    fn complete_running(&mut self, aborted: bool) {
        let Some(Running { job, pipeline }) = self.running.take() else {
            return;
        };
        if aborted {
            pipeline.abort();
        }
        let success = pipeline.stop_and_release().unwrap_or(false);
        let error = pipeline.take_error();
        drop(pipeline);

        if success {
            match completed(&job) {
                Ok(result) => {
                    job.set_state(JobState::Succeeded);
                    job.reporter().finish(JobEvent::Completed(result));
                    return;
                }
                Err(error) => {
                    job.set_state(JobState::Aborted);
                    remove_output(&job);
                    job.reporter().finish(JobEvent::Failed {
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                    return;
                }
            }
        }

        job.set_state(JobState::Aborted);
        remove_output(&job);
        let event = match error {
            Some(error) if !aborted => JobEvent::Failed {
                kind: error.kind(),
                message: error.to_string(),
            },
            _ => JobEvent::Aborted,
        };
        job.reporter().finish(event);
    }

    fn abort(&mut self, job: Job) -> Result<(), CompressError> {
        match job.state() {
            JobState::Succeeded | JobState::Aborted => Err(CompressError::AlreadyAborted(
                job.id().to_string(),
                "compression has already completed",
            )),
            JobState::Running => {
                let is_running = self
                    .running
                    .as_ref()
                    .is_some_and(|running| running.job.id() == job.id());
                if is_running {
                    info!(job_id = %job.id(), "aborting running job");
                    self.complete_running(true);
                    self.start_next();
                }
                Ok(())
            }
            JobState::Queued => {
                info!(job_id = %job.id(), "aborting queued job");
                job.set_state(JobState::Aborted);
                remove_output(&job);
                job.reporter().finish(JobEvent::Aborted);
                Ok(())
            }
            JobState::Created | JobState::Parameterized => {
                info!(job_id = %job.id(), "aborting job before submission");
                job.set_state(JobState::Aborted);
                remove_output(&job);
                job.reporter().finish(JobEvent::Aborted);
                Ok(())
            }
        }
    }

    fn shutdown_all(&mut self) {
        info!(queued = self.queue.len(), "shutting down all jobs");
        self.complete_running(true);
        for job in self.queue.drain(..) {
            if job.is_aborted() {
                continue;
            }
            job.set_state(JobState::Aborted);
            remove_output(&job);
            job.reporter().finish(JobEvent::Aborted);
        }
    }
}

fn completed(job: &Job) -> Result<CompressResult, CompressError> {
    let params = job
        .params()
        .ok_or_else(|| CompressError::internal(anyhow!("job has no parameters")))?;
    let size_bytes = std::fs::metadata(&params.output_path)?.len();
    let (width, height) = output_size(params);
    Ok(CompressResult {
        output_path: params.output_path.clone(),
        name: file_name(&params.output_path),
        width,
        height,
        size_bytes,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn remove_output(job: &Job) {
    let Some(JobParams { output_path, .. }) = job.params() else {
        return;
    };
    match std::fs::remove_file(output_path) {
        Ok(()) => debug!(job_id = %job.id(), path = %output_path.display(), "removed partial output"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(job_id = %job.id(), %error, "failed to remove partial output"),
    }
}
