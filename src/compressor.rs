use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::backend::MediaBackend;
use crate::error::CompressError;
use crate::job::{CompressRequest, JobHandle, JobParams};
use crate::media::SourceInfo;
use crate::scheduler::{JobScheduler, SchedulerSettings};

#[derive(Debug, Clone)]
pub struct CompressorSettings {
    /// Where compressed files are written.
    pub output_dir: PathBuf,
    /// Frame rate used when neither the request nor the source has one.
    pub default_fps: u32,
    pub scheduler: SchedulerSettings,
}

impl Default for CompressorSettings {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir().join("video-compress"),
            default_fps: 30,
            scheduler: SchedulerSettings::default(),
        }
    }
}

/// Entry point: validates requests, creates output files and hands jobs to
/// the scheduler.
pub struct Compressor {
    backend: Arc<dyn MediaBackend>,
    settings: CompressorSettings,
    scheduler: JobScheduler,
}

impl Compressor {
    pub fn new(backend: Arc<dyn MediaBackend>, settings: CompressorSettings) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::spawn(backend.clone(), settings.scheduler.clone())?;
        info!(backend = backend.name(), output_dir = %settings.output_dir.display(), "compressor ready");
        Ok(Self {
            backend,
            settings,
            scheduler,
        })
    }

    pub fn create_job(&self) -> JobHandle {
        JobHandle::new()
    }

    /// Resolves the request against the source, creates the output file and
    /// submits the job. Errors here mean no pipeline was built.
    pub async fn compress(&self, handle: &JobHandle, request: CompressRequest) -> Result<(), CompressError> {
        let job = handle.job();
        job.check_parameterizable()?;

        for (name, value) in [("width", request.width), ("height", request.height)] {
            if let Some(value) = value
                && value % 2 != 0
            {
                return Err(CompressError::InvalidArgument(format!("{name} {value} is odd")));
            }
        }

        let source = self.probe(&request.source).await?;
        let params = self.resolve(handle.id(), &request, &source)?;

        if let Some(parent) = params.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&params.output_path).await?;
        info!(
            job_id = %handle.id(),
            source = %params.source.display(),
            output = %params.output_path.display(),
            bitrate = params.bitrate,
            fps = params.fps,
            width = params.width,
            height = params.height,
            "job parameterized"
        );

        if let Err(error) = job.parameterize(params.clone()) {
            _ = tokio::fs::remove_file(&params.output_path).await;
            return Err(error);
        }
        self.scheduler.submit(job.clone()).await
    }

    fn resolve(
        &self,
        job_id: &str,
        request: &CompressRequest,
        source: &SourceInfo,
    ) -> Result<JobParams, CompressError> {
        let fps = match request.fps {
            Some(fps) if fps > 0 => fps,
            _ => source
                .frame_rate
                .map(|fps| fps.round() as u32)
                .filter(|fps| *fps > 0)
                .unwrap_or(self.settings.default_fps),
        };

        let bitrate = match (request.bitrate, source.bitrate) {
            (Some(target), Some(original)) if original <= target => {
                return Err(CompressError::InvalidArgument(format!(
                    "target bitrate {target} is not lower than the source bitrate {original}"
                )));
            }
            (Some(target), _) => target,
            (None, Some(original)) => original / 2,
            (None, None) => {
                return Err(CompressError::InvalidArgument(
                    "source bitrate is unknown, a target bitrate is required".to_string(),
                ));
            }
        };

        let stem = request
            .source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());

        Ok(JobParams {
            source: request.source.clone(),
            bitrate,
            fps,
            width: request.width.unwrap_or(source.width),
            height: request.height.unwrap_or(source.height),
            rotation: source.rotation,
            duration_us: source.duration_us,
            output_path: self.settings.output_dir.join(format!("{stem}_{job_id}.mp4")),
        })
    }

    async fn probe(&self, path: &Path) -> Result<SourceInfo, CompressError> {
        let backend = self.backend.clone();
        let path = path.to_path_buf();
        let info = tokio::task::spawn_blocking(move || backend.probe(&path))
            .await
            .map_err(|error| CompressError::internal(error.into()))?
            .map_err(|error| CompressError::SourceUnreadable(format!("{error:#}")))?;
        if info.duration_us <= 0 {
            return Err(CompressError::SourceUnreadable(format!(
                "{} has no duration",
                info.path.display()
            )));
        }
        Ok(info)
    }

    pub async fn abort(&self, handle: &JobHandle) -> Result<(), CompressError> {
        info!(job_id = %handle.id(), "abort requested");
        self.scheduler.abort(handle.job().clone()).await
    }

    /// Probes a file without compressing it.
    pub async fn video_info(&self, path: impl AsRef<Path>) -> Result<SourceInfo, CompressError> {
        self.probe(path.as_ref()).await
    }

    /// Aborts the running job and every queued one, then stops the scheduler.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown_all().await;
    }

    /// Number of pipeline teardowns that ran so far.
    pub fn teardown_count(&self) -> usize {
        self.scheduler.teardown_count()
    }
}
