use std::sync::Arc;

use anyhow::{Context, bail};
use ffmpeg_next as ffmpeg;
use futures::StreamExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use video_compress::backend::ffmpeg::FfmpegBackend;
use video_compress::{Compressor, Config, JobEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    ffmpeg::init().context("initialize ffmpeg")?;

    let config = Config::load()?;
    let compressor = Compressor::new(Arc::new(FfmpegBackend::new()), config.compressor_settings())?;

    let Some(request) = config.request() else {
        bail!("A source video is required");
    };

    if config.info {
        let info = compressor.video_info(&request.source).await?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        compressor.shutdown().await;
        return Ok(());
    }

    let handle = compressor.create_job();
    info!(job_id = %handle.id(), source = %request.source.display(), "compressing");
    compressor.compress(&handle, request).await?;

    let mut events = std::pin::pin!(handle.events());
    let mut succeeded = false;
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
        match event {
            JobEvent::Completed(_) => succeeded = true,
            JobEvent::Failed { kind, message } => error!(%kind, reason = %message, "compression failed"),
            _ => {}
        }
    }

    compressor.shutdown().await;
    if !succeeded {
        bail!("compression did not complete");
    }
    Ok(())
}
