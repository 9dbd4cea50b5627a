use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compressor::CompressorSettings;
use crate::job::CompressRequest;
use crate::pipeline::PipelineSettings;
use crate::scheduler::SchedulerSettings;

/// Main configuration structure that can be loaded from CLI or a config file
///
/// Example configuration file content
/// # Video Compress Configuration
///
/// output_dir = "./compressed"
/// queue_capacity = 100
/// default_fps = 30
///
/// # Pipeline timing
/// muxer_poll_ms = 50
/// render_poll_ms = 5
/// queue_poll_ms = 10
/// audio_queue_capacity = 100
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Source video to compress
    #[serde(skip)]
    pub source: Option<PathBuf>,

    /// Target video bitrate in bits per second (default: half the source bitrate)
    #[arg(short, long)]
    #[serde(skip)]
    pub bitrate: Option<u64>,

    /// Target frame rate (default: the source frame rate)
    #[arg(short, long)]
    #[serde(skip)]
    pub fps: Option<u32>,

    /// Target width, must be even
    #[arg(long)]
    #[serde(skip)]
    pub width: Option<u32>,

    /// Target height, must be even
    #[arg(long)]
    #[serde(skip)]
    pub height: Option<u32>,

    /// Print what the source contains instead of compressing it
    #[arg(long)]
    #[serde(skip)]
    pub info: bool,

    /// Directory compressed files are written to
    #[arg(short, long, default_value = "./compressed")]
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Number of jobs that may wait behind the running one
    #[arg(short, long, default_value_t = 100)]
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Frame rate used when neither the request nor the source has one
    #[arg(long, default_value_t = 30)]
    #[serde(default = "default_fps")]
    pub default_fps: u32,

    /// Poll interval while waiting for the muxer to start, in milliseconds
    #[arg(long, default_value_t = 50)]
    #[serde(default = "default_muxer_poll_ms")]
    pub muxer_poll_ms: u64,

    /// Render loop sleep when no decoded frame is ready, in milliseconds
    #[arg(long, default_value_t = 5)]
    #[serde(default = "default_render_poll_ms")]
    pub render_poll_ms: u64,

    /// Audio encoder wait for a decoded chunk, in milliseconds
    #[arg(long, default_value_t = 10)]
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,

    /// Decoded audio chunks buffered between decoder and encoder
    #[arg(long, default_value_t = 100)]
    #[serde(default = "default_audio_queue_capacity")]
    pub audio_queue_capacity: usize,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            bitrate: None,
            fps: None,
            width: None,
            height: None,
            info: false,
            output_dir: default_output_dir(),
            queue_capacity: default_queue_capacity(),
            default_fps: default_fps(),
            muxer_poll_ms: default_muxer_poll_ms(),
            render_poll_ms: default_render_poll_ms(),
            queue_poll_ms: default_queue_poll_ms(),
            audio_queue_capacity: default_audio_queue_capacity(),
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.output_dir == default_output_dir() {
            self.output_dir = file_config.output_dir;
        }
        if self.queue_capacity == default_queue_capacity() {
            self.queue_capacity = file_config.queue_capacity;
        }
        if self.default_fps == default_fps() {
            self.default_fps = file_config.default_fps;
        }
        if self.muxer_poll_ms == default_muxer_poll_ms() {
            self.muxer_poll_ms = file_config.muxer_poll_ms;
        }
        if self.render_poll_ms == default_render_poll_ms() {
            self.render_poll_ms = file_config.render_poll_ms;
        }
        if self.queue_poll_ms == default_queue_poll_ms() {
            self.queue_poll_ms = file_config.queue_poll_ms;
        }
        if self.audio_queue_capacity == default_audio_queue_capacity() {
            self.audio_queue_capacity = file_config.audio_queue_capacity;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.is_empty() {
            return Err(anyhow::anyhow!("Output directory cannot be empty"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacity must be at least 1"));
        }
        if self.audio_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Audio queue capacity must be at least 1"));
        }
        if self.default_fps == 0 {
            return Err(anyhow::anyhow!("Default fps must be positive"));
        }
        if self.muxer_poll_ms == 0 || self.render_poll_ms == 0 || self.queue_poll_ms == 0 {
            return Err(anyhow::anyhow!("Poll intervals must be positive"));
        }
        if self.source.is_none() {
            return Err(anyhow::anyhow!("A source video is required"));
        }

        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            muxer_poll: Duration::from_millis(self.muxer_poll_ms),
            render_poll: Duration::from_millis(self.render_poll_ms),
            queue_poll: Duration::from_millis(self.queue_poll_ms),
            audio_queue_capacity: self.audio_queue_capacity,
            ..PipelineSettings::default()
        }
    }

    pub fn compressor_settings(&self) -> CompressorSettings {
        CompressorSettings {
            output_dir: PathBuf::from(&self.output_dir),
            default_fps: self.default_fps,
            scheduler: SchedulerSettings {
                queue_capacity: self.queue_capacity,
                pipeline: self.pipeline_settings(),
            },
        }
    }

    /// The compression the command line asks for, if a source was given.
    pub fn request(&self) -> Option<CompressRequest> {
        Some(CompressRequest {
            source: self.source.clone()?,
            bitrate: self.bitrate,
            fps: self.fps,
            width: self.width,
            height: self.height,
        })
    }
}

// Default value functions
fn default_output_dir() -> String {
    "./compressed".to_string()
}

fn default_queue_capacity() -> usize {
    100
}

fn default_fps() -> u32 {
    30
}

fn default_muxer_poll_ms() -> u64 {
    50
}

fn default_render_poll_ms() -> u64 {
    5
}

fn default_queue_poll_ms() -> u64 {
    10
}

fn default_audio_queue_capacity() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file() {
        let cli = Config::parse_from(["video-compress", "in.mp4", "--queue-capacity", "3"]);
        let file: Config = toml::from_str(
            r#"
            output_dir = "/tmp/out"
            queue_capacity = 7
            render_poll_ms = 9
            "#,
        )
        .unwrap();
        let merged = cli.merge_with_file(file);
        assert_eq!(merged.queue_capacity, 3);
        assert_eq!(merged.output_dir, "/tmp/out");
        assert_eq!(merged.render_poll_ms, 9);
        assert_eq!(merged.muxer_poll_ms, 50);
        assert_eq!(merged.source.as_deref(), Some(Path::new("in.mp4")));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::parse_from(["video-compress", "in.mp4"]);
        assert!(config.validate().is_ok());
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let missing_source = Config::parse_from(["video-compress"]);
        assert!(missing_source.validate().is_err());
    }

    #[test]
    fn test_settings_and_request() {
        let config = Config::parse_from([
            "video-compress",
            "clip.mov",
            "--bitrate",
            "1500000",
            "--fps",
            "15",
            "--render-poll-ms",
            "2",
        ]);
        let settings = config.compressor_settings();
        assert_eq!(settings.scheduler.queue_capacity, 100);
        assert_eq!(settings.scheduler.pipeline.render_poll, Duration::from_millis(2));

        let request = config.request().unwrap();
        assert_eq!(request.bitrate, Some(1_500_000));
        assert_eq!(request.fps, Some(15));
        assert!(request.width.is_none());
    }
}
