pub mod backend;
pub mod codec;
pub mod compressor;
pub mod config;
pub mod error;
pub mod frame_selector;
pub mod job;
pub mod media;
pub mod pipeline;
pub mod scheduler;
pub mod surface;

//
// Re-export
//
pub use backend::{Demuxer, MediaBackend, Muxer};
pub use compressor::{Compressor, CompressorSettings};
pub use config::Config;
pub use error::{CompressError, ErrorKind, Result};
pub use job::{CompressRequest, CompressResult, JobEvent, JobHandle, JobState};
pub use media::{EncoderCapabilities, SourceInfo};
pub use pipeline::PipelineSettings;
pub use scheduler::SchedulerSettings;
