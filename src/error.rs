use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure categories reported to job observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    SourceUnreadable,
    NoMediaTrack,
    UnsupportedParameters,
    ConfigurationError,
    IoError,
    InternalTranscodeError,
    QueueFull,
    AlreadyScheduled,
    AlreadyAborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::SourceUnreadable => "source unreadable",
            ErrorKind::NoMediaTrack => "no media track",
            ErrorKind::UnsupportedParameters => "unsupported parameters",
            ErrorKind::ConfigurationError => "configuration error",
            ErrorKind::IoError => "io error",
            ErrorKind::InternalTranscodeError => "internal transcode error",
            ErrorKind::QueueFull => "queue full",
            ErrorKind::AlreadyScheduled => "already scheduled",
            ErrorKind::AlreadyAborted => "already aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),
    #[error("no audio or video track found in source")]
    NoMediaTrack,
    #[error("unsupported parameters: {0}")]
    UnsupportedParameters(String),
    #[error("codec configuration failed: {0}")]
    Configuration(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transcode error: {0}")]
    Internal(String),
    #[error("compression queue is full ({0} jobs pending)")]
    QueueFull(usize),
    #[error("job {0} has already been scheduled")]
    AlreadyScheduled(String),
    #[error("job {0}: {1}")]
    AlreadyAborted(String, &'static str),
}

impl CompressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompressError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CompressError::SourceUnreadable(_) => ErrorKind::SourceUnreadable,
            CompressError::NoMediaTrack => ErrorKind::NoMediaTrack,
            CompressError::UnsupportedParameters(_) => ErrorKind::UnsupportedParameters,
            CompressError::Configuration(_) => ErrorKind::ConfigurationError,
            CompressError::Io(_) => ErrorKind::IoError,
            CompressError::Internal(_) => ErrorKind::InternalTranscodeError,
            CompressError::QueueFull(_) => ErrorKind::QueueFull,
            CompressError::AlreadyScheduled(_) => ErrorKind::AlreadyScheduled,
            CompressError::AlreadyAborted(..) => ErrorKind::AlreadyAborted,
        }
    }

    /// Wraps a backend failure that happened while a codec was being set up.
    pub fn configuration(error: anyhow::Error) -> Self {
        CompressError::Configuration(format!("{error:#}"))
    }

    /// Wraps a backend failure that happened while media was flowing.
    pub fn internal(error: anyhow::Error) -> Self {
        CompressError::Internal(format!("{error:#}"))
    }
}

pub type Result<T, E = CompressError> = std::result::Result<T, E>;
