use std::fmt;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Configuration,
    Environment,
    Build,
    Publish,
    Cancelled,
    TimedOut,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Environment => "environment",
            ErrorKind::Build => "build",
            ErrorKind::Publish => "publish",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed-out",
            ErrorKind::Io => "io",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("environment error: {0}")]
    Environment(String),

    /// Compilation failed; `diagnostics` holds the tail of compiler output.
    #[error("build error: {message}")]
    Build { message: String, diagnostics: String },

    #[error("publish error: {0}")]
    Publish(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("job exceeded its {}s timeout", .0.as_secs())]
    TimedOut(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }

    pub fn environment(message: impl Into<String>) -> Self {
        PipelineError::Environment(message.into())
    }

    pub fn publish(message: impl Into<String>) -> Self {
        PipelineError::Publish(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::Environment(_) => ErrorKind::Environment,
            PipelineError::Build { .. } => ErrorKind::Build,
            PipelineError::Publish(_) => ErrorKind::Publish,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::TimedOut(_) => ErrorKind::TimedOut,
            PipelineError::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
