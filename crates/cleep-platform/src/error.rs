use thiserror::Error;

use cleep_shared::ErrorKind;

/// Errors produced by host probes.
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    /// The host tool required by the probe is not installed.
    #[error("Probe unavailable: {0} not found")]
    Unavailable(String),

    /// No implementation exists for the running operating system.
    #[error("Probe not supported on {0}")]
    Unsupported(String),

    /// The host tool ran but reported a failure.
    #[error("{program} exited with status {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    /// The host tool output could not be understood.
    #[error("Unable to parse {program} output: {reason}")]
    Parse { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) | Self::Unsupported(_) => ErrorKind::ProbeUnavailable,
            _ => ErrorKind::CommandError,
        }
    }

    pub(crate) fn parse(program: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            program: program.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProbeError>;
