use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error codes surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameter,
    MissingParameter,
    InvalidModule,
    InvalidCommand,
    NoResponse,
    BusNotReady,
    CommandError,
    ProbeUnavailable,
    DeviceOffline,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidParameter => "invalid_parameter",
            Self::MissingParameter => "missing_parameter",
            Self::InvalidModule => "invalid_module",
            Self::InvalidCommand => "invalid_command",
            Self::NoResponse => "no_response",
            Self::BusNotReady => "bus_not_ready",
            Self::CommandError => "command_error",
            Self::ProbeUnavailable => "probe_unavailable",
            Self::DeviceOffline => "device_offline",
        }
    }

    /// How a worker is expected to react to this kind of failure.
    pub fn severity(&self) -> Severity {
        match self {
            Self::DeviceOffline => Severity::Transient,
            Self::ProbeUnavailable => Severity::SubsystemFatal,
            _ => Severity::JobFatal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes used by the workers.
///
/// `Transient` failures are logged and retried by the worker itself,
/// `JobFatal` ones end the current job with a terminal status, and
/// `SubsystemFatal` ones disable the feature until restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Transient,
    JobFatal,
    SubsystemFatal,
}

/// Tagged error crossing subsystem boundaries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CleepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CleepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::BusNotReady).unwrap();
        assert_eq!(json, "\"bus_not_ready\"");
        assert_eq!(ErrorKind::MissingParameter.as_str(), "missing_parameter");
    }

    #[test]
    fn test_severity() {
        assert_eq!(ErrorKind::DeviceOffline.severity(), Severity::Transient);
        assert_eq!(ErrorKind::ProbeUnavailable.severity(), Severity::SubsystemFatal);
        assert_eq!(ErrorKind::NoResponse.severity(), Severity::JobFatal);
    }

    #[test]
    fn test_display() {
        let err = CleepError::new(ErrorKind::InvalidCommand, "unknown command \"foo\"");
        assert_eq!(err.to_string(), "invalid_command: unknown command \"foo\"");
    }
}
