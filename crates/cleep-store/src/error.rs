use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to determine a platform configuration directory.
    #[error("Could not determine application config directory")]
    NoConfigDir,

    /// Reading or writing the configuration file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid JSON for [`crate::AppConfig`].
    #[error("Invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    /// A section name that does not exist in the document.
    #[error("Unknown configuration section: {0}")]
    UnknownSection(String),

    /// A writer panicked while holding the configuration lock.
    #[error("Configuration lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
