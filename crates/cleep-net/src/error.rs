use thiserror::Error;

use cleep_shared::{CleepError, ErrorKind};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus task is not running")]
    Stopped,

    #[error("Unknown peer {0}")]
    UnknownPeer(String),

    #[error("Network is unreachable")]
    Offline,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<BusError> for CleepError {
    fn from(e: BusError) -> Self {
        let kind = match e {
            BusError::Offline => ErrorKind::DeviceOffline,
            BusError::UnknownPeer(_) => ErrorKind::InvalidParameter,
            BusError::Stopped => ErrorKind::BusNotReady,
            BusError::Serialization(_) => ErrorKind::CommandError,
        };
        CleepError::new(kind, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
