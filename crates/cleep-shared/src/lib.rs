//! Types and helpers shared by every Cleep desktop crate.

pub mod constants;
pub mod error;
pub mod headers;
pub mod protocol;
pub mod types;
pub mod wifi;

pub use error::{CleepError, ErrorKind, Severity};
pub use headers::PeerInfos;
