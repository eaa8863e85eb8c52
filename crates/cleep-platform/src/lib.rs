//! # cleep-platform
//!
//! Read-only host probes used by the install pipeline:
//!
//! - **Removable media**: one [`drives::DriveProbe`] implementation per
//!   operating system (block device listing on Linux, disk utility info
//!   blocks on macOS, logical disks on Windows).
//! - **Wi-Fi**: adapters and visible networks, trying the available tools
//!   of the host in priority order.
//!
//! Probes shell out to host tools through a [`runner::CommandRunner`] and
//! keep short TTL caches keyed by query name. A missing host tool is
//! reported as [`ProbeError::Unavailable`] so callers can hide the feature.

pub mod cache;
pub mod drives;
pub mod os;
pub mod runner;
pub mod wifi;

mod error;

pub use cache::ProbeCache;
pub use drives::{DriveInventory, DriveProbe};
pub use error::{ProbeError, Result};
pub use os::HostOs;
pub use runner::{CommandOutput, CommandRunner, HostRunner};
pub use wifi::{WifiProbe, WifiScanner};
