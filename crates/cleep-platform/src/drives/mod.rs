//! Removable media enumeration.
//!
//! Only media the host reports as removable are surfaced. Internal and
//! system disks must never reach the install pipeline.

mod linux;
mod macos;
mod windows;

use std::sync::Arc;
use std::time::Duration;

use cleep_shared::constants::DRIVES_CACHE_TTL_SECS;
use cleep_shared::types::Drive;
use tracing::{debug, warn};

use crate::cache::ProbeCache;
use crate::error::{ProbeError, Result};
use crate::os::HostOs;
use crate::runner::CommandRunner;

pub use linux::LinuxDrives;
pub use macos::MacDrives;
pub use windows::WindowsDrives;

/// One implementation per operating system.
pub trait DriveProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// List the removable media currently attached.
    fn removable_drives(&self) -> Result<Vec<Drive>>;
}

/// Probe that always reports the feature as unavailable.
struct UnsupportedDrives(HostOs);

impl DriveProbe for UnsupportedDrives {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn removable_drives(&self) -> Result<Vec<Drive>> {
        Err(ProbeError::Unsupported(self.0.name().to_string()))
    }
}

/// Cached removable media listing for the running host.
pub struct DriveInventory {
    probe: Box<dyn DriveProbe>,
    cache: ProbeCache<Vec<Drive>>,
}

impl DriveInventory {
    pub fn new(probe: Box<dyn DriveProbe>) -> Self {
        Self {
            probe,
            cache: ProbeCache::new(Duration::from_secs(DRIVES_CACHE_TTL_SECS)),
        }
    }

    /// Pick the probe matching `os`.
    pub fn for_os(os: HostOs, runner: Arc<dyn CommandRunner>) -> Self {
        let probe: Box<dyn DriveProbe> = match os {
            HostOs::Linux => Box::new(LinuxDrives::new(runner)),
            HostOs::MacOs => Box::new(MacDrives::new(runner)),
            HostOs::Windows => Box::new(WindowsDrives::new(runner)),
            HostOs::Other => Box::new(UnsupportedDrives(os)),
        };
        debug!(probe = probe.name(), "Drive probe selected");
        Self::new(probe)
    }

    pub fn for_host(runner: Arc<dyn CommandRunner>) -> Self {
        Self::for_os(HostOs::current(), runner)
    }

    /// Removable media, served from a short-lived cache unless `force`.
    pub fn list(&self, force: bool) -> Result<Vec<Drive>> {
        self.cache
            .get_or_try_insert("drives", force, || {
                self.probe.removable_drives().map_err(|e| {
                    warn!(probe = self.probe.name(), error = %e, "Drive probe failed");
                    e
                })
            })
    }
}

/// `"<vendor> <model>"` with padding and empty parts removed.
pub(crate) fn describe(parts: &[&str], fallback: &str) -> String {
    let text = parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}
