//! Wi-Fi adapter detection and network scanning.
//!
//! Each host tool is a [`WifiProbe`]. The scanner tries the probes whose
//! tool is installed in priority order and falls through to the next one
//! when a tool fails.

mod airport;
mod iwlist;
mod netsh;
mod nmcli;

use std::sync::Arc;
use std::time::Duration;

use cleep_shared::constants::WIFI_CACHE_TTL_SECS;
use cleep_shared::types::{WifiEncryption, WifiNetwork, WifiStatus};
use tracing::{debug, warn};

use crate::cache::ProbeCache;
use crate::error::{ProbeError, Result};
use crate::os::HostOs;
use crate::runner::CommandRunner;

pub use airport::AirportProbe;
pub use iwlist::IwlistProbe;
pub use netsh::NetshProbe;
pub use nmcli::NmcliProbe;

pub trait WifiProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the host tool backing this probe is installed.
    fn is_available(&self) -> bool;

    /// Names of the wireless interfaces.
    fn interfaces(&self) -> Result<Vec<String>>;

    /// Networks visible from `interfaces`.
    fn scan(&self, interfaces: &[String]) -> Result<Vec<WifiNetwork>>;
}

/// Cached Wi-Fi status for the running host.
pub struct WifiScanner {
    probes: Vec<Box<dyn WifiProbe>>,
    cache: ProbeCache<WifiStatus>,
}

impl WifiScanner {
    pub fn new(probes: Vec<Box<dyn WifiProbe>>) -> Self {
        Self {
            probes,
            cache: ProbeCache::new(Duration::from_secs(WIFI_CACHE_TTL_SECS)),
        }
    }

    pub fn for_os(os: HostOs, runner: Arc<dyn CommandRunner>) -> Self {
        let probes: Vec<Box<dyn WifiProbe>> = match os {
            HostOs::Linux => vec![
                Box::new(NmcliProbe::new(runner.clone())),
                Box::new(IwlistProbe::new(runner)),
            ],
            HostOs::MacOs => vec![Box::new(AirportProbe::new(runner))],
            HostOs::Windows => vec![Box::new(NetshProbe::new(runner))],
            HostOs::Other => Vec::new(),
        };
        Self::new(probes)
    }

    pub fn for_host(runner: Arc<dyn CommandRunner>) -> Self {
        Self::for_os(HostOs::current(), runner)
    }

    /// Adapter presence only, without scanning.
    pub fn adapter_present(&self, force: bool) -> Result<bool> {
        self.cache
            .get_or_try_insert("adapter", force, || {
                let interfaces = self.with_first_working(|probe| probe.interfaces())?;
                Ok(WifiStatus {
                    adapter_present: !interfaces.is_empty(),
                    networks: Vec::new(),
                })
            })
            .map(|status| status.adapter_present)
    }

    /// Adapter presence and visible networks.
    ///
    /// Without an adapter the network list is empty. Networks are sorted by
    /// decreasing signal and deduplicated per interface and SSID.
    pub fn status(&self, force: bool) -> Result<WifiStatus> {
        self.cache.get_or_try_insert("networks", force, || {
            self.with_first_working(|probe| {
                let interfaces = probe.interfaces()?;
                if interfaces.is_empty() {
                    return Ok(WifiStatus::default());
                }
                let networks = dedup_networks(probe.scan(&interfaces)?);
                debug!(
                    probe = probe.name(),
                    interfaces = interfaces.len(),
                    networks = networks.len(),
                    "Wi-Fi scan done"
                );
                Ok(WifiStatus {
                    adapter_present: true,
                    networks,
                })
            })
        })
    }

    fn with_first_working<T>(&self, mut f: impl FnMut(&dyn WifiProbe) -> Result<T>) -> Result<T> {
        let mut last_error = None;
        for probe in self.probes.iter().filter(|p| p.is_available()) {
            match f(probe.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(probe = probe.name(), error = %e, "Wi-Fi probe failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ProbeError::Unavailable("wifi tool".to_string())))
    }
}

/// Keep the strongest entry per (interface, ssid), strongest first.
fn dedup_networks(mut networks: Vec<WifiNetwork>) -> Vec<WifiNetwork> {
    networks.retain(|n| !n.ssid.is_empty());
    networks.sort_by(|a, b| b.signal_level.cmp(&a.signal_level));
    let mut seen = std::collections::HashSet::new();
    networks.retain(|n| seen.insert((n.interface.clone(), n.ssid.clone())));
    networks
}

/// Map a free-form security description to an encryption kind.
pub(crate) fn encryption_from_security(security: &str) -> WifiEncryption {
    let upper = security.trim().to_ascii_uppercase();
    if upper.is_empty() || upper == "--" || upper == "NONE" || upper == "OPEN" {
        WifiEncryption::Unsecured
    } else if upper.contains("WPA2") || upper.contains("WPA3") || upper.contains("RSN") {
        WifiEncryption::Wpa2
    } else if upper.contains("WPA") {
        WifiEncryption::Wpa
    } else if upper.contains("WEP") {
        WifiEncryption::Wep
    } else {
        WifiEncryption::Unknown
    }
}
