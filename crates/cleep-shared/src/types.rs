use serde::{Deserialize, Serialize};

use crate::constants::UNCONFIGURED_HOSTNAME;
use crate::headers::PeerInfos;

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

/// A Cleep device seen on the presence channel.
///
/// The `uuid` is stable across sessions, `ident` is the bus-assigned id of
/// the current session only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    pub uuid: String,
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub macs: Vec<String>,
    #[serde(default)]
    pub cleepdesktop: bool,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub extra: PeerExtra,
}

/// Free-form peer attributes plus the few the desktop derives itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apps: Option<serde_json::Value>,
    /// Unix timestamp (seconds) of the last ENTER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectedat: Option<i64>,
    #[serde(default)]
    pub configured: bool,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl Peer {
    /// Build a fresh record from decoded presence headers.
    pub fn from_infos(ident: &str, infos: &PeerInfos) -> Self {
        let mut extra = PeerExtra {
            version: infos.version.clone(),
            other: infos.extra.clone(),
            ..PeerExtra::default()
        };
        extra.apps = extra.other.remove("apps");

        Self {
            uuid: infos.uuid.clone().unwrap_or_default(),
            ident: ident.to_string(),
            hostname: infos.hostname.clone(),
            ip: infos.ip.clone(),
            port: infos.port,
            ssl: infos.ssl,
            macs: infos.macs.clone(),
            cleepdesktop: infos.cleepdesktop,
            online: false,
            extra,
        }
    }

    /// A device is configured once its hostname differs from the factory one.
    pub fn is_configured(&self) -> bool {
        matches!(self.hostname.as_deref(), Some(h) if !h.is_empty() && h != UNCONFIGURED_HOSTNAME)
    }

    /// Whether this peer shares at least one mac address with `macs`.
    pub fn shares_mac(&self, macs: &[String]) -> bool {
        self.macs
            .iter()
            .any(|mac| macs.iter().any(|other| other.eq_ignore_ascii_case(mac)))
    }
}

/// Snapshot pushed on the `devices` UI topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DevicesSnapshot {
    pub unconfigured: usize,
    pub devices: Vec<Peer>,
}

// ---------------------------------------------------------------------------
// Image catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageCategory {
    Official,
    Upstream,
}

/// An installable OS image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageEntry {
    pub label: String,
    pub url: String,
    /// Unix timestamp (seconds) of the release.
    pub timestamp: i64,
    pub category: ImageCategory,
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

// ---------------------------------------------------------------------------
// Removable media
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Drive {
    pub description: String,
    pub path: String,
    pub read_only: bool,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Wi-Fi
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WifiEncryption {
    Wpa2,
    Wpa,
    Wep,
    Unsecured,
    Unknown,
}

impl WifiEncryption {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "wpa2" => Some(Self::Wpa2),
            "wpa" => Some(Self::Wpa),
            "wep" => Some(Self::Wep),
            "unsecured" => Some(Self::Unsecured),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiNetwork {
    pub interface: String,
    pub ssid: String,
    pub encryption: WifiEncryption,
    /// Signal quality in percent (0-100).
    pub signal_level: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiStatus {
    pub adapter_present: bool,
    pub networks: Vec<WifiNetwork>,
}

// ---------------------------------------------------------------------------
// Tool update
// ---------------------------------------------------------------------------

/// Offer of a newer flashing tool release.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolUpdate {
    pub available: bool,
    pub version: Option<String>,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub size: u64,
    pub error: bool,
}

// ---------------------------------------------------------------------------
// Download / install statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Idle,
    Downloading,
    DownloadingNosize,
    Done,
    Canceled,
    Error,
    ErrorInvalidSize,
    ErrorBadChecksum,
    ErrorNetwork,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Downloading | Self::DownloadingNosize)
    }
}

/// Install job state machine.
///
/// ```text
/// idle -> downloading|downloading_nosize -> request_write_permissions
///      -> flashing -> validating -> done|canceled|error_*
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Idle,
    Downloading,
    DownloadingNosize,
    RequestWritePermissions,
    Flashing,
    Validating,
    Done,
    Canceled,
    Error,
    ErrorInvalidSize,
    ErrorBadChecksum,
    ErrorFlash,
    ErrorNetwork,
}

impl InstallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done
                | Self::Canceled
                | Self::Error
                | Self::ErrorInvalidSize
                | Self::ErrorBadChecksum
                | Self::ErrorFlash
                | Self::ErrorNetwork
        )
    }

    /// Progress share already completed when this phase starts, and the share
    /// the phase itself accounts for.
    fn phase_window(&self) -> (u32, u32) {
        match self {
            Self::Downloading | Self::DownloadingNosize => (0, 33),
            Self::RequestWritePermissions => (33, 0),
            Self::Flashing => (33, 33),
            Self::Validating => (66, 33),
            _ => (0, 0),
        }
    }

    /// Overall progress from the local percent of the current phase.
    pub fn total_percent(&self, percent: i32) -> u8 {
        if *self == Self::Done {
            return 100;
        }
        if self.is_terminal() || *self == Self::Idle {
            return 0;
        }
        let (base, share) = self.phase_window();
        let local = percent.clamp(0, 100) as u32;
        (base + local * share / 100).min(99) as u8
    }
}

impl From<DownloadStatus> for InstallStatus {
    fn from(status: DownloadStatus) -> Self {
        match status {
            DownloadStatus::Idle => Self::Idle,
            DownloadStatus::Downloading | DownloadStatus::Done => Self::Downloading,
            DownloadStatus::DownloadingNosize => Self::DownloadingNosize,
            DownloadStatus::Canceled => Self::Canceled,
            DownloadStatus::Error => Self::Error,
            DownloadStatus::ErrorInvalidSize => Self::ErrorInvalidSize,
            DownloadStatus::ErrorBadChecksum => Self::ErrorBadChecksum,
            DownloadStatus::ErrorNetwork => Self::ErrorNetwork,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(hostname: Option<&str>, macs: &[&str]) -> Peer {
        Peer {
            uuid: "u1".into(),
            ident: "i1".into(),
            hostname: hostname.map(str::to_string),
            ip: None,
            port: 80,
            ssl: false,
            macs: macs.iter().map(|m| m.to_string()).collect(),
            cleepdesktop: false,
            online: false,
            extra: PeerExtra::default(),
        }
    }

    #[test]
    fn test_configured_flag() {
        assert!(!peer(None, &[]).is_configured());
        assert!(!peer(Some("cleepdevice"), &[]).is_configured());
        assert!(!peer(Some(""), &[]).is_configured());
        assert!(peer(Some("kitchen"), &[]).is_configured());
    }

    #[test]
    fn test_shares_mac_is_case_insensitive() {
        let p = peer(None, &["AA:BB:CC:DD:EE:FF"]);
        assert!(p.shares_mac(&["aa:bb:cc:dd:ee:ff".to_string()]));
        assert!(!p.shares_mac(&["11:22:33:44:55:66".to_string()]));
        assert!(!p.shares_mac(&[]));
    }

    #[test]
    fn test_total_percent_windows() {
        assert_eq!(InstallStatus::Downloading.total_percent(0), 0);
        assert_eq!(InstallStatus::Downloading.total_percent(100), 33);
        assert_eq!(InstallStatus::DownloadingNosize.total_percent(-1), 0);
        assert_eq!(InstallStatus::RequestWritePermissions.total_percent(0), 33);
        assert_eq!(InstallStatus::Flashing.total_percent(50), 49);
        assert_eq!(InstallStatus::Validating.total_percent(100), 99);
        assert_eq!(InstallStatus::Done.total_percent(0), 100);
        assert_eq!(InstallStatus::ErrorFlash.total_percent(40), 0);
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&InstallStatus::RequestWritePermissions).unwrap();
        assert_eq!(json, "\"request_write_permissions\"");
        let json = serde_json::to_string(&DownloadStatus::DownloadingNosize).unwrap();
        assert_eq!(json, "\"downloading_nosize\"");
    }

    #[test]
    fn test_download_status_mapping() {
        assert_eq!(
            InstallStatus::from(DownloadStatus::ErrorBadChecksum),
            InstallStatus::ErrorBadChecksum
        );
        assert!(DownloadStatus::Canceled.is_terminal());
        assert!(!DownloadStatus::DownloadingNosize.is_terminal());
    }

    #[test]
    fn test_peer_extra_keeps_unknown_keys() {
        let json = serde_json::json!({
            "uuid": "abc",
            "extra": {"version": "0.1.0", "configured": true, "custom": 3}
        });
        let p: Peer = serde_json::from_value(json).unwrap();
        assert_eq!(p.extra.version.as_deref(), Some("0.1.0"));
        assert_eq!(p.extra.other.get("custom"), Some(&serde_json::json!(3)));
        assert!(!p.online);
    }
}
