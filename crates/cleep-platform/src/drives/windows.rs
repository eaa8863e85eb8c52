use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use cleep_shared::types::Drive;

use crate::error::{ProbeError, Result};
use crate::runner::{run_checked, CommandRunner};

use super::{describe, DriveProbe};

const POWERSHELL: &str = "powershell";
const LOGICAL_DISKS_QUERY: &str = "Get-CimInstance -ClassName Win32_LogicalDisk | \
Select-Object DeviceID,DriveType,Size,VolumeName,Access | ConvertTo-Json -Compress";

/// `Win32_LogicalDisk.DriveType` value for removable disks.
const DRIVE_TYPE_REMOVABLE: u32 = 2;
/// `Win32_LogicalDisk.Access` value for read-only media.
const ACCESS_READ_ONLY: u32 = 1;

/// Logical disk listing through CIM, filtered on the removable drive type.
pub struct WindowsDrives {
    runner: Arc<dyn CommandRunner>,
}

impl WindowsDrives {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl DriveProbe for WindowsDrives {
    fn name(&self) -> &'static str {
        "win32_logicaldisk"
    }

    fn removable_drives(&self) -> Result<Vec<Drive>> {
        let out = run_checked(
            self.runner.as_ref(),
            POWERSHELL,
            &["-NoProfile", "-NonInteractive", "-Command", LOGICAL_DISKS_QUERY],
        )?;
        let drives = parse_logical_disks(&out)?;
        debug!(count = drives.len(), "Removable drives listed");
        Ok(drives)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LogicalDisk {
    #[serde(rename = "DeviceID")]
    device_id: String,
    #[serde(default)]
    drive_type: u32,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    volume_name: Option<String>,
    #[serde(default)]
    access: Option<u32>,
}

/// `ConvertTo-Json` prints a bare object when there is a single result.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<LogicalDisk>),
    One(LogicalDisk),
}

pub(crate) fn parse_logical_disks(output: &str) -> Result<Vec<Drive>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let disks = match serde_json::from_str::<OneOrMany>(trimmed)
        .map_err(|e| ProbeError::parse(POWERSHELL, e.to_string()))?
    {
        OneOrMany::Many(disks) => disks,
        OneOrMany::One(disk) => vec![disk],
    };

    Ok(disks
        .into_iter()
        .filter(|d| d.drive_type == DRIVE_TYPE_REMOVABLE)
        .filter_map(|d| {
            let size_bytes = d.size.filter(|s| *s > 0)?;
            let name = d.volume_name.as_deref().unwrap_or_default();
            Some(Drive {
                description: format!("{} ({})", describe(&[name], "Removable disk"), d.device_id),
                read_only: d.access == Some(ACCESS_READ_ONLY),
                path: d.device_id,
                size_bytes,
            })
        })
        .collect())
}
