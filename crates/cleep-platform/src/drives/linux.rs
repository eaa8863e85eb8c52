use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use cleep_shared::types::Drive;

use crate::error::{ProbeError, Result};
use crate::runner::{run_checked, CommandRunner};

use super::{describe, DriveProbe};

const LSBLK: &str = "lsblk";
const UDEVADM: &str = "udevadm";
const LSBLK_ARGS: &[&str] = &[
    "-J",
    "-b",
    "-d",
    "-o",
    "NAME,PATH,SIZE,RO,RM,HOTPLUG,TRAN,VENDOR,MODEL,TYPE",
];

/// Block device listing through `lsblk`, refined with udev properties.
pub struct LinuxDrives {
    runner: Arc<dyn CommandRunner>,
}

impl LinuxDrives {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn udev_properties(&self, path: &str) -> HashMap<String, String> {
        let arg = format!("--name={path}");
        match run_checked(
            self.runner.as_ref(),
            UDEVADM,
            &["info", "--query=property", &arg],
        ) {
            Ok(out) => parse_udev_properties(&out),
            Err(e) => {
                trace!(path, error = %e, "udev properties unavailable");
                HashMap::new()
            }
        }
    }
}

impl DriveProbe for LinuxDrives {
    fn name(&self) -> &'static str {
        "lsblk"
    }

    fn removable_drives(&self) -> Result<Vec<Drive>> {
        let out = run_checked(self.runner.as_ref(), LSBLK, LSBLK_ARGS)?;
        let devices = parse_lsblk(&out)?;
        let with_udev = self.runner.has_program(UDEVADM);

        let drives: Vec<Drive> = devices
            .into_iter()
            .filter_map(|dev| {
                let props = if with_udev {
                    self.udev_properties(&dev.path)
                } else {
                    HashMap::new()
                };
                dev.into_drive(&props)
            })
            .collect();

        debug!(count = drives.len(), "Removable drives listed");
        Ok(drives)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<HashMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlockDevice {
    name: String,
    path: String,
    size: u64,
    read_only: bool,
    removable: bool,
    hotplug: bool,
    transport: String,
    vendor: String,
    model: String,
    kind: String,
}

// lsblk emits booleans as `true`, `"1"` or `1` depending on its version.
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn number(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn parse_lsblk(output: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput =
        serde_json::from_str(output).map_err(|e| ProbeError::parse(LSBLK, e.to_string()))?;

    Ok(parsed
        .blockdevices
        .iter()
        .map(|dev| {
            let name = text(dev.get("name"));
            let mut path = text(dev.get("path"));
            if path.is_empty() {
                path = format!("/dev/{name}");
            }
            BlockDevice {
                name,
                path,
                size: number(dev.get("size")),
                read_only: flag(dev.get("ro")),
                removable: flag(dev.get("rm")),
                hotplug: flag(dev.get("hotplug")),
                transport: text(dev.get("tran")).to_ascii_lowercase(),
                vendor: text(dev.get("vendor")),
                model: text(dev.get("model")),
                kind: text(dev.get("type")),
            }
        })
        .collect())
}

pub(crate) fn parse_udev_properties(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

impl BlockDevice {
    fn is_sd_card(&self, props: &HashMap<String, String>) -> bool {
        self.name.starts_with("mmcblk")
            || self.transport == "mmc"
            || props.contains_key("ID_DRIVE_FLASH_SD")
            || props.contains_key("ID_DRIVE_MEDIA_FLASH_SD")
    }

    fn is_usb(&self, props: &HashMap<String, String>) -> bool {
        self.transport == "usb" || props.get("ID_BUS").map(String::as_str) == Some("usb")
    }

    /// Keep whole disks the kernel flags as removable or hot-pluggable,
    /// attached through USB or an SD reader, with media inserted.
    fn into_drive(self, props: &HashMap<String, String>) -> Option<Drive> {
        if self.kind != "disk" || self.size == 0 {
            return None;
        }
        if !(self.removable || self.hotplug) {
            return None;
        }
        let bus = if self.is_sd_card(props) {
            "SD card"
        } else if self.is_usb(props) {
            "USB"
        } else {
            return None;
        };

        let label = describe(&[&self.vendor, &self.model], &self.name);
        Some(Drive {
            description: format!("{label} ({bus})"),
            path: self.path,
            read_only: self.read_only,
            size_bytes: self.size,
        })
    }
}
