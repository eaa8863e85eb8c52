use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use cleep_shared::types::Drive;

use crate::error::Result;
use crate::runner::{run_checked, CommandRunner};

use super::{describe, DriveProbe};

const DISKUTIL: &str = "diskutil";

static BYTES_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\((\d+) Bytes\)").ok());

/// Disk listing through `diskutil info -all`.
pub struct MacDrives {
    runner: Arc<dyn CommandRunner>,
}

impl MacDrives {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl DriveProbe for MacDrives {
    fn name(&self) -> &'static str {
        "diskutil"
    }

    fn removable_drives(&self) -> Result<Vec<Drive>> {
        let out = run_checked(self.runner.as_ref(), DISKUTIL, &["info", "-all"])?;
        let drives = parse_diskutil(&out);
        debug!(count = drives.len(), "Removable drives listed");
        Ok(drives)
    }
}

/// Split the output into one key/value map per disk. Blocks are separated
/// by a line of asterisks.
fn info_blocks(output: &str) -> Vec<HashMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current = HashMap::new();

    for line in output.lines() {
        if line.trim_start().starts_with("****") {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                current.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn is_yes(block: &HashMap<String, String>, key: &str) -> bool {
    block
        .get(key)
        .map(|v| v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

fn size_of(block: &HashMap<String, String>) -> u64 {
    let raw = block
        .get("Disk Size")
        .or_else(|| block.get("Total Size"))
        .map(String::as_str)
        .unwrap_or_default();
    BYTES_RE
        .as_ref()
        .and_then(|re| re.captures(raw))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

pub(crate) fn parse_diskutil(output: &str) -> Vec<Drive> {
    info_blocks(output)
        .into_iter()
        .filter(|block| is_yes(block, "Whole") && !is_yes(block, "Virtual"))
        .filter(|block| {
            let removable = block
                .get("Removable Media")
                .map(|v| v.eq_ignore_ascii_case("removable") || v.eq_ignore_ascii_case("yes"))
                .unwrap_or(false);
            let external_usb = block.get("Protocol").map(String::as_str) == Some("USB")
                && block.get("Device Location").map(String::as_str) == Some("External");
            removable || external_usb
        })
        .filter_map(|block| {
            let path = block.get("Device Node")?.clone();
            let size_bytes = size_of(&block);
            if size_bytes == 0 {
                return None;
            }
            let name = block
                .get("Device / Media Name")
                .or_else(|| block.get("Media Name"))
                .map(String::as_str)
                .unwrap_or_default();
            let protocol = block.get("Protocol").map(String::as_str).unwrap_or_default();
            let read_only = is_yes(&block, "Media Read-Only") || is_yes(&block, "Read-Only Media");

            let label = describe(&[name], &path);
            let description = if protocol.is_empty() {
                label
            } else {
                format!("{label} ({protocol})")
            };
            Some(Drive {
                description,
                path,
                read_only,
                size_bytes,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;

    const DISKUTIL_INFO: &str = "   Device Identifier:         disk0
   Device Node:               /dev/disk0
   Whole:                     Yes
   Part of Whole:             disk0
   Device / Media Name:       APPLE SSD AP0512Q

   Protocol:                  Apple Fabric
   Disk Size:                 500.3 GB (500277792768 Bytes) (exactly 977105064 512-Byte-Units)
   Device Location:           Internal
   Removable Media:           Fixed
   Media Read-Only:           No
   Virtual:                   No
**********

   Device Identifier:         disk4
   Device Node:               /dev/disk4
   Whole:                     Yes
   Part of Whole:             disk4
   Device / Media Name:       SD Card Reader

   Protocol:                  USB
   Disk Size:                 31.9 GB (31914983424 Bytes) (exactly 62333952 512-Byte-Units)
   Device Location:           External
   Removable Media:           Removable
   Media Read-Only:           No
   Virtual:                   No
**********

   Device Identifier:         disk4s1
   Device Node:               /dev/disk4s1
   Whole:                     No
   Part of Whole:             disk4
   Removable Media:           Removable
   Disk Size:                 268.4 MB (268435456 Bytes) (exactly 524288 512-Byte-Units)
**********

   Device Identifier:         disk5
   Device Node:               /dev/disk5
   Whole:                     Yes
   Device / Media Name:       Disk Image
   Protocol:                  Disk Image
   Disk Size:                 1.0 GB (1000000000 Bytes) (exactly 1953125 512-Byte-Units)
   Removable Media:           Removable
   Virtual:                   Yes
**********
";

    #[test]
    fn test_parse_keeps_whole_removable_disks() {
        let drives = parse_diskutil(DISKUTIL_INFO);
        assert_eq!(
            drives,
            vec![Drive {
                description: "SD Card Reader (USB)".into(),
                path: "/dev/disk4".into(),
                read_only: false,
                size_bytes: 31_914_983_424,
            }]
        );
    }

    #[test]
    fn test_probe_runs_diskutil() {
        let probe = MacDrives::new(Arc::new(
            FakeRunner::new().with("diskutil info -all", DISKUTIL_INFO),
        ));
        assert_eq!(probe.removable_drives().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_output() {
        assert!(parse_diskutil("").is_empty());
    }
}
