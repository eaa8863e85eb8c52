use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use cleep_shared::types::{WifiEncryption, WifiNetwork};
use cleep_shared::wifi::dbm_to_percent;

use crate::error::Result;
use crate::runner::CommandRunner;

use super::WifiProbe;

const IWLIST: &str = "iwlist";

static SIGNAL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"Signal level[=:]\s*(-?\d+)(?:/(\d+))?\s*(dBm)?").ok());
static ESSID_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r#"ESSID:"(.*)""#).ok());

/// Wireless extensions scanner, used when NetworkManager is absent.
pub struct IwlistProbe {
    runner: Arc<dyn CommandRunner>,
}

impl IwlistProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    // `iwlist` exits non-zero when one of the interfaces cannot scan, the
    // output is still usable.
    fn scan_output(&self) -> Result<String> {
        Ok(self.runner.run(IWLIST, &["scanning"])?.stdout)
    }
}

impl WifiProbe for IwlistProbe {
    fn name(&self) -> &'static str {
        IWLIST
    }

    fn is_available(&self) -> bool {
        self.runner.has_program(IWLIST)
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(parse_scan(&self.scan_output()?).0)
    }

    fn scan(&self, interfaces: &[String]) -> Result<Vec<WifiNetwork>> {
        Ok(parse_scan(&self.scan_output()?)
            .1
            .into_iter()
            .filter(|n| interfaces.contains(&n.interface))
            .collect())
    }
}

#[derive(Default)]
struct Cell {
    ssid: String,
    signal_level: u8,
    key_on: bool,
    wpa: bool,
    wpa2: bool,
}

impl Cell {
    fn into_network(self, interface: &str) -> WifiNetwork {
        let encryption = if !self.key_on {
            WifiEncryption::Unsecured
        } else if self.wpa2 {
            WifiEncryption::Wpa2
        } else if self.wpa {
            WifiEncryption::Wpa
        } else {
            WifiEncryption::Wep
        };
        WifiNetwork {
            interface: interface.to_string(),
            ssid: self.ssid,
            encryption,
            signal_level: self.signal_level,
        }
    }
}

fn signal_percent(line: &str) -> Option<u8> {
    let caps = SIGNAL_RE.as_ref()?.captures(line)?;
    let value: i32 = caps.get(1)?.as_str().parse().ok()?;
    if caps.get(3).is_some() || value < 0 {
        return Some(dbm_to_percent(value));
    }
    let max: i32 = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(100)
        .max(1);
    Some((value.clamp(0, max) * 100 / max) as u8)
}

/// Parse `iwlist scanning` into wireless interface names and networks.
fn parse_scan(output: &str) -> (Vec<String>, Vec<WifiNetwork>) {
    let mut interfaces = Vec::new();
    let mut networks = Vec::new();
    let mut interface = String::new();
    let mut cell: Option<Cell> = None;

    for line in output.lines() {
        if !line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
            if let Some(done) = cell.take() {
                networks.push(done.into_network(&interface));
            }
            let name = line.split_whitespace().next().unwrap_or_default();
            interface = name.to_string();
            if line.contains("Scan completed") || line.contains("No scan results") {
                interfaces.push(interface.clone());
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.starts_with("Cell ") {
            if let Some(done) = cell.replace(Cell::default()) {
                networks.push(done.into_network(&interface));
            }
            continue;
        }
        let Some(current) = cell.as_mut() else {
            continue;
        };
        if let Some(percent) = signal_percent(trimmed) {
            current.signal_level = percent;
        } else if trimmed.starts_with("Encryption key:") {
            current.key_on = trimmed.ends_with("on");
        } else if let Some(caps) = ESSID_RE.as_ref().and_then(|re| re.captures(trimmed)) {
            current.ssid = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        } else if trimmed.starts_with("IE:") {
            if trimmed.contains("WPA2") {
                current.wpa2 = true;
            } else if trimmed.contains("WPA") {
                current.wpa = true;
            }
        }
    }
    if let Some(done) = cell.take() {
        networks.push(done.into_network(&interface));
    }
    (interfaces, networks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;

    const SCAN: &str = r#"lo        Interface doesn't support scanning.

wlan0     Scan completed :
          Cell 01 - Address: 00:11:22:33:44:55
                    Channel:6
                    Frequency:2.437 GHz (Channel 6)
                    Quality=70/70  Signal level=-39 dBm
                    Encryption key:on
                    ESSID:"Home"
                    IE: IEEE 802.11i/WPA2 Version 1
                    IE: WPA Version 1
          Cell 02 - Address: 66:77:88:99:AA:BB
                    Quality=35/70  Signal level=-75 dBm
                    Encryption key:off
                    ESSID:"Guest"
          Cell 03 - Address: CC:DD:EE:FF:00:11
                    Quality:40/100  Signal level:60/100
                    Encryption key:on
                    ESSID:"Legacy"
"#;

    #[test]
    fn test_parse_scan() {
        let (interfaces, networks) = parse_scan(SCAN);
        assert_eq!(interfaces, vec!["wlan0"]);
        assert_eq!(networks.len(), 3);

        assert_eq!(networks[0].ssid, "Home");
        assert_eq!(networks[0].encryption, WifiEncryption::Wpa2);
        assert_eq!(networks[0].signal_level, dbm_to_percent(-39));

        assert_eq!(networks[1].ssid, "Guest");
        assert_eq!(networks[1].encryption, WifiEncryption::Unsecured);

        assert_eq!(networks[2].encryption, WifiEncryption::Wep);
        assert_eq!(networks[2].signal_level, 60);
    }

    #[test]
    fn test_scan_tolerates_partial_failure() {
        let runner = FakeRunner::new().with_status("iwlist scanning", 255, SCAN);
        let probe = IwlistProbe::new(Arc::new(runner));
        let interfaces = probe.interfaces().unwrap();
        assert_eq!(probe.scan(&interfaces).unwrap().len(), 3);
    }
}
