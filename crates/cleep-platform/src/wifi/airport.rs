use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use cleep_shared::types::WifiNetwork;
use cleep_shared::wifi::dbm_to_percent;

use crate::error::Result;
use crate::runner::{run_checked, CommandRunner};

use super::{encryption_from_security, WifiProbe};

const AIRPORT: &str =
    "/System/Library/PrivateFrameworks/Apple80211.framework/Versions/Current/Resources/airport";
const NETWORKSETUP: &str = "networksetup";

static SCAN_LINE_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^\s*(.+?)\s+((?:[0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2})\s+(-?\d+)\s+\S+\s+\S+\s+\S+\s+(.+?)\s*$",
    )
    .ok()
});

/// macOS scanner built on the private `airport` tool.
pub struct AirportProbe {
    runner: Arc<dyn CommandRunner>,
}

impl AirportProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl WifiProbe for AirportProbe {
    fn name(&self) -> &'static str {
        "airport"
    }

    fn is_available(&self) -> bool {
        self.runner.has_program(AIRPORT)
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        let out = run_checked(
            self.runner.as_ref(),
            NETWORKSETUP,
            &["-listallhardwareports"],
        )?;
        Ok(parse_hardware_ports(&out))
    }

    fn scan(&self, interfaces: &[String]) -> Result<Vec<WifiNetwork>> {
        // airport only scans the primary wireless interface
        let Some(interface) = interfaces.first() else {
            return Ok(Vec::new());
        };
        let out = run_checked(self.runner.as_ref(), AIRPORT, &["-s"])?;
        Ok(parse_scan(&out, interface))
    }
}

fn parse_hardware_ports(output: &str) -> Vec<String> {
    let mut interfaces = Vec::new();
    let mut wifi_port = false;
    for line in output.lines() {
        if let Some(port) = line.strip_prefix("Hardware Port:") {
            let port = port.trim();
            wifi_port = port == "Wi-Fi" || port == "AirPort";
        } else if let Some(device) = line.strip_prefix("Device:") {
            if wifi_port {
                interfaces.push(device.trim().to_string());
            }
            wifi_port = false;
        }
    }
    interfaces
}

fn parse_scan(output: &str, interface: &str) -> Vec<WifiNetwork> {
    let Some(re) = SCAN_LINE_RE.as_ref() else {
        return Vec::new();
    };
    output
        .lines()
        .skip(1)
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| {
            let rssi: i32 = caps.get(3)?.as_str().parse().ok()?;
            Some(WifiNetwork {
                interface: interface.to_string(),
                ssid: caps.get(1)?.as_str().to_string(),
                encryption: encryption_from_security(caps.get(4)?.as_str()),
                signal_level: dbm_to_percent(rssi),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use cleep_shared::types::WifiEncryption;

    const PORTS: &str = "
Hardware Port: Ethernet
Device: en1
Ethernet Address: 00:00:00:00:00:01

Hardware Port: Wi-Fi
Device: en0
Ethernet Address: 00:00:00:00:00:02
";

    const SCAN: &str = "                            SSID BSSID             RSSI CHANNEL HT CC SECURITY (auth/unicast/group)
                      My Network 00:11:22:33:44:55 -52  11      Y  FR WPA2(PSK/AES/AES)
                          Bistro a0:b1:c2:d3:e4:f5 -80  6       Y  -- NONE
                          Legacy 10:20:30:40:50:60 -67  1       N  FR WEP
";

    #[test]
    fn test_parse_hardware_ports() {
        assert_eq!(parse_hardware_ports(PORTS), vec!["en0"]);
    }

    #[test]
    fn test_scan() {
        let runner = FakeRunner::new()
            .with("networksetup -listallhardwareports", PORTS)
            .with(&format!("{AIRPORT} -s"), SCAN);
        let probe = AirportProbe::new(Arc::new(runner));
        assert!(probe.is_available());

        let interfaces = probe.interfaces().unwrap();
        let networks = probe.scan(&interfaces).unwrap();
        assert_eq!(networks.len(), 3);
        assert_eq!(networks[0].ssid, "My Network");
        assert_eq!(networks[0].interface, "en0");
        assert_eq!(networks[0].encryption, WifiEncryption::Wpa2);
        assert_eq!(networks[0].signal_level, dbm_to_percent(-52));
        assert_eq!(networks[1].encryption, WifiEncryption::Unsecured);
        assert_eq!(networks[2].encryption, WifiEncryption::Wep);
    }

    #[test]
    fn test_scan_failure_is_reported() {
        let runner = FakeRunner::new().failing(&format!("{AIRPORT} -s"), 1);
        let probe = AirportProbe::new(Arc::new(runner));
        assert!(probe.scan(&["en0".to_string()]).is_err());
    }
}
