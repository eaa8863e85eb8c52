use std::sync::Arc;

use cleep_shared::types::WifiNetwork;

use crate::error::Result;
use crate::runner::{run_checked, CommandRunner};

use super::{encryption_from_security, WifiProbe};

const NETSH: &str = "netsh";

/// Windows WLAN service through `netsh wlan`.
pub struct NetshProbe {
    runner: Arc<dyn CommandRunner>,
}

impl NetshProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl WifiProbe for NetshProbe {
    fn name(&self) -> &'static str {
        NETSH
    }

    fn is_available(&self) -> bool {
        self.runner.has_program(NETSH)
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        // exits non-zero when the WLAN service is stopped, meaning no adapter
        let output = self.runner.run(NETSH, &["wlan", "show", "interfaces"])?;
        Ok(parse_interfaces(&output.stdout))
    }

    fn scan(&self, interfaces: &[String]) -> Result<Vec<WifiNetwork>> {
        let mut networks = Vec::new();
        for interface in interfaces {
            let arg = format!("interface={interface}");
            let out = run_checked(
                self.runner.as_ref(),
                NETSH,
                &["wlan", "show", "networks", "mode=bssid", &arg],
            )?;
            networks.extend(parse_networks(&out, interface));
        }
        Ok(networks)
    }
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(" : ").or_else(|| line.split_once(':'))?;
    Some((key.trim(), value.trim()))
}

fn parse_interfaces(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(key_value)
        .filter(|(key, _)| *key == "Name")
        .map(|(_, value)| value.to_string())
        .collect()
}

fn parse_networks(output: &str, interface: &str) -> Vec<WifiNetwork> {
    let mut networks: Vec<WifiNetwork> = Vec::new();
    for line in output.lines() {
        let Some((key, value)) = key_value(line) else {
            continue;
        };
        if key.starts_with("SSID ") {
            networks.push(WifiNetwork {
                interface: interface.to_string(),
                ssid: value.to_string(),
                encryption: encryption_from_security(""),
                signal_level: 0,
            });
            continue;
        }
        let Some(current) = networks.last_mut() else {
            continue;
        };
        match key {
            "Authentication" => current.encryption = encryption_from_security(value),
            "Encryption" if value.eq_ignore_ascii_case("WEP") => {
                current.encryption = encryption_from_security("WEP")
            }
            "Signal" => {
                let percent = value.trim_end_matches('%').trim().parse::<u8>().unwrap_or(0);
                current.signal_level = current.signal_level.max(percent.min(100));
            }
            _ => {}
        }
    }
    networks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use cleep_shared::types::WifiEncryption;

    const INTERFACES: &str = "
There is 1 interface on the system:

    Name                   : Wi-Fi
    Description            : Intel(R) Wi-Fi 6 AX201 160MHz
    GUID                   : 1b2c3d4e-0000-0000-0000-000000000000
    State                  : connected
";

    const NETWORKS: &str = "
Interface name : Wi-Fi
There are 2 networks currently visible.

SSID 1 : Home
    Network type            : Infrastructure
    Authentication          : WPA2-Personal
    Encryption              : CCMP
    BSSID 1                 : 00:11:22:33:44:55
         Signal             : 62%
         Radio type         : 802.11ac
    BSSID 2                 : 00:11:22:33:44:56
         Signal             : 91%

SSID 2 : Open Cafe
    Network type            : Infrastructure
    Authentication          : Open
    Encryption              : None
    BSSID 1                 : 66:77:88:99:aa:bb
         Signal             : 30%
";

    #[test]
    fn test_parse_interfaces() {
        assert_eq!(parse_interfaces(INTERFACES), vec!["Wi-Fi"]);
        assert!(parse_interfaces("There is no wireless interface on the system.").is_empty());
    }

    #[test]
    fn test_scan_keeps_best_bssid_signal() {
        let runner = FakeRunner::new()
            .with("netsh wlan show interfaces", INTERFACES)
            .with(
                "netsh wlan show networks mode=bssid interface=Wi-Fi",
                NETWORKS,
            );
        let probe = NetshProbe::new(Arc::new(runner));
        let interfaces = probe.interfaces().unwrap();
        let networks = probe.scan(&interfaces).unwrap();

        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].ssid, "Home");
        assert_eq!(networks[0].signal_level, 91);
        assert_eq!(networks[0].encryption, WifiEncryption::Wpa2);
        assert_eq!(networks[1].ssid, "Open Cafe");
        assert_eq!(networks[1].encryption, WifiEncryption::Unsecured);
    }
}
