use std::sync::Arc;

use cleep_shared::types::WifiNetwork;

use crate::error::Result;
use crate::runner::{run_checked, CommandRunner};

use super::{encryption_from_security, WifiProbe};

const NMCLI: &str = "nmcli";

/// NetworkManager command line client.
pub struct NmcliProbe {
    runner: Arc<dyn CommandRunner>,
}

impl NmcliProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl WifiProbe for NmcliProbe {
    fn name(&self) -> &'static str {
        NMCLI
    }

    fn is_available(&self) -> bool {
        self.runner.has_program(NMCLI)
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        let out = run_checked(
            self.runner.as_ref(),
            NMCLI,
            &["-t", "-f", "DEVICE,TYPE", "device"],
        )?;
        Ok(parse_devices(&out))
    }

    fn scan(&self, interfaces: &[String]) -> Result<Vec<WifiNetwork>> {
        let out = run_checked(
            self.runner.as_ref(),
            NMCLI,
            &["-t", "-f", "DEVICE,SSID,SIGNAL,SECURITY", "device", "wifi", "list"],
        )?;
        Ok(parse_networks(&out)
            .into_iter()
            .filter(|n| interfaces.contains(&n.interface))
            .collect())
    }
}

/// Split a terse nmcli line on `:`, honouring `\:` and `\\` escapes.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    if let Some(last) = fields.last_mut() {
                        last.push(next);
                    }
                }
            }
            ':' => fields.push(String::new()),
            _ => {
                if let Some(last) = fields.last_mut() {
                    last.push(c);
                }
            }
        }
    }
    fields
}

fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(split_terse)
        .filter(|f| f.len() >= 2 && f[1] == "wifi")
        .map(|f| f[0].clone())
        .collect()
}

fn parse_networks(output: &str) -> Vec<WifiNetwork> {
    output
        .lines()
        .map(split_terse)
        .filter(|f| f.len() >= 4)
        .map(|f| WifiNetwork {
            interface: f[0].clone(),
            ssid: f[1].clone(),
            signal_level: f[2].trim().parse::<u8>().unwrap_or(0).min(100),
            encryption: encryption_from_security(&f[3]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use cleep_shared::types::WifiEncryption;

    #[test]
    fn test_terse_escapes() {
        assert_eq!(
            split_terse(r"wlan0:my\:net:80:WPA2"),
            vec!["wlan0", "my:net", "80", "WPA2"]
        );
        assert_eq!(split_terse(r"a\\b:"), vec![r"a\b", ""]);
    }

    #[test]
    fn test_scan_with_fake_nmcli() {
        let runner = FakeRunner::new()
            .with(
                "nmcli -t -f DEVICE,TYPE device",
                "enp3s0:ethernet\nwlp2s0:wifi\nlo:loopback\n",
            )
            .with(
                "nmcli -t -f DEVICE,SSID,SIGNAL,SECURITY device wifi list",
                "wlp2s0:Home:82:WPA1 WPA2\nwlp2s0:Cafe:40:\nwlp2s0::30:WPA2\nwlp9s9:Other:90:WEP\n",
            );
        let probe = NmcliProbe::new(Arc::new(runner));
        assert!(probe.is_available());

        let interfaces = probe.interfaces().unwrap();
        assert_eq!(interfaces, vec!["wlp2s0"]);

        let networks = probe.scan(&interfaces).unwrap();
        assert_eq!(networks.len(), 3);
        assert_eq!(networks[0].ssid, "Home");
        assert_eq!(networks[0].signal_level, 82);
        assert_eq!(networks[0].encryption, WifiEncryption::Wpa2);
        assert_eq!(networks[1].encryption, WifiEncryption::Unsecured);
    }

    #[test]
    fn test_not_available_without_tool() {
        let probe = NmcliProbe::new(Arc::new(FakeRunner::new()));
        assert!(!probe.is_available());
    }
}
