//! Wi-Fi signal conversion and credential handling.

use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::constants::{PSK_ITERATIONS, PSK_LENGTH};
use crate::error::{CleepError, ErrorKind};
use crate::types::WifiEncryption;

/// Signal quality (percent) for -1 dBm down to -100 dBm.
const DBM_TO_PERCENT: [u8; 100] = [
    100, 100, 100, 100, 100, 100, 100, 100, 100, 100, // -1 .. -10
    100, 100, 100, 100, 100, 100, 100, 100, 100, 100, // -11 .. -20
    99, 99, 99, 98, 98, 98, 97, 97, 96, 96, // -21 .. -30
    95, 95, 94, 93, 93, 92, 91, 90, 90, 89, // -31 .. -40
    88, 87, 86, 85, 84, 83, 82, 81, 80, 79, // -41 .. -50
    78, 76, 75, 74, 73, 71, 70, 69, 67, 66, // -51 .. -60
    64, 63, 61, 60, 58, 56, 55, 53, 51, 50, // -61 .. -70
    48, 46, 44, 42, 40, 38, 36, 34, 32, 30, // -71 .. -80
    28, 26, 24, 22, 20, 17, 15, 13, 10, 8, // -81 .. -90
    6, 3, 1, 1, 1, 1, 1, 1, 1, 1, // -91 .. -100
];

/// Convert a dBm reading into a 0-100 quality.
///
/// Readings outside the table (positive values, zero, or below -100 dBm)
/// yield 0.
pub fn dbm_to_percent(dbm: i32) -> u8 {
    if !(-100..=-1).contains(&dbm) {
        return 0;
    }
    DBM_TO_PERCENT[(-dbm - 1) as usize]
}

/// Derive the WPA pre-shared key (hex) from a passphrase and SSID.
pub fn derive_psk(ssid: &str, passphrase: &str) -> String {
    let mut key = [0u8; PSK_LENGTH];
    pbkdf2_hmac::<Sha1>(
        passphrase.as_bytes(),
        ssid.as_bytes(),
        PSK_ITERATIONS,
        &mut key,
    );
    hex::encode(key)
}

/// Wi-Fi credentials pre-seeded on a flashed medium.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiConfig {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    pub encryption: WifiEncryption,
    #[serde(default)]
    pub hidden: bool,
}

/// Content of the credential file read by the device on first boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiCredentialFile {
    pub network: String,
    pub password: String,
    pub encryption: WifiEncryption,
    pub hidden: bool,
}

impl WifiConfig {
    pub fn validate(&self) -> Result<(), CleepError> {
        if self.ssid.is_empty() {
            return Err(CleepError::new(
                ErrorKind::InvalidParameter,
                "Wifi network name must be specified",
            ));
        }
        match self.encryption {
            WifiEncryption::Wpa | WifiEncryption::Wpa2 => {
                let len = self.password.chars().count();
                if len == 0 {
                    return Err(CleepError::new(
                        ErrorKind::InvalidParameter,
                        "Wifi password is required for WPA/WPA2 networks",
                    ));
                }
                if !(8..=63).contains(&len) {
                    return Err(CleepError::new(
                        ErrorKind::InvalidParameter,
                        "WPA/WPA2 password must be 8 to 63 characters long",
                    ));
                }
            }
            WifiEncryption::Wep if self.password.is_empty() => {
                return Err(CleepError::new(
                    ErrorKind::InvalidParameter,
                    "Wifi password is required for WEP networks",
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// WPA passwords are stored as derived keys, others verbatim.
    pub fn to_credential_file(&self) -> WifiCredentialFile {
        let password = match self.encryption {
            WifiEncryption::Wpa | WifiEncryption::Wpa2 => derive_psk(&self.ssid, &self.password),
            _ => self.password.clone(),
        };
        WifiCredentialFile {
            network: self.ssid.clone(),
            password,
            encryption: self.encryption,
            hidden: self.hidden,
        }
    }
}
