//! Presence header codec.
//!
//! Every header travels as a string on the bus. Known keys are decoded into
//! typed fields (booleans from `"0"`/`"1"`, integers from decimal strings,
//! mac lists from JSON); any other key is kept as JSON when it parses and as
//! a plain string otherwise.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const HEADER_UUID: &str = "uuid";
pub const HEADER_VERSION: &str = "version";
pub const HEADER_HOSTNAME: &str = "hostname";
pub const HEADER_IP: &str = "ip";
pub const HEADER_PORT: &str = "port";
pub const HEADER_SSL: &str = "ssl";
pub const HEADER_CLEEPDESKTOP: &str = "cleepdesktop";
pub const HEADER_MACS: &str = "macs";

const KNOWN_HEADERS: [&str; 8] = [
    HEADER_UUID,
    HEADER_VERSION,
    HEADER_HOSTNAME,
    HEADER_IP,
    HEADER_PORT,
    HEADER_SSL,
    HEADER_CLEEPDESKTOP,
    HEADER_MACS,
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Header {key} is not a boolean: {value:?}")]
    InvalidBool { key: String, value: String },

    #[error("Header {key} is not an integer: {value:?}")]
    InvalidInteger { key: String, value: String },

    #[error("Header {key} is not a JSON list of strings: {value:?}")]
    InvalidList { key: String, value: String },
}

/// Typed view of the headers a peer advertises when it enters the channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerInfos {
    pub uuid: Option<String>,
    pub version: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub port: u16,
    pub ssl: bool,
    pub cleepdesktop: bool,
    pub macs: Vec<String>,
    /// Application-specific headers.
    pub extra: Map<String, Value>,
}

impl PeerInfos {
    /// Decode raw string headers.
    pub fn from_headers(headers: &HashMap<String, String>) -> Result<Self, HeaderError> {
        let text = |key: &str| headers.get(key).filter(|v| !v.is_empty()).cloned();

        let port = match headers.get(HEADER_PORT) {
            Some(raw) if !raw.is_empty() => {
                raw.trim()
                    .parse::<u16>()
                    .map_err(|_| HeaderError::InvalidInteger {
                        key: HEADER_PORT.to_string(),
                        value: raw.clone(),
                    })?
            }
            _ => 0,
        };

        let macs = match headers.get(HEADER_MACS) {
            Some(raw) if !raw.is_empty() => {
                serde_json::from_str::<Vec<String>>(raw).map_err(|_| HeaderError::InvalidList {
                    key: HEADER_MACS.to_string(),
                    value: raw.clone(),
                })?
            }
            _ => Vec::new(),
        };

        let extra = headers
            .iter()
            .filter(|(key, _)| !KNOWN_HEADERS.contains(&key.as_str()))
            .map(|(key, raw)| {
                let value = serde_json::from_str::<Value>(raw)
                    .unwrap_or_else(|_| Value::String(raw.clone()));
                (key.clone(), value)
            })
            .collect();

        Ok(Self {
            uuid: text(HEADER_UUID),
            version: text(HEADER_VERSION),
            hostname: text(HEADER_HOSTNAME),
            ip: text(HEADER_IP),
            port,
            ssl: decode_bool(headers, HEADER_SSL)?,
            cleepdesktop: decode_bool(headers, HEADER_CLEEPDESKTOP)?,
            macs,
            extra,
        })
    }

    /// Encode back into the string form used on the wire.
    pub fn to_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();

        let mut put = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                headers.insert(key.to_string(), v.clone());
            }
        };
        put(HEADER_UUID, &self.uuid);
        put(HEADER_VERSION, &self.version);
        put(HEADER_HOSTNAME, &self.hostname);
        put(HEADER_IP, &self.ip);

        headers.insert(HEADER_PORT.to_string(), self.port.to_string());
        headers.insert(HEADER_SSL.to_string(), encode_bool(self.ssl));
        headers.insert(HEADER_CLEEPDESKTOP.to_string(), encode_bool(self.cleepdesktop));
        headers.insert(
            HEADER_MACS.to_string(),
            serde_json::to_string(&self.macs).unwrap_or_else(|_| "[]".to_string()),
        );

        for (key, value) in &self.extra {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            headers.insert(key.clone(), raw);
        }

        headers
    }
}

fn encode_bool(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn decode_bool(headers: &HashMap<String, String>, key: &str) -> Result<bool, HeaderError> {
    match headers.get(key).map(|v| v.trim()) {
        None | Some("") | Some("0") => Ok(false),
        Some("1") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(v) => Err(HeaderError::InvalidBool {
            key: key.to_string(),
            value: v.to_string(),
        }),
    }
}
