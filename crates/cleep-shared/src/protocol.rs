//! JSON payloads exchanged with devices over the peer bus.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A command addressed to a device module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalCommand {
    pub command: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_infos: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// An event raised by (or sent to) a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalEvent {
    pub event: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_infos: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_uuid: Option<String>,
}

/// Either a command or an event. A payload carrying both is a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ExternalMessage {
    Command(ExternalCommand),
    Event(ExternalEvent),
}

impl ExternalMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Command or event name.
    pub fn name(&self) -> &str {
        match self {
            Self::Command(c) => &c.command,
            Self::Event(e) => &e.event,
        }
    }

    pub fn params(&self) -> &Map<String, Value> {
        match self {
            Self::Command(c) => &c.params,
            Self::Event(e) => &e.params,
        }
    }
}
