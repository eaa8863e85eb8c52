//! In-process message plane.
//!
//! Components exchange [`MessageRequest`]s through the [`MessageBus`].
//! Commands addressed to one recipient get a single [`MessageResponse`],
//! broadcasts and events get none. Recipients that serve commands wrap a
//! [`CommandRouter`] holding typed handlers with declared parameters.

mod bus;
mod router;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cleep_shared::{CleepError, ErrorKind};

pub use bus::{serve, Envelope, MessageBus, Subscription};
pub use router::{CommandContext, CommandRouter, ParamSpec, ParamType};

/// A command or an event travelling on the bus. When both names are set
/// the request is a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Recipient name, absent for a broadcast.
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    /// Device the event is about.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Forward the event to the devices on the LAN bus.
    #[serde(default)]
    pub propagate: bool,
    /// Unicast timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl MessageRequest {
    pub fn command(name: &str, params: Map<String, Value>) -> Self {
        Self {
            command: Some(name.to_string()),
            params,
            ..Self::default()
        }
    }

    pub fn event(name: &str, params: Map<String, Value>) -> Self {
        Self {
            event: Some(name.to_string()),
            params,
            ..Self::default()
        }
    }

    pub fn to(mut self, recipient: &str) -> Self {
        self.to = Some(recipient.to_string());
        self
    }

    pub fn from_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn is_command(&self) -> bool {
        self.command.is_some()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Command name, or event name for events.
    pub fn name(&self) -> &str {
        self.command
            .as_deref()
            .or(self.event.as_deref())
            .unwrap_or_default()
    }
}

/// Success value of a command handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOk {
    pub data: Value,
    /// Informational message shown to the user.
    pub info: Option<String>,
}

impl CommandOk {
    pub fn data<S: Serialize>(data: S) -> Self {
        Self {
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            info: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            data: Value::Null,
            info: Some(message.into()),
        }
    }
}

pub type CommandResult = Result<CommandOk, CleepError>;

/// Reply to a unicast command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub error: bool,
    pub message: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl MessageResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            error: false,
            message: String::new(),
            data,
            kind: None,
        }
    }

    pub fn failure(error: CleepError) -> Self {
        Self {
            error: true,
            message: error.message,
            data: Value::Null,
            kind: Some(error.kind),
        }
    }

    pub fn failure_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::failure(CleepError::new(kind, message))
    }
}

impl From<CommandResult> for MessageResponse {
    fn from(result: CommandResult) -> Self {
        match result {
            Ok(ok) => Self {
                error: false,
                message: ok.info.unwrap_or_default(),
                data: ok.data,
                kind: None,
            },
            Err(e) => Self::failure(e),
        }
    }
}
