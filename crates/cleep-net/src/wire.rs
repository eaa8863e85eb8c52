//! Payloads of the request/response exchange between two nodes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sent to a peer right after the connection is established (HELLO) or to
/// deliver a unicast payload (WHISPER).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireRequest {
    Hello { headers: HashMap<String, String> },
    Whisper { payload: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireResponse {
    /// HELLO answered with our own headers.
    Hello { headers: HashMap<String, String> },
    Ack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tags() {
        let json = serde_json::to_value(WireRequest::Whisper {
            payload: "{}".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "whisper");

        let back: WireResponse = serde_json::from_str(r#"{"type":"ack"}"#).unwrap();
        assert_eq!(back, WireResponse::Ack);
    }
}
