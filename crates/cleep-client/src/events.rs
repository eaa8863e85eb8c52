//! UI push channel.
//!
//! One coalescing slot per topic: the transport only ever sees the latest
//! snapshot of a topic. Taps receive every push in order and are used for
//! logging and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiTopic {
    Devices,
    Install,
    Updates,
    Monitoring,
    Message,
    Network,
}

impl UiTopic {
    pub const ALL: [UiTopic; 6] = [
        UiTopic::Devices,
        UiTopic::Install,
        UiTopic::Updates,
        UiTopic::Monitoring,
        UiTopic::Message,
        UiTopic::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Devices => "devices",
            Self::Install => "install",
            Self::Updates => "updates",
            Self::Monitoring => "monitoring",
            Self::Message => "message",
            Self::Network => "network",
        }
    }
}

type Tap = mpsc::UnboundedSender<(UiTopic, Value)>;

#[derive(Clone)]
pub struct UiPush {
    slots: Arc<HashMap<UiTopic, watch::Sender<Option<Value>>>>,
    taps: Arc<Mutex<Vec<Tap>>>,
}

impl UiPush {
    pub fn new() -> Self {
        let slots = UiTopic::ALL
            .iter()
            .map(|topic| (*topic, watch::channel(None).0))
            .collect();
        Self {
            slots: Arc::new(slots),
            taps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replace the snapshot of `topic`.
    pub fn push<S: Serialize>(&self, topic: UiTopic, payload: S) {
        let value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(topic = topic.as_str(), error = %e, "Failed to serialize UI push");
                return;
            }
        };
        tracing::trace!(topic = topic.as_str(), "UI push");

        if let Ok(mut taps) = self.taps.lock() {
            taps.retain(|tap| tap.send((topic, value.clone())).is_ok());
        }
        if let Some(slot) = self.slots.get(&topic) {
            slot.send_replace(Some(value));
        }
    }

    /// Latest snapshot of `topic`, if any was pushed.
    pub fn latest(&self, topic: UiTopic) -> Option<Value> {
        self.slots.get(&topic).and_then(|slot| slot.borrow().clone())
    }

    /// Watch `topic`. A late subscriber immediately sees the latest snapshot.
    pub fn subscribe(&self, topic: UiTopic) -> watch::Receiver<Option<Value>> {
        match self.slots.get(&topic) {
            Some(slot) => slot.subscribe(),
            None => watch::channel(None).1,
        }
    }

    /// Receive every push from now on, in order.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<(UiTopic, Value)> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut taps) = self.taps.lock() {
            taps.push(tx);
        }
        rx
    }
}

impl Default for UiPush {
    fn default() -> Self {
        Self::new()
    }
}
