//! Device registry.
//!
//! Folds peer bus notifications into the persisted device table. The table
//! is owned by a single task; readers go through [`DevicesHandle`] and get
//! snapshot copies.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use cleep_net::BusNotification;
use cleep_shared::protocol::ExternalMessage;
use cleep_shared::types::{DevicesSnapshot, Peer};
use cleep_shared::PeerInfos;

use crate::events::UiTopic;
use crate::messagebus::{MessageBus, MessageRequest};
use crate::state::AppContext;

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Known devices keyed by uuid, plus the ident of the current session.
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: BTreeMap<String, Peer>,
    idents: HashMap<String, String>,
}

impl DeviceTable {
    pub fn new(devices: BTreeMap<String, Peer>) -> Self {
        Self {
            devices,
            idents: HashMap::new(),
        }
    }

    pub fn devices(&self) -> &BTreeMap<String, Peer> {
        &self.devices
    }

    pub fn uuid_of(&self, ident: &str) -> Option<&str> {
        self.idents.get(ident).map(String::as_str)
    }

    pub fn ident_of(&self, uuid: &str) -> Option<&str> {
        self.devices
            .get(uuid)
            .filter(|peer| peer.online && !peer.ident.is_empty())
            .map(|peer| peer.ident.as_str())
    }

    /// ENTER. Returns whether the table changed.
    pub fn on_enter(&mut self, ident: &str, infos: &PeerInfos, now: i64) -> bool {
        if infos.cleepdesktop {
            debug!(ident, "Ignoring other desktop instance");
            return false;
        }
        let Some(uuid) = infos.uuid.as_deref().filter(|u| !u.is_empty()) else {
            warn!(ident, "Peer announced without uuid, ignored");
            return false;
        };

        let replaced: Vec<String> = self
            .devices
            .iter()
            .filter(|(key, peer)| key.as_str() != uuid && peer.shares_mac(&infos.macs))
            .map(|(key, _)| key.clone())
            .collect();
        for old in replaced {
            info!(old = %old, new = %uuid, "Device reinstalled, replacing previous entry");
            self.devices.remove(&old);
            self.idents.retain(|_, u| *u != old);
        }
        // A previous session of the same device must not outlive this one.
        self.idents.retain(|_, u| u.as_str() != uuid);

        let mut peer = Peer::from_infos(ident, infos);
        peer.online = true;
        peer.extra.connectedat = Some(now);
        peer.extra.configured = peer.is_configured();

        info!(uuid, ident, hostname = ?peer.hostname, "Device online");
        self.idents.insert(ident.to_string(), uuid.to_string());
        self.devices.insert(uuid.to_string(), peer);
        true
    }

    /// EXIT. The entry is kept offline.
    pub fn on_exit(&mut self, ident: &str) -> bool {
        let Some(uuid) = self.idents.remove(ident) else {
            return false;
        };
        match self.devices.get_mut(&uuid) {
            Some(peer) if peer.online => {
                info!(uuid = %uuid, ident, "Device offline");
                peer.online = false;
                true
            }
            _ => false,
        }
    }

    /// Network loss: every device goes offline.
    pub fn all_offline(&mut self) -> bool {
        self.idents.clear();
        let mut changed = false;
        for peer in self.devices.values_mut().filter(|p| p.online) {
            peer.online = false;
            changed = true;
        }
        changed
    }

    pub fn delete(&mut self, uuid: &str) -> bool {
        let removed = self.devices.remove(uuid).is_some();
        if removed {
            self.idents.retain(|_, u| u.as_str() != uuid);
            info!(uuid, "Device deleted");
        }
        removed
    }

    pub fn snapshot(&self) -> DevicesSnapshot {
        let devices: Vec<Peer> = self.devices.values().cloned().collect();
        DevicesSnapshot {
            unconfigured: devices.iter().filter(|p| !p.extra.configured).count(),
            devices,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry task
// ---------------------------------------------------------------------------

enum RegistryCommand {
    Snapshot(oneshot::Sender<DevicesSnapshot>),
    Delete {
        uuid: String,
        reply: oneshot::Sender<bool>,
    },
    IdentOf {
        uuid: String,
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Cloneable access to the registry task.
#[derive(Clone)]
pub struct DevicesHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl DevicesHandle {
    pub async fn snapshot(&self) -> DevicesSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryCommand::Snapshot(reply)).await.is_err() {
            return DevicesSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Remove a device. Returns false for an unknown uuid.
    pub async fn delete(&self, uuid: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = RegistryCommand::Delete {
            uuid: uuid.to_string(),
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Bus ident of an online device.
    pub async fn ident_of(&self, uuid: &str) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        let command = RegistryCommand::IdentOf {
            uuid: uuid.to_string(),
            reply,
        };
        self.tx.send(command).await.ok()?;
        rx.await.ok().flatten()
    }
}

struct Registry {
    ctx: Arc<AppContext>,
    messages: MessageBus,
    table: DeviceTable,
}

impl Registry {
    /// Persist, then push the new snapshot.
    fn commit(&self) {
        if let Err(e) = self.ctx.config.save_devices(self.table.devices().clone()) {
            warn!(error = %e, "Failed to persist devices");
            self.ctx.report("devices.persist", &e);
        }
        self.ctx.ui.push(UiTopic::Devices, self.table.snapshot());
    }

    async fn on_notification(&mut self, notification: BusNotification) {
        match notification {
            BusNotification::PeerConnected { ident, infos } => {
                if self.table.on_enter(&ident, &infos, chrono::Utc::now().timestamp()) {
                    self.commit();
                }
            }
            BusNotification::PeerDisconnected { ident } => {
                if self.table.on_exit(&ident) {
                    self.commit();
                }
            }
            BusNotification::MessageReceived { ident, message } => {
                self.on_message(&ident, message).await;
            }
            BusNotification::NetworkStatus { online } => {
                self.ctx.ui.push(UiTopic::Network, json!({ "online": online }));
                if !online && self.table.all_offline() {
                    self.commit();
                }
            }
        }
    }

    async fn on_message(&mut self, ident: &str, message: ExternalMessage) {
        let device_id = self.table.uuid_of(ident).map(str::to_string);
        debug!(ident, device = ?device_id, message = message.name(), "Device message");

        self.ctx.ui.push(
            UiTopic::Monitoring,
            json!({
                "timestamp": chrono::Utc::now().timestamp(),
                "device_id": device_id,
                "message": message,
            }),
        );

        if let ExternalMessage::Event(event) = message {
            let mut request = MessageRequest::event(&event.event, event.params);
            request.device_id = device_id.or(event.device_id);
            request.sender = Some("devices".to_string());
            self.messages.push(request).await;
        }
    }

    fn on_command(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Snapshot(reply) => {
                let _ = reply.send(self.table.snapshot());
            }
            RegistryCommand::Delete { uuid, reply } => {
                let removed = self.table.delete(&uuid);
                if removed {
                    self.commit();
                }
                let _ = reply.send(removed);
            }
            RegistryCommand::IdentOf { uuid, reply } => {
                let _ = reply.send(self.table.ident_of(&uuid).map(str::to_string));
            }
        }
    }
}

/// Load the persisted table and spawn the registry task.
pub fn spawn_registry(
    ctx: Arc<AppContext>,
    messages: MessageBus,
    mut notifications: mpsc::Receiver<BusNotification>,
) -> anyhow::Result<DevicesHandle> {
    let table = DeviceTable::new(ctx.config.load_devices()?);
    info!(devices = table.devices().len(), "Device registry loaded");

    let (tx, mut rx) = mpsc::channel(32);
    let mut registry = Registry {
        ctx,
        messages,
        table,
    };
    registry
        .ctx
        .ui
        .push(UiTopic::Devices, registry.table.snapshot());

    tokio::spawn(async move {
        let mut bus_open = true;
        loop {
            tokio::select! {
                notification = notifications.recv(), if bus_open => match notification {
                    Some(n) => registry.on_notification(n).await,
                    None => {
                        info!("Bus notifications closed, serving the persisted table only");
                        bus_open = false;
                    }
                },
                command = rx.recv() => match command {
                    Some(command) => registry.on_command(command),
                    None => break,
                },
            }
        }
        debug!("Device registry stopped");
    });

    Ok(DevicesHandle { tx })
}
