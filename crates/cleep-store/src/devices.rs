//! Persistence of the known device table.

use std::collections::BTreeMap;

use tracing::debug;

use cleep_shared::types::Peer;

use crate::config::ConfigStore;
use crate::error::Result;

impl ConfigStore {
    /// Devices as they should start a session: everything offline, other
    /// desktop instances dropped.
    pub fn load_devices(&self) -> Result<BTreeMap<String, Peer>> {
        self.read(|config| {
            config
                .devices
                .iter()
                .filter(|(_, peer)| !peer.cleepdesktop)
                .map(|(uuid, peer)| {
                    let mut peer = peer.clone();
                    peer.online = false;
                    if peer.uuid.is_empty() {
                        peer.uuid = uuid.clone();
                    }
                    (uuid.clone(), peer)
                })
                .collect()
        })
    }

    /// Replace the whole device table.
    pub fn save_devices(&self, devices: BTreeMap<String, Peer>) -> Result<()> {
        let count = devices.len();
        self.update(|config| config.devices = devices)?;
        debug!(count, "Device table persisted");
        Ok(())
    }
}
