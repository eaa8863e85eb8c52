//! Peer session tracking.
//!
//! A connection only becomes a peer once its HELLO headers are known. The
//! tracker remembers which connections have been announced so EXIT is only
//! reported for peers that did ENTER.

use std::collections::HashMap;

use libp2p::{Multiaddr, PeerId};
use tracing::debug;

use cleep_shared::PeerInfos;

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub address: Multiaddr,
    /// Unix epoch millis.
    pub connected_at: u64,
    /// Decoded HELLO headers, once received.
    pub infos: Option<PeerInfos>,
}

#[derive(Debug, Clone, Default)]
pub struct PeerTracker {
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&mut self, peer_id: PeerId, address: Multiaddr) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        debug!(peer = %peer_id, addr = %address, "Tracking new peer connection");
        self.peers.entry(peer_id).or_insert(PeerEntry {
            peer_id,
            address,
            connected_at: now,
            infos: None,
        });
    }

    /// Store HELLO headers. Returns true the first time, meaning the peer
    /// has just entered.
    pub fn on_hello(&mut self, peer_id: PeerId, infos: PeerInfos) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(entry) => {
                let first = entry.infos.is_none();
                entry.infos = Some(infos);
                first
            }
            None => false,
        }
    }

    /// Forget a peer. Returns true if it had been announced.
    pub fn on_disconnected(&mut self, peer_id: &PeerId) -> bool {
        match self.peers.remove(peer_id) {
            Some(entry) => {
                debug!(peer = %peer_id, "Removed peer from tracker");
                entry.infos.is_some()
            }
            None => false,
        }
    }

    pub fn is_announced(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .map(|e| e.infos.is_some())
            .unwrap_or(false)
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn address(&self, peer_id: &PeerId) -> Option<&Multiaddr> {
        self.peers.get(peer_id).map(|e| &e.address)
    }

    /// Resolve the bus ident of an announced peer.
    pub fn lookup(&self, ident: &str) -> Option<PeerId> {
        let peer_id: PeerId = ident.parse().ok()?;
        self.is_announced(&peer_id).then_some(peer_id)
    }

    /// Snapshot of announced peers with their headers.
    pub fn announced(&self) -> Vec<(PeerId, PeerInfos)> {
        self.peers
            .values()
            .filter_map(|e| e.infos.clone().map(|infos| (e.peer_id, infos)))
            .collect()
    }

    /// Drop every peer, returning those that had been announced.
    pub fn drain_announced(&mut self) -> Vec<PeerId> {
        self.peers
            .drain()
            .filter(|(_, e)| e.infos.is_some())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
