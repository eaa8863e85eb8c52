//! Composed libp2p `NetworkBehaviour` for the Cleep bus.
//!
//! Combines mDNS (LAN discovery), GossipSub (SHOUT on the channel topic)
//! and a JSON request/response protocol (HELLO headers and WHISPER).

use libp2p::{gossipsub, mdns, request_response, swarm::NetworkBehaviour};

use crate::wire::{WireRequest, WireResponse};

/// All sub-behaviours are driven by the single bus event loop.
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "CleepEvent")]
pub struct CleepBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub exchange: request_response::json::Behaviour<WireRequest, WireResponse>,
}

#[derive(Debug)]
pub enum CleepEvent {
    Gossipsub(gossipsub::Event),
    Mdns(mdns::Event),
    Exchange(request_response::Event<WireRequest, WireResponse>),
}

impl From<gossipsub::Event> for CleepEvent {
    fn from(event: gossipsub::Event) -> Self {
        CleepEvent::Gossipsub(event)
    }
}

impl From<mdns::Event> for CleepEvent {
    fn from(event: mdns::Event) -> Self {
        CleepEvent::Mdns(event)
    }
}

impl From<request_response::Event<WireRequest, WireResponse>> for CleepEvent {
    fn from(event: request_response::Event<WireRequest, WireResponse>) -> Self {
        CleepEvent::Exchange(event)
    }
}
