// LAN presence bus built on libp2p with QUIC transport.

pub mod behaviour;
pub mod bus;
pub mod interfaces;
pub mod peers;
pub mod transport;
pub mod wire;

mod error;

pub use behaviour::{CleepBehaviour, CleepEvent};
pub use bus::{spawn_bus, BusCommand, BusConfig, BusHandle, BusNotification};
pub use error::{BusError, Result};
pub use interfaces::{has_default_route, local_macs};
pub use peers::{PeerEntry, PeerTracker};
pub use transport::build_swarm;
pub use wire::{WireRequest, WireResponse};
