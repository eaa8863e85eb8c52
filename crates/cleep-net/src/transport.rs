use libp2p::identity::Keypair;
use tracing::info;

use crate::behaviour::CleepBehaviour;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub fn build_swarm(keypair: Keypair) -> anyhow::Result<libp2p::Swarm<CleepBehaviour>> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::Duration;

    use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
    use libp2p::request_response::{self, ProtocolSupport};
    use libp2p::{mdns, StreamProtocol, SwarmBuilder};

    use cleep_shared::constants::{
        EXCHANGE_PROTOCOL, EXCHANGE_TIMEOUT_SECS, GOSSIPSUB_HEARTBEAT_SECS, MAX_MESSAGE_SIZE,
    };

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> std::result::Result<CleepBehaviour, BoxError> {
            let local_peer_id = key.public().to_peer_id();

            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = DefaultHasher::new();
                message.data.hash(&mut hasher);
                if let Some(ref source) = message.source {
                    source.hash(&mut hasher);
                }
                if let Some(seq) = message.sequence_number {
                    seq.hash(&mut hasher);
                }
                MessageId::from(hasher.finish().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_MESSAGE_SIZE)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> BoxError { format!("GossipSub config: {e}").into() })?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| -> BoxError { format!("GossipSub init: {e}").into() })?;

            let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;

            let exchange = request_response::json::Behaviour::new(
                [(StreamProtocol::new(EXCHANGE_PROTOCOL), ProtocolSupport::Full)],
                request_response::Config::default()
                    .with_request_timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECS)),
            );

            Ok(CleepBehaviour {
                gossipsub,
                mdns,
                exchange,
            })
        })?
        // Presence is tied to the connection, QUIC keep-alives detect dead peers.
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(3600)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "Built Cleep bus swarm with QUIC transport");

    Ok(swarm)
}
