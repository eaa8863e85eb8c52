//! Glue between the peer bus adapter and the rest of the application.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cleep_net::{spawn_bus, BusConfig, BusHandle, BusNotification};
use cleep_shared::constants::BUS_CHANNEL;
use cleep_shared::protocol::{ExternalCommand, ExternalEvent, ExternalMessage};
use cleep_shared::PeerInfos;

use crate::messagebus::{MessageRequest, Subscription};
use crate::state::AppContext;

/// Recipient name of the propagation task on the message bus.
pub const BRIDGE_RECIPIENT: &str = "peerbus";

/// Headers advertised to the devices.
pub fn local_headers(ctx: &AppContext) -> anyhow::Result<PeerInfos> {
    let uuid = ctx.config.read(|c| c.cleep.uuid.clone())?;
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.is_empty());

    Ok(PeerInfos {
        uuid: Some(uuid),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        hostname,
        cleepdesktop: true,
        ..PeerInfos::default()
    })
}

/// Start the peer bus with a fresh session identity.
pub fn start_bus(
    ctx: &AppContext,
) -> anyhow::Result<(BusHandle, mpsc::Receiver<BusNotification>)> {
    let config = BusConfig {
        channel: BUS_CHANNEL.to_string(),
        listen_port: ctx.options.bus_port(),
        headers: local_headers(ctx)?,
    };
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    Ok(spawn_bus(keypair, config))
}

/// Payload sent to the devices for a message bus request.
pub fn to_external(request: &MessageRequest, sender: &str) -> ExternalMessage {
    match &request.command {
        Some(command) => ExternalMessage::Command(ExternalCommand {
            command: command.clone(),
            params: request.params.clone(),
            to: request.to.clone(),
            sender: Some(sender.to_string()),
            broadcast: request.to.is_none(),
            peer_infos: None,
            command_uuid: Some(uuid::Uuid::new_v4().to_string()),
            timeout: request.timeout,
        }),
        None => ExternalMessage::Event(ExternalEvent {
            event: request.name().to_string(),
            params: request.params.clone(),
            device_id: request.device_id.clone(),
            sender: Some(sender.to_string()),
            peer_infos: None,
            command_uuid: None,
        }),
    }
}

/// Forward broadcast events flagged `propagate` to the devices.
pub fn spawn_propagation(
    mut subscription: Subscription,
    bus: BusHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            let request = &envelope.request;
            if request.is_command() || !request.propagate {
                continue;
            }
            debug!(event = request.name(), "Propagating event to devices");
            if let Err(e) = bus.broadcast(to_external(request, bus.ident())).await {
                warn!(event = request.name(), error = %e, "Event not propagated");
            }
        }
        info!("Propagation task stopped");
    })
}
