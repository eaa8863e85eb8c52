//! Bus orchestration with the tokio mpsc command/notification pattern.
//!
//! The swarm lives in a dedicated task and is the only owner of the
//! sockets. Callers talk to it through [`BusHandle`] and receive peer
//! lifecycle and payloads as [`BusNotification`]s, in the order the task
//! observed them.
//!
//! While the host has no route out the task pauses and retries with a
//! backoff. Every loss of network ends the current session, which reports
//! EXIT for each known peer, and a fresh session starts once the network
//! is back.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub, mdns,
    multiaddr::Protocol,
    request_response,
    swarm::{dial_opts::DialOpts, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use cleep_shared::constants::{
    BUS_CHANNEL, BUS_RETRY_MAX_SECS, BUS_RETRY_MIN_MS, DEFAULT_BUS_PORT, NETWORK_CHECK_SECS,
};
use cleep_shared::protocol::ExternalMessage;
use cleep_shared::{ErrorKind, PeerInfos};

use crate::behaviour::{CleepBehaviour, CleepEvent};
use crate::error::{BusError, Result};
use crate::interfaces::{has_default_route, local_lan_ip, local_macs};
use crate::peers::PeerTracker;
use crate::transport::build_swarm;
use crate::wire::{WireRequest, WireResponse};

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the bus task.
#[derive(Debug)]
pub enum BusCommand {
    /// SHOUT a message on the channel.
    Broadcast(ExternalMessage),
    /// WHISPER a message to one peer.
    SendTo {
        ident: String,
        message: ExternalMessage,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Snapshot of the announced peers, keyed by ident.
    GetPeers(oneshot::Sender<Vec<(String, PeerInfos)>>),
    /// Stop the task and release the sockets.
    Shutdown,
}

/// Notifications sent *from* the bus task.
#[derive(Debug, Clone)]
pub enum BusNotification {
    /// ENTER: a peer announced its headers.
    PeerConnected { ident: String, infos: PeerInfos },
    /// EXIT: an announced peer went away.
    PeerDisconnected { ident: String },
    /// SHOUT or WHISPER payload from an announced peer.
    MessageReceived {
        ident: String,
        message: ExternalMessage,
    },
    /// The default route appeared or disappeared.
    NetworkStatus { online: bool },
}

pub struct BusConfig {
    /// Channel joined at startup.
    pub channel: String,
    /// QUIC listen port, 0 for any.
    pub listen_port: u16,
    /// Headers advertised to peers. `macs` and `ip` are filled from the
    /// local interfaces at the start of every session.
    pub headers: PeerInfos,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: BUS_CHANNEL.to_string(),
            listen_port: DEFAULT_BUS_PORT,
            headers: PeerInfos::default(),
        }
    }
}

/// Cloneable sender side of the bus.
#[derive(Debug, Clone)]
pub struct BusHandle {
    ident: String,
    cmd_tx: mpsc::Sender<BusCommand>,
}

impl BusHandle {
    /// Our own ident on the bus.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub async fn broadcast(&self, message: ExternalMessage) -> Result<()> {
        self.cmd_tx
            .send(BusCommand::Broadcast(message))
            .await
            .map_err(|_| BusError::Stopped)
    }

    pub async fn send_to(&self, ident: &str, message: ExternalMessage) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCommand::SendTo {
                ident: ident.to_string(),
                message,
                reply,
            })
            .await
            .map_err(|_| BusError::Stopped)?;
        rx.await.map_err(|_| BusError::Stopped)?
    }

    pub async fn peers(&self) -> Result<Vec<(String, PeerInfos)>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCommand::GetPeers(reply))
            .await
            .map_err(|_| BusError::Stopped)?;
        rx.await.map_err(|_| BusError::Stopped)
    }

    /// Ask the task to stop. Stopping an already stopped bus is a no-op.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(BusCommand::Shutdown).await;
    }
}

/// Spawn the bus in a background tokio task.
///
/// The ident is derived from `keypair` and stays the same for the whole
/// lifetime of the task.
pub fn spawn_bus(
    keypair: libp2p::identity::Keypair,
    config: BusConfig,
) -> (BusHandle, mpsc::Receiver<BusNotification>) {
    let ident = keypair.public().to_peer_id().to_string();
    let (cmd_tx, cmd_rx) = mpsc::channel::<BusCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<BusNotification>(256);

    info!(ident = %ident, channel = %config.channel, "Starting bus");
    tokio::spawn(run_bus(keypair, config, cmd_rx, notif_tx));

    (BusHandle { ident, cmd_tx }, notif_rx)
}

fn backoff(duration: Duration) -> Duration {
    let max = Duration::from_secs(BUS_RETRY_MAX_SECS);
    if duration >= max {
        return max;
    }
    (duration * 2).min(max)
}

enum SessionEnd {
    Shutdown,
    NetworkLost,
}

async fn run_bus(
    keypair: libp2p::identity::Keypair,
    config: BusConfig,
    mut cmd_rx: mpsc::Receiver<BusCommand>,
    notif_tx: mpsc::Sender<BusNotification>,
) {
    let min_retry = Duration::from_millis(BUS_RETRY_MIN_MS);
    let mut retry = min_retry;
    let mut online: Option<bool> = None;

    loop {
        if !has_default_route() {
            if online != Some(false) {
                online = Some(false);
                warn!(kind = %ErrorKind::DeviceOffline, "No default route, bus paused");
                let _ = notif_tx
                    .send(BusNotification::NetworkStatus { online: false })
                    .await;
            }
            if wait_offline(&mut cmd_rx, retry).await {
                break;
            }
            retry = backoff(retry);
            continue;
        }

        retry = min_retry;
        if online != Some(true) {
            online = Some(true);
            info!("Network available, bus session starting");
            let _ = notif_tx
                .send(BusNotification::NetworkStatus { online: true })
                .await;
        }

        match run_session(keypair.clone(), &config, &mut cmd_rx, &notif_tx).await {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::NetworkLost) => {
                info!("Network lost, bus session ended");
            }
            Err(e) => {
                error!(error = %e, "Bus session failed");
                if wait_offline(&mut cmd_rx, retry).await {
                    break;
                }
                retry = backoff(retry);
            }
        }
    }

    info!("Bus event loop terminated");
}

/// Serve commands without a swarm for `delay`. Returns true on shutdown.
async fn wait_offline(cmd_rx: &mut mpsc::Receiver<BusCommand>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(BusCommand::Broadcast(message)) => {
                    debug!(name = message.name(), "Bus offline, broadcast dropped");
                }
                Some(BusCommand::SendTo { ident, reply, .. }) => {
                    debug!(ident = %ident, "Bus offline, whisper rejected");
                    let _ = reply.send(Err(BusError::Offline));
                }
                Some(BusCommand::GetPeers(reply)) => {
                    let _ = reply.send(Vec::new());
                }
                Some(BusCommand::Shutdown) | None => return true,
            }
        }
    }
}

async fn run_session(
    keypair: libp2p::identity::Keypair,
    config: &BusConfig,
    cmd_rx: &mut mpsc::Receiver<BusCommand>,
    notif_tx: &mpsc::Sender<BusNotification>,
) -> anyhow::Result<SessionEnd> {
    let mut swarm = build_swarm(keypair)?;

    let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port).parse()?;
    swarm.listen_on(listen_addr)?;

    let topic = gossipsub::IdentTopic::new(&config.channel);
    swarm.behaviour_mut().gossipsub.subscribe(&topic)?;

    let mut headers = config.headers.clone();
    headers.macs = local_macs();
    if headers.ip.is_none() {
        headers.ip = local_lan_ip().map(|ip| ip.to_string());
    }

    let mut session = Session {
        swarm,
        topic,
        headers: headers.to_headers(),
        tracker: PeerTracker::new(),
        notif_tx: notif_tx.clone(),
    };

    let mut network_check = tokio::time::interval(Duration::from_secs(NETWORK_CHECK_SECS));
    network_check.tick().await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(BusCommand::Shutdown) => {
                        info!("Bus shutdown requested");
                        return Ok(SessionEnd::Shutdown);
                    }
                    None => {
                        info!("Command channel closed, shutting down bus");
                        return Ok(SessionEnd::Shutdown);
                    }
                    Some(cmd) => session.handle_command(cmd),
                }
            }

            _ = network_check.tick() => {
                if !has_default_route() {
                    session.exit_all().await;
                    return Ok(SessionEnd::NetworkLost);
                }
            }

            event = session.swarm.select_next_some() => session.handle_event(event).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    swarm: Swarm<CleepBehaviour>,
    topic: gossipsub::IdentTopic,
    headers: HashMap<String, String>,
    tracker: PeerTracker,
    notif_tx: mpsc::Sender<BusNotification>,
}

impl Session {
    async fn notify(&mut self, notification: BusNotification) {
        let _ = self.notif_tx.send(notification).await;
    }

    async fn exit_all(&mut self) {
        for peer_id in self.tracker.drain_announced() {
            self.notify(BusNotification::PeerDisconnected {
                ident: peer_id.to_string(),
            })
            .await;
        }
    }

    fn handle_command(&mut self, cmd: BusCommand) {
        match cmd {
            BusCommand::Broadcast(message) => {
                let data = match message.to_json() {
                    Ok(json) => json.into_bytes(),
                    Err(e) => {
                        error!(error = %e, "Unable to encode broadcast");
                        return;
                    }
                };
                match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.topic.clone(), data)
                {
                    Ok(_) => debug!(name = message.name(), "Shout published"),
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        debug!(name = message.name(), "No peer to shout to");
                    }
                    Err(e) => error!(error = %e, "Publish failed"),
                }
            }
            BusCommand::SendTo {
                ident,
                message,
                reply,
            } => {
                let result = match self.tracker.lookup(&ident) {
                    Some(peer_id) => message.to_json().map_err(BusError::from).map(|payload| {
                        self.swarm
                            .behaviour_mut()
                            .exchange
                            .send_request(&peer_id, WireRequest::Whisper { payload });
                        debug!(peer = %peer_id, name = message.name(), "Whisper sent");
                    }),
                    None => Err(BusError::UnknownPeer(ident)),
                };
                let _ = reply.send(result);
            }
            BusCommand::GetPeers(reply) => {
                let peers = self
                    .tracker
                    .announced()
                    .into_iter()
                    .map(|(peer_id, infos)| (peer_id.to_string(), infos))
                    .collect();
                let _ = reply.send(peers);
            }
            BusCommand::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<CleepEvent>) {
        match event {
            SwarmEvent::Behaviour(CleepEvent::Mdns(mdns::Event::Discovered(list))) => {
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in list {
                    by_peer.entry(peer_id).or_default().push(addr);
                }
                for (peer_id, addresses) in by_peer {
                    if self.swarm.is_connected(&peer_id) {
                        continue;
                    }
                    debug!(peer = %peer_id, "mDNS discovered peer, dialing");
                    let opts = DialOpts::peer_id(peer_id).addresses(addresses).build();
                    if let Err(e) = self.swarm.dial(opts) {
                        warn!(peer = %peer_id, error = %e, "Dial failed");
                    }
                }
            }

            SwarmEvent::Behaviour(CleepEvent::Mdns(mdns::Event::Expired(list))) => {
                for (peer_id, addr) in list {
                    trace!(peer = %peer_id, addr = %addr, "mDNS record expired");
                }
            }

            SwarmEvent::Behaviour(CleepEvent::Gossipsub(gossipsub::Event::Message {
                message, ..
            })) => {
                let Some(source) = message.source else {
                    return;
                };
                if !self.tracker.is_announced(&source) {
                    debug!(peer = %source, "Shout from unannounced peer dropped");
                    return;
                }
                self.deliver(source, &message.data).await;
            }

            SwarmEvent::Behaviour(CleepEvent::Exchange(request_response::Event::Message {
                peer,
                message,
            })) => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let response = match request {
                        WireRequest::Hello { headers } => {
                            self.on_hello(peer, headers).await;
                            WireResponse::Hello {
                                headers: self.headers.clone(),
                            }
                        }
                        WireRequest::Whisper { payload } => {
                            if self.tracker.is_announced(&peer) {
                                self.deliver(peer, payload.as_bytes()).await;
                            } else {
                                debug!(peer = %peer, "Whisper from unannounced peer dropped");
                            }
                            WireResponse::Ack
                        }
                    };
                    if self
                        .swarm
                        .behaviour_mut()
                        .exchange
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!(peer = %peer, "Response channel closed");
                    }
                }
                request_response::Message::Response { response, .. } => match response {
                    WireResponse::Hello { headers } => self.on_hello(peer, headers).await,
                    WireResponse::Ack => trace!(peer = %peer, "Whisper acknowledged"),
                },
            },

            SwarmEvent::Behaviour(CleepEvent::Exchange(
                request_response::Event::OutboundFailure { peer, error, .. },
            )) => {
                warn!(peer = %peer, error = %error, "Outbound exchange failed");
            }

            SwarmEvent::Behaviour(CleepEvent::Exchange(
                request_response::Event::InboundFailure { peer, error, .. },
            )) => {
                warn!(peer = %peer, error = %error, "Inbound exchange failed");
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                let addr = endpoint.get_remote_address().clone();
                self.tracker.on_connected(peer_id, addr.clone());
                if num_established.get() == 1 {
                    debug!(peer = %peer_id, addr = %addr, "Connected, sending hello");
                    self.swarm.behaviour_mut().exchange.send_request(
                        &peer_id,
                        WireRequest::Hello {
                            headers: self.headers.clone(),
                        },
                    );
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 && self.tracker.on_disconnected(&peer_id) {
                    info!(peer = %peer_id, "Peer exited");
                    self.notify(BusNotification::PeerDisconnected {
                        ident: peer_id.to_string(),
                    })
                    .await;
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening on new address");
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
            }

            SwarmEvent::IncomingConnectionError { error, .. } => {
                warn!(error = %error, "Incoming connection error");
            }

            _ => {}
        }
    }

    async fn on_hello(&mut self, peer_id: PeerId, headers: HashMap<String, String>) {
        let mut infos = match PeerInfos::from_headers(&headers) {
            Ok(infos) => infos,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Invalid peer headers");
                return;
            }
        };
        if infos.ip.is_none() {
            infos.ip = self.remote_ip(&peer_id);
        }
        if self.tracker.on_hello(peer_id, infos.clone()) {
            info!(peer = %peer_id, hostname = ?infos.hostname, "Peer entered");
            self.notify(BusNotification::PeerConnected {
                ident: peer_id.to_string(),
                infos,
            })
            .await;
        }
    }

    fn remote_ip(&self, peer_id: &PeerId) -> Option<String> {
        self.tracker
            .address(peer_id)
            .and_then(ip_of)
            .map(|ip| ip.to_string())
    }

    async fn deliver(&mut self, peer_id: PeerId, data: &[u8]) {
        let decoded = std::str::from_utf8(data)
            .map_err(|e| e.to_string())
            .and_then(|text| ExternalMessage::from_json(text).map_err(|e| e.to_string()));
        match decoded {
            Ok(message) => {
                self.notify(BusNotification::MessageReceived {
                    ident: peer_id.to_string(),
                    message,
                })
                .await;
            }
            Err(e) => warn!(peer = %peer_id, error = %e, "Undecodable bus payload"),
        }
    }
}

/// IP part of a multiaddr, if any.
fn ip_of(addr: &Multiaddr) -> Option<std::net::IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(ip.into()),
        Protocol::Ip6(ip) => Some(ip.into()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let mut d = Duration::from_millis(BUS_RETRY_MIN_MS);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(d.as_millis());
            d = backoff(d);
        }
        assert_eq!(seen, vec![500, 1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn test_ip_of_multiaddr() {
        let addr: Multiaddr = "/ip4/192.168.1.7/udp/5670/quic-v1".parse().unwrap();
        assert_eq!(ip_of(&addr), Some("192.168.1.7".parse().unwrap()));
        let addr: Multiaddr = "/dns4/example.com/udp/5670/quic-v1".parse().unwrap();
        assert_eq!(ip_of(&addr), None);
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        let expected = keypair.public().to_peer_id().to_string();
        let (handle, mut notif_rx) = spawn_bus(
            keypair,
            BusConfig {
                listen_port: 0,
                ..BusConfig::default()
            },
        );
        assert_eq!(handle.ident(), expected);

        assert!(handle.peers().await.unwrap().is_empty());
        handle.shutdown().await;

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while notif_rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());

        let err = handle.peers().await.unwrap_err();
        assert!(matches!(err, BusError::Stopped));
    }

    #[tokio::test]
    async fn test_whisper_to_unknown_peer() {
        let (handle, _notif_rx) = spawn_bus(
            libp2p::identity::Keypair::generate_ed25519(),
            BusConfig {
                listen_port: 0,
                ..BusConfig::default()
            },
        );
        let message = ExternalMessage::from_json(r#"{"event":"x.y","params":{}}"#).unwrap();
        let err = handle.send_to("nobody", message).await.unwrap_err();
        // offline hosts reject every whisper, online ones do not know the ident
        assert!(matches!(err, BusError::UnknownPeer(_) | BusError::Offline));
        handle.shutdown().await;
    }
}
