use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Map;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use cleep_shared::constants::{
    COMMAND_TIMEOUT_SECS, EVENT_APPLICATION_READY, RECIPIENT_IDLE_SECS, RECIPIENT_QUEUE_SIZE,
};
use cleep_shared::ErrorKind;

use super::router::CommandRouter;
use super::{MessageRequest, MessageResponse};

/// Interval between two reaper passes.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// A request sitting in a recipient queue.
#[derive(Debug)]
pub struct Envelope {
    pub request: MessageRequest,
    reply: Option<oneshot::Sender<MessageResponse>>,
}

impl Envelope {
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer the caller of a unicast command. No-op for broadcasts.
    pub fn respond(&mut self, response: MessageResponse) {
        if let Some(reply) = self.reply.take() {
            // The caller may have timed out already.
            let _ = reply.send(response);
        }
    }
}

/// Receiving side of a recipient queue.
pub struct Subscription {
    name: String,
    rx: mpsc::Receiver<Envelope>,
    activity: Arc<Mutex<Instant>>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await;
        touch(&self.activity);
        envelope
    }
}

struct Recipient {
    tx: mpsc::Sender<Envelope>,
    activity: Arc<Mutex<Instant>>,
}

impl Recipient {
    fn is_stale(&self, idle: Duration) -> bool {
        if self.tx.is_closed() {
            return true;
        }
        let pending = self.tx.capacity() < self.tx.max_capacity();
        pending && last_activity(&self.activity).elapsed() >= idle
    }
}

#[derive(Default)]
struct BusState {
    ready: bool,
    deferred: Vec<MessageRequest>,
    recipients: HashMap<String, Recipient>,
}

impl BusState {
    /// Deliver a broadcast to every recipient except its sender.
    fn deliver_broadcast(&mut self, request: &MessageRequest) {
        let sender = request.sender.as_deref().map(str::to_ascii_lowercase);
        let mut closed = Vec::new();

        for (name, recipient) in &self.recipients {
            if sender.as_deref() == Some(name.as_str()) {
                continue;
            }
            let envelope = Envelope {
                request: request.clone(),
                reply: None,
            };
            match recipient.tx.try_send(envelope) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(recipient = %name, message = request.name(), "Recipient queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(name.clone()),
            }
        }

        for name in closed {
            debug!(recipient = %name, "Recipient gone");
            self.recipients.remove(&name);
        }
    }
}

/// In-process request/response bus.
///
/// Until [`MessageBus::app_ready`] is called, unicast requests fail with
/// `bus_not_ready` and broadcasts are queued. The queue is flushed in
/// arrival order when the application becomes ready, right before the
/// ready event itself is broadcast.
#[derive(Clone)]
pub struct MessageBus {
    state: Arc<Mutex<BusState>>,
    command_timeout: Duration,
    idle_timeout: Duration,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_timeouts(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            Duration::from_secs(RECIPIENT_IDLE_SECS),
        )
    }

    pub fn with_timeouts(command_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            command_timeout,
            idle_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a recipient. An existing recipient with the same name is
    /// replaced.
    pub fn subscribe(&self, name: &str) -> Subscription {
        let name = name.to_ascii_lowercase();
        let (tx, rx) = mpsc::channel(RECIPIENT_QUEUE_SIZE);
        let activity = Arc::new(Mutex::new(Instant::now()));

        let previous = self.lock().recipients.insert(
            name.clone(),
            Recipient {
                tx,
                activity: activity.clone(),
            },
        );
        if previous.is_some() {
            warn!(recipient = %name, "Recipient subscribed twice, previous queue dropped");
        } else {
            debug!(recipient = %name, "Recipient subscribed");
        }

        Subscription { name, rx, activity }
    }

    pub fn unsubscribe(&self, name: &str) {
        self.lock().recipients.remove(&name.to_ascii_lowercase());
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.lock()
            .recipients
            .contains_key(&name.to_ascii_lowercase())
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Flush deferred broadcasts, broadcast the ready event and open the bus.
    pub fn app_ready(&self) {
        let mut state = self.lock();
        if state.ready {
            return;
        }

        let deferred = std::mem::take(&mut state.deferred);
        info!(deferred = deferred.len(), "Application ready, opening message bus");
        for request in &deferred {
            state.deliver_broadcast(request);
        }

        let ready = MessageRequest::event(EVENT_APPLICATION_READY, Map::new());
        state.deliver_broadcast(&ready);
        state.ready = true;
    }

    /// Post a request.
    ///
    /// Returns the recipient response for a unicast command, `None` for
    /// broadcasts and events.
    pub async fn push(&self, request: MessageRequest) -> Option<MessageResponse> {
        let Some(to) = request.to.as_deref().map(str::to_ascii_lowercase) else {
            let mut state = self.lock();
            if state.ready {
                trace!(message = request.name(), "Broadcast");
                state.deliver_broadcast(&request);
            } else {
                debug!(message = request.name(), "Bus not ready, broadcast deferred");
                state.deferred.push(request);
            }
            return None;
        };

        let is_command = request.is_command();
        let tx = {
            let state = self.lock();
            if !state.ready {
                debug!(to = %to, message = request.name(), "Bus not ready, unicast rejected");
                return is_command.then(|| {
                    MessageResponse::failure_kind(ErrorKind::BusNotReady, "Message bus is not ready")
                });
            }
            match state.recipients.get(&to) {
                Some(recipient) => recipient.tx.clone(),
                None => {
                    return is_command.then(|| {
                        MessageResponse::failure_kind(
                            ErrorKind::InvalidModule,
                            format!("Unknown recipient \"{to}\""),
                        )
                    });
                }
            }
        };

        if !is_command {
            let envelope = Envelope {
                request,
                reply: None,
            };
            if tx.try_send(envelope).is_err() {
                warn!(to = %to, "Event not delivered");
            }
            return None;
        }

        let timeout = request
            .timeout
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.command_timeout);
        let command = request.name().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            request,
            reply: Some(reply_tx),
        };

        let exchange = async move {
            tx.send(envelope).await.ok()?;
            reply_rx.await.ok()
        };
        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(Some(response)) => response,
            Ok(None) => MessageResponse::failure_kind(
                ErrorKind::NoResponse,
                format!("Recipient \"{to}\" dropped command \"{command}\""),
            ),
            Err(_) => {
                warn!(to = %to, command = %command, "No response");
                MessageResponse::failure_kind(
                    ErrorKind::NoResponse,
                    format!("No response from \"{to}\" to command \"{command}\""),
                )
            }
        };
        Some(response)
    }

    /// Unicast command helper.
    pub async fn command(
        &self,
        to: &str,
        command: &str,
        params: Map<String, serde_json::Value>,
        sender: &str,
    ) -> MessageResponse {
        let request = MessageRequest::command(command, params)
            .to(to)
            .from_sender(sender);
        match self.push(request).await {
            Some(response) => response,
            None => MessageResponse::failure_kind(ErrorKind::NoResponse, "No response"),
        }
    }

    /// Drop recipients whose queue is closed or left undrained for too long.
    pub fn reap(&self) -> Vec<String> {
        let idle = self.idle_timeout;
        let mut state = self.lock();
        let stale: Vec<String> = state
            .recipients
            .iter()
            .filter(|(_, r)| r.is_stale(idle))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            info!(recipient = %name, "Reaping idle recipient");
            state.recipients.remove(name);
        }
        stale
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                bus.reap();
            }
        })
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve the commands of `router` from `subscription` until the queue closes.
///
/// Each command runs on its own task so a slow handler does not hold the
/// queue. Events are ignored.
pub async fn serve(mut subscription: Subscription, router: CommandRouter) {
    let router = Arc::new(router);
    while let Some(mut envelope) = subscription.recv().await {
        if !envelope.request.is_command() {
            continue;
        }
        let router = router.clone();
        tokio::spawn(async move {
            let response = router.dispatch(&envelope.request).await;
            envelope.respond(response);
        });
    }
    debug!(recipient = %subscription.name(), "Recipient queue closed");
}

fn touch(activity: &Mutex<Instant>) {
    match activity.lock() {
        Ok(mut at) => *at = Instant::now(),
        Err(poisoned) => *poisoned.into_inner() = Instant::now(),
    }
}

fn last_activity(activity: &Mutex<Instant>) -> Instant {
    match activity.lock() {
        Ok(at) => *at,
        Err(poisoned) => *poisoned.into_inner(),
    }
}
