//! Lifecycle of the single push connection.

use super::protocol::{parse_message, register_message};
use super::transport::{Channel, Connector};
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::types::Identity;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnection schedule: linear growth, capped, bounded attempt count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

/// State of the push connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
}

/// Counters for the push connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub opened: u64,
    pub received: u64,
    pub malformed: u64,
}

struct Shared {
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    gave_up: AtomicBool,
    opened: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
}

struct Running {
    identity: Identity,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Owns the push connection: registration, decoding and reconnection.
///
/// Decoded messages are published on the [`EventBus`]. After
/// `max_attempts` consecutive failed reconnects the manager gives up and
/// stays `Disconnected` until `connect` is called again.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, bus: Arc<EventBus>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                bus,
                policy,
                state,
                gave_up: AtomicBool::new(false),
                opened: AtomicU64::new(0),
                received: AtomicU64::new(0),
                malformed: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether reconnection was abandoned after exhausting its attempts.
    pub fn gave_up(&self) -> bool {
        self.shared.gave_up.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            opened: self.shared.opened.load(Ordering::Relaxed),
            received: self.shared.received.load(Ordering::Relaxed),
            malformed: self.shared.malformed.load(Ordering::Relaxed),
        }
    }

    /// Open the connection for `identity`.
    ///
    /// A no-op while a connection (or its reconnect loop) for the same
    /// identity is alive. Must be called from within a tokio runtime.
    pub fn connect(&self, identity: Identity) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let mut running = self.running.lock();
        if let Some(ref current) = *running {
            if !current.task.is_finished() && current.identity == identity {
                debug!("connection already active");
                return Ok(());
            }
            current.task.abort();
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.shared.gave_up.store(false, Ordering::SeqCst);
        let task = runtime.spawn(run(self.shared.clone(), identity.clone(), outbound_rx));
        *running = Some(Running {
            identity,
            outbound,
            task,
        });
        Ok(())
    }

    /// Queue a text message. Fails unless the connection is open.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let running = self.running.lock();
        let current = running.as_ref().ok_or(SyncError::NotConnected)?;
        current
            .outbound
            .send(text.into())
            .map_err(|_| SyncError::NotConnected)
    }

    /// Serialize `message` as JSON and send it.
    pub fn send_json(&self, message: &impl serde::Serialize) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.send(text)
    }

    /// Close the connection and cancel any pending reconnect.
    pub fn disconnect(&self) {
        if let Some(current) = self.running.lock().take() {
            current.task.abort();
            info!("push connection closed by client");
        }
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(current) = self.running.get_mut().take() {
            current.task.abort();
        }
    }
}

/// How a pumped connection ended.
enum Closed {
    /// Remote close or transport failure; reconnect.
    Dropped,
    /// The manager released the outbound queue.
    Released,
}

async fn run(
    shared: Arc<Shared>,
    identity: Identity,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let mut attempt: u32 = 0;
    loop {
        shared.state.send_replace(ConnectionState::Connecting);

        match shared.connector.connect().await {
            Ok(mut channel) => {
                attempt = 0;
                shared.opened.fetch_add(1, Ordering::Relaxed);
                match register_message(&identity) {
                    Ok(text) => {
                        if let Err(e) = channel.send(text).await {
                            warn!(error = %e, "failed to send registration");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode registration"),
                }
                shared.state.send_replace(ConnectionState::Connected);
                info!(user = %identity.id, "push connection open");

                match pump(&shared, channel.as_mut(), &mut outbound).await {
                    Closed::Released => {
                        channel.close().await;
                        shared.state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    Closed::Dropped => info!("push connection lost"),
                }
            }
            Err(e) => warn!(attempt, error = %e, "push connection failed"),
        }

        attempt += 1;
        if attempt > shared.policy.max_attempts {
            shared.gave_up.store(true, Ordering::SeqCst);
            shared.state.send_replace(ConnectionState::Disconnected);
            info!(
                attempts = shared.policy.max_attempts,
                "giving up on push connection; relying on polling"
            );
            return;
        }

        let delay = shared.policy.delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        shared
            .state
            .send_replace(ConnectionState::Reconnecting { attempt, delay });
        tokio::time::sleep(delay).await;
    }
}

async fn pump(
    shared: &Shared,
    channel: &mut dyn Channel,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> Closed {
    loop {
        tokio::select! {
            inbound = channel.recv() => match inbound {
                Some(Ok(text)) => dispatch(shared, &text),
                Some(Err(SyncError::MalformedMessage(reason))) => {
                    shared.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(reason = %reason, "dropping undecodable frame");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "push connection error");
                    return Closed::Dropped;
                }
                None => return Closed::Dropped,
            },
            message = outbound.recv() => match message {
                Some(text) => {
                    if let Err(e) = channel.send(text).await {
                        warn!(error = %e, "send failed");
                        return Closed::Dropped;
                    }
                }
                None => return Closed::Released,
            },
        }
    }
}

fn dispatch(shared: &Shared, text: &str) {
    shared.received.fetch_add(1, Ordering::Relaxed);
    match parse_message(text) {
        Ok(event) => {
            debug!(kind = %event.kind, "push received");
            shared.bus.publish(event);
        }
        Err(e) => {
            shared.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "dropping malformed push message");
        }
    }
}
