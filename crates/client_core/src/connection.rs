//! Session lifecycle for the machine's event channel.
//!
//! One [`ConnectionManager`] owns at most one live transport. A supervisor
//! task pumps inbound frames into the [`ListenerRegistry`] and, when the
//! transport drops, retries according to the [`ReconnectPolicy`]. Every
//! transport opened by the supervisor delivers into the same registry, so
//! consumer subscriptions survive reconnects untouched.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;
use shared::{
    error::ProtocolError,
    protocol::{decode_server_event, ClientMessage, EventKind, Ping},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    error::{ConnectionError, TransportError},
    registry::ListenerRegistry,
    transport::{Transport, TransportLink},
};

pub const DEFAULT_RECONNECTION_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Automatic retry in progress; `attempt` is 1-based.
    Reconnecting { attempt: u32 },
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// `delay * 2^(attempt - 1)`, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECTION_ATTEMPTS, DEFAULT_RECONNECTION_DELAY)
    }
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Exponential { max_delay },
        }
    }

    pub fn disabled() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Delay before the 1-based `attempt`, or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let delay = match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.delay.saturating_mul(factor).min(max_delay)
            }
        };
        Some(delay)
    }
}

struct Shared {
    url: Url,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    registry: ListenerRegistry,
    state: watch::Sender<ConnectionState>,
    last_error: watch::Sender<Option<ConnectionError>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    /// Bumped on every explicit connect/disconnect; a supervisor whose
    /// generation is stale must not publish state.
    generation: AtomicU64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new generation and drops the live outbound sender.
    ///
    /// Bumping under the outbound lock orders it against [`Shared::publish`]:
    /// a supervisor either publishes before the bump or not at all.
    fn advance(&self) -> u64 {
        let mut outbound = self.outbound();
        outbound.take();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Runs `update` only while `generation` is current.
    fn publish(
        &self,
        generation: u64,
        update: impl FnOnce(&mut Option<mpsc::Sender<String>>),
    ) -> bool {
        let mut outbound = self.outbound();
        if !self.is_current(generation) {
            return false;
        }
        update(&mut *outbound);
        true
    }

    fn attach(&self, generation: u64, link: &TransportLink) -> bool {
        let attached = self.publish(generation, |outbound| {
            *outbound = Some(link.outbound.clone());
            self.last_error.send_replace(None);
            self.state.send_replace(ConnectionState::Connected);
        });
        if attached {
            info!(
                url = %self.url,
                events = ?EventKind::STATUS.map(EventKind::as_str),
                listeners = ?self.registry,
                "event channel attached to listener registry"
            );
        }
        attached
    }

    fn detach(&self, generation: u64) -> bool {
        self.publish(generation, |outbound| {
            outbound.take();
        })
    }

    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        self.publish(generation, |_| {
            self.state.send_replace(state);
        })
    }

    fn report(&self, generation: u64, error: ConnectionError) -> bool {
        self.publish(generation, |_| {
            self.last_error.send_replace(Some(error));
        })
    }

    fn deliver(&self, frame: &str) {
        match decode_server_event(frame) {
            Ok(event) => {
                let report = self.registry.dispatch(&event);
                debug!(
                    event = %event.kind(),
                    delivered = report.delivered,
                    failed = report.failed,
                    "event dispatched"
                );
            }
            Err(ProtocolError::UnknownEvent(name)) => {
                debug!(event = %name, "ignoring event with no protocol mapping");
            }
            Err(err) => warn!(error = %err, "dropping malformed frame"),
        }
    }
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        url: Url,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        registry: ListenerRegistry,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (last_error, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                url,
                transport,
                policy,
                registry,
                state,
                last_error,
                outbound: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.shared.policy
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.shared.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.shared.last_error.borrow().clone()
    }

    pub fn watch_errors(&self) -> watch::Receiver<Option<ConnectionError>> {
        self.shared.last_error.subscribe()
    }

    /// Replaces any existing transport with a fresh one.
    ///
    /// Resolves on the first handshake outcome. A failed first handshake is
    /// returned to the caller while retries continue in the background
    /// within the policy's budget. The handshake runs on the supervisor
    /// task, so a concurrent [`ConnectionManager::disconnect`] cancels it
    /// and this call returns [`ConnectionError::Cancelled`].
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut supervisor = self.lock_supervisor();
            let generation = self.teardown(&mut supervisor);
            self.shared
                .set_state(generation, ConnectionState::Connecting);
            info!(url = %self.shared.url, "connecting to machine event channel");
            *supervisor = Some(tokio::spawn(run_session(
                Arc::clone(&self.shared),
                generation,
                first_tx,
            )));
        }
        first_rx.await.unwrap_or(Err(ConnectionError::Cancelled))
    }

    /// Tears down the transport and stops any retry loop or pending
    /// handshake. Safe to call in any state.
    pub async fn disconnect(&self) {
        let mut supervisor = self.lock_supervisor();
        let generation = self.teardown(&mut supervisor);
        self.shared
            .set_state(generation, ConnectionState::Disconnected);
        info!(url = %self.shared.url, "machine event channel disconnected");
    }

    fn lock_supervisor(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self, supervisor: &mut Option<JoinHandle<()>>) -> u64 {
        let generation = self.shared.advance();
        if let Some(task) = supervisor.take() {
            task.abort();
        }
        generation
    }

    /// Sends a client message over the live transport.
    pub fn emit(&self, message: &ClientMessage) -> Result<(), ConnectionError> {
        let guard = self.shared.outbound();
        let Some(outbound) = guard.as_ref() else {
            warn!(event = message.name(), "event channel is not connected; message dropped");
            return Err(ConnectionError::NotConnected);
        };
        let text =
            serde_json::to_string(message).map_err(|err| ConnectionError::Encode(err.to_string()))?;
        outbound.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnectionError::OutboundQueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::NotConnected,
        })?;
        debug!(event = message.name(), "client message sent");
        Ok(())
    }

    /// Liveness check; the controller may answer with `pong_client`.
    pub fn ping_server(&self) -> Result<(), ConnectionError> {
        self.emit(&ClientMessage::PingServer(Ping { time: Utc::now() }))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let supervisor = self
            .supervisor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = supervisor.take() {
            task.abort();
        }
    }
}

/// First handshake of a session, then [`supervise`]. The handshake outcome
/// goes back to the caller of `connect` once state and last error reflect it.
async fn run_session(
    shared: Arc<Shared>,
    generation: u64,
    first: oneshot::Sender<Result<(), ConnectionError>>,
) {
    match shared.transport.open(&shared.url).await {
        Ok(link) => {
            if !shared.attach(generation, &link) {
                let _ = first.send(Err(ConnectionError::Cancelled));
                return;
            }
            info!(url = %shared.url, "machine event channel connected");
            let TransportLink { inbound, .. } = link;
            let _ = first.send(Ok(()));
            supervise(shared, generation, Some(inbound), TransportError::Closed).await;
        }
        Err(err) => {
            warn!(url = %shared.url, error = %err, "machine event channel handshake failed");
            let error = ConnectionError::Transport(err.clone());
            shared.report(generation, error.clone());
            if shared.policy.max_attempts == 0 {
                shared.set_state(generation, ConnectionState::Disconnected);
                let _ = first.send(Err(error));
                return;
            }
            let _ = first.send(Err(error));
            supervise(shared, generation, None, err).await;
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    generation: u64,
    mut inbound: Option<mpsc::Receiver<Result<String, TransportError>>>,
    mut last_failure: TransportError,
) {
    loop {
        if let Some(rx) = inbound.take() {
            last_failure = pump(&shared, rx).await;
            if !shared.detach(generation) {
                return;
            }
            warn!(url = %shared.url, reason = %last_failure, "machine event channel lost");
            shared.report(generation, ConnectionError::Transport(last_failure.clone()));
        }

        match reconnect(&shared, generation, last_failure.clone()).await {
            Some(link) => inbound = Some(link.inbound),
            None => return,
        }
    }
}

async fn pump(
    shared: &Shared,
    mut inbound: mpsc::Receiver<Result<String, TransportError>>,
) -> TransportError {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Ok(text) => shared.deliver(&text),
            Err(err) => return err,
        }
    }
    TransportError::Closed
}

async fn reconnect(
    shared: &Shared,
    generation: u64,
    mut last_failure: TransportError,
) -> Option<TransportLink> {
    let mut attempt = 0;
    while let Some(delay) = shared.policy.delay_for(attempt + 1) {
        attempt += 1;
        shared.set_state(generation, ConnectionState::Reconnecting { attempt });
        info!(
            attempt,
            max_attempts = shared.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnection"
        );
        tokio::time::sleep(delay).await;
        if !shared.is_current(generation) {
            return None;
        }

        match shared.transport.open(&shared.url).await {
            Ok(link) => {
                if !shared.attach(generation, &link) {
                    return None;
                }
                info!(attempt, url = %shared.url, "machine event channel reconnected");
                return Some(link);
            }
            Err(err) => {
                warn!(attempt, error = %err, "reconnection attempt failed");
                shared.report(generation, ConnectionError::Transport(err.clone()));
                last_failure = err;
            }
        }
    }

    let error = ConnectionError::RetriesExhausted {
        attempts: attempt,
        last: last_failure,
    };
    error!(url = %shared.url, error = %error, "giving up on machine event channel");
    shared.report(generation, error);
    shared.set_state(generation, ConnectionState::Disconnected);
    None
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
