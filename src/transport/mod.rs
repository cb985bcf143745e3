//! Transport connection — the one realtime link to the server.
//!
//! DESIGN
//! ======
//! A supervisor task owns the link lifecycle: read the token, open a
//! [`Link`] through the [`Connector`], forward inbound frames in wire order,
//! and reconnect with bounded exponential backoff when the link drops. After
//! `max_attempts` consecutive failures the supervisor stops and publishes
//! [`ConnectionStatus::Offline`]; `retry()` starts a fresh supervisor.
//!
//! Everything the supervisor observes leaves through a single ordered
//! [`TransportEvent`] channel, so "connected" is always seen before the first
//! frame of that link. Status changes are also published on a `watch`
//! channel for UI indicators.
//!
//! LIFECYCLE
//! =========
//! 1. `connect()` → token check → spawn supervisor → `Connecting`
//! 2. Link open → `Connected` (new generation, retry count reset)
//! 3. Link drops → `Reconnecting` → backoff → step 2, or `Offline` at the cap
//! 4. `disconnect()` → supervisor aborted (pending retry timer included) →
//!    `Disconnected`
//!
//! Channel interest and bus subscriptions live elsewhere and survive all of
//! the above.

mod loopback;
mod token;
mod ws;

pub use loopback::{LoopbackAcceptor, LoopbackConnector, LoopbackPeer};
pub use token::{SessionTicketSource, StaticToken, TokenSource};
pub use ws::{WsConnector, ws_url};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::{Frame, Status};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no authentication token available")]
    Authentication,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error("link closed")]
    Closed,
    #[error("timed out waiting for response")]
    Timeout,
    #[error("request cancelled by server")]
    Cancelled,
    #[error("server rejected {syscall}: {message}")]
    Rejected { syscall: String, code: Option<String>, message: String },
    #[error("ticket request failed: {0}")]
    Ticket(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget exhausted. Terminal until `retry()`.
    Offline,
}

/// Snapshot published on every status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts; 0 while connected.
    pub retry_count: u32,
    /// Increments once per successfully opened link.
    pub generation: u64,
}

impl ConnectionState {
    fn initial() -> Self {
        Self { status: ConnectionStatus::Disconnected, retry_count: 0, generation: 0 }
    }
}

/// Ordered stream of what happened on the link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected { generation: u64 },
    Frame(Frame),
    Disconnected,
    LinkDown,
}

/// One open bidirectional link, as produced by a [`Connector`].
/// The link is closed when `inbound` yields `None`.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Opens links. The websocket implementation lives in [`WsConnector`].
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, token: &str) -> Result<Link, TransportError>;
}

/// Send half of the current link, tagged with its generation.
#[derive(Clone, Debug)]
pub struct LinkHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

impl LinkHandle {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame on this link without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the link is gone.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

struct Inner {
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    policy: ReconnectPolicy,
    status_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    link: Mutex<Option<LinkHandle>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

/// Handle to the process-wide realtime connection. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Build a transport. The returned receiver yields every [`TransportEvent`]
    /// in order and must be drained by exactly one consumer.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionState::initial());
        let inner = Inner {
            connector,
            tokens,
            policy,
            status_tx,
            events_tx,
            link: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            supervisor: Mutex::new(None),
            generation: AtomicU64::new(0),
        };
        (Self { inner: Arc::new(inner) }, events_rx)
    }

    /// Start the link. Returns once the supervisor is running; watch
    /// [`Transport::status`] for the outcome. A second call while the
    /// supervisor is alive is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Authentication`] if no token is available now.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if !self.inner.tokens.has_token().await {
            warn!("transport: connect refused, no token");
            return Err(TransportError::Authentication);
        }

        let mut supervisor = lock(&self.inner.supervisor);
        if let Some(handle) = supervisor.as_ref()
            && !handle.is_finished()
        {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(tokio::spawn(supervise(inner)));
        Ok(())
    }

    /// Manual retry after the link went [`ConnectionStatus::Offline`].
    ///
    /// # Errors
    ///
    /// Same as [`Transport::connect`].
    pub async fn retry(&self) -> Result<(), TransportError> {
        info!("transport: manual retry");
        self.connect().await
    }

    /// Tear the link down and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.drop_link(None);
        let generation = self.inner.generation.load(Ordering::Acquire);
        self.inner.publish(ConnectionStatus::Disconnected, 0, generation);
        info!("transport: disconnected");
    }

    /// Send a frame on the current link.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when no link is open.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let Some(link) = self.link() else {
            return Err(TransportError::NotConnected);
        };
        link.send(frame)
    }

    /// Send a request and wait for its terminal reply, correlated by `parent_id`.
    ///
    /// # Errors
    ///
    /// Returns transport errors, [`TransportError::Timeout`] after `deadline`,
    /// or [`TransportError::Rejected`] for an error reply.
    pub async fn request(&self, frame: Frame, deadline: Duration) -> Result<Frame, TransportError> {
        let request_id = frame.id.clone();
        let syscall = frame.syscall.clone();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(request_id.clone(), tx);

        if let Err(e) = self.send(frame) {
            lock(&self.inner.pending).remove(&request_id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                lock(&self.inner.pending).remove(&request_id);
                return Err(TransportError::Timeout);
            }
        };

        match reply.status {
            Status::Done => return Ok(reply),
            Status::Cancel => return Err(TransportError::Cancelled),
            _ => {}
        }
        Err(TransportError::Rejected {
            syscall,
            code: reply.error_code(),
            message: reply.error_message(),
        })
    }

    /// Send half of the current link, if connected.
    #[must_use]
    pub fn link(&self) -> Option<LinkHandle> {
        lock(&self.inner.link).clone()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status_tx.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.status_tx.borrow()
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

async fn supervise(inner: Arc<Inner>) {
    let mut attempt: u32 = 0;
    let mut was_connected = false;

    loop {
        let status = if was_connected || attempt > 0 {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
        inner.publish(status, attempt, inner.generation.load(Ordering::Acquire));

        let opened = match inner.tokens.token().await {
            Some(token) => inner.connector.open(&token).await,
            None => Err(TransportError::Authentication),
        };

        match opened {
            Ok(link) => {
                attempt = 0;
                was_connected = true;
                inner.run_link(link).await;
                info!("transport: link dropped");
                let _ = inner.events_tx.send(TransportEvent::Disconnected);
            }
            Err(e) => {
                warn!(error = %e, attempt, "transport: connect attempt failed");
            }
        }

        attempt += 1;
        if attempt > inner.policy.max_attempts {
            let generation = inner.generation.load(Ordering::Acquire);
            inner.publish(ConnectionStatus::Offline, attempt - 1, generation);
            let _ = inner.events_tx.send(TransportEvent::LinkDown);
            warn!(attempts = attempt - 1, "transport: retry budget exhausted, link down");
            return;
        }

        let delay = inner.delay(attempt);
        inner.publish(ConnectionStatus::Reconnecting, attempt, inner.generation.load(Ordering::Acquire));
        debug!(attempt, delay_ms = delay.as_millis(), "transport: backing off");
        tokio::time::sleep(delay).await;
    }
}

impl Inner {
    async fn run_link(&self, link: Link) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.link) = Some(LinkHandle { generation, tx: link.outbound });
        self.publish(ConnectionStatus::Connected, 0, generation);
        let _ = self.events_tx.send(TransportEvent::Connected { generation });
        info!(generation, "transport: connected");

        let mut inbound = link.inbound;
        while let Some(frame) = inbound.recv().await {
            self.route_inbound(frame);
        }

        self.drop_link(Some(generation));
    }

    /// Terminal replies go to their waiting `request`; everything else is an event.
    fn route_inbound(&self, frame: Frame) {
        if frame.status.is_terminal()
            && let Some(parent_id) = frame.parent_id.as_deref()
        {
            let waiter = lock(&self.pending).remove(parent_id);
            if let Some(waiter) = waiter {
                let _ = waiter.send(frame);
                return;
            }
        }
        let _ = self.events_tx.send(TransportEvent::Frame(frame));
    }

    /// Clear the link slot (only if it still holds `generation`, when given)
    /// and fail every outstanding request.
    fn drop_link(&self, generation: Option<u64>) {
        {
            let mut slot = lock(&self.link);
            let matches = match (slot.as_ref(), generation) {
                (Some(current), Some(g)) => current.generation == g,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                *slot = None;
            }
        }
        lock(&self.pending).clear();
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay(attempt);
        if !self.policy.jitter {
            return base;
        }
        let max_jitter = base / 5;
        if max_jitter.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(Duration::ZERO..=max_jitter);
        base + extra
    }

    fn publish(&self, status: ConnectionStatus, retry_count: u32, generation: u64) {
        let next = ConnectionState { status, retry_count, generation };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
