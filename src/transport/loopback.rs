//! In-process connector. Every successful open hands a [`LoopbackPeer`] to
//! the [`LoopbackAcceptor`], which plays the server side of that link.
//! Dropping the peer closes the link as seen by the client.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use frames::Frame;
use tokio::sync::mpsc;

use super::{Connector, Link, TransportError};

pub struct LoopbackConnector {
    peers: mpsc::UnboundedSender<LoopbackPeer>,
    refuse: AtomicU32,
    attempts: AtomicU32,
    tokens: Mutex<Vec<String>>,
}

pub struct LoopbackAcceptor {
    peers: mpsc::UnboundedReceiver<LoopbackPeer>,
}

/// Server end of one loopback link.
pub struct LoopbackPeer {
    pub token: String,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackConnector {
    #[must_use]
    pub fn new() -> (Self, LoopbackAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers: tx,
            refuse: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            tokens: Mutex::new(Vec::new()),
        };
        (connector, LoopbackAcceptor { peers: rx })
    }

    /// Fail the next `n` opens with a connect error.
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::Release);
    }

    /// Opens attempted so far, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Tokens presented by accepted opens, oldest first.
    #[must_use]
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, token: &str) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let refused = self
            .refuse
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("loopback refused".into()));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let peer = LoopbackPeer { token: token.to_owned(), to_client, from_client };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("loopback acceptor gone".into()))?;
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token.to_owned());

        Ok(Link { outbound, inbound })
    }
}

impl LoopbackAcceptor {
    /// Wait for the next successful open.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.peers.recv().await
    }
}

impl LoopbackPeer {
    /// Push a frame to the client. Returns false once the client hung up.
    pub fn push(&self, frame: Frame) -> bool {
        self.to_client.send(frame).is_ok()
    }

    /// Next frame the client sent, or `None` once its side closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Non-blocking variant of [`LoopbackPeer::recv`].
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.from_client.try_recv().ok()
    }
}
