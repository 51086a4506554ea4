//! # Message-based transport between host and isolate
//!
//! A minimal async interface for moving whole messages between the host and
//! an isolate. Each transport is held by exactly one multiplexer, which is
//! responsible for channel tagging and routing.
//!
//! ## Philosophy
//!
//! - **Byte-oriented**: the transport knows nothing about envelopes,
//!   channels, or JSON-RPC. It moves opaque buffers.
//! - **Message-passing**: each send delivers one complete message; each recv
//!   yields one complete message. No partial reads, no reordering.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;

/// Errors at the transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The transport was closed locally.
    Closed,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::Closed => write!(f, "transport closed"),
            Self::Io(msg) => write!(f, "i/o error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A mechanism for asynchronous message passing between host and isolate.
///
/// Object-safe (`Arc<dyn Transport>`). Higher-level patterns — channel
/// multiplexing, request/response correlation — are built on top.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues one complete message for transmission.
    ///
    /// # Invariants
    /// - Must not block on I/O
    /// - Should return `Err` only on permanent failures
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Awaits the next complete message from the peer.
    ///
    /// # Returns
    /// - `Ok(Some(bytes))` - a complete message
    /// - `Ok(None)` - the stream is closed (EOF)
    /// - `Err(_)` - a transport error occurred
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Tears the transport down. After close, the peer's `recv` yields
    /// `Ok(None)` and local sends fail. Idempotent.
    async fn close(&self);
}

/// A duplex channel transport: the in-process postMessage analogue.
///
/// Thread and task isolates live in the host process, so their "wire" is a
/// pair of unbounded channels. Messages sent on one half appear on the
/// other half's `recv` in order.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl ChannelTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        (Self::half(tx_a, rx_b), Self::half(tx_b, rx_a))
    }

    fn half(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
            closed_tx,
            closed_rx,
        }
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| Error::ConnectionLost("channel closed".into())),
            None => Err(Error::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            message = rx.recv() => Ok(message),
            _ = closed.changed() => Ok(None),
        }
    }

    async fn close(&self) {
        // Dropping the sender makes the peer's recv yield EOF once drained;
        // the watch wakes our own pending recv without touching its lock,
        // so close never waits on a reader.
        self.tx.lock().await.take();
        let _ = self.closed_tx.send(true);
    }
}
