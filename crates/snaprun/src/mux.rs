//! # Object multiplexer
//!
//! Splits one duplex transport into named substreams. Each wire message is
//! an [`Envelope`] tagging its channel; a pump task routes inbound payloads
//! to per-channel queues so traffic on one channel never blocks or fails
//! another.
//!
//! ## Invariants
//! - A payload sent on substream `X` arrives only on the peer's substream `X`.
//! - A parent transport failure is reported once and closes every substream.
//! - Destroying the multiplexer destroys the parent transport and with it
//!   every substream.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use snaprpc::Envelope;

use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum Error {
    /// A substream with this channel name is already open.
    ChannelExists(String),
    /// The parent transport is gone; no further traffic is possible.
    Closed,
    Transport(transport::Error),
    Codec(snaprpc::WireError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelExists(name) => write!(f, "substream '{}' already exists", name),
            Self::Closed => write!(f, "multiplexer closed"),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Codec(e) => write!(f, "codec error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<snaprpc::WireError> for Error {
    fn from(e: snaprpc::WireError) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One duplex transport presented as N named duplex substreams.
#[derive(Clone)]
pub struct ObjectMultiplexer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    transport: Arc<dyn Transport>,
    channels: DashMap<String, mpsc::UnboundedSender<Value>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MuxInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxInner")
            .field("channels", &self.channels)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ObjectMultiplexer {
    /// Takes ownership of a transport and starts the routing pump.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let inner = Arc::new(MuxInner {
            transport: Arc::from(transport),
            channels: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(pump(Arc::clone(&inner)));

        Self { inner }
    }

    /// Opens the named substream. Each channel may be opened once; the
    /// receiving half is single-consumer.
    pub fn substream(&self, channel: &str) -> Result<Substream> {
        use dashmap::mapref::entry::Entry;

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.channels.entry(channel.to_string()) {
            Entry::Occupied(_) => return Err(Error::ChannelExists(channel.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }

        Ok(Substream {
            channel: channel.to_string(),
            mux: Arc::clone(&self.inner),
            incoming: Mutex::new(rx),
        })
    }

    /// Destroys the parent transport and every substream. Idempotent and
    /// best-effort: destroy never reports an error.
    pub async fn destroy(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.transport.close().await;
        // Dropping the senders ends every substream's recv loop.
        self.inner.channels.clear();
    }
}

/// Routes inbound envelopes to their channel queues until the transport
/// closes or fails.
async fn pump(inner: Arc<MuxInner>) {
    loop {
        match inner.transport.recv().await {
            Ok(Some(bytes)) => match Envelope::from_bytes(&bytes) {
                Ok(envelope) => match inner.channels.get(&envelope.channel) {
                    Some(tx) => {
                        // A dropped receiver just means the substream went
                        // away first; the message has nowhere to go.
                        let _ = tx.send(envelope.payload);
                    }
                    None => {
                        tracing::warn!(channel = %envelope.channel, "dropping message for unknown channel");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable message");
                }
            },
            Ok(None) => break,
            Err(e) => {
                // Reported exactly once; the pipeline closes below.
                tracing::error!(error = %e, "parent transport failed; closing all substreams");
                break;
            }
        }
    }

    inner.closed.store(true, Ordering::SeqCst);
    inner.channels.clear();
}

/// One named channel over the parent transport.
///
/// Sending tags the payload with the channel name; receiving yields only
/// payloads the peer sent on the same channel. `recv` returns `None` once
/// the parent transport is closed or failed.
#[derive(Debug)]
pub struct Substream {
    channel: String,
    mux: Arc<MuxInner>,
    incoming: Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl Substream {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn send(&self, payload: Value) -> Result<()> {
        if self.mux.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let bytes = Envelope::new(self.channel.clone(), payload).to_bytes()?;
        self.mux.transport.send(&bytes).await?;
        Ok(())
    }

    pub async fn recv(&self) -> Option<Value> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await
    }
}

impl Drop for Substream {
    fn drop(&mut self) {
        self.mux.channels.remove(&self.channel);
    }
}
