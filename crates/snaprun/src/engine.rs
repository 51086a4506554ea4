//! # JSON-RPC engine
//!
//! Request/response correlation over one substream. An async pump task
//! demultiplexes inbound responses and routes each to the pending
//! continuation registered under its id, so responses may resolve out of
//! send order.
//!
//! Messages carrying an `error` member and no id are not responses to
//! anything in flight; they are handed to the out-of-band listener.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use snaprpc::Command;
use snaprpc::ErrorObject;
use snaprpc::Message;
use snaprpc::Request;
use snaprpc::RequestId;

use crate::mux;
use crate::mux::Substream;

#[derive(Debug, Clone)]
pub enum Error {
    /// The peer answered with an error response.
    Remote(ErrorObject),
    /// The engine was shut down while the request was in flight.
    Terminated,
    /// The substream closed before a response arrived.
    ChannelClosed,
    /// Encoding the outbound request failed.
    Codec(String),
    Mux(mux::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // The caller-visible failure is the remote error's message.
            Self::Remote(error) => write!(f, "{}", error.message),
            Self::Terminated => write!(f, "the job was terminated"),
            Self::ChannelClosed => write!(f, "response channel closed"),
            Self::Codec(msg) => write!(f, "codec error: {}", msg),
            Self::Mux(e) => write!(f, "stream error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<mux::Error> for Error {
    fn from(e: mux::Error) -> Self {
        Self::Mux(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type Pending = DashMap<RequestId, oneshot::Sender<Result<Value>>>;
type OobListener = Box<dyn Fn(ErrorObject) + Send + Sync>;

/// Correlates outbound requests with inbound responses by id.
///
/// Cheap to clone; all clones share the pending map and the pump.
#[derive(Clone)]
pub struct RpcEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    substream: Arc<Substream>,
    pending: Pending,
    oob: OobListener,
    closed: AtomicBool,
}

impl RpcEngine {
    /// Takes ownership of a substream and starts the response pump. The
    /// listener fires for every out-of-band error the peer pushes.
    pub fn new(substream: Substream, oob: impl Fn(ErrorObject) + Send + Sync + 'static) -> Self {
        let inner = Arc::new(EngineInner {
            substream: Arc::new(substream),
            pending: DashMap::new(),
            oob: Box::new(oob),
            closed: AtomicBool::new(false),
        });

        let pump_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(value) = pump_inner.substream.recv().await {
                handle_message(&pump_inner, value);
            }
            // Stream gone: nothing in flight can ever resolve.
            pump_inner.closed.store(true, Ordering::SeqCst);
            reject_all(&pump_inner.pending, Error::ChannelClosed);
        });

        Self { inner }
    }

    /// Sends a command and awaits its correlated response.
    pub async fn call(&self, command: Command) -> Result<Value> {
        self.call_method(command.method().to_string(), command.params()).await
    }

    /// Sends an arbitrary method call and awaits its correlated response.
    ///
    /// Each outbound request carries a freshly minted collision-resistant id.
    pub async fn call_method(&self, method: String, params: Option<Value>) -> Result<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Terminated);
        }

        let id = RequestId::fresh();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);

        let request = Request::new(id.clone(), method, params);
        let payload = match serde_json::to_value(&request) {
            Ok(payload) => payload,
            Err(e) => {
                self.inner.pending.remove(&id);
                return Err(Error::Codec(e.to_string()));
            }
        };

        if let Err(e) = self.inner.substream.send(payload).await {
            self.inner.pending.remove(&id);
            return Err(e.into());
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// Shuts the engine down, rejecting every in-flight continuation with a
    /// terminated error. Further calls fail immediately.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        reject_all(&self.inner.pending, Error::Terminated);
    }
}

fn handle_message(inner: &EngineInner, value: Value) {
    let message = match Message::classify(value) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed message");
            return;
        }
    };

    let response = match message {
        Message::Response(response) => response,
        Message::Request(request) => {
            tracing::warn!(method = %request.method, "dropping unexpected request on response channel");
            return;
        }
    };

    let Some(id) = response.id else {
        match response.error {
            Some(error) => (inner.oob)(error),
            None => tracing::warn!("dropping id-less response without error"),
        }
        return;
    };

    // Late or duplicate responses have no continuation; drop them.
    let Some((_, tx)) = inner.pending.remove(&id) else {
        tracing::debug!(id = %id, "no pending request for response");
        return;
    };

    let outcome = match response.error {
        Some(error) => Err(Error::Remote(error)),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };

    // Receiver dropped means the caller gave up; nothing to do.
    let _ = tx.send(outcome);
}

/// Rejects every pending continuation with the given error.
fn reject_all(pending: &Pending, error: Error) {
    let keys: Vec<RequestId> = pending.iter().map(|e| e.key().clone()).collect();
    for key in keys {
        if let Some((_, tx)) = pending.remove(&key) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}
