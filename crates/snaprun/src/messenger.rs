//! # Service messenger
//!
//! The pub/sub bus between the execution environment service and the rest
//! of the host. The service reports faults here; a supervisor subscribes
//! and decides what to do about them. Publication never blocks and never
//! fails, subscribers or not.

use tokio::sync::broadcast;

use snaprpc::ErrorObject;
use snaprpc::SnapId;

/// Events the service publishes about executing snaps.
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceEvent {
    /// A liveness ping failed or timed out. Published at most once per
    /// executing snap; polling stops afterwards.
    Unresponsive { snap_id: SnapId },
    /// The isolate pushed an id-less error on the command channel.
    UnhandledError { snap_id: SnapId, error: ErrorObject },
}

/// Broadcast handle for service events. Cheap to clone.
#[derive(Clone)]
pub struct ServiceMessenger {
    tx: broadcast::Sender<ServiceEvent>,
}

impl ServiceMessenger {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Subscribes to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ServiceEvent) {
        tracing::debug!(?event, "publishing service event");
        // An Err here only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for ServiceMessenger {
    fn default() -> Self {
        Self::new()
    }
}
