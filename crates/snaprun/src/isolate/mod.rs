//! # Isolate containers
//!
//! A container is a platform-provided isolated execution context reachable
//! over a message transport. The service depends only on the capability
//! interface here; the two concrete containers — a dedicated thread and an
//! in-runtime task — are interchangeable.

pub mod task;
pub mod thread;

pub use task::TaskIsolate;
pub use thread::ThreadIsolate;

use std::time::Duration;

use crate::service::JobId;
use crate::transport::Transport;

#[derive(Debug)]
pub enum Error {
    /// The container could not be constructed.
    Spawn(String),
    /// Readiness was not observed within the spawn timeout. The partial
    /// container has been removed.
    NotReady { job_id: JobId, timeout: Duration },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(msg) => write!(f, "spawn error: {}", msg),
            Self::NotReady { job_id, timeout } => {
                write!(f, "isolate for {} not ready within {:?}", job_id, timeout)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Capability interface for constructing and removing isolates.
///
/// `spawn` yields a targetable transport endpoint within a bounded time or
/// fails with the partial container already removed. `destroy` removes the
/// container's host-side record; it never reports the worker's own exit.
#[async_trait::async_trait]
pub trait IsolateFactory: Send + Sync + 'static {
    async fn spawn(&self, job_id: &JobId) -> Result<Box<dyn Transport>>;

    async fn destroy(&self, job_id: &JobId) -> Result<()>;
}
