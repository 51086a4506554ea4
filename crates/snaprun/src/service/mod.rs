//! # Execution environment service
//!
//! The host-side half of the isolation protocol. Owns every job, the
//! snap↔job mapping, the snap RPC hooks, and the liveness watchdogs;
//! nothing else in the host touches those. Each public operation mutates
//! that state only at the well-defined step of a lifecycle transition, so
//! concurrent callers never observe partial state.
//!
//! ## Invariants
//! - The snap↔job mapping is bijective while a snap is executing.
//! - A snap RPC hook exists iff the snap is in the mapping.
//! - `terminate_job` never fails for a known job, and after it returns the
//!   mapping, hook, watchdog, and job record are all gone.

pub mod builder;

use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;

use snaprpc::Command;
use snaprpc::ExecuteSnapParams;
use snaprpc::SnapId;
use snaprpc::SnapRpcParams;
use snaprpc::COMMAND_CHANNEL;
use snaprpc::JSON_RPC_CHANNEL;

use crate::engine;
use crate::engine::RpcEngine;
use crate::isolate;
use crate::isolate::IsolateFactory;
use crate::messenger::ServiceEvent;
use crate::messenger::ServiceMessenger;
use crate::mux;
use crate::mux::ObjectMultiplexer;
use crate::mux::Substream;
use crate::service::builder::ServiceBuilder;
use crate::service::builder::ServiceConfig;

/// Strong type for job identifiers: one fresh id per spawned isolate,
/// never reused across snaps.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct JobId(String);

impl JobId {
    /// Mints a fresh collision-resistant job id.
    pub fn fresh() -> Self {
        Self(format!("job-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub enum Error {
    /// `execute_snap` for a snap id that is already executing.
    AlreadyExecuting(SnapId),
    /// `terminate_snap` (or a hook call) for a snap with no live job.
    UnknownSnap(SnapId),
    /// The job backing this operation was terminated.
    Terminated,
    /// The service was built without a required collaborator.
    Config(String),
    Isolate(isolate::Error),
    Engine(engine::Error),
    Mux(mux::Error),
    /// The `setup_snap_provider` collaborator failed.
    SetupProvider(String),
    /// The isolate did not answer the readiness ping in time.
    Unready(JobId),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExecuting(id) => {
                write!(f, "snap '{}' is already being executed", id)
            }
            Self::UnknownSnap(id) => write!(f, "no snap is executing with id '{}'", id),
            Self::Terminated => write!(f, "the snap was terminated"),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Isolate(e) => write!(f, "isolate error: {}", e),
            // Engine failures carry the remote message; surface it verbatim.
            Self::Engine(e) => write!(f, "{}", e),
            Self::Mux(e) => write!(f, "stream error: {}", e),
            Self::SetupProvider(msg) => write!(f, "setup_snap_provider failed: {}", msg),
            Self::Unready(id) => write!(f, "isolate for {} did not answer readiness ping", id),
        }
    }
}

impl std::error::Error for Error {}

impl From<isolate::Error> for Error {
    fn from(e: isolate::Error) -> Self {
        Self::Isolate(e)
    }
}

impl From<engine::Error> for Error {
    fn from(e: engine::Error) -> Self {
        Self::Engine(e)
    }
}

impl From<mux::Error> for Error {
    fn from(e: mux::Error) -> Self {
        Self::Mux(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An identified unit of third-party code to execute.
#[derive(Clone, Debug)]
pub struct SnapData {
    pub snap_id: SnapId,
    pub source_code: String,
}

/// External collaborator that plumbs the host's wallet-provider middleware
/// into a freshly executed snap's `jsonRpc` substream. Called exactly once
/// per successful execute, before the first hook invocation.
#[async_trait::async_trait]
pub trait SetupSnapProvider: Send + Sync + 'static {
    async fn setup(&self, snap_id: &SnapId, json_rpc: Substream) -> anyhow::Result<()>;
}

/// One live isolate bound to at most one snap.
pub(crate) struct Job {
    pub(crate) snap_id: SnapId,
    pub(crate) mux: ObjectMultiplexer,
    pub(crate) engine: RpcEngine,
}

/// Host-side function that forwards origin-tagged requests into a snap.
///
/// Closes over the job id, never the job record: after the snap is
/// terminated every call rejects.
#[derive(Clone)]
pub struct SnapRpcHook {
    service: Weak<ServiceInner>,
    job_id: JobId,
    snap_id: SnapId,
}

impl SnapRpcHook {
    /// Delivers `(origin, request)` to the snap's registered handler and
    /// resolves to its result. Errors from the isolate surface as
    /// rejections carrying the isolate's error message.
    pub async fn call(&self, origin: impl Into<String>, request: Value) -> Result<Value> {
        let inner = self.service.upgrade().ok_or(Error::Terminated)?;

        let engine = inner
            .jobs
            .get(&self.job_id)
            .map(|job| job.engine.clone())
            .ok_or(Error::Terminated)?;

        let command = Command::SnapRpc(SnapRpcParams {
            origin: origin.into(),
            request,
            target: self.snap_id.clone(),
        });

        Ok(engine.call(command).await?)
    }

    pub fn snap_id(&self) -> &SnapId {
        &self.snap_id
    }
}

pub(crate) struct ServiceInner {
    pub(crate) messenger: ServiceMessenger,
    pub(crate) isolates: Arc<dyn IsolateFactory>,
    pub(crate) setup_provider: Arc<dyn SetupSnapProvider>,
    pub(crate) config: ServiceConfig,
    pub(crate) jobs: DashMap<JobId, Job>,
    pub(crate) snap_to_job: DashMap<SnapId, JobId>,
    pub(crate) job_to_snap: DashMap<JobId, SnapId>,
    pub(crate) hooks: DashMap<SnapId, SnapRpcHook>,
    pub(crate) watchdogs: DashMap<SnapId, JoinHandle<()>>,
}

/// The execution environment service. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionService {
    inner: Arc<ServiceInner>,
}

struct SpawnedJob {
    engine: RpcEngine,
    json_rpc: Substream,
}

impl ExecutionService {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    pub(crate) fn from_inner(inner: ServiceInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The messenger this service publishes fault events on.
    pub fn messenger(&self) -> &ServiceMessenger {
        &self.inner.messenger
    }

    /// Spawns an isolate for the snap, evaluates its source there, and
    /// installs the snap's RPC hook.
    ///
    /// Fails if the snap id is already executing; there is no silent
    /// replacement. Any failure after the spawn tears the job down again
    /// before the error is re-raised.
    pub async fn execute_snap(&self, snap: SnapData) -> Result<Value> {
        let job_id = JobId::fresh();

        // Reserve the snap id up front so a concurrent duplicate execute
        // cannot spawn a second isolate for it.
        match self.inner.snap_to_job.entry(snap.snap_id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyExecuting(snap.snap_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(job_id.clone());
            }
        }

        match self.execute_in_job(&job_id, &snap).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.inner.terminate_job(&job_id).await;
                // The reservation survives terminate_job when the full
                // mapping was never installed.
                self.inner
                    .snap_to_job
                    .remove_if(&snap.snap_id, |_, reserved| reserved == &job_id);
                Err(e)
            }
        }
    }

    async fn execute_in_job(&self, job_id: &JobId, snap: &SnapData) -> Result<Value> {
        let SpawnedJob { engine, json_rpc } = self.init_job(job_id, &snap.snap_id).await?;

        let command = Command::ExecuteSnap(ExecuteSnapParams {
            snap_id: snap.snap_id.clone(),
            source_code: snap.source_code.clone(),
        });
        let result = engine.call(command).await?;

        self.inner
            .setup_provider
            .setup(&snap.snap_id, json_rpc)
            .await
            .map_err(|e| Error::SetupProvider(e.to_string()))?;

        // The watchdog, mapping, and hook go live together, only now that
        // the isolate has confirmed the execute — and only while the job is
        // still registered. Holding the registry entry across the inserts
        // keeps a racing terminate (which removes the job record first)
        // from interleaving between the check and the install.
        match self.inner.jobs.entry(job_id.clone()) {
            Entry::Occupied(_) => {
                self.start_watchdog(snap.snap_id.clone(), engine);
                self.inner
                    .job_to_snap
                    .insert(job_id.clone(), snap.snap_id.clone());
                self.inner.hooks.insert(
                    snap.snap_id.clone(),
                    SnapRpcHook {
                        service: Arc::downgrade(&self.inner),
                        job_id: job_id.clone(),
                        snap_id: snap.snap_id.clone(),
                    },
                );
            }
            Entry::Vacant(_) => return Err(Error::Terminated),
        }

        Ok(result)
    }

    /// Spawns the isolate, wires its streams, and confirms liveness with a
    /// ping before handing the job out. Any failure tears the partially
    /// built isolate down.
    async fn init_job(&self, job_id: &JobId, snap_id: &SnapId) -> Result<SpawnedJob> {
        let transport = self.inner.isolates.spawn(job_id).await?;

        let mux = ObjectMultiplexer::new(transport);
        let command = mux.substream(COMMAND_CHANNEL)?;
        let json_rpc = mux.substream(JSON_RPC_CHANNEL)?;

        let messenger = self.inner.messenger.clone();
        let oob_snap = snap_id.clone();
        let engine = RpcEngine::new(command, move |error| {
            messenger.publish(ServiceEvent::UnhandledError {
                snap_id: oob_snap.clone(),
                error,
            });
        });

        let ping = tokio::time::timeout(
            self.inner.config.spawn_timeout,
            engine.call(Command::Ping),
        )
        .await;

        match ping {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.teardown_partial(&mux, &engine, job_id).await;
                return Err(e.into());
            }
            Err(_) => {
                self.teardown_partial(&mux, &engine, job_id).await;
                return Err(Error::Unready(job_id.clone()));
            }
        }

        self.inner.jobs.insert(
            job_id.clone(),
            Job {
                snap_id: snap_id.clone(),
                mux,
                engine: engine.clone(),
            },
        );

        Ok(SpawnedJob { engine, json_rpc })
    }

    async fn teardown_partial(&self, mux: &ObjectMultiplexer, engine: &RpcEngine, job_id: &JobId) {
        engine.shutdown();
        mux.destroy().await;
        if let Err(e) = self.inner.isolates.destroy(job_id).await {
            tracing::debug!(job = %job_id, error = %e, "ignoring destroy failure during teardown");
        }
    }

    /// Terminates the job executing the given snap. Fails only for snaps
    /// with no live job.
    pub async fn terminate_snap(&self, snap_id: &SnapId) -> Result<()> {
        let job_id = self
            .inner
            .snap_to_job
            .get(snap_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownSnap(snap_id.clone()))?;

        self.inner.terminate_job(&job_id).await;
        Ok(())
    }

    /// Terminates every live job, then clears all snap RPC hooks and
    /// liveness watchdogs unconditionally.
    pub async fn terminate_all_snaps(&self) {
        let job_ids: Vec<JobId> = self.inner.jobs.iter().map(|e| e.key().clone()).collect();
        for job_id in job_ids {
            self.inner.terminate_job(&job_id).await;
        }

        self.inner.hooks.clear();
        let snap_ids: Vec<SnapId> = self.inner.watchdogs.iter().map(|e| e.key().clone()).collect();
        for snap_id in snap_ids {
            if let Some((_, watchdog)) = self.inner.watchdogs.remove(&snap_id) {
                watchdog.abort();
            }
        }
    }

    /// The installed RPC hook for a snap, or absent if it is not executing.
    pub fn rpc_message_handler(&self, snap_id: &SnapId) -> Option<SnapRpcHook> {
        self.inner.hooks.get(snap_id).map(|entry| entry.value().clone())
    }

    /// Whether a snap currently has a live job.
    pub fn is_executing(&self, snap_id: &SnapId) -> bool {
        self.inner.snap_to_job.contains_key(snap_id)
    }

    /// Number of live jobs.
    pub fn job_count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Number of installed snap RPC hooks.
    pub fn hook_count(&self) -> usize {
        self.inner.hooks.len()
    }

    /// Number of running liveness watchdogs.
    pub fn watchdog_count(&self) -> usize {
        self.inner.watchdogs.len()
    }

    /// Schedules liveness polling for an executing snap: ping on every
    /// interval, each raced against the unresponsive timeout. A failed or
    /// timed-out ping publishes `Unresponsive` exactly once and stops the
    /// polling; the supervisor decides whether to terminate.
    fn start_watchdog(&self, snap_id: SnapId, engine: RpcEngine) {
        let messenger = self.inner.messenger.clone();
        let interval = self.inner.config.unresponsive_polling_interval;
        let timeout = self.inner.config.unresponsive_timeout;
        let watched = snap_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match tokio::time::timeout(timeout, engine.call(Command::Ping)).await {
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) | Err(_) => {
                        messenger.publish(ServiceEvent::Unresponsive {
                            snap_id: watched.clone(),
                        });
                        break;
                    }
                }
            }
        });

        self.inner.watchdogs.insert(snap_id, handle);
    }
}

impl ServiceInner {
    /// Tears a job down. The job registry is the linearization point: the
    /// record is removed first, so an execute racing this call observes the
    /// vacancy under its install guard and never resurrects the snap. The
    /// watchdog, hook, and mapping are then cleaned up from the removed
    /// record — before stream destruction, so no caller sees a hook for a
    /// dead stream. Every step is best-effort; terminate never fails for
    /// known jobs.
    pub(crate) async fn terminate_job(&self, job_id: &JobId) {
        let job = self.jobs.remove(job_id).map(|(_, job)| job);

        if let Some(job) = &job {
            if let Some((_, watchdog)) = self.watchdogs.remove(&job.snap_id) {
                watchdog.abort();
            }
            // Guarded removals: never disturb state a newer job for the
            // same snap id may have installed.
            self.hooks
                .remove_if(&job.snap_id, |_, hook| hook.job_id == *job_id);
            self.snap_to_job
                .remove_if(&job.snap_id, |_, mapped| mapped == job_id);
            self.job_to_snap.remove(job_id);
        }

        if let Some(job) = job {
            // In-flight commands reject with a terminated error rather than
            // hanging forever.
            job.engine.shutdown();
            job.mux.destroy().await;
            tracing::debug!(job = %job_id, snap = %job.snap_id, "job terminated");
        }

        if let Err(e) = self.isolates.destroy(job_id).await {
            tracing::debug!(job = %job_id, error = %e, "ignoring destroy failure");
        }
    }
}
