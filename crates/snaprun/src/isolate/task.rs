//! # In-runtime task isolate
//!
//! The worker controller runs as a task on the host runtime. Lighter than a
//! dedicated thread, with the same protocol surface; the compartment still
//! seals the snap, but a stalled snap competes for host worker threads.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::isolate::Error;
use crate::isolate::IsolateFactory;
use crate::isolate::Result;
use crate::service::JobId;
use crate::transport::ChannelTransport;
use crate::transport::Transport;
use crate::worker::compartment::LockdownConfig;
use crate::worker::WorkerController;

const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs one worker task per job on the host runtime.
pub struct TaskIsolate {
    spawn_timeout: Duration,
    lockdown: LockdownConfig,
    tasks: DashMap<JobId, JoinHandle<()>>,
}

impl TaskIsolate {
    pub fn new() -> Self {
        Self {
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            lockdown: LockdownConfig::default(),
            tasks: DashMap::new(),
        }
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn with_lockdown(mut self, config: LockdownConfig) -> Self {
        self.lockdown = config;
        self
    }
}

impl Default for TaskIsolate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl IsolateFactory for TaskIsolate {
    async fn spawn(&self, job_id: &JobId) -> Result<Box<dyn Transport>> {
        let (host_side, worker_side) = ChannelTransport::pair();
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = self.lockdown.clone();

        let task = tokio::spawn(async move {
            let worker = match WorkerController::with_lockdown(Box::new(worker_side), config) {
                Ok(worker) => {
                    let _ = ready_tx.send(Ok(()));
                    worker
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            worker.run().await;
        });

        match tokio::time::timeout(self.spawn_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                self.tasks.insert(job_id.clone(), task);
                Ok(Box::new(host_side))
            }
            Ok(Ok(Err(message))) => Err(Error::Spawn(message)),
            Ok(Err(_)) => Err(Error::Spawn(
                "isolate task exited before signalling readiness".into(),
            )),
            Err(_) => {
                task.abort();
                host_side.close().await;
                Err(Error::NotReady {
                    job_id: job_id.clone(),
                    timeout: self.spawn_timeout,
                })
            }
        }
    }

    async fn destroy(&self, job_id: &JobId) -> Result<()> {
        if let Some((_, task)) = self.tasks.remove(job_id) {
            task.abort();
        }
        Ok(())
    }
}
