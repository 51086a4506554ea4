//! # Dedicated-thread isolate
//!
//! Each job gets its own OS thread running a current-thread async runtime
//! that hosts the worker controller. This is the strongest isolation the
//! in-process containers offer: a snap busy-looping inside its compartment
//! stalls only its own thread.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::isolate::Error;
use crate::isolate::IsolateFactory;
use crate::isolate::Result;
use crate::service::JobId;
use crate::transport::ChannelTransport;
use crate::transport::Transport;
use crate::worker::compartment::LockdownConfig;
use crate::worker::WorkerController;

const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Spawns one dedicated worker thread per job.
pub struct ThreadIsolate {
    spawn_timeout: Duration,
    lockdown: LockdownConfig,
    threads: DashMap<JobId, std::thread::JoinHandle<()>>,
}

impl ThreadIsolate {
    pub fn new() -> Self {
        Self {
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            lockdown: LockdownConfig::default(),
            threads: DashMap::new(),
        }
    }

    /// Bounds how long a container may take to signal readiness.
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn with_lockdown(mut self, config: LockdownConfig) -> Self {
        self.lockdown = config;
        self
    }
}

impl Default for ThreadIsolate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl IsolateFactory for ThreadIsolate {
    async fn spawn(&self, job_id: &JobId) -> Result<Box<dyn Transport>> {
        let (host_side, worker_side) = ChannelTransport::pair();
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = self.lockdown.clone();

        let thread = std::thread::Builder::new()
            .name(format!("snap-worker-{}", job_id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("building isolate runtime: {}", e)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let worker =
                        match WorkerController::with_lockdown(Box::new(worker_side), config) {
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
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;

        match tokio::time::timeout(self.spawn_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                self.threads.insert(job_id.clone(), thread);
                Ok(Box::new(host_side))
            }
            Ok(Ok(Err(message))) => Err(Error::Spawn(message)),
            Ok(Err(_)) => Err(Error::Spawn(
                "isolate thread exited before signalling readiness".into(),
            )),
            Err(_) => {
                // Remove the partial container: closing our half ends the
                // worker's command loop as soon as it starts.
                host_side.close().await;
                Err(Error::NotReady {
                    job_id: job_id.clone(),
                    timeout: self.spawn_timeout,
                })
            }
        }
    }

    async fn destroy(&self, job_id: &JobId) -> Result<()> {
        // The worker exits on its own once the service destroys the
        // transport; joining here would block the host event loop.
        self.threads.remove(job_id);
        Ok(())
    }
}
