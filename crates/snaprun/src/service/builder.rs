//! # Service builder
//!
//! Fluent composition of an execution environment service from its
//! collaborators and timing knobs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::isolate::IsolateFactory;
use crate::messenger::ServiceMessenger;
use crate::service::Error;
use crate::service::ExecutionService;
use crate::service::Result;
use crate::service::ServiceInner;
use crate::service::SetupSnapProvider;

/// Timing configuration for the service.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// How often an executing snap is pinged.
    pub unresponsive_polling_interval: Duration,
    /// How long each liveness ping may take before the snap is reported
    /// unresponsive.
    pub unresponsive_timeout: Duration,
    /// How long spawn plus the readiness ping may take.
    pub spawn_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            unresponsive_polling_interval: Duration::from_secs(5),
            unresponsive_timeout: Duration::from_secs(30),
            spawn_timeout: Duration::from_secs(60),
        }
    }
}

/// Fluent builder for [`ExecutionService`].
pub struct ServiceBuilder {
    messenger: Option<ServiceMessenger>,
    isolates: Option<Arc<dyn IsolateFactory>>,
    setup_provider: Option<Arc<dyn SetupSnapProvider>>,
    config: ServiceConfig,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self {
            messenger: None,
            isolates: None,
            setup_provider: None,
            config: ServiceConfig::default(),
        }
    }

    /// Publishes service events on this messenger instead of a fresh one.
    pub fn messenger(mut self, messenger: ServiceMessenger) -> Self {
        self.messenger = Some(messenger);
        self
    }

    /// The isolate container implementation jobs are spawned with.
    pub fn isolates(mut self, isolates: impl IsolateFactory) -> Self {
        self.isolates = Some(Arc::new(isolates));
        self
    }

    /// The collaborator that wires wallet-provider middleware into each
    /// executed snap.
    pub fn setup_snap_provider(mut self, setup: impl SetupSnapProvider) -> Self {
        self.setup_provider = Some(Arc::new(setup));
        self
    }

    pub fn unresponsive_polling_interval(mut self, interval: Duration) -> Self {
        self.config.unresponsive_polling_interval = interval;
        self
    }

    pub fn unresponsive_timeout(mut self, timeout: Duration) -> Self {
        self.config.unresponsive_timeout = timeout;
        self
    }

    pub fn spawn_timeout(mut self, timeout: Duration) -> Self {
        self.config.spawn_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ExecutionService> {
        let isolates = self
            .isolates
            .ok_or_else(|| Error::Config("an isolate factory is required".into()))?;
        let setup_provider = self
            .setup_provider
            .ok_or_else(|| Error::Config("a setup_snap_provider collaborator is required".into()))?;

        Ok(ExecutionService::from_inner(ServiceInner {
            messenger: self.messenger.unwrap_or_default(),
            isolates,
            setup_provider,
            config: self.config,
            jobs: DashMap::new(),
            snap_to_job: DashMap::new(),
            job_to_snap: DashMap::new(),
            hooks: DashMap::new(),
            watchdogs: DashMap::new(),
        }))
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
