use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::{ConfigHandle, ServerConfig};
use crate::error::Result;
use crate::registry::ServiceRegistry;
use crate::remote::HttpTransport;
use crate::scheduler::{Dispatcher, JobStore};
use crate::worker::HttpLauncher;

/// A registry server: job store, registry, dispatcher, retention sweep and
/// HTTP API in one process.
pub struct Node {
    pub config: ServerConfig,
    pub registry: Arc<ServiceRegistry>,
    pub dispatch_config: ConfigHandle,
}

impl Node {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ServiceRegistry::with_job_store(JobStore::with_capacity(
            config.max_jobs,
        )));
        let dispatch_config = ConfigHandle::new(config.dispatch.clone())?;
        Ok(Self {
            config,
            registry,
            dispatch_config,
        })
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// Starts all node subsystems:
    /// 1. Spawns the dispatcher (assigns queued jobs, forwards cancels)
    /// 2. Spawns the retention sweep
    /// 3. Runs the HTTP API (blocking until shutdown)
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the API server
    /// fails to bind. Background loops log their own errors.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let launcher = HttpLauncher::new(HttpTransport::new()?);
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            launcher,
            self.dispatch_config.clone(),
        );

        let dispatch_token = shutdown.clone();
        let dispatch_task = tokio::spawn(async move {
            dispatcher.run(dispatch_token).await;
        });

        let sweep_registry = self.registry.clone();
        let sweep_config = self.dispatch_config.clone();
        let sweep_token = shutdown.clone();
        let sweep_task = tokio::spawn(async move {
            Self::maintenance_loop(sweep_registry, sweep_config, sweep_token).await;
        });

        let state = ApiState {
            registry: self.registry.clone(),
            host_url: self.config.host_url.clone(),
        };
        let served = api::serve(self.config.listen_addr, state, shutdown.clone()).await;

        // Stop the loops too when the server ended on its own.
        shutdown.cancel();
        for (name, task) in [("dispatcher", dispatch_task), ("maintenance", sweep_task)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Background task panicked");
            }
        }

        served?;
        tracing::info!("Node stopped");
        Ok(())
    }

    /// Periodically remove job trees that outlived the configured lifetime.
    pub async fn maintenance_loop(
        registry: Arc<ServiceRegistry>,
        config: ConfigHandle,
        cancel: CancellationToken,
    ) {
        loop {
            let current = config.current();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Retention sweep shutting down");
                    break;
                }
                _ = tokio::time::sleep(current.maintenance_interval()) => {
                    if let Some(lifetime) = current.job_lifetime() {
                        let removed = registry.remove_parentless_jobs(lifetime);
                        tracing::debug!(removed, "Retention sweep complete");
                    }
                }
            }
        }
    }
}
