use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{DispatchError, Result};

/// Tunables of the dispatch and maintenance loops.
///
/// Immutable once built. A changed configuration is a new value swapped in
/// through [`ConfigHandle::replace`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Pause between two dispatch cycles.
    pub dispatch_interval_ms: u64,
    /// How long a job may stay queued without an eligible host before it is
    /// failed. `None` waits forever.
    pub max_dispatch_wait_ms: Option<u64>,
    /// Retention of job trees without status changes. `None` keeps jobs
    /// until they are deleted explicitly.
    pub job_lifetime_secs: Option<u64>,
    /// Pause between two retention sweeps.
    pub maintenance_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 1000,
            max_dispatch_wait_ms: None,
            job_lifetime_secs: None,
            maintenance_interval_ms: 60_000,
        }
    }
}

impl DispatchConfig {
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_dispatch_wait(mut self, wait: Duration) -> Self {
        self.max_dispatch_wait_ms = Some(wait.as_millis() as u64);
        self
    }

    pub fn with_job_lifetime(mut self, lifetime: Duration) -> Self {
        self.job_lifetime_secs = Some(lifetime.as_secs());
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    /// `None` when unset or beyond what a timestamp can express.
    pub fn max_dispatch_wait(&self) -> Option<chrono::Duration> {
        self.max_dispatch_wait_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(chrono::Duration::try_milliseconds)
    }

    /// `None` when unset or beyond what a timestamp can express.
    pub fn job_lifetime(&self) -> Option<chrono::Duration> {
        self.job_lifetime_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch_interval_ms == 0 {
            return Err(DispatchError::Configuration(
                "dispatch interval must be positive".to_string(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(DispatchError::Configuration(
                "maintenance interval must be positive".to_string(),
            ));
        }
        if self.max_dispatch_wait_ms == Some(0) {
            return Err(DispatchError::Configuration(
                "max dispatch wait must be positive when set".to_string(),
            ));
        }
        if self.job_lifetime_secs == Some(0) {
            return Err(DispatchError::Configuration(
                "job lifetime must be positive when set".to_string(),
            ));
        }
        if self.max_dispatch_wait_ms.is_some() && self.max_dispatch_wait().is_none() {
            return Err(DispatchError::Configuration(
                "max dispatch wait is out of range".to_string(),
            ));
        }
        if self.job_lifetime_secs.is_some() && self.job_lifetime().is_none() {
            return Err(DispatchError::Configuration(
                "job lifetime is out of range".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of a registry server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Base URL this server is reachable at; used as creator host of jobs
    /// submitted without one.
    pub host_url: String,
    pub max_jobs: usize,
    pub dispatch: DispatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let listen_addr = SocketAddr::from(([127, 0, 0, 1], 8080));
        Self {
            listen_addr,
            host_url: format!("http://{}", listen_addr),
            max_jobs: 100_000,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            host_url: format!("http://{}", listen_addr),
            ..Default::default()
        }
    }

    pub fn with_host_url(mut self, host_url: impl Into<String>) -> Self {
        self.host_url = host_url.into();
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_jobs == 0 {
            return Err(DispatchError::Configuration(
                "max jobs must be positive".to_string(),
            ));
        }
        if self.host_url.trim().is_empty() {
            return Err(DispatchError::Configuration(
                "host url must not be blank".to_string(),
            ));
        }
        self.dispatch.validate()
    }
}

/// Shared, atomically swappable [`DispatchConfig`].
///
/// Readers take a cheap snapshot with [`current`](Self::current); loops that
/// want to react to changes [`subscribe`](Self::subscribe).
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<DispatchConfig>>>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        let (tx, _) = watch::channel(Arc::new(DispatchConfig::default()));
        Self { tx: Arc::new(tx) }
    }
}

impl ConfigHandle {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        let (tx, _) = watch::channel(Arc::new(config));
        Ok(Self { tx: Arc::new(tx) })
    }

    pub fn current(&self) -> Arc<DispatchConfig> {
        self.tx.borrow().clone()
    }

    /// Swap in a new configuration. Invalid values leave the current one in
    /// place.
    pub fn replace(&self, config: DispatchConfig) -> Result<()> {
        config.validate()?;
        tracing::info!(
            dispatch_interval_ms = config.dispatch_interval_ms,
            max_dispatch_wait_ms = ?config.max_dispatch_wait_ms,
            job_lifetime_secs = ?config.job_lifetime_secs,
            "Dispatch configuration replaced"
        );
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DispatchConfig>> {
        self.tx.subscribe()
    }
}
