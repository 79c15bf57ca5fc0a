use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::scheduler::job::JobSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Normal,
    Warning,
    Error,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Normal => write!(f, "NORMAL"),
            HealthState::Warning => write!(f, "WARNING"),
            HealthState::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for HealthState {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(HealthState::Normal),
            "WARNING" => Ok(HealthState::Warning),
            "ERROR" => Ok(HealthState::Error),
            other => Err(DispatchError::InvalidArgument(format!(
                "unknown health state '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub service_type: String,
    pub host: String,
}

impl ServiceKey {
    pub fn new(service_type: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            host: host.into(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.service_type, self.host)
    }
}

/// A service type offered by one host, together with its health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_type: String,
    pub host: String,
    pub path: String,
    pub job_producer: bool,
    pub online: bool,
    pub health: HealthState,
    pub health_changed_at: DateTime<Utc>,
    /// Signature of the failure that last moved the health state.
    pub health_signature: Option<JobSignature>,
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistration {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.service_type.clone(), self.host.clone())
    }
}

/// Job counters and timings for one service registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub service: ServiceRegistration,
    pub running_jobs: u64,
    pub queued_jobs: u64,
    pub finished_jobs: u64,
    pub mean_run_time_ms: u64,
    pub mean_queue_time_ms: u64,
}

/// Service registrations keyed by (service type, host). Each entry's map
/// lock serializes its health transitions.
#[derive(Debug, Default)]
pub struct ServiceRegistrations {
    services: DashMap<ServiceKey, ServiceRegistration>,
}

impl ServiceRegistrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, or update path and producer flag of a known one.
    /// Health survives re-registration.
    pub fn register(
        &self,
        service_type: &str,
        host: &str,
        path: &str,
        job_producer: bool,
    ) -> ServiceRegistration {
        let now = Utc::now();
        let registration = self
            .services
            .entry(ServiceKey::new(service_type, host))
            .and_modify(|existing| {
                existing.path = path.to_string();
                existing.job_producer = job_producer;
                existing.online = true;
            })
            .or_insert_with(|| ServiceRegistration {
                service_type: service_type.to_string(),
                host: host.to_string(),
                path: path.to_string(),
                job_producer,
                online: true,
                health: HealthState::Normal,
                health_changed_at: now,
                health_signature: None,
                registered_at: now,
            })
            .clone();

        tracing::info!(service_type, host, path, "Service registered");
        registration
    }

    pub fn unregister(&self, service_type: &str, host: &str) -> Result<ServiceRegistration> {
        let (_, registration) = self
            .services
            .remove(&ServiceKey::new(service_type, host))
            .ok_or_else(|| not_found(service_type, host))?;
        tracing::info!(service_type, host, "Service unregistered");
        Ok(registration)
    }

    /// Drop every registration of a host. Returns how many were removed.
    pub fn unregister_host(&self, host: &str) -> usize {
        let before = self.services.len();
        self.services.retain(|key, _| key.host != host);
        before - self.services.len()
    }

    pub fn get(&self, service_type: &str, host: &str) -> Result<ServiceRegistration> {
        self.services
            .get(&ServiceKey::new(service_type, host))
            .map(|s| s.clone())
            .ok_or_else(|| not_found(service_type, host))
    }

    pub fn set_online(
        &self,
        service_type: &str,
        host: &str,
        online: bool,
    ) -> Result<ServiceRegistration> {
        self.modify(service_type, host, |s| {
            s.online = online;
            s.clone()
        })
    }

    /// Run `f` on one registration while holding its entry lock.
    pub(crate) fn modify<F, R>(&self, service_type: &str, host: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut ServiceRegistration) -> R,
    {
        let mut entry = self
            .services
            .get_mut(&ServiceKey::new(service_type, host))
            .ok_or_else(|| not_found(service_type, host))?;
        Ok(f(entry.value_mut()))
    }

    pub fn by_type(&self, service_type: &str) -> Vec<ServiceRegistration> {
        self.collect_sorted(|s| s.service_type == service_type)
    }

    pub fn by_host(&self, host: &str) -> Vec<ServiceRegistration> {
        self.collect_sorted(|s| s.host == host)
    }

    pub fn all(&self) -> Vec<ServiceRegistration> {
        self.collect_sorted(|_| true)
    }

    /// Number of registrations whose health is not NORMAL.
    pub fn count_abnormal(&self) -> u64 {
        self.services
            .iter()
            .filter(|s| s.health != HealthState::Normal)
            .count() as u64
    }

    fn collect_sorted<F>(&self, predicate: F) -> Vec<ServiceRegistration>
    where
        F: Fn(&ServiceRegistration) -> bool,
    {
        let mut services: Vec<ServiceRegistration> = self
            .services
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        services.sort_by(|a, b| a.key().cmp(&b.key()));
        services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn not_found(service_type: &str, host: &str) -> DispatchError {
    DispatchError::ServiceNotFound {
        service_type: service_type.to_string(),
        host: host.to_string(),
    }
}
