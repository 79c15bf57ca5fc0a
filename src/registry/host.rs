use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Capacity and availability of one worker host, keyed by its base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRegistration {
    pub host: String,
    pub address: String,
    pub memory: u64,
    pub cores: u32,
    pub max_load: f32,
    pub maintenance: bool,
    pub online: bool,
    pub registered_at: DateTime<Utc>,
}

impl HostRegistration {
    /// Online and not in maintenance.
    pub fn accepts_jobs(&self) -> bool {
        self.online && !self.maintenance
    }
}

/// Registration request for a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub host: String,
    pub address: String,
    pub memory: u64,
    pub cores: u32,
    pub max_load: f32,
}

impl HostSpec {
    pub fn new(host: impl Into<String>, max_load: f32) -> Self {
        Self {
            host: host.into(),
            address: String::new(),
            memory: 0,
            cores: 1,
            max_load,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_resources(mut self, memory: u64, cores: u32) -> Self {
        self.memory = memory;
        self.cores = cores;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "host must not be blank".to_string(),
            ));
        }
        if !self.max_load.is_finite() || self.max_load < 0.0 {
            return Err(DispatchError::InvalidArgument(format!(
                "max load of {} must be a non-negative number",
                self.host
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: DashMap<String, HostRegistration>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host, or refresh the capacity of a known one. A refreshed
    /// host comes back online and keeps its maintenance flag.
    pub fn register(&self, spec: HostSpec) -> Result<HostRegistration> {
        spec.validate()?;

        let registration = self
            .hosts
            .entry(spec.host.clone())
            .and_modify(|existing| {
                existing.address = spec.address.clone();
                existing.memory = spec.memory;
                existing.cores = spec.cores;
                existing.max_load = spec.max_load;
                existing.online = true;
            })
            .or_insert_with(|| HostRegistration {
                host: spec.host.clone(),
                address: spec.address.clone(),
                memory: spec.memory,
                cores: spec.cores,
                max_load: spec.max_load,
                maintenance: false,
                online: true,
                registered_at: Utc::now(),
            })
            .clone();

        tracing::info!(
            host = %registration.host,
            cores = registration.cores,
            max_load = registration.max_load,
            "Host registered"
        );
        Ok(registration)
    }

    pub fn unregister(&self, host: &str) -> Result<HostRegistration> {
        let (_, registration) = self
            .hosts
            .remove(host)
            .ok_or_else(|| DispatchError::HostNotFound(host.to_string()))?;
        tracing::info!(host, "Host unregistered");
        Ok(registration)
    }

    pub fn get(&self, host: &str) -> Result<HostRegistration> {
        self.hosts
            .get(host)
            .map(|h| h.clone())
            .ok_or_else(|| DispatchError::HostNotFound(host.to_string()))
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains_key(host)
    }

    pub fn set_maintenance(&self, host: &str, maintenance: bool) -> Result<HostRegistration> {
        let registration = self.modify(host, |h| h.maintenance = maintenance)?;
        tracing::info!(host, maintenance, "Maintenance mode changed");
        Ok(registration)
    }

    pub fn set_online(&self, host: &str, online: bool) -> Result<HostRegistration> {
        let registration = self.modify(host, |h| h.online = online)?;
        tracing::info!(host, online, "Host availability changed");
        Ok(registration)
    }

    fn modify<F>(&self, host: &str, f: F) -> Result<HostRegistration>
    where
        F: FnOnce(&mut HostRegistration),
    {
        let mut entry = self
            .hosts
            .get_mut(host)
            .ok_or_else(|| DispatchError::HostNotFound(host.to_string()))?;
        f(entry.value_mut());
        Ok(entry.clone())
    }

    /// All hosts ordered by URL.
    pub fn all(&self) -> Vec<HostRegistration> {
        let mut hosts: Vec<HostRegistration> = self.hosts.iter().map(|h| h.clone()).collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
