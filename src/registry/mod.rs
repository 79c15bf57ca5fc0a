//! Service registry: hosts, the services they offer, service health and the
//! job store, behind one facade.
//!
//! # Components
//!
//! - [`HostRegistry`]: capacity, maintenance and availability per host
//! - [`ServiceRegistrations`]: (service type, host) registrations
//! - [`HealthTracker`]: the only writer of service health
//! - [`JobStore`]: canonical job records
//!
//! Job outcomes reported through [`ServiceRegistry::update_job`] feed the
//! health tracker, which in turn steers later dispatch decisions.

pub mod health;
pub mod host;
pub mod service;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::context::JobContext;
use crate::error::{DispatchError, Result};
use crate::scheduler::dispatcher::{rank_candidates, DispatchSnapshot};
use crate::scheduler::job::{Job, JobId, JobStatus, JobUpdate, NewJob};
use crate::scheduler::load::{NodeLoad, SystemLoad};
use crate::scheduler::store::{CountFilter, JobEvent, JobStore};

pub use health::{HealthTracker, HealthTransition};
pub use host::{HostRegistration, HostRegistry, HostSpec};
pub use service::{HealthState, ServiceRegistration, ServiceRegistrations, ServiceStatistics};

/// Result of draining a host before removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Dispatched jobs returned to the queue.
    pub requeued: usize,
    /// Running jobs marked as failed.
    pub failed: usize,
}

#[derive(Debug)]
pub struct ServiceRegistry {
    hosts: HostRegistry,
    services: Arc<ServiceRegistrations>,
    health: HealthTracker,
    jobs: JobStore,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_job_store(JobStore::new())
    }

    pub fn with_job_store(jobs: JobStore) -> Self {
        let services = Arc::new(ServiceRegistrations::new());
        Self {
            hosts: HostRegistry::new(),
            health: HealthTracker::new(services.clone()),
            services,
            jobs,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.jobs.subscribe()
    }

    // ========== Hosts ==========

    pub fn register_host(&self, spec: HostSpec) -> Result<HostRegistration> {
        self.hosts.register(spec)
    }

    /// Remove a host and all of its service registrations. Rejected while
    /// the host still processes jobs; see [`drain_host`](Self::drain_host).
    pub fn unregister_host(&self, host: &str) -> Result<HostRegistration> {
        if !self.hosts.contains(host) {
            return Err(DispatchError::HostNotFound(host.to_string()));
        }

        let active = self.jobs.jobs_on_host(host).len();
        if active > 0 {
            tracing::warn!(host, active, "Refusing to unregister busy host");
            return Err(DispatchError::HostHasActiveJobs {
                host: host.to_string(),
                active,
            });
        }

        let registration = self.hosts.unregister(host)?;
        let services = self.services.unregister_host(host);

        // A dispatch cycle may have claimed a job between the check and the
        // removal. Put such jobs back in the queue.
        for job in self.jobs.jobs_on_host(host) {
            if job.status == JobStatus::Dispatched {
                self.jobs.release(job.id)?;
            }
        }

        tracing::info!(host, services, "Host and its services removed");
        Ok(registration)
    }

    /// Requeue dispatched jobs and fail running jobs of a host so it can be
    /// unregistered.
    pub fn drain_host(&self, host: &str) -> Result<DrainReport> {
        if !self.hosts.contains(host) {
            return Err(DispatchError::HostNotFound(host.to_string()));
        }

        let mut report = DrainReport::default();
        for job in self.jobs.jobs_on_host(host) {
            let outcome = match job.status {
                JobStatus::Dispatched => self.jobs.release(job.id).map(|_| report.requeued += 1),
                JobStatus::Running => self
                    .jobs
                    .update(
                        job.id,
                        JobUpdate::status(JobStatus::Failed)
                            .with_failure_reason(format!("host {} was drained", host)),
                    )
                    .map(|_| report.failed += 1),
                _ => Ok(()),
            };

            // The job may have finished or moved on since the listing.
            if let Err(e) = outcome {
                tracing::debug!(job_id = job.id, host, error = %e, "Skipped job while draining");
            }
        }

        tracing::info!(
            host,
            requeued = report.requeued,
            failed = report.failed,
            "Host drained"
        );
        Ok(report)
    }

    pub fn enable_host(&self, host: &str) -> Result<HostRegistration> {
        self.hosts.set_online(host, true)
    }

    pub fn disable_host(&self, host: &str) -> Result<HostRegistration> {
        self.hosts.set_online(host, false)
    }

    pub fn set_maintenance(&self, host: &str, maintenance: bool) -> Result<HostRegistration> {
        self.hosts.set_maintenance(host, maintenance)
    }

    pub fn host_registration(&self, host: &str) -> Result<HostRegistration> {
        self.hosts.get(host)
    }

    pub fn host_registrations(&self) -> Vec<HostRegistration> {
        self.hosts.all()
    }

    // ========== Services ==========

    pub fn register_service(
        &self,
        service_type: &str,
        host: &str,
        path: &str,
        job_producer: bool,
    ) -> Result<ServiceRegistration> {
        if service_type.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "service type must not be blank".to_string(),
            ));
        }
        if !self.hosts.contains(host) {
            return Err(DispatchError::HostNotFound(host.to_string()));
        }
        Ok(self
            .services
            .register(service_type, host, path, job_producer))
    }

    pub fn unregister_service(&self, service_type: &str, host: &str) -> Result<()> {
        self.services.unregister(service_type, host).map(|_| ())
    }

    pub fn set_service_online(
        &self,
        service_type: &str,
        host: &str,
        online: bool,
    ) -> Result<ServiceRegistration> {
        self.services.set_online(service_type, host, online)
    }

    pub fn service_registration(
        &self,
        service_type: &str,
        host: &str,
    ) -> Result<ServiceRegistration> {
        self.services.get(service_type, host)
    }

    pub fn services_by_host(&self, host: &str) -> Vec<ServiceRegistration> {
        self.services.by_host(host)
    }

    pub fn services_by_type(&self, service_type: &str) -> Vec<ServiceRegistration> {
        self.services.by_type(service_type)
    }

    pub fn service_registrations(&self) -> Vec<ServiceRegistration> {
        self.services.all()
    }

    /// Registrations able to take a job of `service_type`, best target first.
    pub fn services_by_load(&self, service_type: &str) -> Vec<ServiceRegistration> {
        let snapshot = self.dispatch_snapshot();
        rank_candidates(service_type, 0.0, &snapshot)
            .into_iter()
            .map(|candidate| candidate.service)
            .collect()
    }

    // ========== Health ==========

    pub fn sanitize(&self, service_type: &str, host: &str) -> Result<HealthTransition> {
        self.health.sanitize(service_type, host)
    }

    pub fn count_of_abnormal_services(&self) -> u64 {
        self.services.count_abnormal()
    }

    /// Feed a failed launch of `job` on `host` into service health.
    pub fn record_dispatch_failure(&self, job: &Job, host: &str) -> Result<HealthTransition> {
        self.health.record_failure(&job.signature(), host)
    }

    // ========== Jobs ==========

    pub fn create_job(&self, context: &JobContext, request: NewJob) -> Result<Job> {
        self.jobs.create(context.apply(request))
    }

    /// Apply an update from a processing host. Finished jobs count as a
    /// success for their service, failed jobs as a failure.
    pub fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        let (job, status_changed) = self.jobs.apply_update(id, update)?;
        if status_changed {
            self.feed_health(&job);
        }
        Ok(job)
    }

    fn feed_health(&self, job: &Job) {
        let Some(host) = job.processing_host.as_deref() else {
            return;
        };
        let outcome = match job.status {
            JobStatus::Finished => self.health.record_success(&job.job_type, host),
            JobStatus::Failed => self.health.record_failure(&job.signature(), host),
            _ => return,
        };
        // Inline jobs may run on hosts without a registration for their type.
        if let Err(e) = outcome {
            tracing::debug!(job_id = job.id, host, error = %e, "Job outcome not tracked");
        }
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.jobs.get(id)
    }

    pub fn child_jobs(&self, id: JobId) -> Result<Vec<Job>> {
        self.jobs.children(id)
    }

    pub fn jobs(&self, service_type: Option<&str>, status: Option<JobStatus>) -> Vec<Job> {
        self.jobs.jobs(service_type, status)
    }

    pub fn active_jobs(&self) -> Vec<Job> {
        self.jobs.active_jobs()
    }

    pub fn queued_jobs(&self) -> Vec<Job> {
        self.jobs.queued_jobs()
    }

    pub fn job_payloads(&self, operation: &str) -> Vec<String> {
        self.jobs.payloads(operation)
    }

    pub fn cancel_job(&self, id: JobId) -> Result<Job> {
        let job = self.jobs.cancel(id)?;
        tracing::info!(job_id = id, "Job canceled");
        Ok(job)
    }

    pub fn remove_job(&self, id: JobId) -> Result<()> {
        self.jobs.remove(id)
    }

    pub fn remove_parentless_jobs(&self, lifetime: chrono::Duration) -> usize {
        self.jobs.remove_parentless_jobs(lifetime)
    }

    pub fn claim_job(&self, id: JobId, host: &str) -> Result<Job> {
        self.jobs.claim(id, host)
    }

    pub fn release_job(&self, id: JobId) -> Result<Job> {
        self.jobs.release(id)
    }

    // ========== Counts & load ==========

    pub fn count(&self, filter: &CountFilter) -> u64 {
        self.jobs.count(filter)
    }

    pub fn count_by_host(&self, service_type: &str, host: &str, status: JobStatus) -> Result<u64> {
        require("service type", service_type)?;
        require("host", host)?;
        Ok(self.jobs.count(&CountFilter {
            service_type: Some(service_type.to_string()),
            host: Some(host.to_string()),
            status: Some(status),
            ..Default::default()
        }))
    }

    pub fn count_by_operation(
        &self,
        service_type: &str,
        operation: &str,
        status: JobStatus,
    ) -> Result<u64> {
        require("service type", service_type)?;
        require("operation", operation)?;
        Ok(self.jobs.count(&CountFilter {
            service_type: Some(service_type.to_string()),
            operation: Some(operation.to_string()),
            status: Some(status),
            ..Default::default()
        }))
    }

    /// Load of every registered host.
    pub fn current_load(&self) -> SystemLoad {
        let hosts = self.hosts.all();
        self.jobs
            .system_load(hosts.iter().map(|h| (h.host.as_str(), h.max_load)))
    }

    /// Capacity of every registered host, without current load.
    pub fn max_loads(&self) -> SystemLoad {
        self.hosts
            .all()
            .into_iter()
            .map(|h| NodeLoad::idle(h.host, h.max_load))
            .collect()
    }

    pub fn max_load_on_node(&self, host: &str) -> Result<NodeLoad> {
        let registration = self.hosts.get(host)?;
        Ok(NodeLoad::idle(registration.host, registration.max_load))
    }

    /// Job counters and mean timings per service registration.
    ///
    /// `queued_jobs` counts jobs bound to the host that have not started yet.
    pub fn statistics(&self) -> Vec<ServiceStatistics> {
        let jobs = self.jobs.jobs(None, None);
        self.services
            .all()
            .into_iter()
            .map(|service| {
                let mut stats = ServiceStatistics {
                    service,
                    running_jobs: 0,
                    queued_jobs: 0,
                    finished_jobs: 0,
                    mean_run_time_ms: 0,
                    mean_queue_time_ms: 0,
                };
                let mut run = Mean::default();
                let mut queue = Mean::default();

                let on_service = jobs.iter().filter(|j| {
                    j.job_type == stats.service.service_type
                        && j.processing_host.as_deref() == Some(stats.service.host.as_str())
                });
                for job in on_service {
                    match job.status {
                        JobStatus::Running => stats.running_jobs += 1,
                        JobStatus::Dispatched => stats.queued_jobs += 1,
                        JobStatus::Finished => {
                            stats.finished_jobs += 1;
                            if let Some(t) = job.run_time() {
                                run.add(t);
                            }
                        }
                        _ => {}
                    }
                    if let Some(t) = job.queue_time() {
                        queue.add(t);
                    }
                }

                stats.mean_run_time_ms = run.millis();
                stats.mean_queue_time_ms = queue.millis();
                stats
            })
            .collect()
    }

    // ========== Dispatch ==========

    /// Consistent-enough view of hosts, services and load for one dispatch
    /// decision.
    pub fn dispatch_snapshot(&self) -> DispatchSnapshot {
        let hosts = self.hosts.all();
        let load = self
            .jobs
            .system_load(hosts.iter().map(|h| (h.host.as_str(), h.max_load)));
        DispatchSnapshot {
            hosts,
            services: self.services.all(),
            load,
        }
    }
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DispatchError::InvalidArgument(format!(
            "{} must be provided",
            name
        )));
    }
    Ok(())
}

#[derive(Default)]
struct Mean {
    total_ms: i64,
    samples: i64,
}

impl Mean {
    fn add(&mut self, duration: chrono::Duration) {
        self.total_ms += duration.num_milliseconds().max(0);
        self.samples += 1;
    }

    fn millis(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            (self.total_ms / self.samples) as u64
        }
    }
}
