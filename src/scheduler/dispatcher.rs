use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigHandle, DispatchConfig};
use crate::error::{DispatchError, Result};
use crate::registry::{HealthState, HostRegistration, ServiceRegistration, ServiceRegistry};
use crate::scheduler::job::{Job, JobStatus, JobUpdate};
use crate::scheduler::load::{NodeLoad, SystemLoad};
use crate::scheduler::store::JobEvent;
use crate::worker::JobLauncher;

/// Where a job is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTarget {
    pub host: String,
    pub service_type: String,
    pub service_path: String,
}

impl From<&ServiceRegistration> for DispatchTarget {
    fn from(service: &ServiceRegistration) -> Self {
        Self {
            host: service.host.clone(),
            service_type: service.service_type.clone(),
            service_path: service.path.clone(),
        }
    }
}

/// Hosts, services and load at one point in time.
#[derive(Debug, Clone, Default)]
pub struct DispatchSnapshot {
    pub hosts: Vec<HostRegistration>,
    pub services: Vec<ServiceRegistration>,
    pub load: SystemLoad,
}

/// An eligible registration with its load factor after taking the job.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub service: ServiceRegistration,
    pub projected_load: f32,
}

/// Eligible registrations for a job of `job_type` weighing `job_load`,
/// best first.
///
/// Eligible: the registration is online, its host is registered, online
/// and out of maintenance, and its health is not ERROR. Ordering: NORMAL
/// before WARNING, then projected load factor ascending (hosts without
/// capacity last), then host URL.
pub fn rank_candidates(
    job_type: &str,
    job_load: f32,
    snapshot: &DispatchSnapshot,
) -> Vec<Candidate> {
    let hosts: HashMap<&str, &HostRegistration> = snapshot
        .hosts
        .iter()
        .map(|h| (h.host.as_str(), h))
        .collect();

    let mut candidates: Vec<Candidate> = snapshot
        .services
        .iter()
        .filter(|s| s.service_type == job_type && s.online && s.health != HealthState::Error)
        .filter_map(|service| {
            let host = hosts.get(service.host.as_str())?;
            if !host.accepts_jobs() {
                return None;
            }
            let projected_load = snapshot
                .load
                .get(&host.host)
                .cloned()
                .unwrap_or_else(|| NodeLoad::idle(host.host.clone(), host.max_load))
                .projected_load_factor(job_load);
            Some(Candidate {
                service: service.clone(),
                projected_load,
            })
        })
        .collect();

    candidates.sort_by(compare_candidates);
    candidates
}

fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    a.service
        .health
        .cmp(&b.service.health)
        .then_with(|| a.projected_load.total_cmp(&b.projected_load))
        .then_with(|| a.service.host.cmp(&b.service.host))
}

/// Pick the target for `job`, or [`DispatchError::NoEligibleHost`].
pub fn select_target(job: &Job, snapshot: &DispatchSnapshot) -> Result<DispatchTarget> {
    rank_candidates(&job.job_type, job.job_load, snapshot)
        .first()
        .map(|candidate| DispatchTarget::from(&candidate.service))
        .ok_or_else(|| DispatchError::NoEligibleHost(job.job_type.clone()))
}

/// Outcome counters of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Jobs claimed and handed to their host.
    pub dispatched: usize,
    /// Jobs whose launch failed and which went back to the queue.
    pub requeued: usize,
    /// Jobs left queued for lack of an eligible host.
    pub waiting: usize,
    /// Jobs failed after waiting longer than the configured maximum.
    pub expired: usize,
}

/// Matches queued jobs with hosts and hands them to a [`JobLauncher`].
pub struct Dispatcher<L> {
    registry: Arc<ServiceRegistry>,
    launcher: L,
    config: ConfigHandle,
}

impl<L: JobLauncher> Dispatcher<L> {
    pub fn new(registry: Arc<ServiceRegistry>, launcher: L, config: ConfigHandle) -> Self {
        Self {
            registry,
            launcher,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Run dispatch cycles until the token is cancelled. Cancellations of
    /// bound jobs are forwarded to their host in between.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = self.registry.subscribe();
        let mut period = self.config.current().dispatch_interval();
        let mut ticker = dispatch_ticker(period);
        tracing::info!(
            dispatch_interval_ms = period.as_millis() as u64,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Ok(JobEvent::StatusChanged(job)) if job.status == JobStatus::Canceled => {
                        self.forward_cancel(&job).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Dispatcher lagged behind job events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    let report = self.dispatch_once().await;
                    if report != DispatchReport::default() {
                        tracing::debug!(
                            dispatched = report.dispatched,
                            requeued = report.requeued,
                            waiting = report.waiting,
                            expired = report.expired,
                            "Dispatch cycle complete"
                        );
                    }

                    let current = self.config.current().dispatch_interval();
                    if current != period {
                        tracing::info!(
                            dispatch_interval_ms = current.as_millis() as u64,
                            "Dispatch interval changed"
                        );
                        period = current;
                        ticker = dispatch_ticker(period);
                    }
                }
            }
        }
    }

    /// One pass over the queue, oldest job first.
    pub async fn dispatch_once(&self) -> DispatchReport {
        let config = self.config.current();
        let mut report = DispatchReport::default();
        let mut snapshot = self.registry.dispatch_snapshot();

        for job in self.registry.queued_jobs() {
            let target = match select_target(&job, &snapshot) {
                Ok(target) => target,
                Err(_) => {
                    if self.expire_if_overdue(&job, &config) {
                        report.expired += 1;
                    } else {
                        report.waiting += 1;
                    }
                    continue;
                }
            };

            let claimed = match self.registry.claim_job(job.id, &target.host) {
                Ok(claimed) => claimed,
                Err(e) => {
                    // Canceled, removed or claimed elsewhere since the listing.
                    tracing::debug!(job_id = job.id, error = %e, "Job not claimable");
                    continue;
                }
            };
            snapshot.load.assign(&target.host, claimed.job_load);

            match self.launcher.launch(&target, &claimed).await {
                Ok(()) => {
                    report.dispatched += 1;
                    tracing::info!(
                        job_id = claimed.id,
                        host = %target.host,
                        service_type = %target.service_type,
                        operation = %claimed.operation,
                        "Job dispatched"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = claimed.id,
                        host = %target.host,
                        error = %e,
                        "Job launch failed, returning it to the queue"
                    );
                    if let Err(e) =
                        self.registry.record_dispatch_failure(&claimed, &target.host)
                    {
                        tracing::debug!(
                            job_id = claimed.id,
                            error = %e,
                            "Launch failure not tracked"
                        );
                    }
                    match self.registry.release_job(claimed.id) {
                        Ok(_) => report.requeued += 1,
                        Err(e) => {
                            tracing::debug!(job_id = claimed.id, error = %e, "Job not requeued");
                        }
                    }
                    // Health and load moved; later jobs decide on fresh data.
                    snapshot = self.registry.dispatch_snapshot();
                }
            }
        }

        report
    }

    fn expire_if_overdue(&self, job: &Job, config: &DispatchConfig) -> bool {
        let Some(max_wait) = config.max_dispatch_wait() else {
            return false;
        };
        if Utc::now() - job.date_created < max_wait {
            return false;
        }

        let reason = format!(
            "no eligible host for {} within {} ms",
            job.job_type,
            max_wait.num_milliseconds()
        );
        match self.registry.update_job(
            job.id,
            JobUpdate::status(JobStatus::Failed).with_failure_reason(reason),
        ) {
            Ok(_) => {
                tracing::warn!(job_id = job.id, job_type = %job.job_type, "Job expired in queue");
                true
            }
            Err(e) => {
                tracing::debug!(job_id = job.id, error = %e, "Job not expired");
                false
            }
        }
    }

    /// Best-effort cancel request to the processing host of `job`.
    pub async fn forward_cancel(&self, job: &Job) {
        let Some(host) = job.processing_host.as_deref() else {
            return;
        };
        let service = match self.registry.service_registration(&job.job_type, host) {
            Ok(service) => service,
            Err(e) => {
                tracing::debug!(job_id = job.id, host, error = %e, "No service to cancel on");
                return;
            }
        };

        let target = DispatchTarget::from(&service);
        if let Err(e) = self.launcher.cancel(&target, job).await {
            tracing::warn!(job_id = job.id, host, error = %e, "Cancel request failed");
        }
    }
}

fn dispatch_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}
