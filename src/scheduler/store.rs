use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobId, JobStatus, JobUpdate, NewJob};
use crate::scheduler::load::{NodeLoad, SystemLoad};

const DEFAULT_MAX_JOBS: usize = 100_000;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle notifications published by the store.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Created(Job),
    StatusChanged(Job),
    Removed(JobId),
}

/// Optional filters for [`JobStore::count`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountFilter {
    pub service_type: Option<String>,
    pub host: Option<String>,
    pub operation: Option<String>,
    pub status: Option<JobStatus>,
}

impl CountFilter {
    fn matches(&self, job: &Job) -> bool {
        self.service_type
            .as_deref()
            .map_or(true, |t| job.job_type == t)
            && self
                .host
                .as_deref()
                .map_or(true, |h| job.processing_host.as_deref() == Some(h))
            && self
                .operation
                .as_deref()
                .map_or(true, |o| job.operation == o)
            && self.status.map_or(true, |s| job.status == s)
    }
}

/// Canonical record of all jobs.
///
/// Every mutation of a single job happens under that job's map entry lock,
/// which is what makes [`claim`](Self::claim) exclusive and keeps the
/// retention sweep from racing a status update.
#[derive(Debug)]
pub struct JobStore {
    jobs: DashMap<JobId, Job>,
    next_id: AtomicU64,
    max_jobs: usize,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_jobs,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Create a job. Ids come from a monotonic sequence and are never reused.
    pub fn create(&self, request: NewJob) -> Result<Job> {
        request.validate()?;

        if self.jobs.len() >= self.max_jobs {
            return Err(DispatchError::CapacityExceeded(self.max_jobs));
        }
        if let Some(parent_id) = request.parent_id {
            if !self.jobs.contains_key(&parent_id) {
                return Err(DispatchError::JobNotFound(parent_id));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = Job::from_request(id, request, Utc::now());
        self.jobs.insert(id, job.clone());

        tracing::debug!(
            job_id = id,
            job_type = %job.job_type,
            operation = %job.operation,
            status = %job.status,
            "Job created"
        );
        self.publish(JobEvent::Created(job.clone()));
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Result<Job> {
        self.jobs
            .get(&id)
            .map(|job| job.clone())
            .ok_or(DispatchError::JobNotFound(id))
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Direct children of a job, ordered by id.
    pub fn children(&self, id: JobId) -> Result<Vec<Job>> {
        if !self.jobs.contains_key(&id) {
            return Err(DispatchError::JobNotFound(id));
        }
        Ok(self.collect_sorted(|job| job.parent_id == Some(id)))
    }

    /// Jobs of a service type, optionally restricted to one status.
    pub fn jobs(&self, service_type: Option<&str>, status: Option<JobStatus>) -> Vec<Job> {
        self.collect_sorted(|job| {
            service_type.map_or(true, |t| job.job_type == t)
                && status.map_or(true, |s| job.status == s)
        })
    }

    /// All jobs that have not reached a terminal status.
    pub fn active_jobs(&self) -> Vec<Job> {
        self.collect_sorted(|job| !job.status.is_terminal())
    }

    /// Queued jobs, oldest first.
    pub fn queued_jobs(&self) -> Vec<Job> {
        self.collect_sorted(|job| job.status == JobStatus::Queued)
    }

    /// Jobs currently occupying capacity on a host.
    pub fn jobs_on_host(&self, host: &str) -> Vec<Job> {
        self.collect_sorted(|job| {
            job.status.is_active() && job.processing_host.as_deref() == Some(host)
        })
    }

    pub fn payloads(&self, operation: &str) -> Vec<String> {
        self.collect_sorted(|job| job.operation == operation)
            .into_iter()
            .filter_map(|job| job.payload)
            .collect()
    }

    pub fn count(&self, filter: &CountFilter) -> u64 {
        self.jobs.iter().filter(|j| filter.matches(j.value())).count() as u64
    }

    fn collect_sorted<F>(&self, predicate: F) -> Vec<Job>
    where
        F: Fn(&Job) -> bool,
    {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Bind a queued job to a processing host.
    ///
    /// Exactly one caller wins for a given job; everyone else gets
    /// [`DispatchError::AlreadyClaimed`].
    pub fn claim(&self, id: JobId, host: &str) -> Result<Job> {
        let job = {
            let mut entry = self.jobs.get_mut(&id).ok_or(DispatchError::JobNotFound(id))?;
            match entry.status {
                JobStatus::Queued => {}
                JobStatus::Dispatched | JobStatus::Running => {
                    return Err(DispatchError::AlreadyClaimed(id))
                }
                from => {
                    return Err(DispatchError::IllegalTransition {
                        job_id: id,
                        from,
                        to: JobStatus::Dispatched,
                    })
                }
            }
            entry.transition(JobStatus::Dispatched, Utc::now())?;
            entry.processing_host = Some(host.to_string());
            entry.clone()
        };

        tracing::debug!(job_id = id, host, "Job claimed");
        self.publish(JobEvent::StatusChanged(job.clone()));
        Ok(job)
    }

    /// Return a dispatched job to the queue, clearing its processing host.
    pub fn release(&self, id: JobId) -> Result<Job> {
        let job = {
            let mut entry = self.jobs.get_mut(&id).ok_or(DispatchError::JobNotFound(id))?;
            entry.transition(JobStatus::Queued, Utc::now())?;
            entry.clone()
        };
        self.publish(JobEvent::StatusChanged(job.clone()));
        Ok(job)
    }

    /// Apply an update reported by a processing host.
    pub fn update(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        self.apply_update(id, update).map(|(job, _)| job)
    }

    /// Like [`update`](Self::update), also reporting whether the status moved.
    pub(crate) fn apply_update(&self, id: JobId, update: JobUpdate) -> Result<(Job, bool)> {
        let (job, status_changed) = {
            let mut entry = self.jobs.get_mut(&id).ok_or(DispatchError::JobNotFound(id))?;

            // Terminal records are immutable.
            if entry.status.is_terminal() {
                return Err(DispatchError::IllegalTransition {
                    job_id: id,
                    from: entry.status,
                    to: update.status.unwrap_or(entry.status),
                });
            }

            if let (Some(reported), Some(current)) =
                (update.processing_host.as_deref(), entry.processing_host.as_deref())
            {
                if reported != current {
                    return Err(DispatchError::InvalidArgument(format!(
                        "job {} is processed by {}, not {}",
                        id, current, reported
                    )));
                }
            }

            let mut status_changed = false;
            if let Some(status) = update.status {
                if status != entry.status {
                    // Claims only go through `claim`, which records the host.
                    if status == JobStatus::Dispatched {
                        return Err(DispatchError::IllegalTransition {
                            job_id: id,
                            from: entry.status,
                            to: status,
                        });
                    }
                    entry.transition(status, Utc::now())?;
                    status_changed = true;
                }
            }

            if update.payload.is_some() {
                entry.payload = update.payload;
            }
            if update.failure_reason.is_some() {
                entry.failure_reason = update.failure_reason;
            }
            entry.date_changed = Utc::now();
            (entry.clone(), status_changed)
        };

        if status_changed {
            tracing::debug!(job_id = id, status = %job.status, "Job status updated");
            self.publish(JobEvent::StatusChanged(job.clone()));
        }
        Ok((job, status_changed))
    }

    /// Mark a non-terminal job as canceled.
    pub fn cancel(&self, id: JobId) -> Result<Job> {
        self.update(id, JobUpdate::status(JobStatus::Canceled))
    }

    /// Delete a job. Deleting an already deleted job succeeds; running jobs
    /// must be canceled first. The id is never handed out again.
    pub fn remove(&self, id: JobId) -> Result<()> {
        let removed = self
            .jobs
            .remove_if(&id, |_, job| job.status != JobStatus::Running);

        match removed {
            Some(_) => {
                tracing::debug!(job_id = id, "Job removed");
                self.publish(JobEvent::Removed(id));
                Ok(())
            }
            None if self.jobs.contains_key(&id) => Err(DispatchError::JobRunning(id)),
            // Issued ids that are no longer stored were deleted before.
            None if id > 0 && id < self.next_id.load(Ordering::SeqCst) => Ok(()),
            None => Err(DispatchError::JobNotFound(id)),
        }
    }

    /// Remove root jobs whose whole tree has not changed for `lifetime`,
    /// descendants included. A job whose parent was deleted counts as a root.
    /// Returns the number of removed jobs.
    pub fn remove_parentless_jobs(&self, lifetime: chrono::Duration) -> usize {
        match Utc::now().checked_sub_signed(lifetime) {
            Some(cutoff) => self.remove_stale_trees(cutoff),
            // Older than any representable time: nothing qualifies.
            None => 0,
        }
    }

    fn remove_stale_trees(&self, cutoff: DateTime<Utc>) -> usize {
        let snapshot: Vec<(JobId, Option<JobId>, DateTime<Utc>)> = self
            .jobs
            .iter()
            .map(|e| (e.id, e.parent_id, e.date_changed))
            .collect();

        let mut children: HashMap<JobId, Vec<JobId>> = HashMap::new();
        let mut changed: HashMap<JobId, DateTime<Utc>> = HashMap::new();
        let mut roots = Vec::new();
        for (id, _, date_changed) in &snapshot {
            changed.insert(*id, *date_changed);
        }
        for (id, parent, _) in &snapshot {
            match parent {
                Some(p) if changed.contains_key(p) => children.entry(*p).or_default().push(*id),
                _ => roots.push(*id),
            }
        }
        roots.sort_unstable();

        let mut removed = 0;
        for root in roots {
            let tree = subtree_post_order(root, &children);
            if tree.iter().any(|id| changed.get(id).map_or(true, |c| *c > cutoff)) {
                continue;
            }

            // Leaves first, so a refused child keeps its ancestors alive.
            for id in tree {
                let gone = self
                    .jobs
                    .remove_if(&id, |_, job| job.date_changed <= cutoff)
                    .is_some();
                if !gone {
                    break;
                }
                self.publish(JobEvent::Removed(id));
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "Removed abandoned job trees");
        }
        removed
    }

    /// Load per host, for every `(host, max_load)` given.
    pub fn system_load<'a, I>(&self, hosts: I) -> SystemLoad
    where
        I: IntoIterator<Item = (&'a str, f32)>,
    {
        let mut loads: HashMap<String, NodeLoad> = hosts
            .into_iter()
            .map(|(host, max)| (host.to_string(), NodeLoad::idle(host, max)))
            .collect();

        for entry in self.jobs.iter() {
            let job = entry.value();
            if !job.status.is_active() {
                continue;
            }
            if let Some(node) = job
                .processing_host
                .as_deref()
                .and_then(|h| loads.get_mut(h))
            {
                node.running_jobs += 1;
                node.current_load += job.job_load;
            }
        }

        loads.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn subtree_post_order(root: JobId, children: &HashMap<JobId, Vec<JobId>>) -> Vec<JobId> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        stack.push((id, true));
        if let Some(kids) = children.get(&id) {
            for kid in kids {
                stack.push((*kid, false));
            }
        }
    }
    order
}
