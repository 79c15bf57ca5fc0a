use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

pub type JobId = u64;

/// Default load weight of a job that does not declare one.
pub const DEFAULT_JOB_LOAD: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Dispatched,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Dispatched => write!(f, "DISPATCHED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Finished => write!(f, "FINISHED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "DISPATCHED" => Ok(JobStatus::Dispatched),
            "RUNNING" => Ok(JobStatus::Running),
            "FINISHED" => Ok(JobStatus::Finished),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELED" => Ok(JobStatus::Canceled),
            other => Err(DispatchError::InvalidArgument(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Statuses that occupy capacity on the processing host.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Dispatched | JobStatus::Running)
    }

    /// Lifecycle edges. `Queued -> Dispatched` is only taken through
    /// [`JobStore::claim`](crate::scheduler::JobStore::claim).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Dispatched)
                | (Queued, Canceled)
                | (Queued, Failed)
                | (Dispatched, Queued)
                | (Dispatched, Running)
                | (Dispatched, Failed)
                | (Dispatched, Canceled)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

/// Identity of "the same kind of job": type, operation and the ordered
/// argument list. The payload never takes part in the comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobSignature {
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
}

impl std::fmt::Display for JobSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}({})",
            self.job_type,
            self.operation,
            self.arguments.join(",")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub payload: Option<String>,
    pub status: JobStatus,
    pub creator_host: String,
    pub processing_host: Option<String>,
    pub job_load: f32,
    pub parent_id: Option<JobId>,
    pub queueable: bool,
    pub failure_reason: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_completed: Option<DateTime<Utc>>,
    pub date_changed: DateTime<Utc>,
}

impl Job {
    pub(crate) fn from_request(id: JobId, request: NewJob, now: DateTime<Utc>) -> Self {
        // Inline jobs run in the caller's context right away.
        let (status, processing_host, date_started) = if request.queueable {
            (JobStatus::Queued, None, None)
        } else {
            (
                JobStatus::Running,
                Some(request.creator_host.clone()),
                Some(now),
            )
        };

        Self {
            id,
            job_type: request.job_type,
            operation: request.operation,
            arguments: request.arguments,
            payload: request.payload,
            status,
            creator_host: request.creator_host,
            processing_host,
            job_load: request.job_load,
            parent_id: request.parent_id,
            queueable: request.queueable,
            failure_reason: None,
            date_created: now,
            date_started,
            date_completed: None,
            date_changed: now,
        }
    }

    pub fn signature(&self) -> JobSignature {
        JobSignature {
            job_type: self.job_type.clone(),
            operation: self.operation.clone(),
            arguments: self.arguments.clone(),
        }
    }

    /// Time spent waiting before the job started running.
    pub fn queue_time(&self) -> Option<chrono::Duration> {
        self.date_started.map(|started| started - self.date_created)
    }

    /// Time spent running, available once the job reached a terminal status.
    pub fn run_time(&self) -> Option<chrono::Duration> {
        match (self.date_started, self.date_completed) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Apply a lifecycle edge, stamping the matching timestamps.
    pub(crate) fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(DispatchError::IllegalTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }

        match to {
            JobStatus::Queued => {
                self.processing_host = None;
                self.date_started = None;
            }
            JobStatus::Running => {
                self.date_started.get_or_insert(now);
            }
            s if s.is_terminal() => {
                self.date_completed = Some(now);
            }
            _ => {}
        }

        self.status = to;
        self.date_changed = now;
        Ok(())
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub payload: Option<String>,
    pub creator_host: String,
    pub job_load: f32,
    pub parent_id: Option<JobId>,
    pub queueable: bool,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            operation: operation.into(),
            arguments: Vec::new(),
            payload: None,
            creator_host: String::new(),
            job_load: DEFAULT_JOB_LOAD,
            parent_id: None,
            queueable: true,
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_load(mut self, job_load: f32) -> Self {
        self.job_load = job_load;
        self
    }

    pub fn with_creator(mut self, host: impl Into<String>) -> Self {
        self.creator_host = host.into();
        self
    }

    pub fn with_parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Run in the caller's own context instead of going through dispatch.
    pub fn inline(mut self) -> Self {
        self.queueable = false;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.job_type.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "job type must not be blank".to_string(),
            ));
        }
        if self.operation.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "operation must not be blank".to_string(),
            ));
        }
        if !self.job_load.is_finite() || self.job_load < 0.0 {
            return Err(DispatchError::InvalidArgument(format!(
                "job load must be a non-negative number, got {}",
                self.job_load
            )));
        }
        if !self.queueable && self.creator_host.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "inline jobs need a creator host to run on".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fields a processing host may report back for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub payload: Option<String>,
    pub failure_reason: Option<String>,
    /// Host the update originates from; must match the processing host.
    pub processing_host: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn from_host(mut self, host: impl Into<String>) -> Self {
        self.processing_host = Some(host.into());
        self
    }
}

impl From<&Job> for JobUpdate {
    fn from(job: &Job) -> Self {
        Self {
            status: Some(job.status),
            payload: job.payload.clone(),
            failure_reason: job.failure_reason.clone(),
            processing_host: job.processing_host.clone(),
        }
    }
}
