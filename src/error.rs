use thiserror::Error;

use crate::scheduler::job::{JobId, JobStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Service {service_type} not registered on host {host}")]
    ServiceNotFound { service_type: String, host: String },

    /// A remote call could not complete. `status` is the unexpected HTTP
    /// status when one was received.
    #[error("Transport failure (status {status:?}): {message}")]
    Transport { status: Option<u16>, message: String },

    #[error("No eligible host for job type {0}")]
    NoEligibleHost(String),

    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: JobId, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} was already claimed by another dispatcher")]
    AlreadyClaimed(JobId),

    #[error("Host {host} still processes {active} job(s)")]
    HostHasActiveJobs { host: String, active: usize },

    #[error("Job {0} is running and must be canceled first")]
    JobRunning(JobId),

    #[error("Job store is at capacity ({0} jobs)")]
    CapacityExceeded(usize),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl DispatchError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        DispatchError::Transport {
            status,
            message: message.into(),
        }
    }

    /// True for the not-found family, which is never retried automatically.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DispatchError::JobNotFound(_)
                | DispatchError::HostNotFound(_)
                | DispatchError::ServiceNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
