use crate::scheduler::job::{JobId, NewJob};

/// The host and job a piece of work is executing on behalf of.
///
/// Passed explicitly to job creation: jobs created inside a running job
/// become its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    host: String,
    current_job: Option<JobId>,
}

impl JobContext {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            current_job: None,
        }
    }

    /// Context of code running as part of `job_id`.
    pub fn for_job(host: impl Into<String>, job_id: JobId) -> Self {
        Self {
            host: host.into(),
            current_job: Some(job_id),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.current_job
    }

    /// Fill in creator and parent where the request leaves them unset.
    pub fn apply(&self, mut request: NewJob) -> NewJob {
        if request.creator_host.is_empty() {
            request.creator_host = self.host.clone();
        }
        if request.parent_id.is_none() {
            request.parent_id = self.current_job;
        }
        request
    }
}
