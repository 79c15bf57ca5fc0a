use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::context::JobContext;
use crate::error::{DispatchError, Result};
use crate::registry::ServiceRegistry;
use crate::scheduler::job::{Job, JobId, JobStatus, NewJob, DEFAULT_JOB_LOAD};
use crate::scheduler::store::JobEvent;
use crate::workflow::retry::{FailureDecision, HoldDecision, RetryPolicy};

fn default_job_load() -> f32 {
    DEFAULT_JOB_LOAD
}

/// One operation of a workflow definition: the job it submits and how its
/// failures are handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperationDefinition {
    /// Operation name, also used as the job operation.
    pub id: String,
    pub job_type: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default = "default_job_load")]
    pub job_load: f32,
    #[serde(default)]
    pub retry_strategy: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<String>,
}

impl OperationDefinition {
    pub fn new(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            arguments: Vec::new(),
            payload: None,
            job_load: DEFAULT_JOB_LOAD,
            retry_strategy: None,
            max_attempts: None,
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

    pub fn with_retry(mut self, strategy: &str, max_attempts: Option<u32>) -> Self {
        self.retry_strategy = Some(strategy.to_string());
        self.max_attempts = max_attempts.map(|n| n.to_string());
        self
    }

    fn job_request(&self) -> NewJob {
        let mut request = NewJob::new(&self.job_type, &self.id)
            .with_arguments(self.arguments.iter().cloned())
            .with_load(self.job_load);
        request.payload = self.payload.clone();
        request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Pending,
    Running { job_id: JobId },
    /// Waiting for an operator [`HoldDecision`].
    Held { failed_job: JobId },
    Succeeded { job_id: JobId },
    Failed { job_id: JobId },
}

impl OperationState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded { .. } | OperationState::Failed { .. }
        )
    }
}

/// Drives the jobs of one operation through its retry policy.
#[derive(Debug, Clone)]
pub struct WorkflowOperation {
    definition: OperationDefinition,
    policy: RetryPolicy,
    state: OperationState,
    jobs: Vec<JobId>,
}

impl WorkflowOperation {
    /// Validate a definition. Bad retry attributes are configuration errors.
    pub fn new(definition: OperationDefinition) -> Result<Self> {
        if definition.id.trim().is_empty() || definition.job_type.trim().is_empty() {
            return Err(DispatchError::Configuration(
                "operation needs an id and a job type".to_string(),
            ));
        }
        let policy = RetryPolicy::from_attributes(
            definition.retry_strategy.as_deref(),
            definition.max_attempts.as_deref(),
        )?;
        Ok(Self {
            definition,
            policy,
            state: OperationState::Pending,
            jobs: Vec::new(),
        })
    }

    pub fn definition(&self) -> &OperationDefinition {
        &self.definition
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Jobs submitted so far, oldest first.
    pub fn jobs(&self) -> &[JobId] {
        &self.jobs
    }

    pub fn attempts(&self) -> u32 {
        self.jobs.len() as u32
    }

    fn submit(&mut self, registry: &ServiceRegistry, context: &JobContext) -> Result<Job> {
        let job = registry.create_job(context, self.definition.job_request())?;
        self.jobs.push(job.id);
        self.state = OperationState::Running { job_id: job.id };
        tracing::info!(
            operation = %self.definition.id,
            job_id = job.id,
            attempt = self.jobs.len(),
            "Operation job submitted"
        );
        Ok(job)
    }

    /// Submit the first attempt.
    pub fn start(&mut self, registry: &ServiceRegistry, context: &JobContext) -> Result<Job> {
        if self.state != OperationState::Pending {
            return Err(DispatchError::InvalidArgument(format!(
                "operation {} was already started",
                self.definition.id
            )));
        }
        self.submit(registry, context)
    }

    /// React to the terminal status of the current job.
    pub fn on_job_finished(
        &mut self,
        registry: &ServiceRegistry,
        context: &JobContext,
        job: &Job,
    ) -> Result<OperationState> {
        let current = match self.state {
            OperationState::Running { job_id } if job_id == job.id => job_id,
            _ => {
                return Err(DispatchError::InvalidArgument(format!(
                    "job {} is not the running job of operation {}",
                    job.id, self.definition.id
                )))
            }
        };

        match job.status {
            JobStatus::Finished => {
                self.state = OperationState::Succeeded { job_id: current };
            }
            // A canceled job ends the operation without retries.
            JobStatus::Canceled => {
                self.state = OperationState::Failed { job_id: current };
            }
            JobStatus::Failed => match self.policy.decide(self.attempts()) {
                FailureDecision::Retry => {
                    tracing::warn!(
                        operation = %self.definition.id,
                        job_id = current,
                        attempt = self.attempts(),
                        max_attempts = self.policy.max_attempts,
                        "Operation job failed, retrying"
                    );
                    self.submit(registry, context)?;
                }
                FailureDecision::Hold => {
                    tracing::warn!(
                        operation = %self.definition.id,
                        job_id = current,
                        "Operation job failed, holding for a decision"
                    );
                    self.state = OperationState::Held {
                        failed_job: current,
                    };
                }
                FailureDecision::Fail => {
                    tracing::error!(
                        operation = %self.definition.id,
                        job_id = current,
                        attempts = self.attempts(),
                        "Operation failed"
                    );
                    self.state = OperationState::Failed { job_id: current };
                }
            },
            status => {
                return Err(DispatchError::InvalidArgument(format!(
                    "job {} is still {}",
                    job.id, status
                )))
            }
        }
        Ok(self.state)
    }

    /// Apply an operator decision to a held operation. Retries after a hold
    /// are not limited by the attempt budget.
    pub fn resume(
        &mut self,
        registry: &ServiceRegistry,
        context: &JobContext,
        decision: HoldDecision,
    ) -> Result<OperationState> {
        let OperationState::Held { failed_job } = self.state else {
            return Err(DispatchError::InvalidArgument(format!(
                "operation {} is not held",
                self.definition.id
            )));
        };

        match decision {
            HoldDecision::Retry => {
                self.submit(registry, context)?;
            }
            HoldDecision::None => {
                self.state = OperationState::Failed { job_id: failed_job };
            }
        }
        tracing::info!(operation = %self.definition.id, decision = ?decision, "Operation resumed");
        Ok(self.state)
    }

    /// Start the operation if needed and follow job events until it either
    /// completes or is held.
    pub async fn run_to_completion(
        &mut self,
        registry: &ServiceRegistry,
        context: &JobContext,
    ) -> Result<OperationState> {
        let mut events = registry.subscribe();
        if self.state == OperationState::Pending {
            self.start(registry, context)?;
        }

        loop {
            let OperationState::Running { job_id } = self.state else {
                return Ok(self.state);
            };

            // The job may have ended before this loop subscribed.
            let job = registry.get_job(job_id)?;
            if job.status.is_terminal() {
                self.on_job_finished(registry, context, &job)?;
                continue;
            }

            match events.recv().await {
                Ok(JobEvent::StatusChanged(job))
                    if job.id == job_id && job.status.is_terminal() =>
                {
                    self.on_job_finished(registry, context, &job)?;
                }
                Ok(JobEvent::Removed(id)) if id == job_id => {
                    return Err(DispatchError::JobNotFound(id));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, job_id, "Operation lagged behind job events");
                }
                Err(RecvError::Closed) => {
                    return Err(DispatchError::JobFailed {
                        job_id,
                        reason: "job event stream closed".to_string(),
                    });
                }
            }
        }
    }
}
