//! Workflow operations and their failure handling.
//!
//! An operation submits one job at a time. When that job fails, its
//! [`RetryPolicy`] decides between giving up, resubmitting, or holding the
//! operation until an operator picks a [`HoldDecision`].

pub mod operation;
pub mod retry;

pub use operation::{OperationDefinition, OperationState, WorkflowOperation};
pub use retry::{FailureDecision, HoldDecision, RetryPolicy, RetryStrategy, DEFAULT_MAX_ATTEMPTS};
