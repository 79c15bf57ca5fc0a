use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Attempts made by a `retry` operation when none are configured, the
/// original attempt included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// What a workflow operation does when its job fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// The first failure is final.
    #[default]
    None,
    /// Resubmit until the attempt budget is spent.
    Retry,
    /// Wait for an operator decision.
    Hold,
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStrategy::None => write!(f, "none"),
            RetryStrategy::Retry => write!(f, "retry"),
            RetryStrategy::Hold => write!(f, "hold"),
        }
    }
}

impl FromStr for RetryStrategy {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(RetryStrategy::None),
            "retry" => Ok(RetryStrategy::Retry),
            "hold" => Ok(RetryStrategy::Hold),
            other => Err(DispatchError::Configuration(format!(
                "unknown retry strategy '{}'",
                other
            ))),
        }
    }
}

/// Next step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureDecision {
    Retry,
    Fail,
    Hold,
}

/// Operator answer to a held operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldDecision {
    Retry,
    None,
}

impl FromStr for HoldDecision {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(HoldDecision::Retry),
            "none" => Ok(HoldDecision::None),
            other => Err(DispatchError::InvalidArgument(format!(
                "unknown hold decision '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    /// Attempt budget of the `retry` strategy, the original attempt included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy, max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(DispatchError::Configuration(
                "max-attempts must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            strategy,
            max_attempts,
        })
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn retry(max_attempts: u32) -> Result<Self> {
        Self::new(RetryStrategy::Retry, max_attempts)
    }

    pub fn hold() -> Self {
        Self {
            strategy: RetryStrategy::Hold,
            ..Default::default()
        }
    }

    /// Build a policy from the raw `retry-strategy` and `max-attempts`
    /// attributes of an operation definition.
    pub fn from_attributes(strategy: Option<&str>, max_attempts: Option<&str>) -> Result<Self> {
        let strategy = strategy
            .map(RetryStrategy::from_str)
            .transpose()?
            .unwrap_or_default();
        let max_attempts = match max_attempts {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                DispatchError::Configuration(format!("max-attempts '{}' is not a number", raw))
            })?,
            None => DEFAULT_MAX_ATTEMPTS,
        };
        Self::new(strategy, max_attempts)
    }

    /// Decide what follows the failure of attempt number `attempts`.
    pub fn decide(&self, attempts: u32) -> FailureDecision {
        match self.strategy {
            RetryStrategy::None => FailureDecision::Fail,
            RetryStrategy::Retry if attempts < self.max_attempts => FailureDecision::Retry,
            RetryStrategy::Retry => FailureDecision::Fail,
            RetryStrategy::Hold => FailureDecision::Hold,
        }
    }
}
