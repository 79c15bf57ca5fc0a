//! Health state machine for service registrations.
//!
//! ```text
//!            failure                same-signature failure
//!   NORMAL ──────────▶ WARNING ────────────────────────▶ ERROR
//!     ▲                  │  ▲ other-signature failure      │
//!     │                  │  └──────────┘                   │
//!     └──── success ─────┴───────────── success ───────────┘
//! ```
//!
//! Recovery is optimistic: the first success on a host brings its service
//! straight back to NORMAL.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::service::{HealthState, ServiceRegistration, ServiceRegistrations};
use crate::scheduler::job::JobSignature;

/// Outcome of feeding one job result into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthTransition {
    Unchanged(HealthState),
    Changed { from: HealthState, to: HealthState },
}

impl HealthTransition {
    pub fn state(&self) -> HealthState {
        match self {
            HealthTransition::Unchanged(state) => *state,
            HealthTransition::Changed { to, .. } => *to,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, HealthTransition::Changed { .. })
    }
}

/// Apply a failure with `signature` to a registration.
pub fn apply_failure(
    service: &mut ServiceRegistration,
    signature: &JobSignature,
    now: DateTime<Utc>,
) -> HealthTransition {
    let from = service.health;
    let to = match from {
        HealthState::Normal => HealthState::Warning,
        HealthState::Warning if service.health_signature.as_ref() == Some(signature) => {
            HealthState::Error
        }
        HealthState::Warning => HealthState::Warning,
        HealthState::Error => return HealthTransition::Unchanged(from),
    };

    if to == from && service.health_signature.as_ref() == Some(signature) {
        return HealthTransition::Unchanged(from);
    }

    service.health = to;
    service.health_signature = Some(signature.clone());
    service.health_changed_at = now;

    if to == from {
        HealthTransition::Unchanged(from)
    } else {
        HealthTransition::Changed { from, to }
    }
}

/// Apply a success to a registration.
pub fn apply_success(service: &mut ServiceRegistration, now: DateTime<Utc>) -> HealthTransition {
    let from = service.health;
    if from == HealthState::Normal {
        return HealthTransition::Unchanged(from);
    }
    service.health = HealthState::Normal;
    service.health_signature = None;
    service.health_changed_at = now;
    HealthTransition::Changed {
        from,
        to: HealthState::Normal,
    }
}

/// Feeds job outcomes into service health. The only writer of
/// [`ServiceRegistration::health`].
#[derive(Debug, Clone)]
pub struct HealthTracker {
    services: Arc<ServiceRegistrations>,
}

impl HealthTracker {
    pub fn new(services: Arc<ServiceRegistrations>) -> Self {
        Self { services }
    }

    /// Record a failed job (or failed transport call) of `signature` on `host`.
    pub fn record_failure(&self, signature: &JobSignature, host: &str) -> Result<HealthTransition> {
        let transition = self.services.modify(&signature.job_type, host, |service| {
            apply_failure(service, signature, Utc::now())
        })?;

        match transition {
            HealthTransition::Changed { from, to } if to == HealthState::Error => {
                tracing::error!(
                    service_type = %signature.job_type,
                    host,
                    signature = %signature,
                    from = %from,
                    "Service moved to ERROR, excluded from dispatch"
                );
            }
            HealthTransition::Changed { from, to } => {
                tracing::warn!(
                    service_type = %signature.job_type,
                    host,
                    signature = %signature,
                    from = %from,
                    to = %to,
                    "Service health degraded"
                );
            }
            HealthTransition::Unchanged(state) => {
                tracing::debug!(
                    service_type = %signature.job_type,
                    host,
                    state = %state,
                    "Failure recorded without state change"
                );
            }
        }
        Ok(transition)
    }

    /// Record a successful job of `service_type` on `host`.
    pub fn record_success(&self, service_type: &str, host: &str) -> Result<HealthTransition> {
        let transition = self
            .services
            .modify(service_type, host, |service| apply_success(service, Utc::now()))?;

        if let HealthTransition::Changed { from, .. } = transition {
            tracing::info!(service_type, host, from = %from, "Service recovered to NORMAL");
        }
        Ok(transition)
    }

    /// Operator reset of a service back to NORMAL.
    pub fn sanitize(&self, service_type: &str, host: &str) -> Result<HealthTransition> {
        let transition = self
            .services
            .modify(service_type, host, |service| apply_success(service, Utc::now()))?;
        tracing::info!(service_type, host, "Service sanitized");
        Ok(transition)
    }
}
