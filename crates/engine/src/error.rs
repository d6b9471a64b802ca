//! Error taxonomy for the tower engine
//!
//! Business outcomes (a plan that cannot be fully satisfied, a playbook step
//! that fails) are reported inside structured results. The variants here are
//! reserved for caller mistakes and infrastructure faults.

use std::time::Duration;

use thiserror::Error;

use crate::healing::{IssueType, RemediationStatus};

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Tower ID is not part of the topology
    #[error("unknown tower: {0}")]
    UnknownTower(String),

    /// No neighbor or warm spare can take the requested load
    #[error("no eligible redistribution target for tower {0}")]
    NoEligibleTarget(String),

    /// Issue type is unknown or has no registered playbook
    #[error("no playbook registered for issue type {0}")]
    InvalidIssueType(String),

    #[error("remediation {0} not found")]
    RemediationNotFound(String),

    /// Persistence call exceeded its deadline; nothing was committed
    #[error("persistence call exceeded deadline of {}ms", .0.as_millis())]
    PersistenceTimeout(Duration),

    /// Backing store failed
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Rollback requested for a playbook with rollback disabled
    #[error("rollback is disabled for {0} remediations")]
    PolicyViolation(IssueType),

    #[error("remediation {id} cannot be {action} while {status}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: RemediationStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Returns true if the caller may retry the same call unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::PersistenceTimeout(_))
    }

    /// Returns true for faults of the storage layer rather than the request.
    ///
    /// Infrastructure faults abort a running remediation; everything else
    /// raised while executing a step is recorded on the step instead.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            EngineError::PersistenceTimeout(_)
                | EngineError::Persistence(_)
                | EngineError::Io(_)
                | EngineError::Serialization(_)
        )
    }

    /// Short machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnknownTower(_) => "unknown_tower",
            EngineError::NoEligibleTarget(_) => "no_eligible_target",
            EngineError::InvalidIssueType(_) => "invalid_issue_type",
            EngineError::RemediationNotFound(_) => "remediation_not_found",
            EngineError::PersistenceTimeout(_) => "persistence_timeout",
            EngineError::Persistence(_) => "persistence_failure",
            EngineError::PolicyViolation(_) => "policy_violation",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Io(_) => "io_error",
            EngineError::Serialization(_) => "serialization_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_retryable() {
        assert!(EngineError::PersistenceTimeout(Duration::from_millis(5)).is_retryable());
        assert!(!EngineError::Persistence("disk full".into()).is_retryable());
        assert!(!EngineError::UnknownTower("tower-404".into()).is_retryable());
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(EngineError::Persistence("unreachable".into()).is_infrastructure());
        assert!(!EngineError::NoEligibleTarget("tower-004".into()).is_infrastructure());
        assert!(!EngineError::PolicyViolation(IssueType::HighCpu).is_infrastructure());
    }

    #[test]
    fn test_timeout_message_includes_deadline() {
        let err = EngineError::PersistenceTimeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "persistence call exceeded deadline of 250ms");
    }
}
