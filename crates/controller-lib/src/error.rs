//! Typed error taxonomy for the controller core
//!
//! Phase-local errors inside the switch orchestrator are captured into
//! terminal switch records rather than propagated; everything else crosses
//! module boundaries as a `CoreError`.

use thiserror::Error;

/// Errors produced by the controller core
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Bad input; never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation refused in the current state (e.g. activating a
    /// non-graduated model, archiving the active model)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A concurrent switch is already in flight; caller must back off
    #[error("conflict: {0}")]
    Conflict(String),

    /// No replacement pool available, not even the stable fallback
    #[error("no candidate available: {0}")]
    NoCandidate(String),

    /// A bounded wait elapsed
    #[error("timed out waiting for {operation} after {waited_secs}s")]
    Timeout { operation: String, waited_secs: u64 },

    /// Transient cloud or cluster API failure; retried with backoff up to a
    /// bounded attempt count before surfacing
    #[error("provider error: {0}")]
    Provider(String),

    /// A core invariant was observed broken (e.g. two active models); fatal,
    /// surfaced to operators, never silently auto-corrected
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl CoreError {
    /// Whether the operation may be retried as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Provider(_) | CoreError::Timeout { .. })
    }

    /// Stable machine-readable kind, used by the API and CLI surfaces
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::InvalidState(_) => "invalid_state",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::NoCandidate(_) => "no_candidate",
            CoreError::Timeout { .. } => "timeout",
            CoreError::Provider(_) => "provider",
            CoreError::InvariantViolation(_) => "invariant_violation",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CoreError::Provider("throttled".into()).is_retryable());
        assert!(CoreError::Timeout {
            operation: "drain".into(),
            waited_secs: 300
        }
        .is_retryable());
        assert!(!CoreError::Conflict("switch in flight".into()).is_retryable());
        assert!(!CoreError::Validation("bad pool".into()).is_retryable());
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(CoreError::NoCandidate("x".into()).kind(), "no_candidate");
        assert_eq!(CoreError::Conflict("x".into()).kind(), "conflict");
    }
}
