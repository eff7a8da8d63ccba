//! Error taxonomy shared by the pool, emitter, engine and factory.
//!
//! Callers get a specific category rather than a generic failure so they can
//! tell "try again later" ([`RelayError::CapacityExceeded`]) from "this call was
//! invalid" ([`RelayError::OwnershipViolation`]) from "the work itself failed"
//! ([`RelayError::ExecutionTimeout`] / [`RelayError::ExecutionFailure`]).

use std::time::Duration;

/// Which admission limit rejected a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityScope {
    /// Global cap on concurrently active user contexts.
    ActiveUsers,
    /// Global cap on registered connections.
    GlobalConnections,
    /// Per-user cap on registered connections.
    UserConnections,
}

impl std::fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActiveUsers => f.write_str("active_users"),
            Self::GlobalConnections => f.write_str("global_connections"),
            Self::UserConnections => f.write_str("user_connections"),
        }
    }
}

/// Errors surfaced by relay components.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    /// An admission limit was hit. Rejected immediately, never retried internally.
    #[error("capacity exceeded ({scope}): limit {limit}")]
    CapacityExceeded {
        /// The limit that was hit.
        scope: CapacityScope,
        /// Configured value of that limit.
        limit: usize,
    },

    /// A resource was accessed with a user id that does not own it.
    ///
    /// Carries no detail about the resource or its real owner. The pool itself
    /// answers ownership mismatches with `false`/`None`; this variant is for
    /// callers above it that need to turn such an answer into an error.
    #[error("access denied")]
    OwnershipViolation,

    /// An event could not be delivered after exhausting its retry budget.
    #[error("delivery failed after {attempts} attempts: {reason}")]
    DeliveryFailure {
        /// Attempts made, including the first.
        attempts: u32,
        /// Last failure observed.
        reason: String,
    },

    /// The agent logic did not finish within the execution timeout.
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// The agent logic returned an error.
    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    /// A cleanup step failed. Cleanup continues regardless.
    #[error("cleanup failed: {0}")]
    CleanupFailure(String),

    /// The emitter has been cleaned up and accepts no further events.
    #[error("emitter closed")]
    EmitterClosed,

    /// The factory was used before `configure` was called.
    #[error("factory not configured")]
    NotConfigured,

    /// `configure` was called a second time.
    #[error("factory already configured")]
    AlreadyConfigured,

    /// A context with the same request id is already active.
    #[error("request {0} already has an active context")]
    DuplicateRequest(String),

    /// No live connection is available for the requested binding.
    #[error("connection unavailable")]
    ConnectionUnavailable,

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    /// Whether the caller may retry the same call later and expect success.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// Whether this failure came from the agent logic itself.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::ExecutionTimeout(_) | Self::ExecutionFailure(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::OwnershipViolation => "ownership_violation",
            Self::DeliveryFailure { .. } => "delivery_failure",
            Self::ExecutionTimeout(_) => "execution_timeout",
            Self::ExecutionFailure(_) => "execution_failure",
            Self::CleanupFailure(_) => "cleanup_failure",
            Self::EmitterClosed => "emitter_closed",
            Self::NotConfigured => "not_configured",
            Self::AlreadyConfigured => "already_configured",
            Self::DuplicateRequest(_) => "duplicate_request",
            Self::ConnectionUnavailable => "connection_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_capacity_is_retryable() {
        assert!(
            RelayError::CapacityExceeded {
                scope: CapacityScope::ActiveUsers,
                limit: 100
            }
            .is_retryable()
        );
        assert!(!RelayError::OwnershipViolation.is_retryable());
        assert!(!RelayError::ExecutionFailure("boom".into()).is_retryable());
        assert!(!RelayError::ExecutionTimeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn execution_classification() {
        assert!(RelayError::ExecutionTimeout(Duration::from_secs(1)).is_execution_error());
        assert!(RelayError::ExecutionFailure("x".into()).is_execution_error());
        assert!(!RelayError::EmitterClosed.is_execution_error());
    }

    #[test]
    fn ownership_violation_reveals_nothing() {
        let msg = RelayError::OwnershipViolation.to_string();
        assert_eq!(msg, "access denied");
    }

    #[test]
    fn capacity_message_names_scope() {
        let err = RelayError::CapacityExceeded {
            scope: CapacityScope::UserConnections,
            limit: 2,
        };
        assert_eq!(err.to_string(), "capacity exceeded (user_connections): limit 2");
    }

    #[test]
    fn error_kinds_are_snake_case() {
        let errors = [
            RelayError::OwnershipViolation,
            RelayError::DeliveryFailure {
                attempts: 3,
                reason: "timeout".into(),
            },
            RelayError::CleanupFailure("x".into()),
            RelayError::EmitterClosed,
            RelayError::NotConfigured,
            RelayError::AlreadyConfigured,
            RelayError::DuplicateRequest("req_1".into()),
            RelayError::ConnectionUnavailable,
            RelayError::Internal("x".into()),
        ];
        for err in errors {
            let kind = err.error_kind();
            assert!(
                kind.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "kind '{kind}' must be snake_case"
            );
        }
    }
}
