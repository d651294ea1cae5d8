//! Error types for the telemetry subsystem.

use std::sync::{LockResult, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Errors emitted by telemetry components.
///
/// None of these are fatal to the host: a rejected observation or a missing
/// metric only degrades what gets recorded.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The named metric, operation, or health check is not registered.
    #[error("{kind} `{name}` not found")]
    NotFound {
        /// What was being looked up (`metric`, `operation`, `health check`).
        kind: &'static str,
        /// Name that was requested.
        name: String,
    },
    /// A supplied value was malformed or outside the permitted domain.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Human-readable reason for rejection.
        reason: String,
    },
    /// The target is in a state that forbids the operation.
    #[error("invalid state: {reason}")]
    InvalidState {
        /// Human-readable reason for rejection.
        reason: String,
    },
    /// A health probe did not answer within its budget.
    #[error("health check `{name}` timeout after {timeout:?}")]
    Timeout {
        /// Name of the health check.
        name: String,
        /// Budget the probe exceeded.
        timeout: Duration,
    },
    /// Identifier parsing failure.
    #[error(transparent)]
    Id(#[from] agent_primitives::Error),
}

impl TelemetryError {
    /// Builds a [`TelemetryError::NotFound`].
    #[must_use]
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Builds a [`TelemetryError::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Builds a [`TelemetryError::InvalidState`].
    #[must_use]
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}

/// Result alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Maximum accepted length for metric, operation, and check names.
pub(crate) const MAX_NAME_LEN: usize = 200;

pub(crate) fn validate_name(kind: &str, name: &str) -> TelemetryResult<()> {
    if name.trim().is_empty() {
        return Err(TelemetryError::invalid_argument(format!(
            "{kind} name cannot be empty"
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TelemetryError::invalid_argument(format!(
            "{kind} name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

// A panicking producer must not disable telemetry for everyone else.
pub(crate) fn recover<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_mentions_timeout() {
        let err = TelemetryError::Timeout {
            name: "db".into(),
            timeout: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("metric", "requests_total").is_ok());
        assert!(matches!(
            validate_name("metric", "  "),
            Err(TelemetryError::InvalidArgument { .. })
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(validate_name("metric", &long).is_err());
    }
}
