//! Error taxonomy for the completion barrier
//!
//! `BarrierError` is what a handler invocation reports to its host. The host
//! uses `is_retryable` to decide whether at-least-once redelivery of the
//! notification can make progress.

use std::time::Duration;

/// Failure talking to the ledger store
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Failure calling the review service or the workflow orchestrator
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Request(#[from] sqlx::Error),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Continuation token is not known to the orchestrator")]
    UnknownToken,

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl ClientError {
    /// The token can no longer be used, so retrying the resume is pointless
    pub fn is_stale_token(&self) -> bool {
        matches!(self, ClientError::UnknownToken)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    #[error("Malformed subtask identifier '{identifier}': {reason}")]
    Parse { identifier: String, reason: String },

    #[error(transparent)]
    LedgerUnavailable(#[from] LedgerError),

    #[error("Teardown of review resource '{resource}' failed: {source}")]
    TeardownFailed {
        resource: String,
        #[source]
        source: ClientError,
    },

    #[error("Resuming execution '{execution_id}' failed: {source}")]
    ResumeFailed {
        execution_id: String,
        #[source]
        source: ClientError,
    },

    #[error("Sentinel of execution '{execution_id}' carries no continuation token")]
    CorruptSentinel { execution_id: String },
}

impl BarrierError {
    pub(crate) fn parse(identifier: &str, reason: impl Into<String>) -> Self {
        BarrierError::Parse {
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether redelivering the same notification can make progress
    pub fn is_retryable(&self) -> bool {
        match self {
            BarrierError::Parse { .. } | BarrierError::CorruptSentinel { .. } => false,
            BarrierError::LedgerUnavailable(_) | BarrierError::TeardownFailed { .. } => true,
            BarrierError::ResumeFailed { source, .. } => !source.is_stale_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!BarrierError::parse("nosep", "missing separator").is_retryable());
        assert!(BarrierError::from(LedgerError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(BarrierError::ResumeFailed {
            execution_id: "E1".to_string(),
            source: ClientError::Rejected("throttled".to_string()),
        }
        .is_retryable());
        assert!(!BarrierError::ResumeFailed {
            execution_id: "E1".to_string(),
            source: ClientError::UnknownToken,
        }
        .is_retryable());
    }

    #[test]
    fn test_ledger_error_message_is_surfaced() {
        let err = BarrierError::from(LedgerError::Unavailable("connection refused".to_string()));
        assert_eq!(err.to_string(), "Ledger unavailable: connection refused");
    }
}
