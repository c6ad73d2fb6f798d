//! Crate-wide error taxonomy.
//!
//! Failures are split along the lines the retry machinery cares about:
//! transient failures feed the submission/restart policy, rejections are
//! terminal for the job, stale notifications are discarded without touching
//! job state, and fatal errors abort a single job's processing only.

use crate::job::JobKey;

/// Errors surfaced by the reconciliation core
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    /// Timeout, transport error, or endpoint temporarily down; retried per
    /// policy up to the configured ceiling
    #[error("transient failure: {0}")]
    Transient(String),

    /// Endpoint explicitly refused the request; terminal for the job, with
    /// the endpoint's error code preserved verbatim
    #[error("endpoint rejected request (code {code:?}): {reason}")]
    Rejected { code: Option<i32>, reason: String },

    /// Remote-state ordinal regression or unknown session key; logged and
    /// discarded, never mutates the job record
    #[error("stale notification for job {job}: incoming ordinal {incoming} behind {current}")]
    StaleNotification {
        job: JobKey,
        incoming: u8,
        current: u8,
    },

    /// Credentials expired before a refresh completed
    #[error("credentials for job {job} expired before refresh completed")]
    CredentialExpiry { job: JobKey },

    /// Programming invariant violation; aborts the one job's processing,
    /// never the process
    #[error("invariant violated: {0}")]
    Fatal(String),

    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ReconcileError {
    /// Whether the policy may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKey;

    #[test]
    fn test_retryability() {
        assert!(ReconcileError::Transient("timeout".into()).is_retryable());
        assert!(!ReconcileError::Rejected {
            code: Some(7),
            reason: "bad request".into()
        }
        .is_retryable());
        assert!(!ReconcileError::Fatal("double call".into()).is_retryable());
    }

    #[test]
    fn test_stale_notification_display_carries_ordinals() {
        let err = ReconcileError::StaleNotification {
            job: JobKey::new(),
            incoming: 1,
            current: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("ordinal 1"));
        assert!(msg.contains("behind 3"));
    }
}
