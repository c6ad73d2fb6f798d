//! Transition guard for observed remote state.
//!
//! The endpoint's state ladder only moves forward, so a notification whose
//! ordinal is behind the current observation is stale (out-of-order or
//! duplicated delivery) and must be discarded. The single exception is the
//! post-error rollback: an error report that itself fails validation may be
//! reverted to the retained pre-failure state once acknowledged.

use crate::job::{JobRecord, RemoteJobState};

/// Verdict on an incoming remote-state observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    /// Apply the observation
    Allowed,
    /// Apply it and clear the retained pre-failure state
    AllowedRollback,
    /// Discard without mutating the record
    Stale { incoming: u8, current: u8 },
}

/// Check an incoming observation against the record's current remote state
pub fn allow_transition(record: &JobRecord, incoming: RemoteJobState) -> TransitionCheck {
    let current = record.observed_remote_state;
    if incoming.ordinal() >= current.ordinal() {
        return TransitionCheck::Allowed;
    }
    // Error recovery: a failed state may revert to exactly the state held
    // before the failure, once
    if current == RemoteJobState::Failed && record.remote_state_before_failure == Some(incoming) {
        return TransitionCheck::AllowedRollback;
    }
    TransitionCheck::Stale {
        incoming: incoming.ordinal(),
        current: current.ordinal(),
    }
}
