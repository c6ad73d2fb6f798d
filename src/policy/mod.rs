//! # Submission/Restart Policy
//!
//! Pure decision logic: given attempt counts, elapsed time, and endpoint
//! health, compute whether to act now, defer, or give up. No I/O and no
//! clock reads happen here; callers pass `now` in, which keeps every rule
//! unit-testable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::CallOutcome;
use crate::config::{RestartConfig, SubmitConfig};
use crate::endpoint::EndpointHealth;
use crate::job::DesiredState;

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Act now
    Permit,
    /// Re-evaluate at the given time
    DeferUntil(DateTime<Utc>),
    /// Attempt budget exhausted or desired state forbids the action
    Abandon,
}

/// Retryability classification for a failed remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeout or transport trouble; may succeed on retry
    Transient,
    /// The endpoint explicitly refused the request; retrying cannot help
    Rejected,
}

/// Classify a call outcome for retry purposes. Transport and timeout
/// failures are retryable; an explicit endpoint rejection is terminal.
pub fn classify_outcome(outcome: &CallOutcome) -> Option<FailureClass> {
    match outcome {
        CallOutcome::Success => None,
        CallOutcome::Timeout | CallOutcome::TransportError(_) => Some(FailureClass::Transient),
        CallOutcome::Rejected { .. } => Some(FailureClass::Rejected),
    }
}

/// Decide whether a (re)submission may be issued now.
///
/// Attempts are spaced a fixed `interval` apart, the endpoint-wide
/// suspension is honored, and the budget ceiling abandons the job. The
/// deferral target is `max(endpoint suspension, last attempt + interval)`.
pub fn submission_decision(
    attempts: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    endpoint: &EndpointHealth,
    desired: DesiredState,
    config: &SubmitConfig,
    now: DateTime<Utc>,
) -> PolicyDecision {
    if !desired.allows_submission() {
        return PolicyDecision::Abandon;
    }
    interval_decision(
        attempts,
        config.max_attempts,
        last_attempt_at,
        config.interval(),
        endpoint,
        now,
    )
}

/// Decide whether a session restart may be issued now. Mirrors the
/// submission rules with the restart interval and ceiling; the
/// per-submission restart counter is reset by the job record whenever a new
/// submission (not restart) begins.
pub fn restart_decision(
    attempts: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    endpoint: &EndpointHealth,
    config: &RestartConfig,
    now: DateTime<Utc>,
) -> PolicyDecision {
    interval_decision(
        attempts,
        config.max_attempts,
        last_attempt_at,
        config.interval(),
        endpoint,
        now,
    )
}

fn interval_decision(
    attempts: u32,
    max_attempts: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    interval: std::time::Duration,
    endpoint: &EndpointHealth,
    now: DateTime<Utc>,
) -> PolicyDecision {
    if attempts >= max_attempts {
        return PolicyDecision::Abandon;
    }

    let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
    let spacing_ready = last_attempt_at.map(|last| last + interval);
    let suspension = endpoint.suspended_until(now);

    let earliest = match (spacing_ready, suspension) {
        (None, None) => return PolicyDecision::Permit,
        (Some(t), None) => t,
        (None, Some(t)) => t,
        (Some(a), Some(b)) => a.max(b),
    };

    if earliest <= now {
        PolicyDecision::Permit
    } else {
        PolicyDecision::DeferUntil(earliest)
    }
}
