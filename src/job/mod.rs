//! # Job Record
//!
//! Persistent-within-process state for one submitted workload. The record is
//! owned exclusively by the reconciliation engine that created it and is torn
//! down only after reaching a terminal phase and being released by the owning
//! scheduler. Mutators here keep the timestamp and attempt bookkeeping
//! honest; the engine decides when to call them.

pub mod states;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::channel::{CallHandle, CallKind, JobSpec, RemoteNotification};
use crate::endpoint::EndpointHealth;

pub use states::{ControllerPhase, DesiredState, RemoteJobState, RestartReason, TerminalKind};

/// Stable identity for one job within this controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey(Uuid);

impl JobKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The single remote call currently in flight for a job, if any. The handle
/// stays reserved even after a timeout, until the channel confirms completion
/// or abandonment, so two in-flight calls can never be conflated.
#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingCall {
    pub handle: CallHandle,
    pub kind: CallKind,
    pub issued_at: DateTime<Utc>,
    /// Set once the call exceeded the channel timeout; failed for policy
    /// purposes but the handle is still live
    pub timed_out: bool,
}

/// How an outstanding call resolved, latched for the next evaluate to
/// consume
#[derive(Debug, Clone, PartialEq)]
pub enum CallResolution {
    Succeeded,
    TransientFailure(Option<i32>),
    Rejected(Option<i32>),
}

/// Remote stdout/stderr growth between probes. A job that looks alive but
/// whose output has not grown for longer than the grace window is escalated
/// like a channel timeout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputWait {
    pub output_size: u64,
    pub error_size: u64,
    pub last_growth: Option<DateTime<Utc>>,
}

impl OutputWait {
    /// Fold in sizes from a probe; returns true if either stream grew
    pub fn update(&mut self, output: u64, error: u64, now: DateTime<Utc>) -> bool {
        let grew = output > self.output_size || error > self.error_size;
        self.output_size = self.output_size.max(output);
        self.error_size = self.error_size.max(error);
        if grew || self.last_growth.is_none() {
            self.last_growth = Some(now);
        }
        grew
    }

    /// Whether output has been flat past the grace window
    pub fn stalled(&self, now: DateTime<Utc>, grace: std::time::Duration) -> bool {
        match self.last_growth {
            Some(last) => {
                now.signed_duration_since(last)
                    > chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX)
            }
            None => false,
        }
    }
}

/// One-shot latches so duplicated notifications never double-log
/// user-visible milestones
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MilestoneLog {
    pub submit_logged: bool,
    pub execute_logged: bool,
    pub terminate_logged: bool,
}

/// State for one job under reconciliation
#[derive(Debug)]
pub struct JobRecord {
    pub key: JobKey,
    pub spec: JobSpec,

    /// Locally intended outcome; mutated only by the scheduler/operator
    pub desired_state: DesiredState,
    phase: ControllerPhase,
    pub phase_entered_at: DateTime<Utc>,

    /// Last state the endpoint reported, possibly stale
    pub observed_remote_state: RemoteJobState,
    pub observed_error_code: Option<i32>,
    pub remote_state_entered_at: DateTime<Utc>,
    /// Pre-error state retained so an error report that itself fails
    /// validation can be rolled back once acknowledged
    pub remote_state_before_failure: Option<RemoteJobState>,

    /// Most recent notification not yet merged; a second arrival overwrites
    pub pending_callback: Option<RemoteNotification>,
    pub coalesced_callbacks: u64,
    pub stale_notifications: u64,
    pub last_contact_at: Option<DateTime<Utc>>,

    /// Remote-side identity once the endpoint assigned one
    pub session_contact: Option<String>,

    pub submit_attempts: u32,
    pub last_submit_at: Option<DateTime<Utc>>,
    pub last_submit_failure: Option<i32>,

    pub restart_attempts: u32,
    pub restart_attempts_since_submit: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub last_restart_reason: Option<RestartReason>,
    /// Set after a restart handshake until the session proves itself within
    /// the commit window
    pub awaiting_restart_commit: bool,

    pub credential_expires_at: Option<DateTime<Utc>>,
    /// Stamped when a refresh call resolves, spacing further attempts
    pub last_credential_refresh_at: Option<DateTime<Utc>>,

    pub outstanding_call: Option<OutstandingCall>,
    /// Resolution of the last completed call, consumed by the next evaluate
    pub last_resolved: Option<(CallKind, CallResolution)>,

    pub endpoint: Arc<EndpointHealth>,

    /// Operator-requested resubmit vs one the engine decided on itself
    pub wants_resubmission: bool,
    pub resubmission_requested: bool,

    /// Force a probe on the next evaluate regardless of the probe interval
    pub probe_now: bool,
    pub last_probe_at: Option<DateTime<Utc>>,

    /// One bounded best-effort cancel is attempted before Terminal(Removed)
    pub cancel_attempted: bool,

    pub output_wait: OutputWait,
    pub milestones: MilestoneLog,
}

impl JobRecord {
    pub fn new(spec: JobSpec, endpoint: Arc<EndpointHealth>, now: DateTime<Utc>) -> Self {
        let credential_expires_at = spec.credential_expires_at;
        Self {
            key: JobKey::new(),
            spec,
            desired_state: DesiredState::default(),
            phase: ControllerPhase::default(),
            phase_entered_at: now,
            observed_remote_state: RemoteJobState::default(),
            observed_error_code: None,
            remote_state_entered_at: now,
            remote_state_before_failure: None,
            pending_callback: None,
            coalesced_callbacks: 0,
            stale_notifications: 0,
            last_contact_at: None,
            session_contact: None,
            submit_attempts: 0,
            last_submit_at: None,
            last_submit_failure: None,
            restart_attempts: 0,
            restart_attempts_since_submit: 0,
            last_restart_at: None,
            last_restart_reason: None,
            awaiting_restart_commit: false,
            credential_expires_at,
            last_credential_refresh_at: None,
            outstanding_call: None,
            last_resolved: None,
            endpoint,
            wants_resubmission: false,
            resubmission_requested: false,
            probe_now: false,
            last_probe_at: None,
            cancel_attempted: false,
            output_wait: OutputWait::default(),
            milestones: MilestoneLog::default(),
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    /// Move to a new phase, stamping `phase_entered_at`. Callers must not use
    /// this for the routine Monitoring self-loop; same-phase entries are
    /// rejected so probe traffic cannot perturb the stuck-phase clock.
    pub fn enter_phase(&mut self, phase: ControllerPhase, now: DateTime<Utc>) {
        if self.phase == phase {
            return;
        }
        debug!(
            job = %self.key,
            from = %self.phase,
            to = %phase,
            "Phase transition"
        );
        self.phase = phase;
        self.phase_entered_at = now;
    }

    /// Store a freshly delivered notification. At most one is held; a second
    /// arrival overwrites the first and the overwrite is counted as a
    /// coalesced notification.
    pub fn store_callback(&mut self, notification: RemoteNotification) {
        if self.pending_callback.replace(notification).is_some() {
            self.coalesced_callbacks += 1;
        }
    }

    /// Apply a validated remote state to the observed fields. The caller
    /// (the engine) is responsible for running the transition guard first.
    pub fn apply_remote_state(
        &mut self,
        state: RemoteJobState,
        error_code: Option<i32>,
        now: DateTime<Utc>,
    ) {
        if state == RemoteJobState::Failed && self.observed_remote_state != RemoteJobState::Failed {
            self.remote_state_before_failure = Some(self.observed_remote_state);
        }
        if state != self.observed_remote_state {
            debug!(
                job = %self.key,
                from = %self.observed_remote_state,
                to = %state,
                error_code = ?error_code,
                "Remote state advanced"
            );
            self.observed_remote_state = state;
            self.remote_state_entered_at = now;
        }
        self.observed_error_code = error_code;
        self.last_contact_at = Some(now);
        self.awaiting_restart_commit = false;
    }

    /// Bookkeeping for an issued call; enforced by the engine to never
    /// overlap an existing outstanding call
    pub fn note_call_issued(&mut self, kind: CallKind, handle: CallHandle, now: DateTime<Utc>) {
        debug_assert!(self.outstanding_call.is_none());
        self.outstanding_call = Some(OutstandingCall {
            handle,
            kind,
            issued_at: now,
            timed_out: false,
        });
        match kind {
            CallKind::Submit => {
                self.submit_attempts += 1;
                self.last_submit_at = Some(now);
                self.restart_attempts_since_submit = 0;
            }
            CallKind::RestartSession => {
                self.restart_attempts += 1;
                self.restart_attempts_since_submit += 1;
                self.last_restart_at = Some(now);
            }
            CallKind::Poll => {
                self.last_probe_at = Some(now);
                self.probe_now = false;
            }
            CallKind::Cancel => {
                self.cancel_attempted = true;
            }
            CallKind::RefreshCredentials => {}
        }
    }

    /// Clear the outstanding call and latch its resolution for the next
    /// evaluate. Returns the kind of call that resolved, or None if the
    /// handle did not match (late completion for a superseded call).
    pub fn resolve_call(
        &mut self,
        handle: CallHandle,
        resolution: CallResolution,
    ) -> Option<CallKind> {
        match &self.outstanding_call {
            Some(call) if call.handle == handle => {
                let kind = call.kind;
                self.outstanding_call = None;
                self.last_resolved = Some((kind, resolution));
                Some(kind)
            }
            _ => None,
        }
    }

    /// Time since the endpoint last proved the session alive, via callback
    /// or successful probe
    pub fn since_last_contact(&self, now: DateTime<Utc>) -> chrono::Duration {
        let anchor = self
            .last_contact_at
            .unwrap_or(self.phase_entered_at)
            .min(now);
        now.signed_duration_since(anchor)
    }

    /// Full state dump for fatal-error logging
    pub fn state_dump(&self) -> serde_json::Value {
        serde_json::json!({
            "job": self.key.to_string(),
            "desired_state": self.desired_state,
            "phase": self.phase,
            "phase_entered_at": self.phase_entered_at,
            "observed_remote_state": self.observed_remote_state,
            "observed_error_code": self.observed_error_code,
            "session_contact": self.session_contact,
            "submit_attempts": self.submit_attempts,
            "restart_attempts": self.restart_attempts,
            "restart_attempts_since_submit": self.restart_attempts_since_submit,
            "outstanding_call": self.outstanding_call.as_ref().map(|c| {
                serde_json::json!({
                    "handle": c.handle.to_string(),
                    "kind": c.kind,
                    "issued_at": c.issued_at,
                    "timed_out": c.timed_out,
                })
            }),
            "coalesced_callbacks": self.coalesced_callbacks,
            "stale_notifications": self.stale_notifications,
            "endpoint": self.endpoint.name(),
        })
    }
}
