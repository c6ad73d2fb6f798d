//! # Reconciliation Engine
//!
//! The event-driven state machine for one job. `evaluate` is level-triggered
//! and idempotent: it re-derives the next action purely from the current
//! job record and endpoint health, never from the reason it was woken, so
//! duplicated wake-ups (a callback and a timer firing for the same event)
//! are harmless. One invocation issues at most one remote call.
//!
//! The engine itself performs no I/O. It returns a [`Next`] describing the
//! single action to take and the deadline at which to re-evaluate if nothing
//! else wakes the job first; the driver executes it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::guards::{allow_transition, TransitionCheck};
use crate::channel::{CallCompletion, CallKind};
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::job::{
    CallResolution, ControllerPhase, DesiredState, JobRecord, RemoteJobState, RestartReason,
    TerminalKind,
};
use crate::policy::{self, FailureClass, PolicyDecision};

/// The single externally visible action decided by one evaluate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Issue this call on the remote channel for this job
    IssueCall(CallKind),
    /// The job reached a terminal phase; publish the event and tear down
    EmitTerminal(TerminalKind),
}

/// Outcome of one evaluate: at most one action, plus the time at which to
/// re-evaluate if no callback or completion arrives first
#[derive(Debug, Clone, PartialEq)]
pub struct Next {
    pub action: Option<Action>,
    pub deadline: Option<DateTime<Utc>>,
}

impl Next {
    fn idle() -> Self {
        Self {
            action: None,
            deadline: None,
        }
    }

    fn at(deadline: DateTime<Utc>) -> Self {
        Self {
            action: None,
            deadline: Some(deadline),
        }
    }

    fn act(action: Action) -> Self {
        Self {
            action: Some(action),
            deadline: None,
        }
    }

    fn act_until(action: Action, deadline: DateTime<Utc>) -> Self {
        Self {
            action: Some(action),
            deadline: Some(deadline),
        }
    }
}

/// Per-job reconciliation state machine. Shared by all jobs; all per-job
/// state lives in the [`JobRecord`].
#[derive(Debug, Clone)]
pub struct Reconciler {
    config: Arc<ReconcilerConfig>,
}

impl Reconciler {
    pub fn new(config: Arc<ReconcilerConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Merge a call completion delivered by the channel into the record and
    /// the endpoint health tracker. Does not transition phases; the next
    /// evaluate consumes the latched resolution.
    pub fn absorb_completion(
        &self,
        record: &mut JobRecord,
        completion: CallCompletion,
        now: DateTime<Utc>,
    ) {
        let Some(outstanding) = record.outstanding_call.clone() else {
            warn!(
                job = %record.key,
                handle = %completion.handle,
                "Completion with no outstanding call, ignoring"
            );
            return;
        };
        if outstanding.handle != completion.handle {
            warn!(
                job = %record.key,
                expected = %outstanding.handle,
                got = %completion.handle,
                "Completion for a superseded call, ignoring"
            );
            return;
        }

        // Reachability accounting. A rejection is still a round trip, so it
        // counts as endpoint success; a timeout already marked as failed is
        // not counted twice.
        match policy::classify_outcome(&completion.outcome) {
            None | Some(FailureClass::Rejected) => record.endpoint.record_success(),
            Some(FailureClass::Transient) => {
                if !outstanding.timed_out {
                    record.endpoint.record_failure(&self.config.endpoint, now);
                }
            }
        }

        let resolution = match policy::classify_outcome(&completion.outcome) {
            None => CallResolution::Succeeded,
            Some(FailureClass::Transient) => CallResolution::TransientFailure(completion.error_code),
            Some(FailureClass::Rejected) => {
                let code = match &completion.outcome {
                    crate::channel::CallOutcome::Rejected { code, .. } => Some(*code),
                    _ => completion.error_code,
                };
                CallResolution::Rejected(code)
            }
        };
        let succeeded = matches!(resolution, CallResolution::Succeeded);
        match &resolution {
            CallResolution::TransientFailure(code) if outstanding.kind == CallKind::Submit => {
                record.last_submit_failure = *code;
            }
            CallResolution::Rejected(code) if outstanding.kind == CallKind::Submit => {
                record.last_submit_failure = *code;
            }
            _ => {}
        }
        record.resolve_call(completion.handle, resolution);
        if outstanding.kind == CallKind::RefreshCredentials {
            record.last_credential_refresh_at = Some(now);
        }

        if succeeded {
            if let Some(session) = completion.session {
                if record.session_contact.as_deref() != Some(session.as_str()) {
                    info!(job = %record.key, session, "Remote session assigned");
                    record.session_contact = Some(session);
                }
            }
            if let Some(expiry) = completion.new_credential_expiry {
                record.credential_expires_at = Some(expiry);
            }
            if let Some(state) = completion.remote_state {
                self.merge_observation(record, state, completion.error_code, now);
            }
            if outstanding.kind == CallKind::Poll {
                record.last_contact_at = Some(now);
                record.awaiting_restart_commit = false;
                if let (Some(out), Some(err)) = (completion.output_size, completion.error_size) {
                    record.output_wait.update(out, err, now);
                }
            }
        }
    }

    /// Run the state machine once. Returns the action to execute (at most
    /// one remote call) and the next re-evaluation deadline.
    pub fn evaluate(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<Next> {
        if record.phase().is_terminal() {
            // An in-flight call resolving against a terminal state is a no-op
            record.pending_callback = None;
            record.last_resolved = None;
            return Ok(Next::idle());
        }

        self.merge_pending_callback(record, now);
        self.mark_call_timeout(record, now);

        if record.desired_state == DesiredState::Removed {
            return self.evaluate_removal(record, now);
        }

        match record.phase() {
            ControllerPhase::Unsubmitted => self.evaluate_unsubmitted(record, now),
            ControllerPhase::Submitting => self.evaluate_submitting(record, now),
            ControllerPhase::AwaitingAck => self.evaluate_awaiting_ack(record, now),
            ControllerPhase::Monitoring => self.evaluate_monitoring(record, now),
            ControllerPhase::RestartingJobManager => self.evaluate_restarting(record, now),
            ControllerPhase::Completing => Ok(self.evaluate_completing(record, now)),
            ControllerPhase::Terminal(_) => Ok(Next::idle()),
        }
    }

    /// Apply a pending notification through the transition guard
    fn merge_pending_callback(&self, record: &mut JobRecord, now: DateTime<Utc>) {
        let Some(callback) = record.pending_callback.take() else {
            return;
        };

        // A callback outranks any poll already in flight: force a fresh
        // probe so the merge never trusts a result older than the callback
        if matches!(&record.outstanding_call, Some(c) if c.kind == CallKind::Poll) {
            record.probe_now = true;
        }

        match allow_transition(record, callback.remote_state) {
            TransitionCheck::Allowed => {
                record.apply_remote_state(callback.remote_state, callback.error_code, now);
            }
            TransitionCheck::AllowedRollback => {
                info!(
                    job = %record.key,
                    to = %callback.remote_state,
                    "Rolling back to pre-failure remote state"
                );
                record.apply_remote_state(callback.remote_state, callback.error_code, now);
                record.remote_state_before_failure = None;
            }
            TransitionCheck::Stale { incoming, current } => {
                record.stale_notifications += 1;
                let err = ReconcileError::StaleNotification {
                    job: record.key,
                    incoming,
                    current,
                };
                warn!(job = %record.key, %err, "Discarding stale notification");
            }
        }
    }

    /// Apply a remote state observed during a call completion, with the
    /// same guard as callbacks
    fn merge_observation(
        &self,
        record: &mut JobRecord,
        state: RemoteJobState,
        error_code: Option<i32>,
        now: DateTime<Utc>,
    ) {
        match allow_transition(record, state) {
            TransitionCheck::Allowed => record.apply_remote_state(state, error_code, now),
            TransitionCheck::AllowedRollback => {
                record.apply_remote_state(state, error_code, now);
                record.remote_state_before_failure = None;
            }
            TransitionCheck::Stale { incoming, current } => {
                record.stale_notifications += 1;
                warn!(
                    job = %record.key,
                    incoming,
                    current,
                    "Discarding stale poll observation"
                );
            }
        }
    }

    /// Treat a call unresolved past the channel timeout as failed for policy
    /// purposes. The handle stays reserved until the channel confirms
    /// completion or abandonment, so no new call can be issued meanwhile.
    fn mark_call_timeout(&self, record: &mut JobRecord, now: DateTime<Utc>) {
        let timeout = chrono::Duration::from_std(self.config.call.timeout())
            .unwrap_or(chrono::Duration::MAX);
        let endpoint = record.endpoint.clone();
        if let Some(call) = &mut record.outstanding_call {
            if !call.timed_out && now.signed_duration_since(call.issued_at) >= timeout {
                warn!(
                    job = %record.key,
                    kind = %call.kind,
                    handle = %call.handle,
                    "Remote call exceeded channel timeout"
                );
                call.timed_out = true;
                endpoint.record_failure(&self.config.endpoint, now);
            }
        }
    }

    /// Deadline to re-check an outstanding call, or None once it already
    /// timed out (the channel's eventual completion is the only way on)
    fn outstanding_deadline(&self, record: &JobRecord) -> Option<DateTime<Utc>> {
        record.outstanding_call.as_ref().and_then(|call| {
            if call.timed_out {
                None
            } else {
                Some(
                    call.issued_at
                        + chrono::Duration::from_std(self.config.call.timeout())
                            .unwrap_or(chrono::Duration::MAX),
                )
            }
        })
    }

    /// Removal intent always wins: one bounded best-effort cancel, then
    /// Terminal(Removed) regardless of its outcome.
    fn evaluate_removal(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<Next> {
        if record.outstanding_call.is_some() {
            // Let the in-flight call resolve; its outcome no longer matters
            return Ok(match self.outstanding_deadline(record) {
                Some(t) => Next::at(t),
                None => Next::idle(),
            });
        }
        record.last_resolved = None;

        if !record.cancel_attempted && record.session_contact.is_some() {
            debug!(job = %record.key, "Best-effort remote cancel before removal");
            return Ok(Next::act_until(
                Action::IssueCall(CallKind::Cancel),
                now + chrono::Duration::from_std(self.config.call.timeout())
                    .unwrap_or(chrono::Duration::MAX),
            ));
        }

        record.enter_phase(ControllerPhase::Terminal(TerminalKind::Removed), now);
        Ok(Next::act(Action::EmitTerminal(TerminalKind::Removed)))
    }

    fn evaluate_unsubmitted(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<Next> {
        if !record.desired_state.allows_submission() {
            // Held or already-completed intent: park until the scheduler
            // changes its mind
            return Ok(Next::idle());
        }
        match policy::submission_decision(
            record.submit_attempts,
            record.last_submit_at,
            &record.endpoint,
            record.desired_state,
            &self.config.submit,
            now,
        ) {
            PolicyDecision::Permit => {
                record.enter_phase(ControllerPhase::Submitting, now);
                Ok(self.issue(record, CallKind::Submit, now)?)
            }
            PolicyDecision::DeferUntil(t) => Ok(Next::at(t)),
            PolicyDecision::Abandon => Ok(self.fail_job(record, now)),
        }
    }

    fn evaluate_submitting(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<Next> {
        // A submit can resolve before its issue was ever observed here
        if matches!(&record.last_resolved, Some((CallKind::Submit, _))) {
            record.enter_phase(ControllerPhase::AwaitingAck, now);
            return self.evaluate_awaiting_ack(record, now);
        }

        if let Some(call) = &record.outstanding_call {
            if call.kind == CallKind::Submit {
                // Call accepted by the channel; confirmation still pending
                record.enter_phase(ControllerPhase::AwaitingAck, now);
            }
            return Ok(match self.outstanding_deadline(record) {
                Some(t) => Next::at(t),
                None => Next::idle(),
            });
        }

        match policy::submission_decision(
            record.submit_attempts,
            record.last_submit_at,
            &record.endpoint,
            record.desired_state,
            &self.config.submit,
            now,
        ) {
            PolicyDecision::Permit => Ok(self.issue(record, CallKind::Submit, now)?),
            PolicyDecision::DeferUntil(t) => Ok(Next::at(t)),
            PolicyDecision::Abandon => {
                warn!(
                    job = %record.key,
                    attempts = record.submit_attempts,
                    "Submission attempt budget exhausted"
                );
                Ok(self.fail_job(record, now))
            }
        }
    }

    fn evaluate_awaiting_ack(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<Next> {
        if let Some((kind, resolution)) = record.last_resolved.take() {
            match (kind, resolution) {
                (CallKind::Submit, CallResolution::Succeeded) => {
                    if record.session_contact.is_none() {
                        warn!(
                            job = %record.key,
                            "Submit succeeded without a session contact, retrying"
                        );
                        record.enter_phase(ControllerPhase::Submitting, now);
                        return self.evaluate_submitting(record, now);
                    }
                    if !record.milestones.submit_logged {
                        record.milestones.submit_logged = true;
                        info!(job = %record.key, "Job submitted to endpoint");
                    }
                    // Confirmation arrives as a callback or probe result
                }
                (CallKind::Submit, CallResolution::TransientFailure(code)) => {
                    debug!(job = %record.key, code = ?code, "Submit failed, will retry");
                    record.enter_phase(ControllerPhase::Submitting, now);
                    return self.evaluate_submitting(record, now);
                }
                (CallKind::Submit, CallResolution::Rejected(code)) => {
                    warn!(job = %record.key, code = ?code, "Submit rejected by endpoint");
                    record.observed_error_code = code;
                    return Ok(self.fail_job(record, now));
                }
                (other_kind, resolution) => {
                    debug!(
                        job = %record.key,
                        kind = %other_kind,
                        resolution = ?resolution,
                        "Ignoring resolution not relevant while awaiting ack"
                    );
                }
            }
        }

        // A probe that finds the job already active resolves a lost
        // acknowledgment without resubmitting
        if record.observed_remote_state.is_confirmed() {
            if !record.milestones.execute_logged {
                record.milestones.execute_logged = true;
                info!(
                    job = %record.key,
                    state = %record.observed_remote_state,
                    "Remote execution confirmed"
                );
            }
            record.enter_phase(ControllerPhase::Monitoring, now);
            return Ok(Next::at(now));
        }

        if record.outstanding_call.is_some() {
            return Ok(match self.outstanding_deadline(record) {
                Some(t) => Next::at(t),
                None => Next::idle(),
            });
        }

        if self.credential_refresh_due(record, now) {
            return Ok(self.issue(record, CallKind::RefreshCredentials, now)?);
        }

        // No confirmation yet: probe once the interval elapses
        let next_probe = self.next_probe_at(record);
        if record.session_contact.is_some() && (record.probe_now || next_probe <= now) {
            return Ok(self.issue(record, CallKind::Poll, now)?);
        }
        Ok(Next::at(next_probe))
    }

    fn evaluate_monitoring(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<Next> {
        if let Some((kind, resolution)) = record.last_resolved.take() {
            match (kind, resolution) {
                (CallKind::Poll, CallResolution::Succeeded) => {
                    // Observation already merged during absorb
                }
                (CallKind::Poll, CallResolution::TransientFailure(_))
                | (CallKind::Poll, CallResolution::Rejected(_)) => {
                    if self.unreachable(record, now) {
                        return Ok(self.start_restart(record, RestartReason::Unreachable, now));
                    }
                }
                (CallKind::RefreshCredentials, CallResolution::Succeeded) => {
                    debug!(job = %record.key, "Credentials refreshed");
                }
                (CallKind::RefreshCredentials, _) => {
                    warn!(
                        job = %record.key,
                        "Credential refresh failed, restarting session"
                    );
                    return Ok(self.start_restart(
                        record,
                        RestartReason::CredentialRefreshFailed,
                        now,
                    ));
                }
                (kind, resolution) => {
                    debug!(
                        job = %record.key,
                        kind = %kind,
                        resolution = ?resolution,
                        "Ignoring resolution not relevant while monitoring"
                    );
                }
            }
        }

        if record.observed_remote_state.is_terminal() {
            if !record.milestones.terminate_logged {
                record.milestones.terminate_logged = true;
                info!(
                    job = %record.key,
                    state = %record.observed_remote_state,
                    error_code = ?record.observed_error_code,
                    "Remote execution finished"
                );
            }
            record.enter_phase(ControllerPhase::Completing, now);
            return Ok(Next::at(now));
        }

        // A restarted session must prove itself within the commit window
        if record.awaiting_restart_commit {
            if let Some(restarted) = record.last_restart_at {
                let commit_deadline = restarted
                    + chrono::Duration::from_std(self.config.restart.commit_timeout())
                        .unwrap_or(chrono::Duration::MAX);
                if now >= commit_deadline {
                    warn!(job = %record.key, "Restarted session never confirmed");
                    record.awaiting_restart_commit = false;
                    return Ok(self.start_restart(record, RestartReason::Unreachable, now));
                }
            }
        }

        // A session that looks alive but whose output has stopped growing is
        // escalated the same as a channel timeout
        if record.observed_remote_state == RemoteJobState::Active
            && record
                .output_wait
                .stalled(now, self.config.output_wait.growth_timeout())
            && record.endpoint.is_reachable()
        {
            return Ok(self.start_restart(record, RestartReason::OutputStalled, now));
        }

        if record.outstanding_call.is_some() {
            return Ok(match self.outstanding_deadline(record) {
                Some(t) => Next::at(t),
                None => Next::idle(),
            });
        }

        if record.session_contact.is_none() {
            // Should not happen: Monitoring is only entered after the
            // endpoint confirmed the session. Park rather than spin.
            warn!(job = %record.key, "Monitoring without a session contact");
            return Ok(Next::idle());
        }

        // Proactive credential refresh, independent of probe cadence
        if self.credential_refresh_due(record, now) {
            return Ok(self.issue(record, CallKind::RefreshCredentials, now)?);
        }

        let next_probe = self.next_probe_at(record);
        if record.probe_now || next_probe <= now {
            return Ok(self.issue(record, CallKind::Poll, now)?);
        }

        // Earliest of: next probe, credential refresh point, commit deadline
        let mut deadline = next_probe;
        if let Some(refresh_at) = self.next_credential_refresh_at(record) {
            deadline = deadline.min(refresh_at);
        }
        if record.awaiting_restart_commit {
            if let Some(restarted) = record.last_restart_at {
                deadline = deadline.min(
                    restarted
                        + chrono::Duration::from_std(self.config.restart.commit_timeout())
                            .unwrap_or(chrono::Duration::MAX),
                );
            }
        }
        Ok(Next::at(deadline.max(now)))
    }

    fn evaluate_restarting(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<Next> {
        if let Some((kind, resolution)) = record.last_resolved.take() {
            match (kind, resolution) {
                (CallKind::RestartSession, CallResolution::Succeeded) => {
                    info!(
                        job = %record.key,
                        attempts = record.restart_attempts,
                        "Session restart handshake succeeded"
                    );
                    record.awaiting_restart_commit = true;
                    record.probe_now = true;
                    record.last_contact_at = Some(now);
                    // A successful restart resets the stall clock the same
                    // way it resets last contact: escalating again requires
                    // a full growth window with polls going out in between
                    record.output_wait.last_growth = Some(now);
                    record.enter_phase(ControllerPhase::Monitoring, now);
                    return Ok(Next::at(now));
                }
                (CallKind::RestartSession, CallResolution::TransientFailure(code)) => {
                    debug!(job = %record.key, code = ?code, "Session restart failed, will retry");
                }
                (CallKind::RestartSession, CallResolution::Rejected(code)) => {
                    warn!(job = %record.key, code = ?code, "Session restart rejected");
                    record.observed_error_code = code;
                    return Ok(self.fail_job(record, now));
                }
                (kind, resolution) => {
                    debug!(
                        job = %record.key,
                        kind = %kind,
                        resolution = ?resolution,
                        "Ignoring resolution not relevant while restarting"
                    );
                }
            }
        }

        if record.outstanding_call.is_some() {
            return Ok(match self.outstanding_deadline(record) {
                Some(t) => Next::at(t),
                None => Next::idle(),
            });
        }

        // Expiring credentials would doom the restarted session too
        if self.credential_refresh_due(record, now) {
            return Ok(self.issue(record, CallKind::RefreshCredentials, now)?);
        }

        match policy::restart_decision(
            record.restart_attempts,
            record.last_restart_at,
            &record.endpoint,
            &self.config.restart,
            now,
        ) {
            PolicyDecision::Permit => Ok(self.issue(record, CallKind::RestartSession, now)?),
            PolicyDecision::DeferUntil(t) => Ok(Next::at(t)),
            PolicyDecision::Abandon => {
                warn!(
                    job = %record.key,
                    attempts = record.restart_attempts,
                    "Restart attempt budget exhausted"
                );
                Ok(self.fail_job(record, now))
            }
        }
    }

    fn evaluate_completing(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Next {
        // Operator-requested resubmission intercepts a remote failure
        if record.observed_remote_state == RemoteJobState::Failed
            && (record.wants_resubmission || record.resubmission_requested)
        {
            info!(job = %record.key, "Resubmitting after remote failure");
            record.wants_resubmission = false;
            record.resubmission_requested = false;
            record.session_contact = None;
            record.cancel_attempted = false;
            record.remote_state_before_failure = None;
            record.observed_remote_state = RemoteJobState::Unsubmitted;
            record.observed_error_code = None;
            record.remote_state_entered_at = now;
            record.milestones = Default::default();
            record.output_wait = Default::default();
            record.enter_phase(ControllerPhase::Submitting, now);
            return Next::at(now);
        }

        let kind = match record.observed_remote_state {
            RemoteJobState::Done => TerminalKind::Success,
            _ => TerminalKind::Failed,
        };
        record.enter_phase(ControllerPhase::Terminal(kind), now);
        Next::act(Action::EmitTerminal(kind))
    }

    /// Decide to issue a call, enforcing the one-outstanding-call invariant.
    /// The driver performs the actual channel call and then records the
    /// handle via [`JobRecord::note_call_issued`].
    fn issue(&self, record: &JobRecord, kind: CallKind, now: DateTime<Utc>) -> Result<Next> {
        if let Some(existing) = &record.outstanding_call {
            return Err(ReconcileError::Fatal(format!(
                "attempted to issue {kind} while {} call {} is outstanding",
                existing.kind, existing.handle
            )));
        }
        Ok(Next::act_until(
            Action::IssueCall(kind),
            now + chrono::Duration::from_std(self.config.call.timeout())
                .unwrap_or(chrono::Duration::MAX),
        ))
    }

    fn fail_job(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Next {
        record.enter_phase(ControllerPhase::Terminal(TerminalKind::Failed), now);
        Next::act(Action::EmitTerminal(TerminalKind::Failed))
    }

    fn start_restart(&self, record: &mut JobRecord, reason: RestartReason, now: DateTime<Utc>) -> Next {
        warn!(job = %record.key, %reason, "Declaring remote session unhealthy");
        record.last_restart_reason = Some(reason);
        record.enter_phase(ControllerPhase::RestartingJobManager, now);
        Next::at(now)
    }

    /// No callback within the channel timeout and the probe also failed,
    /// while the endpoint itself is up
    fn unreachable(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        let timeout = chrono::Duration::from_std(self.config.call.timeout())
            .unwrap_or(chrono::Duration::MAX);
        record.since_last_contact(now) >= timeout && record.endpoint.is_reachable()
    }

    /// When the next proactive refresh should go out, if an expiry is known.
    /// Attempts are spaced by the retry interval so a refresh that resolves
    /// without moving the expiry cannot loop back-to-back.
    fn next_credential_refresh_at(&self, record: &JobRecord) -> Option<DateTime<Utc>> {
        let expiry = record.credential_expires_at?;
        let window = chrono::Duration::from_std(self.config.credentials.refresh_window())
            .unwrap_or(chrono::Duration::MAX);
        let due = expiry - window;
        match record.last_credential_refresh_at {
            Some(last) => {
                let spacing = chrono::Duration::from_std(self.config.credentials.retry_interval())
                    .unwrap_or(chrono::Duration::MAX);
                Some(due.max(last + spacing))
            }
            None => Some(due),
        }
    }

    /// Expiry drives refresh in any phase that holds a session
    fn credential_refresh_due(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        record.session_contact.is_some()
            && self
                .next_credential_refresh_at(record)
                .is_some_and(|t| now >= t)
    }

    fn next_probe_at(&self, record: &JobRecord) -> DateTime<Utc> {
        let interval = chrono::Duration::from_std(self.config.probe.interval())
            .unwrap_or(chrono::Duration::MAX);
        let anchor = record
            .last_probe_at
            .into_iter()
            .chain(record.last_contact_at)
            .max()
            .unwrap_or(record.phase_entered_at);
        anchor + interval
    }
}
