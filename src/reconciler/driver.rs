//! Per-job driver tasks and the [`JobManager`] facade.
//!
//! The engine in [`super::engine`] is pure; this module gives it hands. Each
//! job gets one tokio task that drains its callback mailbox, runs an
//! evaluation, executes the decision against the [`RemoteChannel`], and then
//! sleeps until the engine's deadline or until something wakes it: a call
//! completion, a routed callback, an endpoint recovering, or an operator
//! changing the desired state.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use crate::callback::{CallbackDemux, CallbackSubscription, JobMailbox};
use crate::channel::{
    CallCompletion, CallHandle, CallKind, CallOutcome, JobSpec, RemoteChannel, RemoteNotification,
};
use crate::config::ReconcilerConfig;
use crate::endpoint::{EndpointHealth, EndpointRegistry};
use crate::error::{ReconcileError, Result};
use crate::events::{TerminalEvent, TerminalEventPublisher};
use crate::job::{ControllerPhase, DesiredState, JobKey, JobRecord, RemoteJobState};

use super::engine::{Action, Reconciler};

/// Shared per-job state between the driver task and the manager
struct JobCell {
    record: Mutex<JobRecord>,
    mailbox: Arc<JobMailbox>,
    /// Woken on completions, desired-state changes, and endpoint recovery
    wake: Arc<Notify>,
    /// Held while the job owns a session route in the demux
    subscription: Mutex<Option<CallbackSubscription>>,
}

/// Point-in-time view of one job, for status queries
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub phase: ControllerPhase,
    pub remote_state: RemoteJobState,
    pub error_code: Option<i32>,
    pub session: Option<String>,
    pub submit_attempts: u32,
    pub restart_attempts: u32,
    pub stale_notifications: u64,
    pub coalesced_callbacks: u64,
}

/// Owns every job under reconciliation: accepts jobs, routes completions and
/// callbacks to them, and publishes terminal events.
///
/// One manager serves any number of jobs across any number of endpoints. The
/// channel implementation delivers [`CallCompletion`]s through
/// [`JobManager::deliver_completion`] and unsolicited notifications through
/// [`JobManager::deliver_notification`]; everything else is driven by the
/// per-job tasks.
pub struct JobManager {
    engine: Reconciler,
    config: Arc<ReconcilerConfig>,
    channel: Arc<dyn RemoteChannel>,
    endpoints: EndpointRegistry,
    demux: Arc<CallbackDemux>,
    terminal: TerminalEventPublisher,
    jobs: DashMap<JobKey, Arc<JobCell>>,
    handles: DashMap<CallHandle, JobKey>,
    /// Completions that arrived before their handle was routed. The channel
    /// may resolve a call faster than the issuing task records it.
    parked_completions: DashMap<CallHandle, (chrono::DateTime<Utc>, CallCompletion)>,
}

impl JobManager {
    pub fn new(config: ReconcilerConfig, channel: Arc<dyn RemoteChannel>) -> Arc<Self> {
        let config = Arc::new(config);
        Arc::new(Self {
            engine: Reconciler::new(config.clone()),
            demux: Arc::new(CallbackDemux::new(config.callback.clone())),
            endpoints: EndpointRegistry::new(),
            terminal: TerminalEventPublisher::default(),
            jobs: DashMap::new(),
            handles: DashMap::new(),
            parked_completions: DashMap::new(),
            channel,
            config,
        })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Accept a job for reconciliation and start driving it. The returned
    /// key identifies the job in every other manager call.
    pub fn create_job(self: &Arc<Self>, spec: JobSpec, endpoint: &str) -> JobKey {
        let endpoint = self.endpoints.get_or_create(endpoint);
        let now = Utc::now();
        let record = JobRecord::new(spec, endpoint.clone(), now);
        let key = record.key;

        let cell = Arc::new(JobCell {
            record: Mutex::new(record),
            mailbox: Arc::new(JobMailbox::new()),
            wake: Arc::new(Notify::new()),
            subscription: Mutex::new(None),
        });
        // Re-evaluate as soon as a suspended endpoint comes back
        endpoint.watch(cell.wake.clone());
        self.jobs.insert(key, cell.clone());

        info!(job = %key, endpoint = endpoint.name(), "Job accepted for reconciliation");

        let manager = Arc::clone(self);
        tokio::spawn(async move { drive(manager, key, cell).await });
        key
    }

    /// Change what the scheduler wants for this job. Setting
    /// [`DesiredState::Removed`] starts the removal path: one best-effort
    /// cancel, then a terminal event.
    pub fn set_desired_state(&self, job: JobKey, desired: DesiredState) -> Result<()> {
        let cell = self.cell(job)?;
        cell.record.lock().desired_state = desired;
        cell.wake.notify_one();
        Ok(())
    }

    /// Ask for an immediate probe, ahead of the normal cadence
    pub fn request_probe(&self, job: JobKey) -> Result<()> {
        let cell = self.cell(job)?;
        cell.record.lock().probe_now = true;
        cell.wake.notify_one();
        Ok(())
    }

    /// Ask for a fresh submission should the remote execution fail
    pub fn request_resubmission(&self, job: JobKey) -> Result<()> {
        let cell = self.cell(job)?;
        cell.record.lock().resubmission_requested = true;
        cell.wake.notify_one();
        Ok(())
    }

    pub fn job_status(&self, job: JobKey) -> Option<JobStatus> {
        let cell = self.jobs.get(&job)?;
        let record = cell.record.lock();
        Some(JobStatus {
            phase: record.phase(),
            remote_state: record.observed_remote_state,
            error_code: record.observed_error_code,
            session: record.session_contact.clone(),
            submit_attempts: record.submit_attempts,
            restart_attempts: record.restart_attempts,
            stale_notifications: record.stale_notifications,
            coalesced_callbacks: record.coalesced_callbacks,
        })
    }

    /// Forget a job that has reached a terminal state, along with any call
    /// routes it still holds. Live jobs cannot be released; remove them
    /// through [`DesiredState::Removed`] first.
    pub fn release_job(&self, job: JobKey) -> Result<()> {
        let cell = self.cell(job)?;
        if !cell.record.lock().phase().is_terminal() {
            return Err(ReconcileError::Fatal(format!(
                "job {job} cannot be released before reaching a terminal state"
            )));
        }
        self.jobs.remove(&job);
        self.handles.retain(|_, owner| *owner != job);
        info!(job = %job, "Job released");
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<EndpointHealth>> {
        self.endpoints.get(name)
    }

    pub fn subscribe_terminal(&self) -> broadcast::Receiver<TerminalEvent> {
        self.terminal.subscribe()
    }

    /// Route a call completion from the channel to the job that issued it.
    /// A completion whose handle is not routed yet is parked: the issuing
    /// task may still be recording it, and the handle must not stay reserved
    /// with its completion lost. Parked entries past the call timeout are
    /// for handles no one will ever claim and are pruned.
    pub fn deliver_completion(&self, completion: CallCompletion) {
        let handle = completion.handle;
        let Some((_, key)) = self.handles.remove(&handle) else {
            self.prune_parked_completions();
            self.parked_completions
                .insert(handle, (Utc::now(), completion));
            // Re-check: the route may have been added while we parked, in
            // which case the issuer already missed the buffer
            if let Some((_, key)) = self.handles.remove(&handle) {
                if let Some((_, (_, parked))) = self.parked_completions.remove(&handle) {
                    self.complete(key, parked);
                }
            }
            return;
        };
        self.complete(key, completion);
    }

    fn complete(&self, key: JobKey, completion: CallCompletion) {
        let Some(cell) = self.jobs.get(&key).map(|c| c.value().clone()) else {
            return;
        };

        let now = Utc::now();
        {
            let mut record = cell.record.lock();
            self.engine.absorb_completion(&mut record, completion, now);

            // First completion to carry a session claims the callback route
            if let Some(session) = record.session_contact.clone() {
                let mut subscription = cell.subscription.lock();
                if subscription.is_none() {
                    *subscription = Some(self.demux.register(&session, key, cell.mailbox.clone()));
                }
            }
        }
        cell.wake.notify_one();
    }

    fn prune_parked_completions(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.call.timeout())
                .unwrap_or(chrono::Duration::MAX);
        self.parked_completions.retain(|handle, (parked_at, _)| {
            let keep = *parked_at > cutoff;
            if !keep {
                warn!(%handle, "Dropping completion no call ever claimed");
            }
            keep
        });
    }

    /// Route an unsolicited remote notification by session key. Notifications
    /// for sessions no job owns yet are held in the demux grace buffer.
    pub fn deliver_notification(&self, session: &str, notification: RemoteNotification) {
        self.demux.deliver(session, notification);
    }

    fn cell(&self, job: JobKey) -> Result<Arc<JobCell>> {
        self.jobs
            .get(&job)
            .map(|c| c.value().clone())
            .ok_or_else(|| ReconcileError::Fatal(format!("unknown job {job}")))
    }

    /// Execute an issue decision: one channel call, then record the handle.
    /// A channel that refuses to even start the call is folded back in as a
    /// transport failure so the normal retry policy applies.
    async fn perform_call(&self, key: JobKey, cell: &JobCell, kind: CallKind) {
        let (spec, session) = {
            let record = cell.record.lock();
            (record.spec.clone(), record.session_contact.clone())
        };

        let result = match (kind, session.as_deref()) {
            (CallKind::Submit, _) => self.channel.submit(&spec).await,
            (CallKind::Poll, Some(s)) => self.channel.poll_status(s).await,
            (CallKind::Cancel, Some(s)) => self.channel.cancel(s).await,
            (CallKind::RestartSession, Some(s)) => self.channel.restart_session(s).await,
            (CallKind::RefreshCredentials, Some(s)) => self.channel.refresh_credentials(s).await,
            (_, None) => Err(ReconcileError::Fatal(
                "session-scoped call issued before a session was assigned".into(),
            )),
        };

        let now = Utc::now();
        match result {
            Ok(handle) => {
                cell.record.lock().note_call_issued(kind, handle, now);
                self.handles.insert(handle, key);
                debug!(job = %key, %kind, %handle, "Remote call issued");
                // Claim a completion that raced the route registration
                if let Some((_, (_, parked))) = self.parked_completions.remove(&handle) {
                    self.handles.remove(&handle);
                    self.complete(key, parked);
                }
            }
            Err(err) => {
                warn!(job = %key, %kind, %err, "Channel refused to start the call");
                let handle = CallHandle::new();
                let mut record = cell.record.lock();
                record.note_call_issued(kind, handle, now);
                self.engine.absorb_completion(
                    &mut record,
                    CallCompletion::of(handle, CallOutcome::TransportError(err.to_string())),
                    now,
                );
            }
        }
    }

}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.jobs.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

/// The per-job loop: evaluate, execute, sleep, repeat until terminal
async fn drive(manager: Arc<JobManager>, key: JobKey, cell: Arc<JobCell>) {
    loop {
        let next = {
            let mut record = cell.record.lock();
            while let Some(notification) = cell.mailbox.drain() {
                record.store_callback(notification);
            }
            if record.session_contact.is_none() {
                // Resubmission dropped the session; release its route
                cell.subscription.lock().take();
            }
            match manager.engine.evaluate(&mut record, Utc::now()) {
                Ok(next) => next,
                Err(err) => {
                    error!(
                        job = %key,
                        %err,
                        state = %record.state_dump(),
                        "Reconciliation halted on invariant violation"
                    );
                    return;
                }
            }
        };

        match next.action {
            Some(Action::IssueCall(kind)) => {
                manager.perform_call(key, &cell, kind).await;
                // Re-evaluate immediately with the call on the books
                continue;
            }
            Some(Action::EmitTerminal(kind)) => {
                let error_code = cell.record.lock().observed_error_code;
                cell.subscription.lock().take();
                info!(job = %key, %kind, "Job reached terminal state");
                manager.terminal.publish(TerminalEvent {
                    job: key,
                    kind,
                    error_code,
                    at: Utc::now(),
                });
                return;
            }
            None => {}
        }

        let wait = next.deadline.map(|deadline| {
            deadline
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
        });
        match wait {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = cell.wake.notified() => {}
                    _ = cell.mailbox.waker.notified() => {}
                }
            }
            None => {
                tokio::select! {
                    _ = cell.wake.notified() => {}
                    _ = cell.mailbox.waker.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct RecordingChannel {
        calls: Mutex<Vec<(CallKind, CallHandle)>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, kind: CallKind) -> Result<CallHandle> {
            let handle = CallHandle::new();
            self.calls.lock().push((kind, handle));
            Ok(handle)
        }

        fn last(&self) -> Option<(CallKind, CallHandle)> {
            self.calls.lock().last().copied()
        }
    }

    #[async_trait]
    impl RemoteChannel for RecordingChannel {
        async fn submit(&self, _spec: &JobSpec) -> Result<CallHandle> {
            self.record(CallKind::Submit)
        }
        async fn poll_status(&self, _session: &str) -> Result<CallHandle> {
            self.record(CallKind::Poll)
        }
        async fn cancel(&self, _session: &str) -> Result<CallHandle> {
            self.record(CallKind::Cancel)
        }
        async fn restart_session(&self, _session: &str) -> Result<CallHandle> {
            self.record(CallKind::RestartSession)
        }
        async fn refresh_credentials(&self, _session: &str) -> Result<CallHandle> {
            self.record(CallKind::RefreshCredentials)
        }
    }

    fn spec() -> JobSpec {
        JobSpec {
            name: "t".into(),
            command: "/bin/true".into(),
            args: vec![],
            environment: HashMap::new(),
            credential_expires_at: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_unknown_job_is_an_error() {
        let manager = JobManager::new(ReconcilerConfig::default(), RecordingChannel::new());
        let err = manager
            .set_desired_state(JobKey::new(), DesiredState::Removed)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_driver_submits_and_reports_status() {
        let channel = RecordingChannel::new();
        let manager = JobManager::new(ReconcilerConfig::default(), channel.clone());
        let key = manager.create_job(spec(), "ep.example.org");

        wait_for(|| channel.last().is_some()).await;
        let (kind, handle) = channel.last().unwrap();
        assert_eq!(kind, CallKind::Submit);

        wait_for(|| {
            manager
                .job_status(key)
                .is_some_and(|s| s.phase == ControllerPhase::AwaitingAck)
        })
        .await;

        let mut completion = CallCompletion::of(handle, CallOutcome::Success);
        completion.session = Some("ep.example.org/901".into());
        manager.deliver_completion(completion);

        wait_for(|| {
            manager
                .job_status(key)
                .is_some_and(|s| s.session.is_some())
        })
        .await;
        assert_eq!(manager.job_status(key).unwrap().submit_attempts, 1);
    }

    #[tokio::test]
    async fn test_callback_confirms_and_completes_the_job() {
        let channel = RecordingChannel::new();
        let manager = JobManager::new(ReconcilerConfig::default(), channel.clone());
        let mut terminal = manager.subscribe_terminal();
        let key = manager.create_job(spec(), "ep.example.org");

        wait_for(|| channel.last().is_some()).await;
        let (_, handle) = channel.last().unwrap();
        let mut completion = CallCompletion::of(handle, CallOutcome::Success);
        completion.session = Some("ep.example.org/902".into());
        manager.deliver_completion(completion);
        wait_for(|| manager.job_status(key).is_some_and(|s| s.session.is_some())).await;

        manager.deliver_notification(
            "ep.example.org/902",
            RemoteNotification::new(RemoteJobState::Active, None),
        );
        wait_for(|| {
            manager
                .job_status(key)
                .is_some_and(|s| s.phase == ControllerPhase::Monitoring)
        })
        .await;

        manager.deliver_notification(
            "ep.example.org/902",
            RemoteNotification::new(RemoteJobState::Done, None),
        );
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), terminal.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job, key);
        assert_eq!(event.kind, crate::job::TerminalKind::Success);
        assert_eq!(event.error_code, None);
    }

    /// Resolves every submit before the call even returns its handle, so
    /// the completion always beats the handle registration
    struct EagerChannel {
        manager: Mutex<Option<Arc<JobManager>>>,
    }

    #[async_trait]
    impl RemoteChannel for EagerChannel {
        async fn submit(&self, _spec: &JobSpec) -> Result<CallHandle> {
            let handle = CallHandle::new();
            let mut completion = CallCompletion::of(handle, CallOutcome::Success);
            completion.session = Some("ep.example.org/903".into());
            let manager = self.manager.lock().clone();
            if let Some(manager) = manager {
                manager.deliver_completion(completion);
            }
            Ok(handle)
        }
        async fn poll_status(&self, _session: &str) -> Result<CallHandle> {
            Ok(CallHandle::new())
        }
        async fn cancel(&self, _session: &str) -> Result<CallHandle> {
            Ok(CallHandle::new())
        }
        async fn restart_session(&self, _session: &str) -> Result<CallHandle> {
            Ok(CallHandle::new())
        }
        async fn refresh_credentials(&self, _session: &str) -> Result<CallHandle> {
            Ok(CallHandle::new())
        }
    }

    #[tokio::test]
    async fn test_completion_racing_handle_registration_is_not_lost() {
        let channel = Arc::new(EagerChannel {
            manager: Mutex::new(None),
        });
        let manager = JobManager::new(ReconcilerConfig::default(), channel.clone());
        *channel.manager.lock() = Some(manager.clone());
        let key = manager.create_job(spec(), "ep.example.org");

        // The completion arrived before the handle was routed; it must still
        // reach the job instead of leaving the handle reserved forever
        wait_for(|| manager.job_status(key).is_some_and(|s| s.session.is_some())).await;
        wait_for(|| {
            manager
                .job_status(key)
                .is_some_and(|s| s.phase == ControllerPhase::AwaitingAck)
        })
        .await;
        let status = manager.job_status(key).unwrap();
        assert_eq!(status.submit_attempts, 1);
        assert_eq!(status.session.as_deref(), Some("ep.example.org/903"));
    }

    #[tokio::test]
    async fn test_release_requires_a_terminal_phase() {
        let channel = RecordingChannel::new();
        let manager = JobManager::new(ReconcilerConfig::default(), channel.clone());
        let mut terminal = manager.subscribe_terminal();
        let key = manager.create_job(spec(), "ep.example.org");

        wait_for(|| channel.last().is_some()).await;
        let (_, handle) = channel.last().unwrap();
        assert!(manager.release_job(key).is_err());

        // Removal with no session yet: the resolved submit is the last step
        manager.set_desired_state(key, DesiredState::Removed).unwrap();
        manager.deliver_completion(CallCompletion::of(handle, CallOutcome::Success));
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), terminal.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, crate::job::TerminalKind::Removed);

        manager.release_job(key).unwrap();
        assert_eq!(manager.job_count(), 0);
        assert!(manager.job_status(key).is_none());
        assert!(manager.release_job(key).is_err());
    }
}
