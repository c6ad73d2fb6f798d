//! End-to-end reconciliation scenarios against a scripted channel.
//!
//! The channel here never acts on its own: each test observes the calls the
//! driver issues and hand-delivers the completions and notifications, which
//! makes the interleavings deterministic without faking clocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::TryRecvError;

use remex_core::channel::{
    CallCompletion, CallHandle, CallKind, CallOutcome, JobSpec, RemoteChannel, RemoteNotification,
};
use remex_core::config::ReconcilerConfig;
use remex_core::job::{ControllerPhase, DesiredState, RemoteJobState, TerminalKind};
use remex_core::reconciler::JobManager;
use remex_core::Result;

#[derive(Debug, Clone)]
struct IssuedCall {
    kind: CallKind,
    handle: CallHandle,
}

/// Records every call the driver issues; tests deliver the completions
struct ScriptedChannel {
    calls: Mutex<Vec<IssuedCall>>,
}

impl ScriptedChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn issue(&self, kind: CallKind) -> Result<CallHandle> {
        let handle = CallHandle::new();
        self.calls.lock().push(IssuedCall { kind, handle });
        Ok(handle)
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn call(&self, index: usize) -> Option<IssuedCall> {
        self.calls.lock().get(index).cloned()
    }
}

#[async_trait]
impl RemoteChannel for ScriptedChannel {
    async fn submit(&self, _spec: &JobSpec) -> Result<CallHandle> {
        self.issue(CallKind::Submit)
    }
    async fn poll_status(&self, _session: &str) -> Result<CallHandle> {
        self.issue(CallKind::Poll)
    }
    async fn cancel(&self, _session: &str) -> Result<CallHandle> {
        self.issue(CallKind::Cancel)
    }
    async fn restart_session(&self, _session: &str) -> Result<CallHandle> {
        self.issue(CallKind::RestartSession)
    }
    async fn refresh_credentials(&self, _session: &str) -> Result<CallHandle> {
        self.issue(CallKind::RefreshCredentials)
    }
}

fn job_spec() -> JobSpec {
    JobSpec {
        name: "integration".into(),
        command: "/usr/bin/compute".into(),
        args: vec!["--input".into(), "dataset.bin".into()],
        environment: HashMap::new(),
        credential_expires_at: None,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn wait_for_call(channel: &ScriptedChannel, index: usize, kind: CallKind) -> IssuedCall {
    wait_for("a remote call", || channel.call_count() > index).await;
    let call = channel.call(index).unwrap();
    assert_eq!(call.kind, kind, "call #{index}");
    call
}

fn success(handle: CallHandle) -> CallCompletion {
    CallCompletion::of(handle, CallOutcome::Success)
}

#[tokio::test]
async fn lifecycle_confirmed_by_probes_alone() {
    // No callbacks at all: every observation comes out of a poll result.
    let mut config = ReconcilerConfig::default();
    config.probe.interval_seconds = 0;
    let channel = ScriptedChannel::new();
    let manager = JobManager::new(config, channel.clone());
    let mut terminal = manager.subscribe_terminal();

    let job = manager.create_job(job_spec(), "compute.example.org");

    let submit = wait_for_call(&channel, 0, CallKind::Submit).await;
    let mut completion = success(submit.handle);
    completion.session = Some("compute.example.org/4411".into());
    manager.deliver_completion(completion);

    // The probe sequence walks the job through its remote lifecycle
    let script = [
        RemoteJobState::PendingRemote,
        RemoteJobState::Active,
        RemoteJobState::Active,
        RemoteJobState::Done,
    ];
    for (i, state) in script.into_iter().enumerate() {
        let poll = wait_for_call(&channel, 1 + i, CallKind::Poll).await;
        let mut completion = success(poll.handle);
        completion.remote_state = Some(state);
        completion.output_size = Some(64 * (i as u64 + 1));
        completion.error_size = Some(0);
        manager.deliver_completion(completion);
    }

    let event = tokio::time::timeout(Duration::from_secs(5), terminal.recv())
        .await
        .expect("terminal event")
        .unwrap();
    assert_eq!(event.job, job);
    assert_eq!(event.kind, TerminalKind::Success);

    let status = manager.job_status(job).unwrap();
    assert_eq!(status.phase, ControllerPhase::Terminal(TerminalKind::Success));
    assert_eq!(status.submit_attempts, 1);
}

#[tokio::test]
async fn removal_waits_out_the_inflight_call() {
    let channel = ScriptedChannel::new();
    let manager = JobManager::new(ReconcilerConfig::default(), channel.clone());
    let mut terminal = manager.subscribe_terminal();

    let job = manager.create_job(job_spec(), "compute.example.org");
    let submit = wait_for_call(&channel, 0, CallKind::Submit).await;

    // Removal lands while the submit is still in flight: nothing new may be
    // issued until the channel resolves the handle
    manager.set_desired_state(job, DesiredState::Removed).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.call_count(), 1);
    assert!(matches!(terminal.try_recv(), Err(TryRecvError::Empty)));

    // The submit turns out to have succeeded, so one best-effort cancel goes
    // out before the job is declared removed
    let mut completion = success(submit.handle);
    completion.session = Some("compute.example.org/4412".into());
    manager.deliver_completion(completion);

    let cancel = wait_for_call(&channel, 1, CallKind::Cancel).await;
    manager.deliver_completion(CallCompletion::of(cancel.handle, CallOutcome::Timeout));

    let event = tokio::time::timeout(Duration::from_secs(5), terminal.recv())
        .await
        .expect("terminal event")
        .unwrap();
    assert_eq!(event.kind, TerminalKind::Removed);
}

#[tokio::test]
async fn endpoint_suspension_gates_the_retry() {
    let mut config = ReconcilerConfig::default();
    config.submit.interval_seconds = 0;
    config.endpoint.failure_threshold = 1;
    config.endpoint.backoff_base_seconds = 1;
    config.endpoint.backoff_max_seconds = 1;
    let channel = ScriptedChannel::new();
    let manager = JobManager::new(config, channel.clone());

    let job = manager.create_job(job_spec(), "flaky.example.org");
    let submit = wait_for_call(&channel, 0, CallKind::Submit).await;
    manager.deliver_completion(CallCompletion::of(
        submit.handle,
        CallOutcome::TransportError("connection refused".into()),
    ));

    wait_for("endpoint suspension", || {
        manager
            .endpoint("flaky.example.org")
            .is_some_and(|e| !e.is_reachable())
    })
    .await;
    // No retry inside the suspension window
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.call_count(), 1);

    // Once the window lapses the retry goes out, and its success clears the
    // endpoint instantly
    let retry = wait_for_call(&channel, 1, CallKind::Submit).await;
    assert_eq!(manager.job_status(job).unwrap().submit_attempts, 2);
    let mut completion = success(retry.handle);
    completion.session = Some("flaky.example.org/1".into());
    manager.deliver_completion(completion);

    wait_for("endpoint recovery", || {
        manager
            .endpoint("flaky.example.org")
            .is_some_and(|e| e.is_reachable())
    })
    .await;
}

#[tokio::test]
async fn never_more_than_one_call_in_flight() {
    let channel = ScriptedChannel::new();
    let manager = JobManager::new(ReconcilerConfig::default(), channel.clone());

    let job = manager.create_job(job_spec(), "compute.example.org");
    wait_for_call(&channel, 0, CallKind::Submit).await;

    // Poke the driver from every direction while the submit is unresolved
    for i in 0..20 {
        manager.request_probe(job).unwrap();
        manager.set_desired_state(job, DesiredState::Running).unwrap();
        manager.deliver_notification(
            &format!("unknown.session/{i}"),
            RemoteNotification::new(RemoteJobState::Active, None),
        );
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.call_count(), 1);
}

#[tokio::test]
async fn late_callbacks_replay_from_the_grace_buffer() {
    let channel = ScriptedChannel::new();
    let manager = JobManager::new(ReconcilerConfig::default(), channel.clone());
    let mut terminal = manager.subscribe_terminal();

    let job = manager.create_job(job_spec(), "compute.example.org");
    let submit = wait_for_call(&channel, 0, CallKind::Submit).await;

    // The endpoint notifies before the submit completion told us the
    // session key; the demux must hold the notification until then
    manager.deliver_notification(
        "compute.example.org/4413",
        RemoteNotification::new(RemoteJobState::Active, None),
    );
    manager.deliver_notification(
        "compute.example.org/4413",
        RemoteNotification::new(RemoteJobState::Done, None),
    );

    let mut completion = success(submit.handle);
    completion.session = Some("compute.example.org/4413".into());
    manager.deliver_completion(completion);

    let event = tokio::time::timeout(Duration::from_secs(5), terminal.recv())
        .await
        .expect("terminal event")
        .unwrap();
    assert_eq!(event.job, job);
    assert_eq!(event.kind, TerminalKind::Success);
}
