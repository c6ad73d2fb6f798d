use serde::{Deserialize, Serialize};
use std::fmt;

/// Locally intended outcome for a job, mutated only by the owning
/// scheduler/operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// Job exists but the scheduler has not asked for it to run yet
    Idle,
    /// Job should be running on the endpoint
    Running,
    /// Job should be torn down, locally and remotely
    Removed,
    /// Job is administratively held, no new remote activity
    Held,
    /// Scheduler considers the job finished and wants finalization only
    Completed,
}

impl DesiredState {
    /// Whether this desired state permits new remote submissions
    pub fn allows_submission(&self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Removed => write!(f, "removed"),
            Self::Held => write!(f, "held"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "removed" => Ok(Self::Removed),
            "held" => Ok(Self::Held),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid desired state: {s}")),
        }
    }
}

impl Default for DesiredState {
    fn default() -> Self {
        Self::Idle
    }
}

/// How a job ended, from the controller's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    /// Remote execution finished successfully
    Success,
    /// Remote execution failed, or the controller gave up on it
    Failed,
    /// Local removal intent won out
    Removed,
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Reconciliation phase for one job. Mutated only by the reconciliation
/// engine; distinct from the endpoint's own reported state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    /// Nothing has been sent to the endpoint yet
    Unsubmitted,
    /// A submit call is due or in flight
    Submitting,
    /// Submit accepted by the channel, waiting for the endpoint to confirm
    /// the job actually started
    AwaitingAck,
    /// Job is live remotely; routine probing and callback consumption
    Monitoring,
    /// The remote session manager is being restarted after unreachability
    /// or credential trouble
    RestartingJobManager,
    /// A terminal remote state arrived; finalizing
    Completing,
    /// Done, one way or another
    Terminal(TerminalKind),
}

impl ControllerPhase {
    /// Check if this is a terminal phase (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Check if the job has remote-side presence in this phase
    pub fn is_live_remotely(&self) -> bool {
        matches!(
            self,
            Self::AwaitingAck | Self::Monitoring | Self::RestartingJobManager | Self::Completing
        )
    }
}

impl fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubmitted => write!(f, "unsubmitted"),
            Self::Submitting => write!(f, "submitting"),
            Self::AwaitingAck => write!(f, "awaiting_ack"),
            Self::Monitoring => write!(f, "monitoring"),
            Self::RestartingJobManager => write!(f, "restarting_job_manager"),
            Self::Completing => write!(f, "completing"),
            Self::Terminal(kind) => write!(f, "terminal_{kind}"),
        }
    }
}

impl Default for ControllerPhase {
    fn default() -> Self {
        Self::Unsubmitted
    }
}

/// Remote-side job state as the endpoint reports it. Possibly stale by the
/// time we read it; ordered by `ordinal` so out-of-order notifications can be
/// detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    /// Endpoint has no record of the job yet
    Unsubmitted,
    /// Accepted by the endpoint, queued but not running
    PendingRemote,
    /// Executing
    Active,
    /// Execution paused remotely; may interleave with Active
    Suspended,
    /// Output transfer in progress
    StageOut,
    /// Finished successfully
    Done,
    /// Finished unsuccessfully or evicted
    Failed,
}

impl RemoteJobState {
    /// Monotonically increasing position in the remote state ladder.
    /// `Suspended` shares Active's ordinal since the two interleave freely.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Unsubmitted => 0,
            Self::PendingRemote => 1,
            Self::Active | Self::Suspended => 2,
            Self::StageOut => 3,
            Self::Done | Self::Failed => 4,
        }
    }

    /// Check if the endpoint considers the job finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Check if the job is confirmed present on the endpoint
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, Self::Unsubmitted)
    }
}

impl fmt::Display for RemoteJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubmitted => write!(f, "unsubmitted"),
            Self::PendingRemote => write!(f, "pending_remote"),
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::StageOut => write!(f, "stage_out"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RemoteJobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsubmitted" => Ok(Self::Unsubmitted),
            "pending_remote" => Ok(Self::PendingRemote),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "stage_out" => Ok(Self::StageOut),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid remote job state: {s}")),
        }
    }
}

impl Default for RemoteJobState {
    fn default() -> Self {
        Self::Unsubmitted
    }
}

/// Why a session restart was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// No callback and probes failing while the endpoint itself is up
    Unreachable,
    /// Proactive credential refresh did not complete before expiry
    CredentialRefreshFailed,
    /// Output stopped growing past the configured grace window
    OutputStalled,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::CredentialRefreshFailed => write!(f, "credential_refresh_failed"),
            Self::OutputStalled => write!(f, "output_stalled"),
        }
    }
}
