//! # Remote Call Channel
//!
//! Abstraction over the helper process that performs the actual remote
//! protocol exchange. Calls are asynchronous and rate-limited on the far
//! side: issuing one returns a [`CallHandle`] immediately, and the real
//! outcome arrives later as a [`CallCompletion`]. Protocol variants plug in
//! behind the [`RemoteChannel`] trait; the engine never sees wire details.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::Result;
use crate::job::states::RemoteJobState;

/// Identity of one in-flight remote call. Never reused while the channel may
/// still deliver a completion for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallHandle(Uuid);

impl CallHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The verb an outstanding call is performing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Submit,
    Poll,
    Cancel,
    RestartSession,
    RefreshCredentials,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submit => write!(f, "submit"),
            Self::Poll => write!(f, "poll"),
            Self::Cancel => write!(f, "cancel"),
            Self::RestartSession => write!(f, "restart_session"),
            Self::RefreshCredentials => write!(f, "refresh_credentials"),
        }
    }
}

/// How a remote call finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// The endpoint performed the request
    Success,
    /// The channel gave up waiting; the endpoint may or may not have acted
    Timeout,
    /// The channel could not reach the endpoint
    TransportError(String),
    /// The endpoint explicitly refused the request
    Rejected { code: i32, reason: String },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Completion notification for a previously issued call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallCompletion {
    pub handle: CallHandle,
    pub outcome: CallOutcome,
    /// Remote state observed while performing the call, if the verb learns it
    pub remote_state: Option<RemoteJobState>,
    /// Endpoint error code accompanying the observed state
    pub error_code: Option<i32>,
    /// Session contact assigned by the endpoint (submit only)
    pub session: Option<String>,
    /// Remote stdout size at poll time, when the endpoint reports it
    pub output_size: Option<u64>,
    /// Remote stderr size at poll time, when the endpoint reports it
    pub error_size: Option<u64>,
    /// New credential lifetime after a successful refresh
    pub new_credential_expiry: Option<DateTime<Utc>>,
}

impl CallCompletion {
    /// A bare completion with no status payload
    pub fn of(handle: CallHandle, outcome: CallOutcome) -> Self {
        Self {
            handle,
            outcome,
            remote_state: None,
            error_code: None,
            session: None,
            output_size: None,
            error_size: None,
            new_credential_expiry: None,
        }
    }
}

/// Unsolicited remote-state notification, delivered by session key. Possibly
/// delayed, duplicated, or out of order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNotification {
    pub remote_state: RemoteJobState,
    pub error_code: Option<i32>,
    pub received_at: DateTime<Utc>,
}

impl RemoteNotification {
    pub fn new(remote_state: RemoteJobState, error_code: Option<i32>) -> Self {
        Self {
            remote_state,
            error_code,
            received_at: Utc::now(),
        }
    }
}

/// What to run, where. The wire grammar of the submission protocol is the
/// channel implementation's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// When the submission credentials lapse, if the caller knows
    #[serde(default)]
    pub credential_expires_at: Option<DateTime<Utc>>,
}

/// Asynchronous, handle-identified command facility to one endpoint family.
/// Implementations must return promptly: the returned handle identifies the
/// in-flight call and the outcome arrives later as a [`CallCompletion`]
/// delivered to the completion sink the implementation was constructed with.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn submit(&self, spec: &JobSpec) -> Result<CallHandle>;
    async fn poll_status(&self, session: &str) -> Result<CallHandle>;
    async fn cancel(&self, session: &str) -> Result<CallHandle>;
    async fn restart_session(&self, session: &str) -> Result<CallHandle>;
    async fn refresh_credentials(&self, session: &str) -> Result<CallHandle>;
}
