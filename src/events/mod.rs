//! Terminal-transition event stream.
//!
//! The scheduling collaborator subscribes here to learn when jobs reach a
//! terminal phase, for bookkeeping and history persistence. Publishing with
//! no subscribers is acceptable and not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobKey, TerminalKind};

/// A job reached a terminal phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub job: JobKey,
    pub kind: TerminalKind,
    /// The endpoint's error code, preserved verbatim, when the endpoint
    /// reported one
    pub error_code: Option<i32>,
    pub at: DateTime<Utc>,
}

/// Broadcast publisher for terminal transitions
#[derive(Debug, Clone)]
pub struct TerminalEventPublisher {
    sender: broadcast::Sender<TerminalEvent>,
}

impl TerminalEventPublisher {
    /// Create a new publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a terminal event. A send with no subscribers is fine; the
    /// event stream is advisory.
    pub fn publish(&self, event: TerminalEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to terminal events
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TerminalEventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
