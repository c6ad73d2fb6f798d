//! # Callback Demultiplexer
//!
//! Routes asynchronous remote-state notifications, keyed by the externally
//! assigned session identifier, to the job registered for that session.
//! Delivery never runs job logic inline: it only stores the notification in
//! the job's mailbox and wakes its driver. Notifications for sessions with
//! no registered job are buffered for a bounded grace period to cover the
//! race between deregistration and in-flight delivery, then dropped with a
//! logged anomaly.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::channel::RemoteNotification;
use crate::config::CallbackConfig;
use crate::job::JobKey;

/// Per-job notification slot plus waker. The demultiplexer writes here; the
/// job's driver drains it on its next wake-up. At most one notification is
/// held; a newer arrival overwrites and the overwrite is counted.
#[derive(Debug, Default)]
pub struct JobMailbox {
    slot: Mutex<Option<RemoteNotification>>,
    coalesced: std::sync::atomic::AtomicU64,
    pub waker: Notify,
}

impl JobMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a notification, overwriting any unconsumed one
    pub fn deliver(&self, notification: RemoteNotification) {
        if self.slot.lock().replace(notification).is_some() {
            self.coalesced
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        self.waker.notify_one();
    }

    /// Take the pending notification, if any
    pub fn drain(&self) -> Option<RemoteNotification> {
        self.slot.lock().take()
    }

    /// How many notifications were overwritten before being consumed
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct BufferedNotification {
    session: String,
    notification: RemoteNotification,
    buffered_at: DateTime<Utc>,
}

/// Session-keyed router for unsolicited remote notifications
#[derive(Debug)]
pub struct CallbackDemux {
    config: CallbackConfig,
    routes: DashMap<String, (JobKey, Arc<JobMailbox>)>,
    grace_buffer: Mutex<Vec<BufferedNotification>>,
}

impl CallbackDemux {
    pub fn new(config: CallbackConfig) -> Self {
        Self {
            config,
            routes: DashMap::new(),
            grace_buffer: Mutex::new(Vec::new()),
        }
    }

    /// Register a job for a session key. Any notification buffered for the
    /// session within the grace window is delivered immediately. The
    /// returned subscription deregisters on drop.
    pub fn register(
        self: &Arc<Self>,
        session: &str,
        job: JobKey,
        mailbox: Arc<JobMailbox>,
    ) -> CallbackSubscription {
        self.routes
            .insert(session.to_string(), (job, mailbox.clone()));
        debug!(session, %job, "Callback route registered");

        let now = Utc::now();
        let mut buffer = self.grace_buffer.lock();
        let mut kept = Vec::with_capacity(buffer.len());
        for entry in buffer.drain(..) {
            if entry.session == session {
                debug!(session, %job, "Replaying grace-buffered notification");
                mailbox.deliver(entry.notification);
            } else if !self.expired(&entry, now) {
                kept.push(entry);
            }
        }
        *buffer = kept;

        CallbackSubscription {
            demux: Arc::clone(self),
            session: session.to_string(),
        }
    }

    /// Deliver a notification to whatever job owns the session, or buffer it
    /// for the grace window if none does
    pub fn deliver(&self, session: &str, notification: RemoteNotification) {
        if let Some(route) = self.routes.get(session) {
            let (job, mailbox) = route.value();
            debug!(session, %job, state = %notification.remote_state, "Notification routed");
            mailbox.deliver(notification);
            return;
        }

        let now = Utc::now();
        let mut buffer = self.grace_buffer.lock();
        buffer.retain(|entry| {
            let keep = !self.expired(entry, now);
            if !keep {
                warn!(
                    session = entry.session,
                    state = %entry.notification.remote_state,
                    "Dropping notification for unknown session after grace period"
                );
            }
            keep
        });
        if buffer.len() >= self.config.buffer_capacity {
            let dropped = buffer.remove(0);
            warn!(
                session = dropped.session,
                "Grace buffer full, dropping oldest buffered notification"
            );
        }
        debug!(session, "Buffering notification for unknown session");
        buffer.push(BufferedNotification {
            session: session.to_string(),
            notification,
            buffered_at: now,
        });
    }

    fn expired(&self, entry: &BufferedNotification, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.buffered_at)
            > chrono::Duration::from_std(self.config.grace()).unwrap_or(chrono::Duration::MAX)
    }

    fn deregister(&self, session: &str) {
        if self.routes.remove(session).is_some() {
            debug!(session, "Callback route deregistered");
        }
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.grace_buffer.lock().len()
    }
}

/// Owned registration handle; dropping it deregisters the session route
/// deterministically on job teardown
pub struct CallbackSubscription {
    demux: Arc<CallbackDemux>,
    session: String,
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        self.demux.deregister(&self.session);
    }
}
