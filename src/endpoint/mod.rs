//! # Endpoint Health Tracker
//!
//! Shared circuit breaker for one remote execution resource. Every job
//! targeting the endpoint records call successes and failures here; once
//! consecutive failures cross the configured threshold, new submissions and
//! restarts are suspended endpoint-wide for a capped backoff. A single
//! success clears the suspension immediately: recovery is never artificially
//! delayed.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;

/// Read-only view of an endpoint's health, exposed to resource-selection
/// collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub reachable: bool,
    pub consecutive_failures: u32,
    pub suspend_until: Option<DateTime<Utc>>,
}

/// Per-endpoint shared state. One instance per remote resource, created on
/// first reference and retained for the process lifetime; many jobs update it
/// concurrently, so everything is atomic.
#[derive(Debug)]
pub struct EndpointHealth {
    name: String,
    reachable: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Epoch milliseconds; 0 means no suspension
    suspend_until_ms: AtomicI64,
    /// Wakers for jobs parked on this endpoint, notified on reachability flips
    watchers: Mutex<Vec<Arc<Notify>>>,
}

impl EndpointHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reachable: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            suspend_until_ms: AtomicI64::new(0),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a successful remote call. Clears any suspension on the spot
    /// and wakes parked jobs if the endpoint was previously down.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.suspend_until_ms.store(0, Ordering::Release);
        let was_down = !self.reachable.swap(true, Ordering::AcqRel);
        if was_down {
            info!(endpoint = %self.name, "Endpoint recovered, suspension cleared");
            self.wake_watchers();
        }
    }

    /// Record a failed remote call. Crossing the failure threshold marks the
    /// endpoint down and suspends new submissions/restarts for a capped
    /// backoff.
    pub fn record_failure(&self, config: &EndpointConfig, now: DateTime<Utc>) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(endpoint = %self.name, consecutive_failures = failures, "Endpoint call failed");

        if failures >= config.failure_threshold {
            let backoff = Self::backoff(failures, config);
            let until = now + chrono::Duration::from_std(backoff).unwrap_or_default();
            self.suspend_until_ms
                .store(until.timestamp_millis(), Ordering::Release);
            let was_up = self.reachable.swap(false, Ordering::AcqRel);
            if was_up {
                warn!(
                    endpoint = %self.name,
                    consecutive_failures = failures,
                    suspend_until = %until,
                    "Endpoint marked down, submissions suspended"
                );
                self.wake_watchers();
            }
        }
    }

    /// Capped exponential backoff keyed by how far past the threshold the
    /// failure streak has run
    fn backoff(failures: u32, config: &EndpointConfig) -> std::time::Duration {
        let over = failures.saturating_sub(config.failure_threshold);
        let exp = over.min(16);
        let scaled = config
            .backoff_base()
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        scaled.min(config.backoff_max())
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Suspension deadline currently in force, if any
    pub fn suspended_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ms = self.suspend_until_ms.load(Ordering::Acquire);
        if ms == 0 {
            return None;
        }
        match Utc.timestamp_millis_opt(ms).single() {
            Some(until) if until > now => Some(until),
            _ => None,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> HealthSnapshot {
        HealthSnapshot {
            reachable: self.is_reachable(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            suspend_until: self.suspended_until(now),
        }
    }

    /// Register a waker to be notified on reachability flips. Jobs register
    /// once at creation; wakers are process-lifetime like the entry itself.
    pub fn watch(&self, waker: Arc<Notify>) {
        self.watchers.lock().push(waker);
    }

    fn wake_watchers(&self) {
        for waker in self.watchers.lock().iter() {
            waker.notify_one();
        }
    }
}

/// Registry of endpoint health entries, shared by all jobs. Entries are
/// created on first reference and never removed.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    entries: DashMap<String, Arc<EndpointHealth>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<EndpointHealth> {
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EndpointHealth::new(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<EndpointHealth>> {
        self.entries.get(name).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EndpointConfig {
        EndpointConfig {
            failure_threshold: 3,
            backoff_base_seconds: 30,
            backoff_max_seconds: 600,
        }
    }

    #[test]
    fn test_starts_reachable() {
        let health = EndpointHealth::new("ep1");
        assert!(health.is_reachable());
        assert!(health.suspended_until(Utc::now()).is_none());
    }

    #[test]
    fn test_suspension_after_threshold_failures() {
        let config = test_config();
        let health = EndpointHealth::new("ep1");
        let now = Utc::now();

        health.record_failure(&config, now);
        health.record_failure(&config, now);
        assert!(health.is_reachable());
        assert!(health.suspended_until(now).is_none());

        // Third consecutive failure crosses the threshold
        health.record_failure(&config, now);
        assert!(!health.is_reachable());
        let until = health.suspended_until(now).unwrap();
        assert!(until > now);
    }

    #[test]
    fn test_success_clears_suspension_immediately() {
        let config = test_config();
        let health = EndpointHealth::new("ep1");
        let now = Utc::now();

        for _ in 0..5 {
            health.record_failure(&config, now);
        }
        assert!(!health.is_reachable());

        health.record_success();
        assert!(health.is_reachable());
        assert!(health.suspended_until(now).is_none());
        assert_eq!(health.snapshot(now).consecutive_failures, 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = test_config();
        let at_threshold = EndpointHealth::backoff(3, &config);
        let past_threshold = EndpointHealth::backoff(5, &config);
        let far_past = EndpointHealth::backoff(40, &config);

        assert_eq!(at_threshold, std::time::Duration::from_secs(30));
        assert!(past_threshold > at_threshold);
        assert_eq!(far_past, config.backoff_max());
    }

    #[test]
    fn test_registry_shares_entries() {
        let registry = EndpointRegistry::new();
        let a = registry.get_or_create("ep1");
        let b = registry.get_or_create("ep1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.get_or_create("ep2");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_watchers_woken_on_flip() {
        let config = test_config();
        let health = EndpointHealth::new("ep1");
        let waker = Arc::new(Notify::new());
        health.watch(waker.clone());

        let now = Utc::now();
        for _ in 0..3 {
            health.record_failure(&config, now);
        }
        // Down-flip must have queued a wakeup
        tokio::time::timeout(std::time::Duration::from_millis(50), waker.notified())
            .await
            .expect("watcher not woken on down transition");

        health.record_success();
        tokio::time::timeout(std::time::Duration::from_millis(50), waker.notified())
            .await
            .expect("watcher not woken on up transition");
    }
}
