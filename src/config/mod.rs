//! # Reconciler Configuration
//!
//! Typed, validated configuration for every interval, ceiling, and threshold
//! the reconciliation core consults. All knobs are explicit here rather than
//! process-wide mutable state: the policy and engine receive the config at
//! construction.
//!
//! ## Usage
//!
//! ```rust
//! use remex_core::config::ReconcilerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReconcilerConfig::default();
//! assert!(config.submit.max_attempts > 0);
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{ReconcileError, Result};

/// Root configuration for the reconciliation core
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Routine probing of jobs with no recent callback
    pub probe: ProbeConfig,

    /// Submission attempt spacing and budget
    pub submit: SubmitConfig,

    /// Session restart spacing, budget, and commit window
    pub restart: RestartConfig,

    /// Remote call channel timeouts
    pub call: CallConfig,

    /// Endpoint circuit-breaker thresholds and backoff
    pub endpoint: EndpointConfig,

    /// Callback demultiplexer grace buffering
    pub callback: CallbackConfig,

    /// Output growth stall detection
    pub output_wait: OutputWaitConfig,

    /// Proactive credential refresh
    pub credentials: CredentialConfig,
}

/// Probe scheduling for jobs in the monitoring phase
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub interval_seconds: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Fixed-interval submission retry policy knobs. The interval is deliberately
/// not exponential: operators expect batch resubmission at a predictable
/// cadence.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubmitConfig {
    pub interval_seconds: u64,
    pub max_attempts: u32,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            max_attempts: 5,
        }
    }
}

impl SubmitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Session restart policy knobs. `commit_timeout_seconds` bounds how long the
/// controller waits after a restart handshake for the session to prove itself
/// with a callback or successful probe.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartConfig {
    pub interval_seconds: u64,
    pub max_attempts: u32,
    pub commit_timeout_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            max_attempts: 5,
            commit_timeout_seconds: 600,
        }
    }
}

impl RestartConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_seconds)
    }
}

/// Remote call channel timeout. A call unresolved past this is treated as
/// failed for policy purposes, though its handle stays reserved until the
/// channel confirms completion or abandonment.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CallConfig {
    pub timeout_seconds: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
        }
    }
}

impl CallConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Shared endpoint circuit breaker: after `failure_threshold` consecutive
/// failures new submissions/restarts are suspended for a capped backoff.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub failure_threshold: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base_seconds: 30,
            backoff_max_seconds: 600,
        }
    }
}

impl EndpointConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_seconds)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_seconds)
    }
}

/// Grace buffering for notifications that arrive before (or after) a job is
/// registered for their session key
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub grace_seconds: u64,
    pub buffer_capacity: usize,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            grace_seconds: 60,
            buffer_capacity: 256,
        }
    }
}

impl CallbackConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

/// Stall detection for remote stdout/stderr growth
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputWaitConfig {
    pub growth_timeout_seconds: u64,
}

impl Default for OutputWaitConfig {
    fn default() -> Self {
        Self {
            growth_timeout_seconds: 1200,
        }
    }
}

impl OutputWaitConfig {
    pub fn growth_timeout(&self) -> Duration {
        Duration::from_secs(self.growth_timeout_seconds)
    }
}

/// Proactive credential refresh window: a refresh call is issued once expiry
/// is closer than this, independent of job phase
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub refresh_window_seconds: u64,
    /// Minimum spacing between refresh attempts while expiry stays inside
    /// the window (a refresh may resolve without moving the expiry)
    pub retry_interval_seconds: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            refresh_window_seconds: 600,
            retry_interval_seconds: 60,
        }
    }
}

impl CredentialConfig {
    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.refresh_window_seconds)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }
}

impl ReconcilerConfig {
    /// Load configuration from a YAML file, applying defaults for any
    /// omitted section, then validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: ReconcilerConfig = serde_yaml::from_str(&raw).map_err(|e| {
            ReconcileError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Reconciler configuration loaded");
        Ok(config)
    }

    /// Reject configurations that would wedge the controller
    pub fn validate(&self) -> Result<()> {
        if self.submit.max_attempts == 0 {
            return Err(ReconcileError::Configuration(
                "submit.max_attempts must be at least 1".into(),
            ));
        }
        if self.restart.max_attempts == 0 {
            return Err(ReconcileError::Configuration(
                "restart.max_attempts must be at least 1".into(),
            ));
        }
        if self.call.timeout_seconds == 0 {
            return Err(ReconcileError::Configuration(
                "call.timeout_seconds must be positive".into(),
            ));
        }
        if self.endpoint.failure_threshold == 0 {
            return Err(ReconcileError::Configuration(
                "endpoint.failure_threshold must be at least 1".into(),
            ));
        }
        if self.endpoint.backoff_max_seconds < self.endpoint.backoff_base_seconds {
            return Err(ReconcileError::Configuration(
                "endpoint.backoff_max_seconds must not be below backoff_base_seconds".into(),
            ));
        }
        if self.credentials.retry_interval_seconds == 0 {
            return Err(ReconcileError::Configuration(
                "credentials.retry_interval_seconds must be positive".into(),
            ));
        }
        if self.callback.buffer_capacity == 0 {
            return Err(ReconcileError::Configuration(
                "callback.buffer_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        ReconcilerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "submit:\n  interval_seconds: 30\n  max_attempts: 3\nendpoint:\n  failure_threshold: 2"
        )
        .unwrap();

        let config = ReconcilerConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.submit.interval_seconds, 30);
        assert_eq!(config.submit.max_attempts, 3);
        assert_eq!(config.endpoint.failure_threshold, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.restart.commit_timeout_seconds, 600);
        assert_eq!(config.probe.interval_seconds, 300);
    }

    #[test]
    fn test_zero_attempt_budget_rejected() {
        let config = ReconcilerConfig {
            submit: SubmitConfig {
                interval_seconds: 10,
                max_attempts: 0,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_cap_must_cover_base() {
        let config = ReconcilerConfig {
            endpoint: EndpointConfig {
                failure_threshold: 3,
                backoff_base_seconds: 120,
                backoff_max_seconds: 60,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
