#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Remex Core
//!
//! Event-driven reconciliation of remotely executed jobs. One controller per
//! job tracks the desired state, the last confirmed remote state, and the
//! in-flight remote call, and continuously converges the remote side toward
//! the desired state over an asynchronous, rate-limited, sometimes
//! unreachable channel.
//!
//! ## Architecture
//!
//! The core split is pure-engine versus async-driver. The engine
//! ([`reconciler::Reconciler`]) is a level-triggered state machine: given a
//! [`job::JobRecord`] and the current time it returns at most one action and
//! a re-evaluation deadline, and never performs I/O. The driver
//! ([`reconciler::JobManager`]) runs one tokio task per job that executes
//! those decisions against a [`channel::RemoteChannel`] implementation and
//! feeds completions and unsolicited notifications back in.
//!
//! ## Module Organization
//!
//! - [`channel`] - Call handles, completions, and the remote channel trait
//! - [`job`] - Per-job state: phases, remote states, the job record
//! - [`reconciler`] - The evaluation engine, transition guard, and driver
//! - [`policy`] - Attempt ceilings, spacing intervals, endpoint gating
//! - [`endpoint`] - Shared endpoint health with failure-driven suspension
//! - [`callback`] - Session-keyed notification routing with a grace buffer
//! - [`events`] - Terminal event broadcast
//! - [`config`] - Tunable intervals, ceilings, and windows
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use remex_core::channel::{JobSpec, RemoteChannel};
//! use remex_core::config::ReconcilerConfig;
//! use remex_core::reconciler::JobManager;
//!
//! # async fn example(channel: Arc<dyn RemoteChannel>) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = JobManager::new(ReconcilerConfig::default(), channel);
//! let mut terminal = manager.subscribe_terminal();
//!
//! let job = manager.create_job(
//!     JobSpec {
//!         name: "render-frame-042".into(),
//!         command: "/usr/bin/render".into(),
//!         args: vec!["--frame".into(), "42".into()],
//!         environment: Default::default(),
//!         credential_expires_at: None,
//!     },
//!     "compute.example.org",
//! );
//!
//! // The driver submits, monitors, and recovers on its own; the terminal
//! // event is the one thing every embedder waits for.
//! let event = terminal.recv().await?;
//! assert_eq!(event.job, job);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod policy;
pub mod reconciler;

pub use config::ReconcilerConfig;
pub use error::{ReconcileError, Result};
pub use reconciler::{JobManager, JobStatus, Reconciler};
