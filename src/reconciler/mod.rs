//! The reconciliation core: a pure evaluation engine, the transition guard
//! it applies to remote observations, and the async driver that executes its
//! decisions.

pub mod driver;
pub mod engine;
pub mod guards;

pub use driver::{JobManager, JobStatus};
pub use engine::{Action, Next, Reconciler};
pub use guards::{allow_transition, TransitionCheck};
