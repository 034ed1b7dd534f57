//! Process-wide orchestration.
//!
//! The [`scheduler::Scheduler`] owns one execution-loop entry per agent and
//! the wake dispatcher; [`runtime::Runtime`] builds every component, owns
//! the background workers, and exposes the runtime operations.

pub mod runtime;
pub mod scheduler;

pub use runtime::{DelegationRequest, Runtime, RuntimeOptions};
pub use scheduler::{LoopInfo, Scheduler, WakeOutcome};
