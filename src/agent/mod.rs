//! Per-agent reasoning: actions, history, the backend capability, the
//! system prompt, the journal, and the execution loop that ties them
//! together.

pub mod actions;
pub mod backend;
pub mod execution;
pub mod history;
pub mod journal;
pub mod prompt;

pub use actions::{Action, Decision, Observation};
pub use backend::{check_backend_ready, DecisionRequest, GenaiBackend, ReasoningBackend};
pub use execution::{
    activate, Activation, ActivationReport, ActivationStatus, Heartbeat, LoopContext, LoopPhase,
    LoopSettings,
};
