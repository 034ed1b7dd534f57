use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::locks::LockHolder;
use crate::org::AgentId;
use crate::tasks::{TaskId, TaskStatus};

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid network allow-list pattern: {0}")]
    AllowListPattern(String),
}

/// Errors surfaced by the durable store capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },
}

/// Malformed task, message or organisation graphs. Rejected synchronously at
/// creation time; never enters the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("dependency cycle involving task {0}")]
    DependencyCycle(TaskId),

    #[error("subtask {index} depends on out-of-range sibling {depends_on}")]
    BadSiblingIndex { index: usize, depends_on: usize },

    #[error("unknown dependency task {0}")]
    UnknownDependency(TaskId),

    #[error("task {0} has already started and cannot gain unmet dependencies")]
    AlreadyStarted(TaskId),

    #[error("task objective must not be empty")]
    EmptyObjective,

    #[error("duplicate agent id {0}")]
    DuplicateAgent(AgentId),

    #[error("agent {agent} has rank {rank} but reports to {superior} of rank {superior_rank}")]
    RankMismatch {
        agent: AgentId,
        rank: u8,
        superior: AgentId,
        superior_rank: u8,
    },

    #[error("rank-0 agent {0} must not report to anyone")]
    OperatorWithSuperior(AgentId),

    #[error("agent {0} must report to a superior")]
    MissingSuperior(AgentId),

    #[error("agent {agent} reports to unknown agent {superior}")]
    UnknownSuperior { agent: AgentId, superior: AgentId },

    #[error("reporting cycle through agent {0}")]
    ReportingCycle(AgentId),

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// Errors from the reasoning backend. The execution loop turns these into
/// failed observations rather than aborting.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Ollama not reachable at {url}: {message}")]
    Unavailable { url: String, message: String },

    #[error("Model '{model}' not available: {message}")]
    ModelNotAvailable { model: String, message: String },

    #[error("completion request failed: {0}")]
    Request(String),

    #[error("completion could not be parsed into an action: {0}")]
    Malformed(String),
}

/// Runtime failures. Every variant maps onto a [`ReasonCode`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("unknown approval request {0}")]
    UnknownApproval(String),

    #[error("approval request {0} was denied")]
    ApprovalDenied(String),

    #[error("approval request {0} timed out")]
    ApprovalTimeout(String),

    #[error("network access to `{0}` is not on the allow-list")]
    NetworkNotAllowed(String),

    #[error("resource `{resource}` is held by {holder}")]
    ResourceConflict { resource: String, holder: LockHolder },

    #[error("{holder} does not hold a lock on `{resource}`")]
    NotLockHolder { resource: String, holder: LockHolder },

    #[error("agent {agent} already holds {open} open tasks; {requested} more would exceed the limit of {limit}")]
    CapacityExceeded {
        agent: AgentId,
        open: usize,
        requested: usize,
        limit: usize,
    },

    #[error("{assignee} is not a direct subordinate of {delegator}")]
    NotSubordinate { delegator: AgentId, assignee: AgentId },

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("task {task} is already {status}")]
    AlreadyTerminal { task: TaskId, status: TaskStatus },

    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    #[error("cross-scope relay failed: {0}")]
    TransportFailure(String),

    #[error("message {0} expired before delivery")]
    MessageExpired(String),

    #[error("tool failed: {0}")]
    ToolFailure(String),

    #[error("unknown tool {0}")]
    UnknownTool(String),

    #[error("activation deadline elapsed")]
    ActivationTimeout,

    #[error("agent {0} has open tasks and cannot be archived")]
    AgentBusy(AgentId),
}

/// Machine-readable reason attached to every failure crossing the runtime
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ValidationError,
    UnknownAgent,
    UnknownTask,
    UnknownApproval,
    ApprovalDenied,
    ApprovalTimeout,
    NetworkNotAllowed,
    ResourceConflict,
    NotLockHolder,
    CapacityExceeded,
    NotSubordinate,
    NotAuthorized,
    AlreadyTerminal,
    Cancelled,
    Stuck,
    MaxIterations,
    TransportFailure,
    MessageExpired,
    StoreUnavailable,
    StoreError,
    BackendFailure,
    ToolFailure,
    UnknownTool,
    ActivationTimeout,
    AgentBusy,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ValidationError => "validation_error",
            ReasonCode::UnknownAgent => "unknown_agent",
            ReasonCode::UnknownTask => "unknown_task",
            ReasonCode::UnknownApproval => "unknown_approval",
            ReasonCode::ApprovalDenied => "approval_denied",
            ReasonCode::ApprovalTimeout => "approval_timeout",
            ReasonCode::NetworkNotAllowed => "network_not_allowed",
            ReasonCode::ResourceConflict => "resource_conflict",
            ReasonCode::NotLockHolder => "not_lock_holder",
            ReasonCode::CapacityExceeded => "capacity_exceeded",
            ReasonCode::NotSubordinate => "not_subordinate",
            ReasonCode::NotAuthorized => "not_authorized",
            ReasonCode::AlreadyTerminal => "already_terminal",
            ReasonCode::Cancelled => "cancelled",
            ReasonCode::Stuck => "stuck",
            ReasonCode::MaxIterations => "max_iterations",
            ReasonCode::TransportFailure => "transport_failure",
            ReasonCode::MessageExpired => "message_expired",
            ReasonCode::StoreUnavailable => "store_unavailable",
            ReasonCode::StoreError => "store_error",
            ReasonCode::BackendFailure => "backend_failure",
            ReasonCode::ToolFailure => "tool_failure",
            ReasonCode::UnknownTool => "unknown_tool",
            ReasonCode::ActivationTimeout => "activation_timeout",
            ReasonCode::AgentBusy => "agent_busy",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RuntimeError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            RuntimeError::Validation(_) => ReasonCode::ValidationError,
            RuntimeError::Store(StoreError::Unavailable(_)) => ReasonCode::StoreUnavailable,
            RuntimeError::Store(_) => ReasonCode::StoreError,
            RuntimeError::Backend(_) => ReasonCode::BackendFailure,
            RuntimeError::UnknownAgent(_) => ReasonCode::UnknownAgent,
            RuntimeError::UnknownTask(_) => ReasonCode::UnknownTask,
            RuntimeError::UnknownApproval(_) => ReasonCode::UnknownApproval,
            RuntimeError::ApprovalDenied(_) => ReasonCode::ApprovalDenied,
            RuntimeError::ApprovalTimeout(_) => ReasonCode::ApprovalTimeout,
            RuntimeError::NetworkNotAllowed(_) => ReasonCode::NetworkNotAllowed,
            RuntimeError::ResourceConflict { .. } => ReasonCode::ResourceConflict,
            RuntimeError::NotLockHolder { .. } => ReasonCode::NotLockHolder,
            RuntimeError::CapacityExceeded { .. } => ReasonCode::CapacityExceeded,
            RuntimeError::NotSubordinate { .. } => ReasonCode::NotSubordinate,
            RuntimeError::NotAuthorized(_) => ReasonCode::NotAuthorized,
            RuntimeError::AlreadyTerminal { .. } => ReasonCode::AlreadyTerminal,
            RuntimeError::Cancelled(_) => ReasonCode::Cancelled,
            RuntimeError::TransportFailure(_) => ReasonCode::TransportFailure,
            RuntimeError::MessageExpired(_) => ReasonCode::MessageExpired,
            RuntimeError::ToolFailure(_) => ReasonCode::ToolFailure,
            RuntimeError::UnknownTool(_) => ReasonCode::UnknownTool,
            RuntimeError::ActivationTimeout => ReasonCode::ActivationTimeout,
            RuntimeError::AgentBusy(_) => ReasonCode::AgentBusy,
        }
    }

    /// Faults that abort the current round and park the agent in `error`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Store(StoreError::Unavailable(_)))
    }
}

/// Structured failure returned across the exposed runtime surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: ReasonCode,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

impl std::error::Error for Failure {}

impl From<RuntimeError> for Failure {
    fn from(err: RuntimeError) -> Self {
        Failure {
            reason: err.reason(),
            message: err.to_string(),
        }
    }
}

impl From<ValidationError> for Failure {
    fn from(err: ValidationError) -> Self {
        RuntimeError::from(err).into()
    }
}

/// Result type of the exposed runtime surface.
pub type Outcome<T> = Result<T, Failure>;
