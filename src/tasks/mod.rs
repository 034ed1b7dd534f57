//! Task model and the delegation engine.
//!
//! Tasks form a DAG through parent/child and dependency edges. The
//! [`delegation::DelegationEngine`] creates them, enforces per-agent capacity
//! and re-evaluates blocked tasks as dependencies complete.

pub mod delegation;
pub mod graph;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReasonCode;
use crate::org::AgentId;

/// Identifier of a task (UUID v4 string).
pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    Execute,
    Review,
    Approve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Reviewing,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub objective: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl TaskInput {
    pub fn objective(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub assignee: AgentId,
    /// Agent (or operator) that created the task.
    pub created_by: AgentId,
    pub input: TaskInput,
    pub output: Option<TaskOutput>,
    pub parent_id: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub dependencies: BTreeSet<TaskId>,
    pub status: TaskStatus,
    pub failure_reason: Option<ReasonCode>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_type: TaskType, assignee: &str, created_by: &str, input: TaskInput) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            assignee: assignee.to_string(),
            created_by: created_by.to_string(),
            input,
            output: None,
            parent_id: None,
            children: Vec::new(),
            dependencies: BTreeSet::new(),
            status: TaskStatus::Pending,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent_id = Some(parent.to_string());
        self
    }

    /// Stamp timestamps appropriate to `status`.
    pub fn touch_status(&mut self, status: TaskStatus) {
        self.status = status;
        let now = Utc::now();
        if status == TaskStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
    }
}

/// Description of one child in a split, assigned to a direct subordinate.
/// `depends_on` holds indices of earlier or later siblings in the same batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub assignee: AgentId,
    pub objective: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default = "default_subtask_type")]
    pub task_type: TaskType,
}

fn default_subtask_type() -> TaskType {
    TaskType::Execute
}

impl SubtaskSpec {
    pub fn new(assignee: &str, objective: &str) -> Self {
        Self {
            assignee: assignee.to_string(),
            objective: objective.to_string(),
            acceptance_criteria: Vec::new(),
            depends_on: Vec::new(),
            task_type: TaskType::Execute,
        }
    }

    pub fn after(mut self, sibling: usize) -> Self {
        self.depends_on.push(sibling);
        self
    }
}
