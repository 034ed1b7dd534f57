//! Actions an agent may choose and the observations they produce.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ReasonCode, RuntimeError};
use crate::org::AgentId;
use crate::tasks::SubtaskSpec;

fn default_limit() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ToolCall {
        tool: String,
        #[serde(default)]
        args: Value,
    },
    SendMessage {
        to: AgentId,
        content: String,
        #[serde(default)]
        response_required: bool,
    },
    MemoryQuery {
        query: String,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    Delegate {
        subtasks: Vec<SubtaskSpec>,
    },
    ResolveApproval {
        request_id: String,
        approve: bool,
    },
    Complete {
        summary: String,
        #[serde(default)]
        decisions: Vec<String>,
        #[serde(default)]
        deliverables: Vec<String>,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::ToolCall { .. } => "tool_call",
            Action::SendMessage { .. } => "send_message",
            Action::MemoryQuery { .. } => "memory_query",
            Action::Delegate { .. } => "delegate",
            Action::ResolveApproval { .. } => "resolve_approval",
            Action::Complete { .. } => "complete",
        }
    }

    /// Textual form used for repeated-action detection.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One reasoning step: the model's thought plus the chosen action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub thought: String,
    pub action: Action,
}

impl Decision {
    pub fn new(thought: &str, action: Action) -> Self {
        Self {
            thought: thought.to_string(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub success: bool,
    pub reason: Option<ReasonCode>,
    pub content: String,
    pub objective_satisfied: bool,
    /// Notes worth keeping in the agent's memory.
    pub learnings: Vec<String>,
}

impl Observation {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: None,
            content: content.into(),
            objective_satisfied: false,
            learnings: Vec::new(),
        }
    }

    pub fn failed(reason: ReasonCode, content: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            content: content.into(),
            objective_satisfied: false,
            learnings: Vec::new(),
        }
    }

    pub fn satisfied(mut self) -> Self {
        self.objective_satisfied = true;
        self
    }

    pub fn with_learnings(mut self, learnings: Vec<String>) -> Self {
        self.learnings = learnings;
        self
    }

    /// Render for history: `ok: ...` or `failed (reason): ...`.
    pub fn render(&self) -> String {
        match self.reason {
            None => format!("ok: {}", self.content),
            Some(reason) => format!("failed ({reason}): {}", self.content),
        }
    }
}

impl From<&RuntimeError> for Observation {
    fn from(err: &RuntimeError) -> Self {
        Observation::failed(err.reason(), err.to_string())
    }
}
