//! Tool execution surface.
//!
//! The runtime knows two things about a tool: its [`RiskTier`] and the
//! resources it touches. Everything else is behind [`Tool::execute`].
//! Errors come back as `Err(String)` and become failed observations.

pub mod builtin;
pub mod workspace;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::approval::RiskTier;
use crate::locks::{LockMode, ResourceKind};

/// A resource a tool touches: the argument naming it and how it is locked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TouchSpec {
    pub arg: String,
    pub kind: ResourceKind,
    pub mode: LockMode,
}

impl TouchSpec {
    pub fn new(arg: &str, kind: ResourceKind, mode: LockMode) -> Self {
        Self {
            arg: arg.to_string(),
            kind,
            mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub risk: RiskTier,
    /// Argument names and their meaning, shown to the reasoning backend.
    pub params: Vec<(String, String)>,
    pub touches: Vec<TouchSpec>,
}

/// A concrete resource an invocation will touch.
#[derive(Debug, Clone, PartialEq)]
pub struct Touch {
    pub resource: String,
    pub kind: ResourceKind,
    pub mode: LockMode,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, risk: RiskTier) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            risk,
            params: Vec::new(),
            touches: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, description: &str) -> Self {
        self.params.push((name.to_string(), description.to_string()));
        self
    }

    pub fn touching(mut self, touch: TouchSpec) -> Self {
        self.touches.push(touch);
        self
    }

    /// Resources named by `args` according to the declared touch list.
    /// Arguments that are absent or not strings are skipped.
    pub fn touched(&self, args: &Value) -> Vec<Touch> {
        self.touched_with(args, resource_key)
    }

    /// Like [`ToolSpec::touched`], with `key` turning each argument into
    /// its lock key.
    pub fn touched_with(&self, args: &Value, key: impl Fn(&str) -> String) -> Vec<Touch> {
        self.touches
            .iter()
            .filter_map(|t| {
                let raw = args.get(&t.arg)?.as_str()?;
                Some(Touch {
                    resource: key(raw),
                    kind: t.kind,
                    mode: t.mode,
                })
            })
            .collect()
    }

    /// Resource string used by the approval gate for network tools.
    pub fn network_target(&self, args: &Value) -> Option<String> {
        ["url", "resource"]
            .iter()
            .find_map(|k| args.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    }

    /// Markdown description for the reasoning prompt.
    pub fn describe(&self) -> String {
        let mut out = format!("### {} ({} risk)\n{}", self.name, self.risk, self.description);
        for (name, desc) in &self.params {
            out.push_str(&format!("\n- **{name}**: {desc}"));
        }
        out
    }
}

/// Lock key for a path-like resource. `./a.ts` and `a.ts` name the same file.
pub fn resource_key(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}

pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    /// Resources this invocation locks. Tools that resolve their arguments
    /// override this so the key names the resolved resource.
    fn touched(&self, args: &Value) -> Vec<Touch> {
        self.spec().touched(args)
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>>;
}

/// Whether a tool's output reports the task objective as satisfied, i.e. it
/// is a JSON object with `"objective_satisfied": true`.
pub fn marks_objective_satisfied(output: &str) -> bool {
    serde_json::from_str::<Value>(output)
        .ok()
        .and_then(|v| v.get("objective_satisfied").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Name-indexed tool set, owned by the runtime and shared with every loop.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name.clone();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Tool registered twice; keeping the latest");
        }
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec().clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
