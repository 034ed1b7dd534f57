//! Shared harness for integration tests: a scripted reasoning backend, a
//! fixture organisation and a tool that records its invocations.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use rankflow::agent::{Action, Decision, DecisionRequest, ReasoningBackend};
use rankflow::approval::RiskTier;
use rankflow::error::BackendError;
use rankflow::orchestration::{Runtime, RuntimeOptions};
use rankflow::org::{AgentSpec, Organization};
use rankflow::store::{MemoryStore, Store};
use rankflow::tools::{Tool, ToolRegistry, ToolSpec, TouchSpec};

// ─── Organisation ─────────────────────────────────────────────────────

/// Two forests:
///
/// ```text
/// ceo (0)                  partner-ceo (0)
/// └── lead (1, eng)        └── partner-lead (1, ops)
///     ├── dev-1 (2, eng)
///     └── dev-2 (2, eng)
/// ```
pub fn fixture_org() -> Arc<Organization> {
    let org = Organization::from_specs(vec![
        AgentSpec::new("ceo", 0, "exec", None),
        AgentSpec::new("lead", 1, "eng", Some("ceo")),
        AgentSpec::new("dev-1", 2, "eng", Some("lead")),
        AgentSpec::new("dev-2", 2, "eng", Some("lead")),
        AgentSpec::new("partner-ceo", 0, "exec", None),
        AgentSpec::new("partner-lead", 1, "ops", Some("partner-ceo")),
    ])
    .expect("fixture organisation is valid");
    Arc::new(org)
}

// ─── Scripted backend ─────────────────────────────────────────────────

type Responder = Box<dyn Fn(&DecisionRequest) -> Decision + Send + Sync>;

enum Script {
    /// Decisions in order; the last one repeats once the queue is down to it.
    Queue(VecDeque<Decision>),
    /// Computed from the request, e.g. to answer a pending approval.
    Respond(Responder),
}

/// Reasoning backend that replays per-agent scripts. Agents without a
/// script get a backend failure.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, agent: &str, decisions: Vec<Decision>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(agent.to_string(), Script::Queue(decisions.into()));
        self
    }

    pub fn respond(
        self,
        agent: &str,
        responder: impl Fn(&DecisionRequest) -> Decision + Send + Sync + 'static,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(agent.to_string(), Script::Respond(Box::new(responder)));
        self
    }

    /// Every request `agent` made, in order.
    pub fn requests_from(&self, agent: &str) -> Vec<DecisionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.agent == agent)
            .cloned()
            .collect()
    }

    pub fn calls(&self, agent: &str) -> usize {
        self.requests_from(agent).len()
    }

    fn next(&self, request: &DecisionRequest) -> Result<Decision, BackendError> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&request.agent) {
            Some(Script::Queue(queue)) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(Script::Queue(queue)) => queue
                .front()
                .cloned()
                .ok_or_else(|| BackendError::Request("script is empty".into())),
            Some(Script::Respond(responder)) => Ok(responder(request)),
            None => Err(BackendError::Request(format!("no script for {}", request.agent))),
        }
    }
}

impl ReasoningBackend for ScriptedBackend {
    fn decide<'a>(&'a self, request: &'a DecisionRequest) -> BoxFuture<'a, Result<Decision, BackendError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            self.next(request)
        })
    }
}

pub fn complete(summary: &str) -> Decision {
    Decision::new(
        "done",
        Action::Complete {
            summary: summary.to_string(),
            decisions: Vec::new(),
            deliverables: Vec::new(),
        },
    )
}

pub fn call(tool: &str, args: Value) -> Decision {
    Decision::new(
        &format!("use {tool}"),
        Action::ToolCall {
            tool: tool.to_string(),
            args,
        },
    )
}

// ─── Recording tool ───────────────────────────────────────────────────

/// Tool that records its arguments and returns a fixed output.
pub struct RecordingTool {
    spec: ToolSpec,
    output: Result<String, String>,
    calls: Arc<Mutex<Vec<Value>>>,
    effect: Option<Box<dyn Fn() + Send + Sync>>,
}

impl RecordingTool {
    pub fn new(name: &str, risk: RiskTier) -> Self {
        Self {
            spec: ToolSpec::new(name, "test tool", risk).param("path", "resource to touch"),
            output: Ok(format!("{name} ran")),
            calls: Arc::new(Mutex::new(Vec::new())),
            effect: None,
        }
    }

    pub fn touching(mut self, touch: TouchSpec) -> Self {
        self.spec = self.spec.touching(touch);
        self
    }

    pub fn returning(mut self, output: &str) -> Self {
        self.output = Ok(output.to_string());
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.output = Err(message.to_string());
        self
    }

    /// Run `effect` on every invocation, before returning.
    pub fn with_effect(mut self, effect: impl Fn() + Send + Sync + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }

    /// Handle onto the recorded arguments; stays valid after registration.
    pub fn calls(&self) -> Arc<Mutex<Vec<Value>>> {
        self.calls.clone()
    }
}

impl Tool for RecordingTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(args.clone());
            if let Some(effect) = &self.effect {
                effect();
            }
            self.output.clone()
        })
    }
}

// ─── Runtime ──────────────────────────────────────────────────────────

/// Options with short timers so tests settle quickly.
pub fn fast_options() -> RuntimeOptions {
    let mut options = RuntimeOptions::default();
    options.approval_timeout = Duration::from_secs(5);
    options.approval_sweep_interval = Duration::from_millis(50);
    options.lock_reap_interval = Duration::from_millis(50);
    options.maintenance_interval = Duration::from_millis(100);
    options.settings.activation_timeout = Duration::from_secs(10);
    options
}

pub struct Harness {
    pub runtime: Runtime,
    pub store: Arc<MemoryStore>,
    pub backend: Arc<ScriptedBackend>,
}

pub fn start(backend: ScriptedBackend, tools: ToolRegistry, options: RuntimeOptions) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(backend);
    let runtime = Runtime::start(
        fixture_org(),
        store.clone() as Arc<dyn Store>,
        tools,
        backend.clone(),
        options,
    );
    Harness {
        runtime,
        store,
        backend,
    }
}
