//! Per-agent execution loop.
//!
//! An activation is an explicit state machine:
//!
//! ```text
//! draining_mailbox -> reasoning -> acting -> observing -> draining_mailbox ...
//!        |                                                      |
//!        +-------------------- finished <-----------------------+
//! ```
//!
//! Each call to [`Activation::step`] performs one transition. The round cap
//! and stuck detection are checked on entry to `draining_mailbox`, i.e. at
//! the start of every round, and cancellation and the activation deadline
//! are enforced around the whole drive in [`Activation::run`]. Faults abort
//! the round and end the activation with status `error`; everything else
//! (backend errors, denied approvals, lock conflicts, tool failures) is an
//! observation the agent can react to.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::actions::{Action, Decision, Observation};
use super::backend::{DecisionRequest, ReasoningBackend};
use super::history::{estimate_tokens, History, HistoryEntry, HistoryRole, Importance, DEFAULT_CONTEXT_BUDGET};
use super::journal::{now_iso, Journal, JournalEntry};
use super::prompt::build_system_prompt;
use crate::approval::{ApprovalGate, GateDecision, PendingAction, Resolution, RiskTier};
use crate::error::{ReasonCode, RuntimeError};
use crate::locks::{LockGrant, LockHolder, LockMode, LockState, ResourceLockManager};
use crate::messaging::{DeliveryReceipt, Message, MessageKind, MessageRouter, Priority, SYSTEM_SENDER};
use crate::org::{AgentId, AgentStatus, Organization};
use crate::store::Store;
use crate::tasks::delegation::DelegationEngine;
use crate::tasks::{Task, TaskId, TaskOutput};
use crate::tools::{marks_objective_satisfied, ToolRegistry, Touch};

/// No activation runs more rounds than this, whatever the configuration.
pub const HARD_ROUND_CEILING: u32 = 10;

/// Number of trailing actions/observations inspected by stuck detection.
pub const STUCK_WINDOW: usize = 3;

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    /// Configured reasoning iterations; clamped to 8..=12.
    pub reasoning_iterations: u32,
    pub context_budget: usize,
    pub activation_timeout: Duration,
    pub lock_ttl: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            reasoning_iterations: 10,
            context_budget: DEFAULT_CONTEXT_BUDGET,
            activation_timeout: Duration::from_secs(1800),
            lock_ttl: Duration::from_secs(300),
        }
    }
}

impl LoopSettings {
    pub fn round_cap(&self) -> u32 {
        self.reasoning_iterations.clamp(8, 12).min(HARD_ROUND_CEILING)
    }
}

/// Capabilities injected into every loop. Owned by the scheduler.
#[derive(Clone)]
pub struct LoopContext {
    pub org: Arc<Organization>,
    pub store: Arc<dyn Store>,
    pub router: MessageRouter,
    pub gate: ApprovalGate,
    pub locks: ResourceLockManager,
    pub delegation: DelegationEngine,
    pub tools: ToolRegistry,
    pub backend: Arc<dyn ReasoningBackend>,
    pub journal: Journal,
    pub settings: LoopSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    DrainingMailbox,
    Reasoning,
    Acting,
    Observing,
    Finished,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopPhase::Idle => "idle",
            LoopPhase::DrainingMailbox => "draining_mailbox",
            LoopPhase::Reasoning => "reasoning",
            LoopPhase::Acting => "acting",
            LoopPhase::Observing => "observing",
            LoopPhase::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Last phase a loop reported and when. Shared with the scheduler for
/// liveness checks.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    inner: Arc<Mutex<(LoopPhase, Instant)>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new((LoopPhase::Idle, Instant::now()))),
        }
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self, phase: LoopPhase) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner = (phase, Instant::now());
    }

    pub fn phase(&self) -> LoopPhase {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    /// Time since the last beat.
    pub fn silent_for(&self) -> Duration {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).1.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Completed,
    Stuck,
    MaxIterations,
    Error,
    Cancelled,
    TimedOut,
}

impl ActivationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStatus::Completed => "completed",
            ActivationStatus::Stuck => "stuck",
            ActivationStatus::MaxIterations => "max_iterations",
            ActivationStatus::Error => "error",
            ActivationStatus::Cancelled => "cancelled",
            ActivationStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one activation. Sent to the delegating ancestor when
/// the task did not complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationReport {
    pub agent: AgentId,
    pub task: Option<TaskId>,
    pub status: ActivationStatus,
    pub reason: Option<ReasonCode>,
    pub rounds: u32,
    pub summary: String,
}

#[derive(Debug)]
struct Termination {
    status: ActivationStatus,
    reason: Option<ReasonCode>,
    summary: String,
}

impl Termination {
    fn new(status: ActivationStatus, reason: Option<ReasonCode>, summary: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            summary: summary.into(),
        }
    }

    fn fault(err: &RuntimeError) -> Self {
        Self::new(ActivationStatus::Error, Some(err.reason()), err.to_string())
    }
}

/// Why the trailing window looks stuck, if it does.
fn detect_stuck(actions: &VecDeque<String>, outcomes: &VecDeque<bool>) -> Option<&'static str> {
    if actions.len() >= STUCK_WINDOW && actions.iter().all(|a| a == &actions[0]) {
        return Some("the last 3 actions were identical");
    }
    if outcomes.len() >= STUCK_WINDOW && outcomes.iter().all(|ok| !ok) {
        return Some("the last 3 observations reported failure");
    }
    None
}

fn push_window<T>(window: &mut VecDeque<T>, value: T) {
    window.push_back(value);
    while window.len() > STUCK_WINDOW {
        window.pop_front();
    }
}

fn describe_message(message: &Message) -> String {
    let mut text = format!(
        "[{:?} from {}] {}",
        message.body.kind, message.header.from, message.body.content
    );
    if let Some(payload) = &message.body.payload {
        text.push_str(&format!(" {payload}"));
    }
    text
}

fn message_importance(message: &Message) -> Importance {
    match message.body.kind {
        MessageKind::TaskAssignment | MessageKind::ApprovalRequest | MessageKind::ConflictEscalation => {
            Importance::High
        }
        MessageKind::Notice | MessageKind::Broadcast => Importance::Low,
        _ => Importance::Normal,
    }
}

/// Run one activation for `agent` if it has work: the oldest runnable task,
/// or unread messages that need an answer. `None` when there is nothing to do.
pub async fn activate(
    ctx: &LoopContext,
    agent: &str,
    heartbeat: &Heartbeat,
    cancel: &CancellationToken,
) -> Result<Option<ActivationReport>, RuntimeError> {
    heartbeat.beat(LoopPhase::DrainingMailbox);
    let inbox = ctx.router.receive_unread(agent)?;
    let stored = ctx.store.load_history(agent)?;

    let mut task = None;
    if let Some(candidate) = ctx.delegation.runnable_for(agent)? {
        if ctx.delegation.claim(&candidate.id, agent)? {
            task = Some(ctx.store.get_task(&candidate.id)?);
        }
    }
    if task.is_none() && !inbox.iter().any(Message::needs_response) {
        heartbeat.beat(LoopPhase::Idle);
        return Ok(None);
    }

    let activation = Activation::start(ctx.clone(), agent, task, inbox, stored, heartbeat.clone(), cancel.clone())?;
    Ok(Some(activation.run().await))
}

pub struct Activation {
    ctx: LoopContext,
    agent: AgentId,
    task: Option<Task>,
    objective: String,
    system_prompt: String,
    history: History,
    phase: LoopPhase,
    rounds: u32,
    round_cap: u32,
    pending: Option<Decision>,
    observed: Option<(Option<Action>, Observation)>,
    recent_actions: VecDeque<String>,
    recent_outcomes: VecDeque<bool>,
    escalated: HashSet<String>,
    heartbeat: Heartbeat,
    cancel: CancellationToken,
}

impl Activation {
    /// Prepare an activation. `task` must already be claimed; without one the
    /// activation answers `inbox`.
    pub fn start(
        ctx: LoopContext,
        agent: &str,
        task: Option<Task>,
        inbox: Vec<Message>,
        stored: Vec<HistoryEntry>,
        heartbeat: Heartbeat,
        cancel: CancellationToken,
    ) -> Result<Self, RuntimeError> {
        let record = ctx
            .org
            .get(agent)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent.to_string()))?;

        let mut history = History::from_entries(stored, ctx.settings.context_budget);
        history.demote_pinned();

        let objective = match &task {
            Some(task) => task.input.objective.clone(),
            None => "Answer the messages in your inbox that need a response".to_string(),
        };
        let statement = match &task {
            Some(task) => {
                let mut text = format!("Task {}: {}", task.id, task.input.objective);
                if !task.input.acceptance_criteria.is_empty() {
                    text.push_str(&format!("\nAcceptance criteria:\n- {}", task.input.acceptance_criteria.join("\n- ")));
                }
                if !task.input.context.is_empty() {
                    text.push_str(&format!("\nContext: {}", task.input.context));
                }
                if !task.input.constraints.is_empty() {
                    text.push_str(&format!("\nConstraints: {}", task.input.constraints.join("; ")));
                }
                text
            }
            None => {
                let pending = ctx.gate.pending_for(agent)?;
                let mut text = objective.clone();
                for request in pending {
                    text.push_str(&format!(
                        "\nPending approval {} from {} ({} risk): {}",
                        request.id, request.actor, request.risk, request.action.description
                    ));
                }
                text
            }
        };
        history.record(HistoryRole::Task, statement, Importance::Pinned);

        let ids: Vec<_> = inbox.iter().map(|m| m.id.clone()).collect();
        for message in &inbox {
            history.record(HistoryRole::Message, describe_message(message), message_importance(message));
        }
        if !ids.is_empty() {
            ctx.router.mark_read(agent, &ids)?;
        }

        let tools = ctx.tools.specs();
        let round_cap = ctx.settings.round_cap();
        let system_prompt = build_system_prompt(
            &record,
            &ctx.settings.model,
            &tools,
            round_cap,
            ctx.delegation.max_open_tasks(),
        );

        let status = if task.is_some() {
            AgentStatus::Working
        } else {
            AgentStatus::Reviewing
        };
        ctx.org.set_status(agent, status);
        ctx.org.set_current_task(agent, task.as_ref().map(|t| t.id.clone()));

        tracing::info!(
            agent = %agent,
            task = task.as_ref().map(|t| t.id.as_str()).unwrap_or("inbox"),
            round_cap,
            "Activation started"
        );
        ctx.journal.record(JournalEntry::ActivationStart {
            timestamp: now_iso(),
            agent: agent.to_string(),
            task: task.as_ref().map(|t| t.id.clone()),
            objective: objective.clone(),
        });

        Ok(Self {
            ctx,
            agent: agent.to_string(),
            task,
            objective,
            system_prompt,
            history,
            phase: LoopPhase::DrainingMailbox,
            rounds: 0,
            round_cap,
            pending: None,
            observed: None,
            recent_actions: VecDeque::new(),
            recent_outcomes: VecDeque::new(),
            escalated: HashSet::new(),
            heartbeat,
            cancel,
        })
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Drive the state machine to termination under the activation deadline,
    /// the agent's cancellation token and the task's cancellation token.
    pub async fn run(mut self) -> ActivationReport {
        let agent_cancel = self.cancel.clone();
        let task_cancel = self
            .task
            .as_ref()
            .map(|t| self.ctx.delegation.token(&t.id))
            .unwrap_or_default();
        let limit = self.ctx.settings.activation_timeout;

        let termination = tokio::select! {
            biased;
            _ = agent_cancel.cancelled() => {
                Termination::new(ActivationStatus::Cancelled, Some(ReasonCode::Cancelled), "runtime shutting down")
            }
            _ = task_cancel.cancelled() => {
                Termination::new(ActivationStatus::Cancelled, Some(ReasonCode::Cancelled), "task was cancelled")
            }
            outcome = tokio::time::timeout(limit, self.drive()) => match outcome {
                Ok(termination) => termination,
                Err(_) => Termination::new(
                    ActivationStatus::TimedOut,
                    Some(ReasonCode::ActivationTimeout),
                    format!("activation exceeded {}s", limit.as_secs()),
                ),
            },
        };
        self.finish(termination)
    }

    async fn drive(&mut self) -> Termination {
        loop {
            match self.step().await {
                Ok(Some(termination)) => return termination,
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(agent = %self.agent, round = self.rounds, error = %err, "Round faulted");
                    return Termination::fault(&err);
                }
            }
        }
    }

    /// Perform one phase transition. Returns a termination once the
    /// activation is over; `Err` only for faults that abort the round.
    async fn step(&mut self) -> Result<Option<Termination>, RuntimeError> {
        self.heartbeat.beat(self.phase);
        match self.phase {
            LoopPhase::DrainingMailbox => {
                if self.rounds as usize >= STUCK_WINDOW {
                    if let Some(why) = detect_stuck(&self.recent_actions, &self.recent_outcomes) {
                        tracing::warn!(agent = %self.agent, rounds = self.rounds, why, "Loop is stuck");
                        return Ok(Some(Termination::new(ActivationStatus::Stuck, Some(ReasonCode::Stuck), why)));
                    }
                }
                if self.rounds >= self.round_cap {
                    return Ok(Some(Termination::new(
                        ActivationStatus::MaxIterations,
                        Some(ReasonCode::MaxIterations),
                        format!("no completion after {} rounds", self.rounds),
                    )));
                }
                self.drain_mailbox()?;
                self.phase = LoopPhase::Reasoning;
            }
            LoopPhase::Reasoning => {
                let incoming = estimate_tokens(&self.system_prompt) + estimate_tokens(&self.objective);
                self.history.make_room(incoming);
                let request = DecisionRequest {
                    agent: self.agent.clone(),
                    rank: self.ctx.org.rank_of(&self.agent).unwrap_or_default(),
                    objective: self.objective.clone(),
                    system_prompt: self.system_prompt.clone(),
                    history: self.history.entries().to_vec(),
                    tools: self.ctx.tools.specs(),
                    round: self.rounds + 1,
                };
                match self.ctx.backend.decide(&request).await {
                    Ok(decision) => {
                        self.ctx.journal.record(JournalEntry::ActionChosen {
                            timestamp: now_iso(),
                            agent: self.agent.clone(),
                            round: self.rounds + 1,
                            thought: decision.thought.clone(),
                            action: decision.action.to_value(),
                        });
                        self.pending = Some(decision);
                        self.phase = LoopPhase::Acting;
                    }
                    Err(err) => {
                        tracing::warn!(agent = %self.agent, round = self.rounds + 1, error = %err, "Backend failed");
                        self.observed = Some((None, Observation::failed(ReasonCode::BackendFailure, err.to_string())));
                        self.phase = LoopPhase::Observing;
                    }
                }
            }
            LoopPhase::Acting => {
                let Some(decision) = self.pending.take() else {
                    self.phase = LoopPhase::DrainingMailbox;
                    return Ok(None);
                };
                if !decision.thought.is_empty() {
                    self.history.record(HistoryRole::Thought, decision.thought.clone(), Importance::Low);
                }
                let fingerprint = decision.action.fingerprint();
                self.history.record(HistoryRole::Action, fingerprint.clone(), Importance::Normal);
                push_window(&mut self.recent_actions, fingerprint);

                let observation = match self.act(&decision.action).await {
                    Ok(observation) => observation,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => Observation::from(&err),
                };
                self.observed = Some((Some(decision.action), observation));
                self.phase = LoopPhase::Observing;
            }
            LoopPhase::Observing => {
                let Some((action, observation)) = self.observed.take() else {
                    self.phase = LoopPhase::DrainingMailbox;
                    return Ok(None);
                };
                self.rounds += 1;
                return self.observe(action, observation);
            }
            LoopPhase::Idle | LoopPhase::Finished => {
                return Ok(Some(Termination::new(
                    ActivationStatus::Cancelled,
                    None,
                    "activation is not running",
                )));
            }
        }
        Ok(None)
    }

    fn observe(&mut self, action: Option<Action>, observation: Observation) -> Result<Option<Termination>, RuntimeError> {
        let role = match action {
            Some(Action::MemoryQuery { .. }) if observation.success => HistoryRole::Memory,
            _ => HistoryRole::Observation,
        };
        self.history.record(role, observation.render(), Importance::Normal);
        push_window(&mut self.recent_outcomes, observation.success);
        self.ctx.journal.record(JournalEntry::Observation {
            timestamp: now_iso(),
            agent: self.agent.clone(),
            round: self.rounds,
            success: observation.success,
            reason: observation.reason,
            content: observation.content.clone(),
        });
        tracing::debug!(
            agent = %self.agent,
            round = self.rounds,
            success = observation.success,
            reason = ?observation.reason,
            "Observation recorded"
        );

        for learning in &observation.learnings {
            self.ctx.store.remember(&self.agent, learning)?;
        }
        self.ctx.store.save_history(&self.agent, self.history.entries())?;

        if let Some(Action::Complete { summary, .. }) = &action {
            if observation.success {
                return Ok(Some(Termination::new(ActivationStatus::Completed, None, summary.clone())));
            }
        }
        if observation.objective_satisfied {
            if let Some(task) = &self.task {
                let output = TaskOutput {
                    summary: observation.content.clone(),
                    ..Default::default()
                };
                self.ctx.delegation.complete(&task.id, &self.agent, output)?;
            }
            return Ok(Some(Termination::new(
                ActivationStatus::Completed,
                None,
                observation.content,
            )));
        }

        self.phase = LoopPhase::DrainingMailbox;
        Ok(None)
    }

    fn drain_mailbox(&mut self) -> Result<usize, RuntimeError> {
        let messages = self.ctx.router.receive_unread(&self.agent)?;
        if messages.is_empty() {
            return Ok(0);
        }
        let ids: Vec<_> = messages.iter().map(|m| m.id.clone()).collect();
        for message in &messages {
            self.history.record(HistoryRole::Message, describe_message(message), message_importance(message));
        }
        self.ctx.router.mark_read(&self.agent, &ids)?;
        tracing::debug!(agent = %self.agent, count = messages.len(), "Mailbox drained");
        Ok(messages.len())
    }

    async fn act(&mut self, action: &Action) -> Result<Observation, RuntimeError> {
        match action {
            Action::ToolCall { tool, args } => self.call_tool(tool, args).await,
            Action::SendMessage {
                to,
                content,
                response_required,
            } => self.send_message(to, content, *response_required),
            Action::MemoryQuery { query, limit } => {
                let hits = self.ctx.store.recall(&self.agent, query, *limit)?;
                if hits.is_empty() {
                    Ok(Observation::ok(format!("no memories match `{query}`")))
                } else {
                    Ok(Observation::ok(hits.join("\n")))
                }
            }
            Action::Delegate { subtasks } => {
                let task_id = self.require_task("delegate")?;
                let children = self.ctx.delegation.split(&task_id, &self.agent, subtasks.clone())?;
                let listing: Vec<String> = children
                    .iter()
                    .map(|c| format!("{} -> {} ({})", c.id, c.assignee, c.status))
                    .collect();
                Ok(Observation::ok(format!(
                    "created {} subtasks:\n{}",
                    children.len(),
                    listing.join("\n")
                )))
            }
            Action::ResolveApproval { request_id, approve } => {
                let resolution = self.ctx.gate.resolve(request_id, &self.agent, *approve)?;
                Ok(Observation::ok(format!("approval request {request_id} is {resolution}")))
            }
            Action::Complete {
                summary,
                decisions,
                deliverables,
            } => {
                let observation = match &self.task {
                    Some(task) => {
                        let output = TaskOutput {
                            summary: summary.clone(),
                            decisions: decisions.clone(),
                            deliverables: deliverables.clone(),
                        };
                        let status = self.ctx.delegation.complete(&task.id, &self.agent, output)?;
                        Observation::ok(format!("task {} is {status}", task.id))
                    }
                    None => Observation::ok(summary.clone()),
                };
                Ok(observation.with_learnings(decisions.clone()))
            }
        }
    }

    fn require_task(&self, action: &str) -> Result<TaskId, RuntimeError> {
        self.task
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or_else(|| RuntimeError::NotAuthorized(format!("{action} requires an assigned task")))
    }

    /// Lock holder identity for this activation.
    fn holder(&self) -> LockHolder {
        match &self.task {
            Some(task) => LockHolder::new(&task.id, &self.agent),
            None => LockHolder::new(&format!("inbox:{}", self.agent), &self.agent),
        }
    }

    fn active_status(&self) -> AgentStatus {
        if self.task.is_some() {
            AgentStatus::Working
        } else {
            AgentStatus::Reviewing
        }
    }

    async fn call_tool(&mut self, name: &str, args: &Value) -> Result<Observation, RuntimeError> {
        let tool = self
            .ctx
            .tools
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownTool(name.to_string()))?;
        let spec = tool.spec().clone();
        let touches = tool.touched(args);

        let mut pending = PendingAction::new(format!("{name} {args}"));
        if spec.risk == RiskTier::Network {
            if let Some(target) = spec.network_target(args) {
                pending = pending.on_resource(&target);
            }
        } else if let Some(first) = touches.first() {
            pending = pending.on_resource(&first.resource);
        }
        if let Some(task) = &self.task {
            pending = pending.for_task(&task.id);
        }

        // Don't bother the approver for a resource another task already holds.
        for touch in &touches {
            if let Some(existing) = self.foreign_holder(touch) {
                return Err(self.conflict(&touch.resource, existing)?);
            }
        }

        self.await_approval(spec.risk, pending).await?;

        for touch in &touches {
            self.lock(touch)?;
        }

        tracing::debug!(agent = %self.agent, tool = %name, "Executing tool");
        match tool.execute(args).await {
            Ok(output) => {
                let satisfied = marks_objective_satisfied(&output);
                let observation = Observation::ok(output);
                Ok(if satisfied { observation.satisfied() } else { observation })
            }
            Err(message) => Err(RuntimeError::ToolFailure(message)),
        }
    }

    fn foreign_holder(&self, touch: &Touch) -> Option<LockHolder> {
        let own = self.holder();
        match self.ctx.locks.is_locked(&touch.resource) {
            LockState::Unlocked => None,
            LockState::Held { holder, .. } => (holder != own).then_some(holder),
            LockState::Shared(holders) if touch.mode != LockMode::Read => {
                holders.into_iter().find(|h| *h != own)
            }
            LockState::Shared(_) => None,
        }
    }

    fn lock(&mut self, touch: &Touch) -> Result<(), RuntimeError> {
        let holder = self.holder();
        let ttl = self.ctx.settings.lock_ttl;
        match self
            .ctx
            .locks
            .acquire(&touch.resource, touch.kind, touch.mode, holder.clone(), ttl)
        {
            LockGrant::Granted(_) => Ok(()),
            LockGrant::Conflict { holder: existing, .. } if existing == holder => {
                // Our own lock in another mode: release, then reacquire.
                self.ctx.locks.release(&touch.resource, &holder)?;
                match self
                    .ctx
                    .locks
                    .acquire(&touch.resource, touch.kind, touch.mode, holder, ttl)
                {
                    LockGrant::Granted(_) => Ok(()),
                    LockGrant::Conflict { holder: existing, .. } => Err(self.conflict(&touch.resource, existing)?),
                }
            }
            LockGrant::Conflict { holder: existing, .. } => Err(self.conflict(&touch.resource, existing)?),
        }
    }

    /// Build the conflict error, escalating to the superior the first time
    /// this activation hits `resource`. Only fatal send errors escape.
    fn conflict(&mut self, resource: &str, existing: LockHolder) -> Result<RuntimeError, RuntimeError> {
        tracing::info!(agent = %self.agent, resource = %resource, holder = %existing, "Resource conflict");
        if self.escalated.insert(resource.to_string()) {
            if let Some(superior) = self.ctx.org.superior_of(&self.agent) {
                let task = self.task.as_ref().map(|t| t.id.as_str()).unwrap_or("none");
                let mut message = self
                    .ctx
                    .router
                    .compose(
                        &self.agent,
                        &superior,
                        MessageKind::ConflictEscalation,
                        &format!("`{resource}` is held by {existing}; task {task} cannot modify it"),
                    )
                    .with_priority(Priority::High)
                    .with_payload(json!({
                        "resource": resource,
                        "holder_task": existing.task_id,
                        "holder_agent": existing.agent_id,
                    }));
                if let Some(task) = &self.task {
                    message = message.with_task(&task.id);
                }
                if let Err(err) = self.ctx.router.send(message) {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    tracing::warn!(agent = %self.agent, error = %err, "Conflict escalation not sent");
                }
            }
        }
        Ok(RuntimeError::ResourceConflict {
            resource: resource.to_string(),
            holder: existing,
        })
    }

    async fn await_approval(&mut self, risk: RiskTier, action: PendingAction) -> Result<(), RuntimeError> {
        let description = action.description.clone();
        let (approver, request_id) = match self.ctx.gate.evaluate(&self.agent, risk, action)? {
            GateDecision::Proceed => return Ok(()),
            GateDecision::Await { approver, request_id } => (approver, request_id),
        };

        let mut notice = self
            .ctx
            .router
            .compose(
                &self.agent,
                &approver,
                MessageKind::ApprovalRequest,
                &format!("Approval needed ({risk} risk): {description}"),
            )
            .with_priority(Priority::High)
            .with_payload(json!({
                "request_id": request_id,
                "actor": self.agent,
                "risk": risk.as_str(),
            }))
            .requiring_response(0.8);
        if let Some(task) = &self.task {
            notice = notice.with_task(&task.id);
        }
        if let Err(err) = self.ctx.router.send(notice) {
            if err.is_fatal() {
                return Err(err);
            }
            tracing::warn!(agent = %self.agent, approver = %approver, error = %err, "Approval notice not sent");
        }

        self.ctx.org.set_status(&self.agent, AgentStatus::WaitingApproval);
        let resolution = self.ctx.gate.wait(&request_id, &self.cancel).await;
        self.ctx.org.set_status(&self.agent, self.active_status());
        self.heartbeat.beat(LoopPhase::Acting);

        match resolution? {
            Resolution::Approved => Ok(()),
            Resolution::Denied => Err(RuntimeError::ApprovalDenied(request_id)),
            Resolution::TimedOut | Resolution::Pending => Err(RuntimeError::ApprovalTimeout(request_id)),
        }
    }

    fn send_message(&self, to: &str, content: &str, response_required: bool) -> Result<Observation, RuntimeError> {
        let mut message = self.ctx.router.compose(&self.agent, to, MessageKind::Direct, content);
        if response_required {
            message = message.requiring_response(0.5);
        }
        if let Some(task) = &self.task {
            message = message.with_task(&task.id);
        }
        match self.ctx.router.send(message)? {
            DeliveryReceipt::Delivered { message_id, .. } => {
                Ok(Observation::ok(format!("message {message_id} delivered to {to}")))
            }
            DeliveryReceipt::AcceptedForRelay { message_id, .. } => {
                Ok(Observation::ok(format!("message {message_id} accepted for relay to {to}")))
            }
            DeliveryReceipt::Dropped { message_id, reason } => {
                Ok(Observation::failed(reason, format!("message {message_id} to {to} was dropped")))
            }
        }
    }

    fn report_recipient(&self, task: &Task) -> Option<AgentId> {
        if task.created_by != SYSTEM_SENDER
            && task.created_by != self.agent
            && self.ctx.org.is_active(&task.created_by)
        {
            Some(task.created_by.clone())
        } else {
            self.ctx.org.superior_of(&self.agent)
        }
    }

    fn finish(mut self, termination: Termination) -> ActivationReport {
        self.phase = LoopPhase::Finished;
        self.heartbeat.beat(LoopPhase::Finished);

        let freed = self.ctx.locks.release_task(&self.holder().task_id);
        if !freed.is_empty() {
            tracing::debug!(agent = %self.agent, resources = ?freed, "Activation locks released");
        }

        let report = ActivationReport {
            agent: self.agent.clone(),
            task: self.task.as_ref().map(|t| t.id.clone()),
            status: termination.status,
            reason: termination.reason,
            rounds: self.rounds,
            summary: termination.summary,
        };

        if let Some(task) = &self.task {
            let failed = matches!(
                report.status,
                ActivationStatus::Stuck
                    | ActivationStatus::MaxIterations
                    | ActivationStatus::TimedOut
                    | ActivationStatus::Error
            );
            if failed {
                let reason = report.reason.unwrap_or(ReasonCode::Stuck);
                if let Err(err) = self.ctx.delegation.fail(&task.id, reason, &report.summary) {
                    tracing::warn!(task = %task.id, error = %err, "Could not mark task failed");
                }
                if let Some(recipient) = self.report_recipient(task) {
                    let content = format!(
                        "Task {} ended {} after {} rounds: {}",
                        task.id, report.status, report.rounds, report.summary
                    );
                    let message = self
                        .ctx
                        .router
                        .compose(&self.agent, &recipient, MessageKind::TaskReport, &content)
                        .with_priority(Priority::High)
                        .with_task(&task.id)
                        .with_payload(serde_json::to_value(&report).unwrap_or(Value::Null));
                    if let Err(err) = self.ctx.router.send(message) {
                        tracing::warn!(task = %task.id, to = %recipient, error = %err, "Task report not sent");
                    }
                }
            }
        }

        if let Err(err) = self.ctx.store.save_history(&self.agent, self.history.entries()) {
            tracing::warn!(agent = %self.agent, error = %err, "History not persisted");
        }

        let status = if report.status == ActivationStatus::Error {
            AgentStatus::Error
        } else {
            AgentStatus::Idle
        };
        self.ctx.org.set_status(&self.agent, status);
        self.ctx.org.set_current_task(&self.agent, None);

        self.ctx.journal.record(JournalEntry::ActivationEnd {
            timestamp: now_iso(),
            agent: self.agent.clone(),
            task: report.task.clone(),
            status: report.status.to_string(),
            reason: report.reason,
            rounds: report.rounds,
        });
        tracing::info!(
            agent = %self.agent,
            status = %report.status,
            rounds = report.rounds,
            reason = ?report.reason,
            "Activation finished"
        );
        self.heartbeat.beat(LoopPhase::Idle);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window<T: Clone>(items: &[T]) -> VecDeque<T> {
        items.iter().cloned().collect()
    }

    #[test]
    fn round_cap_is_clamped_and_ceilinged() {
        let mut settings = LoopSettings::default();
        assert_eq!(settings.round_cap(), 10);
        settings.reasoning_iterations = 3;
        assert_eq!(settings.round_cap(), 8);
        settings.reasoning_iterations = 12;
        assert_eq!(settings.round_cap(), HARD_ROUND_CEILING);
    }

    #[test]
    fn identical_actions_are_stuck() {
        let actions = window(&["a".to_string(), "a".to_string(), "a".to_string()]);
        assert!(detect_stuck(&actions, &window(&[true, true, true])).is_some());

        let varied = window(&["a".to_string(), "b".to_string(), "a".to_string()]);
        assert!(detect_stuck(&varied, &window(&[true, false, true])).is_none());
    }

    #[test]
    fn three_failures_are_stuck() {
        let varied = window(&["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(
            detect_stuck(&varied, &window(&[false, false, false])),
            Some("the last 3 observations reported failure")
        );
        assert!(detect_stuck(&varied, &window(&[false, false])).is_none());
    }

    #[test]
    fn window_keeps_only_the_tail() {
        let mut w = VecDeque::new();
        for i in 0..5 {
            push_window(&mut w, i);
        }
        assert_eq!(w, window(&[2, 3, 4]));
    }

    #[test]
    fn heartbeat_tracks_phase() {
        let heartbeat = Heartbeat::new();
        assert_eq!(heartbeat.phase(), LoopPhase::Idle);
        heartbeat.beat(LoopPhase::Reasoning);
        assert_eq!(heartbeat.phase(), LoopPhase::Reasoning);
        assert!(heartbeat.silent_for() < Duration::from_secs(5));
    }
}
