//! Orchestration scheduler.
//!
//! [`Scheduler`] maps agent ids to execution-loop entries and decides which
//! idle loops to wake. It wraps a `HashMap` behind `Arc<Mutex<..>>`; the lock
//! is never held across an `.await`.
//!
//! **Wake model:** a wake for an idle loop spawns a tokio task that runs
//! activations until the agent has no work left. A wake that arrives while
//! the loop is running only sets the entry's `rewake` flag. The flag is
//! checked under the same lock that flips the entry back to idle, so a
//! message delivered between the loop's last mailbox drain and going idle
//! is never lost.
//!
//! **Cancellation model:** each entry holds a child of the root token.
//! Cancelling the root stops every loop at its next suspension point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::execution::{activate, ActivationReport, ActivationStatus, Heartbeat, LoopContext, LoopPhase};
use crate::error::RuntimeError;
use crate::messaging::{WakeReason, WakeSignal};
use crate::org::{AgentId, AgentStatus};

/// What a wake request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeOutcome {
    /// An idle loop was started.
    Started,
    /// The loop is already running and will pick the work up.
    AlreadyActive,
    /// Rank-0 operators have no loop, or the runtime is shutting down.
    Ignored,
}

/// Read-only view of a loop entry.
#[derive(Debug, Clone, Serialize)]
pub struct LoopInfo {
    pub agent: AgentId,
    pub running: bool,
    pub phase: LoopPhase,
    pub activations: u64,
    pub silent_for_ms: u128,
    pub last_report: Option<ActivationReport>,
}

struct LoopEntry {
    heartbeat: Heartbeat,
    cancel_token: CancellationToken,
    running: bool,
    rewake: bool,
    join_handle: Option<JoinHandle<()>>,
    activations: u64,
    last_report: Option<ActivationReport>,
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: LoopContext,
    entries: Arc<Mutex<HashMap<AgentId, LoopEntry>>>,
    root_cancel_token: CancellationToken,
    reports: broadcast::Sender<ActivationReport>,
}

impl Scheduler {
    pub fn new(ctx: LoopContext, root_cancel_token: CancellationToken) -> Self {
        let (reports, _) = broadcast::channel(256);
        Self {
            ctx,
            entries: Arc::new(Mutex::new(HashMap::new())),
            root_cancel_token,
            reports,
        }
    }

    /// Wake `agent`'s loop. A no-op for operators and for loops already running.
    pub fn wake(&self, agent: &str, reason: WakeReason) -> Result<WakeOutcome, RuntimeError> {
        let record = self
            .ctx
            .org
            .get(agent)
            .filter(|r| !r.archived)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent.to_string()))?;
        if record.is_operator() {
            tracing::debug!(agent = %agent, reason = ?reason, "Operator wake ignored");
            return Ok(WakeOutcome::Ignored);
        }
        if self.root_cancel_token.is_cancelled() {
            return Ok(WakeOutcome::Ignored);
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let root = &self.root_cancel_token;
        let entry = entries.entry(agent.to_string()).or_insert_with(|| LoopEntry {
            heartbeat: Heartbeat::new(),
            cancel_token: root.child_token(),
            running: false,
            rewake: false,
            join_handle: None,
            activations: 0,
            last_report: None,
        });
        if entry.cancel_token.is_cancelled() {
            return Ok(WakeOutcome::Ignored);
        }
        if entry.running {
            entry.rewake = true;
            return Ok(WakeOutcome::AlreadyActive);
        }
        entry.running = true;
        entry.rewake = false;

        let scheduler = self.clone();
        let id = agent.to_string();
        let heartbeat = entry.heartbeat.clone();
        let cancel = entry.cancel_token.clone();
        entry.join_handle = Some(tokio::spawn(async move {
            scheduler.run_loop(id, heartbeat, cancel).await;
        }));
        tracing::debug!(agent = %agent, reason = ?reason, "Loop woken");
        Ok(WakeOutcome::Started)
    }

    async fn run_loop(&self, agent: AgentId, heartbeat: Heartbeat, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let again = match activate(&self.ctx, &agent, &heartbeat, &cancel).await {
                Ok(Some(report)) => {
                    let again = report.status != ActivationStatus::Error;
                    {
                        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(entry) = entries.get_mut(&agent) {
                            entry.activations += 1;
                            entry.last_report = Some(report.clone());
                        }
                    }
                    // No subscribers is normal.
                    let _ = self.reports.send(report);
                    again
                }
                Ok(None) => false,
                Err(err) => {
                    tracing::error!(agent = %agent, error = %err, "Activation could not start");
                    self.ctx.org.set_status(&agent, AgentStatus::Error);
                    heartbeat.beat(LoopPhase::Idle);
                    false
                }
            };

            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = entries.get_mut(&agent) else {
                break;
            };
            if (again || entry.rewake) && !cancel.is_cancelled() {
                entry.rewake = false;
                continue;
            }
            entry.running = false;
            break;
        }
        tracing::debug!(agent = %agent, "Loop idle");
    }

    /// Consume wake signals from the router until shutdown.
    pub fn spawn_dispatcher(&self, mut wake_rx: UnboundedReceiver<WakeSignal>) -> JoinHandle<()> {
        let scheduler = self.clone();
        let cancel = self.root_cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = wake_rx.recv() => {
                        let Some(signal) = signal else { break };
                        if let Err(err) = scheduler.wake(&signal.agent, signal.reason) {
                            tracing::debug!(agent = %signal.agent, error = %err, "Wake signal dropped");
                        }
                    }
                }
            }
        })
    }

    /// Periodic upkeep: re-evaluate blocked tasks and log stalled loops.
    pub fn spawn_maintenance(&self, interval: Duration, stall_threshold: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        let cancel = self.root_cancel_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match scheduler.ctx.delegation.reevaluate_blocked() {
                            Ok(unblocked) if !unblocked.is_empty() => {
                                tracing::info!(count = unblocked.len(), "Blocked tasks released");
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(error = %err, "Blocked task sweep failed"),
                        }
                        for agent in scheduler.stalled(stall_threshold) {
                            tracing::warn!(agent = %agent, threshold_secs = stall_threshold.as_secs(), "Loop stalled");
                        }
                    }
                }
            }
        })
    }

    /// Running loops that have not reported progress within `threshold`.
    /// Loops waiting on an approval are not considered stalled.
    pub fn stalled(&self, threshold: Duration) -> Vec<AgentId> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut stalled: Vec<AgentId> = entries
            .iter()
            .filter(|(id, e)| {
                e.running
                    && e.heartbeat.silent_for() > threshold
                    && self.ctx.org.status_of(id) != Some(AgentStatus::WaitingApproval)
            })
            .map(|(id, _)| id.clone())
            .collect();
        stalled.sort();
        stalled
    }

    pub fn is_running(&self, agent: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(agent).map(|e| e.running).unwrap_or(false)
    }

    pub fn info(&self, agent: &str) -> Option<LoopInfo> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(agent).map(|e| snapshot(agent, e))
    }

    pub fn list_all(&self) -> Vec<LoopInfo> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<LoopInfo> = entries.iter().map(|(id, e)| snapshot(id, e)).collect();
        all.sort_by(|a, b| a.agent.cmp(&b.agent));
        all
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<ActivationReport> {
        self.reports.subscribe()
    }

    /// Stop one agent's loop, e.g. when it is archived.
    pub fn cancel_loop(&self, agent: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(agent) {
            Some(entry) => {
                entry.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until no loop is running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let busy = {
                let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                entries.values().any(|e| e.running)
            };
            if !busy {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Cancel the root token, then await every loop with a per-handle
    /// timeout of 5 seconds.
    pub async fn shutdown(&self) {
        self.root_cancel_token.cancel();

        let handles: Vec<(AgentId, JoinHandle<()>)> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .iter_mut()
                .filter_map(|(id, e)| e.join_handle.take().map(|h| (id.clone(), h)))
                .collect()
        };

        for (agent, handle) in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!(agent = %agent, "Loop did not stop within 5s");
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values_mut() {
            entry.running = false;
        }
        tracing::info!(loops = entries.len(), "Scheduler shut down");
    }
}

fn snapshot(agent: &str, entry: &LoopEntry) -> LoopInfo {
    LoopInfo {
        agent: agent.to_string(),
        running: entry.running,
        phase: entry.heartbeat.phase(),
        activations: entry.activations,
        silent_for_ms: entry.heartbeat.silent_for().as_millis(),
        last_report: entry.last_report.clone(),
    }
}
