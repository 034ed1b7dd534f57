//! Rank-based approval gate.
//!
//! Given an actor and an action's [`RiskTier`], the gate either lets the
//! action proceed or files an [`ApprovalRequest`] with the actor's approver
//! and hands back its id. The approver is the actor's direct superior, except
//! for rank-1 actors whose approver is always the rank-0 operator at the top
//! of their tree. Requests resolve exactly once: approved, denied, or timed
//! out at their deadline. Later resolutions are ignored and report the
//! original outcome.

pub mod allow_list;
pub mod risk;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::journal::{now_iso, Journal, JournalEntry};
use crate::error::RuntimeError;
use crate::org::{AgentId, Organization, COORDINATION_RANK, OPERATOR_RANK};
use crate::store::Store;
use crate::tasks::TaskId;

pub use allow_list::NetworkAllowList;
pub use risk::RiskTier;

pub type RequestId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

impl Resolution {
    pub fn is_final(&self) -> bool {
        !matches!(self, Resolution::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Pending => "pending",
            Resolution::Approved => "approved",
            Resolution::Denied => "denied",
            Resolution::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the actor wants to do, as shown to the approver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub description: String,
    /// Resource the action touches (URL for network actions).
    pub resource: Option<String>,
    pub task_id: Option<TaskId>,
}

impl PendingAction {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn on_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub actor: AgentId,
    pub action: PendingAction,
    pub risk: RiskTier,
    /// Snapshot of [`ApprovalGate::approver_for`] at filing time. The
    /// request was routed to this agent, so only it may resolve the request
    /// even if the hierarchy changes while it is pending.
    pub approver: AgentId,
    pub resolution: Resolution,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Proceed,
    Await {
        approver: AgentId,
        request_id: RequestId,
    },
}

struct Waiter {
    tx: watch::Sender<Resolution>,
    deadline: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ApprovalGate {
    org: Arc<Organization>,
    store: Arc<dyn Store>,
    allow_list: Arc<NetworkAllowList>,
    timeout: Duration,
    journal: Journal,
    waiters: Arc<Mutex<HashMap<RequestId, Waiter>>>,
    filed: broadcast::Sender<ApprovalRequest>,
}

impl ApprovalGate {
    pub fn new(
        org: Arc<Organization>,
        store: Arc<dyn Store>,
        allow_list: NetworkAllowList,
        timeout: Duration,
        journal: Journal,
    ) -> Self {
        let (filed, _) = broadcast::channel(64);
        Self {
            org,
            store,
            allow_list: Arc::new(allow_list),
            timeout,
            journal,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            filed,
        }
    }

    /// Who approves `actor`'s actions. `None` for rank-0 operators.
    pub fn approver_for(&self, actor: &str) -> Result<Option<AgentId>, RuntimeError> {
        let record = self
            .org
            .get(actor)
            .filter(|r| !r.archived)
            .ok_or_else(|| RuntimeError::UnknownAgent(actor.to_string()))?;
        let approver = match record.rank {
            OPERATOR_RANK => None,
            COORDINATION_RANK => self.org.root_of(actor),
            _ => record.reports_to,
        };
        match approver {
            Some(id) => Ok(Some(id)),
            None if record.rank == OPERATOR_RANK => Ok(None),
            None => Err(RuntimeError::UnknownAgent(format!("superior of {actor}"))),
        }
    }

    pub fn evaluate(
        &self,
        actor: &str,
        risk: RiskTier,
        action: PendingAction,
    ) -> Result<GateDecision, RuntimeError> {
        let approver = self.approver_for(actor)?;

        if risk.requires_allow_list() {
            let resource = action.resource.as_deref().unwrap_or_default();
            if !self.allow_list.permits(resource) {
                tracing::warn!(agent = %actor, resource = %resource, "Network access refused");
                return Err(RuntimeError::NetworkNotAllowed(resource.to_string()));
            }
        }

        let approver = match approver {
            Some(approver) if risk.requires_approval() => approver,
            _ => return Ok(GateDecision::Proceed),
        };

        let now = Utc::now();
        let deadline = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            actor: actor.to_string(),
            action,
            risk,
            approver: approver.clone(),
            resolution: Resolution::Pending,
            created_at: now,
            deadline,
            resolved_at: None,
        };

        {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            self.store.put_approval(request.clone())?;
            let (tx, _) = watch::channel(Resolution::Pending);
            waiters.insert(request.id.clone(), Waiter { tx, deadline });
        }

        tracing::info!(
            request = %request.id,
            agent = %actor,
            approver = %approver,
            risk = %risk,
            "Approval requested"
        );
        self.journal.record(JournalEntry::ApprovalRequested {
            timestamp: now_iso(),
            request_id: request.id.clone(),
            actor: actor.to_string(),
            approver: approver.clone(),
            risk: risk.to_string(),
            action: request.action.description.clone(),
        });
        let request_id = request.id.clone();
        // No subscribers is normal outside the CLI.
        let _ = self.filed.send(request);

        Ok(GateDecision::Await {
            approver,
            request_id,
        })
    }

    /// Suspend until the request resolves, its deadline passes, or `cancel`
    /// fires. A deadline resolves the request as `timed_out`.
    pub async fn wait(
        &self,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Resolution, RuntimeError> {
        let (mut rx, deadline) = {
            let waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            match waiters.get(request_id) {
                Some(w) => (w.tx.subscribe(), w.deadline),
                None => return Ok(self.get(request_id)?.resolution),
            }
        };

        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let expiry = tokio::time::sleep(remaining);
        tokio::pin!(expiry);

        loop {
            let current = *rx.borrow_and_update();
            if current.is_final() {
                return Ok(current);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RuntimeError::Cancelled(request_id.to_string()));
                }
                _ = &mut expiry => {
                    return Ok(self.finalize(request_id, Resolution::TimedOut)?.resolution);
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(self.get(request_id)?.resolution);
                    }
                }
            }
        }
    }

    /// Record `approver`'s decision. Returns the request's final resolution,
    /// which is the original one if it was already resolved.
    pub fn resolve(
        &self,
        request_id: &str,
        approver: &str,
        approve: bool,
    ) -> Result<Resolution, RuntimeError> {
        let request = self.get(request_id)?;
        if request.approver != approver {
            return Err(RuntimeError::NotAuthorized(format!(
                "{approver} is not the approver of request {request_id}"
            )));
        }
        let decision = if approve {
            Resolution::Approved
        } else {
            Resolution::Denied
        };
        Ok(self.finalize(request_id, decision)?.resolution)
    }

    pub fn get(&self, request_id: &str) -> Result<ApprovalRequest, RuntimeError> {
        self.store
            .get_approval(request_id)?
            .ok_or_else(|| RuntimeError::UnknownApproval(request_id.to_string()))
    }

    /// Unresolved requests addressed to `approver`, oldest first.
    pub fn pending_for(&self, approver: &str) -> Result<Vec<ApprovalRequest>, RuntimeError> {
        let ids: Vec<RequestId> = {
            let waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.keys().cloned().collect()
        };
        let mut requests = Vec::new();
        for id in ids {
            if let Some(request) = self.store.get_approval(&id)? {
                if request.approver == approver && !request.resolution.is_final() {
                    requests.push(request);
                }
            }
        }
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    /// Newly filed requests, for operator consoles.
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.filed.subscribe()
    }

    /// Time out every pending request whose deadline has passed.
    pub fn expire_overdue(&self) -> Vec<RequestId> {
        let now = Utc::now();
        let overdue: Vec<RequestId> = {
            let waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters
                .iter()
                .filter(|(_, w)| w.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };
        overdue
            .into_iter()
            .filter(|id| match self.finalize(id, Resolution::TimedOut) {
                Ok(request) => request.resolution == Resolution::TimedOut,
                Err(e) => {
                    tracing::warn!(request = %id, "Failed to expire approval request: {e}");
                    false
                }
            })
            .collect()
    }

    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        gate.expire_overdue();
                    }
                }
            }
        })
    }

    /// Move a pending request to `resolution`. A request that is already
    /// final is returned unchanged.
    fn finalize(
        &self,
        request_id: &str,
        resolution: Resolution,
    ) -> Result<ApprovalRequest, RuntimeError> {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        let mut request = self.get(request_id)?;
        if request.resolution.is_final() {
            return Ok(request);
        }
        request.resolution = resolution;
        request.resolved_at = Some(Utc::now());
        self.store.put_approval(request.clone())?;
        if let Some(waiter) = waiters.remove(request_id) {
            let _ = waiter.tx.send(resolution);
        }
        drop(waiters);

        tracing::info!(
            request = %request_id,
            agent = %request.actor,
            approver = %request.approver,
            resolution = %resolution,
            "Approval resolved"
        );
        self.journal.record(JournalEntry::ApprovalResolved {
            timestamp: now_iso(),
            request_id: request_id.to_string(),
            resolution: resolution.to_string(),
        });
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::org::AgentSpec;
    use crate::store::MemoryStore;

    fn gate_with(timeout: Duration, allow: &[&str]) -> ApprovalGate {
        let org = Organization::from_specs(vec![
            AgentSpec::new("ceo", 0, "exec", None),
            AgentSpec::new("lead", 1, "eng", Some("ceo")),
            AgentSpec::new("dev", 2, "eng", Some("lead")),
            AgentSpec::new("intern", 3, "eng", Some("dev")),
        ])
        .unwrap();
        let patterns: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        ApprovalGate::new(
            Arc::new(org),
            Arc::new(MemoryStore::new()),
            NetworkAllowList::new(&patterns).unwrap(),
            timeout,
            Journal::disabled(),
        )
    }

    fn gate() -> ApprovalGate {
        gate_with(Duration::from_secs(60), &[])
    }

    fn awaited(decision: GateDecision) -> (AgentId, RequestId) {
        match decision {
            GateDecision::Await {
                approver,
                request_id,
            } => (approver, request_id),
            GateDecision::Proceed => panic!("expected an approval request"),
        }
    }

    #[test]
    fn approver_follows_rank_rules() {
        let gate = gate();
        assert_eq!(gate.approver_for("ceo").unwrap(), None);
        assert_eq!(gate.approver_for("lead").unwrap().as_deref(), Some("ceo"));
        assert_eq!(gate.approver_for("dev").unwrap().as_deref(), Some("lead"));
        assert_eq!(gate.approver_for("intern").unwrap().as_deref(), Some("dev"));
        assert!(matches!(
            gate.approver_for("ghost"),
            Err(RuntimeError::UnknownAgent(_))
        ));
    }

    #[test]
    fn low_risk_and_operators_proceed() {
        let gate = gate();
        assert_eq!(
            gate.evaluate("dev", RiskTier::Low, PendingAction::new("read")).unwrap(),
            GateDecision::Proceed
        );
        assert_eq!(
            gate.evaluate("ceo", RiskTier::High, PendingAction::new("rm")).unwrap(),
            GateDecision::Proceed
        );
    }

    #[tokio::test]
    async fn high_risk_waits_for_superior() {
        let gate = gate();
        let decision = gate
            .evaluate("dev", RiskTier::High, PendingAction::new("delete build dir"))
            .unwrap();
        let (approver, request_id) = awaited(decision);
        assert_eq!(approver, "lead");

        let waiter = {
            let gate = gate.clone();
            let id = request_id.clone();
            tokio::spawn(async move { gate.wait(&id, &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(gate.resolve(&request_id, "lead", true).unwrap(), Resolution::Approved);

        assert_eq!(waiter.await.unwrap().unwrap(), Resolution::Approved);
        assert_eq!(gate.get(&request_id).unwrap().resolution, Resolution::Approved);
    }

    #[test]
    fn second_resolution_returns_first() {
        let gate = gate();
        let (_, id) = awaited(gate.evaluate("dev", RiskTier::Medium, PendingAction::new("write")).unwrap());
        assert_eq!(gate.resolve(&id, "lead", false).unwrap(), Resolution::Denied);
        assert_eq!(gate.resolve(&id, "lead", true).unwrap(), Resolution::Denied);
        assert_eq!(gate.get(&id).unwrap().resolution, Resolution::Denied);
    }

    #[test]
    fn only_the_approver_may_resolve() {
        let gate = gate();
        let (_, id) = awaited(gate.evaluate("intern", RiskTier::High, PendingAction::new("exec")).unwrap());
        assert!(matches!(
            gate.resolve(&id, "lead", true),
            Err(RuntimeError::NotAuthorized(_))
        ));
        assert_eq!(gate.pending_for("dev").unwrap().len(), 1);
        assert!(gate.pending_for("lead").unwrap().is_empty());
    }

    #[test]
    fn approver_is_fixed_when_filed() {
        let gate = gate();
        let (approver, id) = awaited(gate.evaluate("intern", RiskTier::High, PendingAction::new("exec")).unwrap());
        assert_eq!(Some(approver), gate.approver_for("intern").unwrap());

        // The actor leaves; the request stays with the agent it was sent to.
        assert!(gate.org.archive("intern"));
        assert!(gate.approver_for("intern").is_err());
        assert_eq!(gate.get(&id).unwrap().approver, "dev");
        assert_eq!(gate.pending_for("dev").unwrap().len(), 1);
        assert_eq!(gate.resolve(&id, "dev", false).unwrap(), Resolution::Denied);
    }

    #[tokio::test]
    async fn unresolved_request_times_out() {
        let gate = gate_with(Duration::from_millis(30), &[]);
        let (_, id) = awaited(gate.evaluate("dev", RiskTier::High, PendingAction::new("exec")).unwrap());
        let resolution = gate.wait(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(resolution, Resolution::TimedOut);
        // A late decision has no effect.
        assert_eq!(gate.resolve(&id, "lead", true).unwrap(), Resolution::TimedOut);
    }

    #[tokio::test]
    async fn sweep_expires_overdue_requests() {
        let gate = gate_with(Duration::from_millis(10), &[]);
        let (_, id) = awaited(gate.evaluate("dev", RiskTier::Medium, PendingAction::new("write")).unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(gate.expire_overdue(), vec![id.clone()]);
        assert!(gate.expire_overdue().is_empty());
        assert_eq!(gate.get(&id).unwrap().resolution, Resolution::TimedOut);
    }

    #[test]
    fn network_requires_allow_list_then_approval() {
        let gate = gate_with(Duration::from_secs(60), &[r"^https://docs\.rs/"]);
        let refused = gate.evaluate(
            "dev",
            RiskTier::Network,
            PendingAction::new("fetch").on_resource("https://example.com"),
        );
        assert!(matches!(refused, Err(RuntimeError::NetworkNotAllowed(_))));

        let decision = gate
            .evaluate(
                "dev",
                RiskTier::Network,
                PendingAction::new("fetch").on_resource("https://docs.rs/tokio"),
            )
            .unwrap();
        assert_eq!(awaited(decision).0, "lead");
    }

    #[tokio::test]
    async fn cancelled_wait_returns_cancelled() {
        let gate = gate();
        let (_, id) = awaited(gate.evaluate("dev", RiskTier::High, PendingAction::new("exec")).unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            gate.wait(&id, &cancel).await,
            Err(RuntimeError::Cancelled(_))
        ));
    }
}
