//! Runtime facade.
//!
//! [`Runtime::start`] wires the organisation, store, router, approval gate,
//! lock manager, delegation engine and scheduler together, spawns the
//! background workers (wake dispatcher, relay worker, lock reaper, approval
//! sweeper, maintenance tick) and exposes the operations the rest of the
//! system calls. Every operation returns [`Outcome`], so callers always get
//! a machine-readable [`ReasonCode`](crate::error::ReasonCode) on failure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::scheduler::{LoopInfo, Scheduler, WakeOutcome};
use crate::agent::execution::{ActivationReport, LoopContext, LoopSettings};
use crate::agent::journal::Journal;
use crate::agent::ReasoningBackend;
use crate::approval::{ApprovalGate, ApprovalRequest, NetworkAllowList, Resolution};
use crate::error::{Outcome, RuntimeError};
use crate::locks::{LockHolder, LockMode, LockState, ResourceKind, ResourceLock, ResourceLockManager};
use crate::messaging::{
    DeliveryReceipt, LocalDelivery, LocalLink, Message, MessageRouter, RelayBackoff, RelayQueue,
    RelayWorker, WakeReason, DEFAULT_TTL,
};
use crate::org::{AgentId, AgentSpec, Organization};
use crate::store::Store;
use crate::tasks::delegation::{DelegationEngine, MAX_OPEN_TASKS};
use crate::tasks::{SubtaskSpec, Task, TaskId, TaskInput, TaskType};
use crate::tools::ToolRegistry;

/// Tunables for a runtime instance. `Default` matches the configuration
/// defaults.
#[derive(Clone)]
pub struct RuntimeOptions {
    pub settings: LoopSettings,
    pub max_open_tasks: usize,
    pub approval_timeout: Duration,
    pub approval_sweep_interval: Duration,
    pub network_allow_list: NetworkAllowList,
    pub lock_reap_interval: Duration,
    pub default_ttl: Duration,
    pub relay_backoff: RelayBackoff,
    pub stall_threshold: Duration,
    pub maintenance_interval: Duration,
    pub journal: Journal,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            settings: LoopSettings::default(),
            max_open_tasks: MAX_OPEN_TASKS,
            approval_timeout: Duration::from_secs(600),
            approval_sweep_interval: Duration::from_secs(1),
            network_allow_list: NetworkAllowList::deny_all(),
            lock_reap_interval: Duration::from_secs(1),
            default_ttl: DEFAULT_TTL,
            relay_backoff: RelayBackoff::default(),
            stall_threshold: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(30),
            journal: Journal::disabled(),
        }
    }
}

/// What `request_delegation` should do.
#[derive(Debug, Clone)]
pub enum DelegationRequest {
    /// Create a root task for an entry agent.
    Submit {
        entry: AgentId,
        created_by: AgentId,
        task_type: TaskType,
        input: TaskInput,
    },
    /// Walk `chain` down from the task's assignee, one nested child per level.
    Chain { task_id: TaskId, chain: Vec<AgentId> },
    /// Split a task into children for the delegator's direct subordinates.
    Split {
        parent_id: TaskId,
        delegator: AgentId,
        subtasks: Vec<SubtaskSpec>,
    },
}

pub struct Runtime {
    org: Arc<Organization>,
    store: Arc<dyn Store>,
    router: MessageRouter,
    gate: ApprovalGate,
    locks: ResourceLockManager,
    delegation: DelegationEngine,
    scheduler: Scheduler,
    relay_link: Arc<LocalLink>,
    journal: Journal,
    lock_ttl: Duration,
    root_cancel_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build and start a runtime. Must be called inside a tokio runtime.
    pub fn start(
        org: Arc<Organization>,
        store: Arc<dyn Store>,
        tools: ToolRegistry,
        backend: Arc<dyn ReasoningBackend>,
        options: RuntimeOptions,
    ) -> Self {
        let root_cancel_token = CancellationToken::new();
        let journal = options.journal.clone();

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let local = LocalDelivery::new(store.clone(), wake_tx);
        let (relay_queue, relay_inbox) = RelayQueue::channel();
        let relay_link = Arc::new(LocalLink::new(local.clone()));

        let router = MessageRouter::new(
            org.clone(),
            store.clone(),
            local.clone(),
            relay_queue,
            journal.clone(),
            options.default_ttl,
        );
        let gate = ApprovalGate::new(
            org.clone(),
            store.clone(),
            options.network_allow_list.clone(),
            options.approval_timeout,
            journal.clone(),
        );
        let locks = ResourceLockManager::new(journal.clone());
        let delegation = DelegationEngine::new(
            org.clone(),
            store.clone(),
            router.clone(),
            options.max_open_tasks,
            root_cancel_token.child_token(),
        );

        let ctx = LoopContext {
            org: org.clone(),
            store: store.clone(),
            router: router.clone(),
            gate: gate.clone(),
            locks: locks.clone(),
            delegation: delegation.clone(),
            tools,
            backend,
            journal: journal.clone(),
            settings: options.settings.clone(),
        };
        let scheduler = Scheduler::new(ctx, root_cancel_token.clone());

        let background = vec![
            scheduler.spawn_dispatcher(wake_rx),
            scheduler.spawn_maintenance(options.maintenance_interval, options.stall_threshold),
            RelayWorker::new(
                relay_inbox,
                relay_link.clone(),
                local,
                journal.clone(),
                options.relay_backoff,
            )
            .spawn(root_cancel_token.child_token()),
            locks.spawn_reaper(options.lock_reap_interval, root_cancel_token.child_token()),
            gate.spawn_sweeper(options.approval_sweep_interval, root_cancel_token.child_token()),
        ];

        tracing::info!(
            agents = org.active_ids().len(),
            round_cap = options.settings.round_cap(),
            max_open_tasks = options.max_open_tasks,
            "Runtime started"
        );

        Self {
            org,
            store,
            router,
            gate,
            locks,
            delegation,
            scheduler,
            relay_link,
            journal,
            lock_ttl: options.settings.lock_ttl,
            root_cancel_token,
            background: Mutex::new(background),
        }
    }

    pub fn wake(&self, agent: &str, reason: WakeReason) -> Outcome<WakeOutcome> {
        Ok(self.scheduler.wake(agent, reason)?)
    }

    pub fn send_message(&self, message: Message) -> Outcome<DeliveryReceipt> {
        Ok(self.router.send(message)?)
    }

    pub fn request_delegation(&self, request: DelegationRequest) -> Outcome<Vec<Task>> {
        let tasks = match request {
            DelegationRequest::Submit {
                entry,
                created_by,
                task_type,
                input,
            } => vec![self.delegation.submit(&entry, &created_by, task_type, input)?],
            DelegationRequest::Chain { task_id, chain } => self.delegation.delegate_chain(&task_id, &chain)?,
            DelegationRequest::Split {
                parent_id,
                delegator,
                subtasks,
            } => self.delegation.split(&parent_id, &delegator, subtasks)?,
        };
        Ok(tasks)
    }

    /// Acquire a lock. A conflict is a failure with reason
    /// `resource_conflict` naming the current holder. `ttl` defaults to the
    /// configured lock ttl.
    pub fn acquire_lock(
        &self,
        resource: &str,
        kind: ResourceKind,
        mode: LockMode,
        holder: LockHolder,
        ttl: Option<Duration>,
    ) -> Outcome<ResourceLock> {
        let ttl = ttl.unwrap_or(self.lock_ttl);
        Ok(self.locks.acquire(resource, kind, mode, holder, ttl).into_result(resource)?)
    }

    pub fn release_lock(&self, resource: &str, holder: &LockHolder) -> Outcome<()> {
        Ok(self.locks.release(resource, holder)?)
    }

    pub fn lock_state(&self, resource: &str) -> LockState {
        self.locks.is_locked(resource)
    }

    pub fn resolve_approval(&self, request_id: &str, approver: &str, approve: bool) -> Outcome<Resolution> {
        Ok(self.gate.resolve(request_id, approver, approve)?)
    }

    pub fn pending_approvals(&self, approver: &str) -> Outcome<Vec<ApprovalRequest>> {
        Ok(self.gate.pending_for(approver)?)
    }

    pub fn subscribe_approvals(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.gate.subscribe()
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<ActivationReport> {
        self.scheduler.subscribe_reports()
    }

    pub fn cancel_task(&self, task_id: &str, requester: &str) -> Outcome<Vec<TaskId>> {
        Ok(self.delegation.cancel(task_id, requester)?)
    }

    pub fn reassign_task(&self, task_id: &str, requester: &str, new_assignee: &str) -> Outcome<Task> {
        Ok(self.delegation.reassign(task_id, requester, new_assignee)?)
    }

    pub fn task(&self, task_id: &str) -> Outcome<Task> {
        Ok(self.store.get_task(task_id).map_err(RuntimeError::from)?)
    }

    /// Poll until the task reaches a terminal status or `timeout` elapses,
    /// returning its latest state either way.
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> Outcome<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.task(task_id)?;
            if task.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn hire_agent(&self, spec: AgentSpec) -> Outcome<()> {
        let id = spec.id.clone();
        self.org.hire(spec)?;
        tracing::info!(agent = %id, "Agent hired");
        Ok(())
    }

    /// Archive an agent. Refused while it still holds non-terminal tasks;
    /// those must be reassigned first.
    pub fn archive_agent(&self, agent: &str) -> Outcome<()> {
        if !self.org.is_active(agent) {
            return Err(RuntimeError::UnknownAgent(agent.to_string()).into());
        }
        let open = self.store.open_task_count(agent).map_err(RuntimeError::from)?;
        if open > 0 {
            return Err(RuntimeError::AgentBusy(agent.to_string()).into());
        }
        self.scheduler.cancel_loop(agent);
        self.org.archive(agent);
        tracing::info!(agent = %agent, "Agent archived");
        Ok(())
    }

    pub fn loops(&self) -> Vec<LoopInfo> {
        self.scheduler.list_all()
    }

    pub fn stalled(&self, threshold: Duration) -> Vec<AgentId> {
        self.scheduler.stalled(threshold)
    }

    /// Wait until no execution loop is running.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout).await
    }

    pub fn org(&self) -> &Arc<Organization> {
        &self.org
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn locks(&self) -> &ResourceLockManager {
        &self.locks
    }

    pub fn delegation(&self) -> &DelegationEngine {
        &self.delegation
    }

    /// The in-process cross-scope link; take it offline to simulate an
    /// unavailable relay.
    pub fn relay_link(&self) -> &LocalLink {
        &self.relay_link
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Stop every loop and background worker. Each handle gets 5 seconds.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.root_cancel_token.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.drain(..).collect()
        };
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        tracing::info!("Runtime stopped");
    }
}
