//! Task delegation engine.
//!
//! Creates tasks along the reporting chain and owns their status
//! transitions. Capacity is checked at creation time under a single creation
//! lock, so two concurrent splits cannot both squeeze past the open-task
//! limit. Status moves that race with an execution loop go through the
//! store's compare-and-set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::graph;
use super::{SubtaskSpec, Task, TaskId, TaskInput, TaskOutput, TaskStatus, TaskType};
use crate::error::{ReasonCode, RuntimeError, StoreError, ValidationError};
use crate::messaging::{Message, MessageKind, MessageRouter, Priority, SYSTEM_SENDER};
use crate::org::{AgentId, Organization};
use crate::store::Store;

/// Default open-task limit for execution-tier agents.
pub const MAX_OPEN_TASKS: usize = 5;

#[derive(Clone)]
pub struct DelegationEngine {
    org: Arc<Organization>,
    store: Arc<dyn Store>,
    router: MessageRouter,
    max_open_tasks: usize,
    tokens: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    root: CancellationToken,
    creation: Arc<Mutex<()>>,
}

impl DelegationEngine {
    pub fn new(
        org: Arc<Organization>,
        store: Arc<dyn Store>,
        router: MessageRouter,
        max_open_tasks: usize,
        root: CancellationToken,
    ) -> Self {
        Self {
            org,
            store,
            router,
            max_open_tasks,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            root,
            creation: Arc::new(Mutex::new(())),
        }
    }

    /// Create a root task for `entry`. This is the external ingress.
    pub fn submit(
        &self,
        entry: &str,
        created_by: &str,
        task_type: TaskType,
        input: TaskInput,
    ) -> Result<Task, RuntimeError> {
        if input.objective.trim().is_empty() {
            return Err(ValidationError::EmptyObjective.into());
        }
        if !self.org.is_active(entry) {
            return Err(RuntimeError::UnknownAgent(entry.to_string()));
        }

        let mut task = Task::new(task_type, entry, created_by, input);
        task.touch_status(TaskStatus::Assigned);
        {
            let _guard = self.creation.lock().unwrap_or_else(|e| e.into_inner());
            self.check_capacity(entry, 1)?;
            self.insert_linked(&task)?;
        }
        tracing::info!(task = %task.id, agent = %entry, "Task submitted");
        self.dispatch(&task);
        Ok(task)
    }

    /// Split `parent_id` into an ordered batch of children for `delegator`'s
    /// direct subordinates. `depends_on` indices refer to siblings in the batch.
    pub fn split(
        &self,
        parent_id: &str,
        delegator: &str,
        specs: Vec<SubtaskSpec>,
    ) -> Result<Vec<Task>, RuntimeError> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let tasks = {
            let _guard = self.creation.lock().unwrap_or_else(|e| e.into_inner());
            let parent = self.store.get_task(parent_id)?;
            if parent.assignee != delegator {
                return Err(RuntimeError::NotAuthorized(format!(
                    "{delegator} is not the assignee of task {parent_id}"
                )));
            }
            if parent.status.is_terminal() {
                return Err(RuntimeError::AlreadyTerminal {
                    task: parent.id,
                    status: parent.status,
                });
            }
            for spec in &specs {
                if spec.objective.trim().is_empty() {
                    return Err(ValidationError::EmptyObjective.into());
                }
                if !self.org.is_direct_subordinate(delegator, &spec.assignee) {
                    return Err(RuntimeError::NotSubordinate {
                        delegator: delegator.to_string(),
                        assignee: spec.assignee.clone(),
                    });
                }
            }
            graph::sibling_order(&specs)?;

            let mut batch: HashMap<&str, usize> = HashMap::new();
            for spec in &specs {
                *batch.entry(spec.assignee.as_str()).or_default() += 1;
            }
            for (assignee, requested) in batch {
                self.check_capacity(assignee, requested)?;
            }

            let context = format!("Part of task {}: {}", parent.id, parent.input.objective);
            let mut tasks: Vec<Task> = specs
                .iter()
                .map(|spec| {
                    let input = TaskInput {
                        objective: spec.objective.clone(),
                        acceptance_criteria: spec.acceptance_criteria.clone(),
                        context: context.clone(),
                        constraints: parent.input.constraints.clone(),
                    };
                    Task::new(spec.task_type, &spec.assignee, delegator, input).with_parent(parent_id)
                })
                .collect();
            let ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
            for (task, spec) in tasks.iter_mut().zip(&specs) {
                task.dependencies
                    .extend(spec.depends_on.iter().map(|&i| ids[i].clone()));
                let status = if task.dependencies.is_empty() {
                    TaskStatus::Assigned
                } else {
                    TaskStatus::Blocked
                };
                task.touch_status(status);
            }

            for task in &tasks {
                self.insert_linked(task)?;
            }
            self.store
                .update_task(parent_id, &mut |p| p.children.extend(ids.iter().cloned()))?;
            tasks
        };

        for task in &tasks {
            if task.status == TaskStatus::Assigned {
                self.dispatch(task);
            }
        }
        tracing::info!(
            task = %parent_id,
            agent = %delegator,
            children = tasks.len(),
            "Task split"
        );
        Ok(tasks)
    }

    /// Hand `task_id` down the reporting chain, one nested child per level.
    /// `chain[0]` must report to the task's assignee and each later entry to
    /// the one before it. Intermediate holders wait in `reviewing`; only the
    /// final assignee is dispatched.
    pub fn delegate_chain(&self, task_id: &str, chain: &[AgentId]) -> Result<Vec<Task>, RuntimeError> {
        let Some(last) = chain.len().checked_sub(1) else {
            return Ok(Vec::new());
        };

        let tasks = {
            let _guard = self.creation.lock().unwrap_or_else(|e| e.into_inner());
            let root = self.store.get_task(task_id)?;
            if root.status.is_terminal() {
                return Err(RuntimeError::AlreadyTerminal {
                    task: root.id,
                    status: root.status,
                });
            }
            let mut holder = root.assignee.clone();
            for agent in chain {
                if !self.org.is_direct_subordinate(&holder, agent) {
                    return Err(RuntimeError::NotSubordinate {
                        delegator: holder,
                        assignee: agent.clone(),
                    });
                }
                holder = agent.clone();
            }
            for agent in chain {
                self.check_capacity(agent, 1)?;
            }

            let mut tasks = Vec::with_capacity(chain.len());
            let mut parent = root.id.clone();
            let mut delegator = root.assignee.clone();
            for (level, agent) in chain.iter().enumerate() {
                let task_type = if level == last {
                    TaskType::Execute
                } else {
                    TaskType::Plan
                };
                let mut task =
                    Task::new(task_type, agent, &delegator, root.input.clone()).with_parent(&parent);
                task.touch_status(if level == last {
                    TaskStatus::Assigned
                } else {
                    TaskStatus::Reviewing
                });
                self.insert_linked(&task)?;
                let child = task.id.clone();
                self.store
                    .update_task(&parent, &mut |p| p.children.push(child.clone()))?;
                parent = task.id.clone();
                delegator = agent.clone();
                tasks.push(task);
            }

            if root.status == TaskStatus::Assigned {
                self.store
                    .compare_and_set_status(&root.id, TaskStatus::Assigned, TaskStatus::Reviewing)?;
            }
            tasks
        };

        if let Some(leaf) = tasks.last() {
            self.dispatch(leaf);
            tracing::info!(task = %task_id, leaf = %leaf.id, assignee = %leaf.assignee, depth = tasks.len(), "Task delegated down the chain");
        }
        Ok(tasks)
    }

    /// Make `task_id` wait for `depends_on`. Rejects edges that would close a
    /// cycle through dependency or parent/child edges.
    pub fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<(), RuntimeError> {
        if task_id == depends_on {
            return Err(ValidationError::DependencyCycle(task_id.to_string()).into());
        }
        let task = self.store.get_task(task_id)?;
        let dependency = self.store.get_task(depends_on).map_err(|e| match e {
            StoreError::NotFound { .. } => {
                RuntimeError::from(ValidationError::UnknownDependency(depends_on.to_string()))
            }
            other => other.into(),
        })?;
        if task.status.is_terminal() {
            return Err(RuntimeError::AlreadyTerminal {
                task: task.id,
                status: task.status,
            });
        }

        let store = self.store.clone();
        let cyclic = graph::reaches(depends_on, task_id, |id| {
            let t = store.get_task(id)?;
            Ok(t.dependencies.into_iter().chain(t.children).collect())
        })?;
        if cyclic {
            return Err(ValidationError::DependencyCycle(task_id.to_string()).into());
        }

        let satisfied = dependency.status == TaskStatus::Completed;
        if !satisfied && task.status == TaskStatus::InProgress {
            return Err(ValidationError::AlreadyStarted(task_id.to_string()).into());
        }
        let dep = depends_on.to_string();
        self.store.update_task(task_id, &mut |t| {
            t.dependencies.insert(dep.clone());
            if !satisfied && matches!(t.status, TaskStatus::Assigned | TaskStatus::Pending) {
                t.touch_status(TaskStatus::Blocked);
            }
        })?;
        tracing::debug!(task = %task_id, depends_on = %depends_on, "Dependency added");
        Ok(())
    }

    /// The oldest assigned task of `agent` whose dependencies are met.
    pub fn runnable_for(&self, agent: &str) -> Result<Option<Task>, RuntimeError> {
        for task in self.store.tasks_for(agent)? {
            if task.status == TaskStatus::Assigned && self.dependencies_met(&task)? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Move an assigned task to `in_progress`. Returns `false` when another
    /// claim won or a dependency is no longer met.
    pub fn claim(&self, task_id: &str, agent: &str) -> Result<bool, RuntimeError> {
        let task = self.store.get_task(task_id)?;
        if task.assignee != agent {
            return Err(RuntimeError::NotAuthorized(format!(
                "{agent} is not the assignee of task {task_id}"
            )));
        }
        if !self.dependencies_met(&task)? {
            self.store
                .compare_and_set_status(task_id, TaskStatus::Assigned, TaskStatus::Blocked)?;
            return Ok(false);
        }
        Ok(self
            .store
            .compare_and_set_status(task_id, TaskStatus::Assigned, TaskStatus::InProgress)?)
    }

    /// Record the assignee's completion. A task with open children waits in
    /// `reviewing` and completes when its last child does.
    pub fn complete(
        &self,
        task_id: &str,
        agent: &str,
        output: TaskOutput,
    ) -> Result<TaskStatus, RuntimeError> {
        let task = self.store.get_task(task_id)?;
        if task.assignee != agent {
            return Err(RuntimeError::NotAuthorized(format!(
                "{agent} is not the assignee of task {task_id}"
            )));
        }
        if task.status.is_terminal() {
            return Err(RuntimeError::AlreadyTerminal {
                task: task.id,
                status: task.status,
            });
        }

        let open_children = self
            .store
            .children_of(task_id)?
            .iter()
            .any(|c| !c.status.is_terminal());
        let status = if open_children {
            TaskStatus::Reviewing
        } else {
            TaskStatus::Completed
        };
        let mut output = Some(output);
        self.store.update_task(task_id, &mut |t| {
            if let Some(out) = output.take() {
                t.output = Some(out);
            }
            t.touch_status(status);
        })?;
        tracing::info!(task = %task_id, agent = %agent, status = %status, "Task completion recorded");

        if status == TaskStatus::Completed {
            self.on_completed(task_id)?;
        }
        Ok(status)
    }

    /// Mark a task failed. A parent waiting in `reviewing` is reopened so its
    /// assignee can re-plan.
    pub fn fail(&self, task_id: &str, reason: ReasonCode, summary: &str) -> Result<(), RuntimeError> {
        let mut changed = false;
        let task = self.store.update_task(task_id, &mut |t| {
            if !t.status.is_terminal() {
                t.failure_reason = Some(reason);
                t.output = Some(TaskOutput {
                    summary: summary.to_string(),
                    ..Default::default()
                });
                t.touch_status(TaskStatus::Failed);
                changed = true;
            }
        })?;
        if !changed {
            return Ok(());
        }
        self.drop_token(task_id);
        tracing::warn!(task = %task_id, agent = %task.assignee, %reason, "Task failed");

        if let Some(parent_id) = &task.parent_id {
            let parent = self.store.get_task(parent_id)?;
            if parent.status == TaskStatus::Reviewing
                && self.store.compare_and_set_status(
                    parent_id,
                    TaskStatus::Reviewing,
                    TaskStatus::Assigned,
                )?
            {
                self.notify(
                    &parent.assignee,
                    parent_id,
                    &format!("Subtask {task_id} failed ({reason}); task {parent_id} is reopened for re-planning"),
                );
            }
        }
        Ok(())
    }

    /// Cancel a task and every non-terminal descendant. Permitted to the
    /// task's creator or any ancestor of its assignee.
    pub fn cancel(&self, task_id: &str, requester: &str) -> Result<Vec<TaskId>, RuntimeError> {
        let task = self.store.get_task(task_id)?;
        let authorized = requester == SYSTEM_SENDER
            || requester == task.created_by
            || self.org.is_ancestor(requester, &task.assignee);
        if !authorized {
            return Err(RuntimeError::NotAuthorized(format!(
                "{requester} may not cancel task {task_id}"
            )));
        }
        if task.status.is_terminal() {
            return Err(RuntimeError::AlreadyTerminal {
                task: task.id,
                status: task.status,
            });
        }

        let mut cancelled = Vec::new();
        let mut worklist = vec![task_id.to_string()];
        while let Some(id) = worklist.pop() {
            let mut changed = false;
            let current = self.store.update_task(&id, &mut |t| {
                if !t.status.is_terminal() {
                    t.failure_reason = Some(ReasonCode::Cancelled);
                    t.touch_status(TaskStatus::Cancelled);
                    changed = true;
                }
            })?;
            worklist.extend(current.children.iter().cloned());
            if changed {
                if let Some(token) = self.take_token(&id) {
                    token.cancel();
                }
                self.notify(&current.assignee, &id, &format!("Task {id} was cancelled by {requester}"));
                cancelled.push(id);
            }
        }
        tracing::info!(task = %task_id, requester = %requester, count = cancelled.len(), "Task cancelled");
        Ok(cancelled)
    }

    /// Move a not-yet-started task to another agent.
    pub fn reassign(&self, task_id: &str, requester: &str, new_assignee: &str) -> Result<Task, RuntimeError> {
        let _guard = self.creation.lock().unwrap_or_else(|e| e.into_inner());
        let task = self.store.get_task(task_id)?;
        let authorized = requester == SYSTEM_SENDER
            || requester == task.created_by
            || self.org.is_ancestor(requester, &task.assignee);
        if !authorized {
            return Err(RuntimeError::NotAuthorized(format!(
                "{requester} may not reassign task {task_id}"
            )));
        }
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Blocked | TaskStatus::Pending) {
            return Err(RuntimeError::NotAuthorized(format!(
                "task {task_id} is {} and cannot be reassigned",
                task.status
            )));
        }
        if !self.org.is_active(new_assignee) {
            return Err(RuntimeError::UnknownAgent(new_assignee.to_string()));
        }
        if self.org.is_active(&task.created_by)
            && !self.org.is_direct_subordinate(&task.created_by, new_assignee)
        {
            return Err(RuntimeError::NotSubordinate {
                delegator: task.created_by.clone(),
                assignee: new_assignee.to_string(),
            });
        }
        self.check_capacity(new_assignee, 1)?;

        let assignee = new_assignee.to_string();
        let task = self
            .store
            .update_task(task_id, &mut |t| t.assignee = assignee.clone())?;
        tracing::info!(task = %task_id, agent = %new_assignee, "Task reassigned");
        if task.status == TaskStatus::Assigned {
            self.dispatch(&task);
        }
        Ok(task)
    }

    /// Unblock every blocked task whose dependencies have all completed.
    pub fn reevaluate_blocked(&self) -> Result<Vec<TaskId>, RuntimeError> {
        let mut unblocked = Vec::new();
        for task in self.store.all_tasks()? {
            if task.status == TaskStatus::Blocked && self.unblock(&task)? {
                unblocked.push(task.id);
            }
        }
        Ok(unblocked)
    }

    /// Whether every child of `task_id` has completed.
    pub fn eligible_for_completion(&self, task_id: &str) -> Result<bool, RuntimeError> {
        Ok(self
            .store
            .children_of(task_id)?
            .iter()
            .all(|c| c.status == TaskStatus::Completed))
    }

    /// Cancellation token for `task_id`, a child of its parent's token.
    /// Terminal and unknown tasks get one that is already cancelled.
    pub fn token(&self, task_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = tokens.get(task_id) {
            return token.clone();
        }
        // Checked under the map lock so a concurrent cancel either sees the
        // token inserted here or has already marked the task terminal.
        match self.store.get_task(task_id) {
            Ok(task) if !task.status.is_terminal() => {
                link_token(&mut tokens, &self.root, task_id, task.parent_id.as_deref())
            }
            _ => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    pub fn max_open_tasks(&self) -> usize {
        self.max_open_tasks
    }

    fn check_capacity(&self, agent: &str, requested: usize) -> Result<(), RuntimeError> {
        let record = self
            .org
            .get(agent)
            .filter(|r| !r.archived)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent.to_string()))?;
        if !record.is_execution_tier() {
            return Ok(());
        }
        let open = self.store.open_task_count(agent)?;
        if open + requested > self.max_open_tasks {
            tracing::warn!(agent = %agent, open, requested, limit = self.max_open_tasks, "Delegation refused: capacity");
            return Err(RuntimeError::CapacityExceeded {
                agent: agent.to_string(),
                open,
                requested,
                limit: self.max_open_tasks,
            });
        }
        Ok(())
    }

    fn dependencies_met(&self, task: &Task) -> Result<bool, RuntimeError> {
        for dep in &task.dependencies {
            if self.store.get_task(dep)?.status != TaskStatus::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn unblock(&self, task: &Task) -> Result<bool, RuntimeError> {
        if !self.dependencies_met(task)? {
            return Ok(false);
        }
        if !self
            .store
            .compare_and_set_status(&task.id, TaskStatus::Blocked, TaskStatus::Assigned)?
        {
            return Ok(false);
        }
        tracing::info!(task = %task.id, agent = %task.assignee, "Task unblocked");
        let task = self.store.get_task(&task.id)?;
        self.dispatch(&task);
        Ok(true)
    }

    /// Unblock dependents and cascade completion to parents in `reviewing`.
    fn on_completed(&self, task_id: &str) -> Result<(), RuntimeError> {
        let mut worklist = vec![task_id.to_string()];
        while let Some(done) = worklist.pop() {
            self.drop_token(&done);
            for dependent in self.store.dependents_of(&done)? {
                let dependent = self.store.get_task(&dependent)?;
                if dependent.status == TaskStatus::Blocked {
                    self.unblock(&dependent)?;
                }
            }

            let Some(parent_id) = self.store.get_task(&done)?.parent_id else {
                continue;
            };
            if !self.eligible_for_completion(&parent_id)? {
                continue;
            }
            let parent = self.store.get_task(&parent_id)?;
            match parent.status {
                TaskStatus::Reviewing => {
                    if self.store.compare_and_set_status(
                        &parent_id,
                        TaskStatus::Reviewing,
                        TaskStatus::Completed,
                    )? {
                        tracing::info!(task = %parent_id, agent = %parent.assignee, "Parent completed with its last child");
                        worklist.push(parent_id);
                    }
                }
                status if !status.is_terminal() => {
                    self.notify(
                        &parent.assignee,
                        &parent_id,
                        &format!("All subtasks of task {parent_id} completed; it is ready for completion"),
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Register the task's token, then store it. Loops can only claim a
    /// stored task, so a claimed task always has a linked token.
    fn insert_linked(&self, task: &Task) -> Result<(), RuntimeError> {
        {
            let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
            link_token(&mut tokens, &self.root, &task.id, task.parent_id.as_deref());
        }
        if let Err(err) = self.store.insert_task(task.clone()) {
            self.drop_token(&task.id);
            return Err(err.into());
        }
        Ok(())
    }

    fn take_token(&self, task_id: &str) -> Option<CancellationToken> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(task_id)
    }

    fn drop_token(&self, task_id: &str) {
        self.take_token(task_id);
    }

    fn dispatch(&self, task: &Task) {
        let from = if task.created_by != task.assignee && self.org.is_active(&task.created_by) {
            task.created_by.as_str()
        } else {
            SYSTEM_SENDER
        };
        let message = self
            .router
            .compose(
                from,
                &task.assignee,
                MessageKind::TaskAssignment,
                &format!("Task {}: {}", task.id, task.input.objective),
            )
            .with_task(&task.id)
            .with_payload(json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "objective": task.input.objective,
                "acceptance_criteria": task.input.acceptance_criteria,
                "parent_id": task.parent_id,
            }));
        if let Err(e) = self.router.send(message) {
            tracing::warn!(task = %task.id, agent = %task.assignee, "Failed to dispatch assignment: {e}");
        }
    }

    fn notify(&self, agent: &str, task_id: &str, content: &str) {
        let message = Message::direct(SYSTEM_SENDER, agent, MessageKind::Notice, content)
            .with_priority(Priority::High)
            .with_task(task_id);
        if let Err(e) = self.router.send(message) {
            tracing::warn!(task = %task_id, agent = %agent, "Failed to send task notice: {e}");
        }
    }
}

fn link_token(
    tokens: &mut HashMap<TaskId, CancellationToken>,
    root: &CancellationToken,
    task_id: &str,
    parent: Option<&str>,
) -> CancellationToken {
    let token = parent
        .and_then(|p| tokens.get(p))
        .unwrap_or(root)
        .child_token();
    tokens.insert(task_id.to_string(), token.clone());
    token
}
