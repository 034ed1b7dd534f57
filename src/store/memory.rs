//! In-process [`Store`] backed by maps behind a single mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::Store;
use crate::agent::history::HistoryEntry;
use crate::approval::ApprovalRequest;
use crate::error::StoreError;
use crate::messaging::{Message, MessageId};
use crate::tasks::{Task, TaskStatus};

#[derive(Default)]
struct State {
    tasks: HashMap<String, Task>,
    /// Insertion order of tasks, so listings are stable.
    task_order: Vec<String>,
    unread: HashMap<String, VecDeque<Message>>,
    archive: HashMap<String, Vec<Message>>,
    memories: HashMap<String, Vec<String>>,
    histories: HashMap<String, Vec<HistoryEntry>>,
    approvals: HashMap<String, ApprovalRequest>,
}

/// Map-backed store. `set_available(false)` simulates an outage.
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            tracing::warn!("Store marked unavailable");
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

fn task_not_found(id: &str) -> StoreError {
    StoreError::NotFound {
        kind: "task",
        id: id.to_string(),
    }
}

impl Store for MemoryStore {
    fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists {
                kind: "task",
                id: task.id,
            });
        }
        state.task_order.push(task.id.clone());
        state.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        self.state()?
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| task_not_found(id))
    }

    fn update_task(
        &self,
        id: &str,
        update: &mut dyn FnMut(&mut Task),
    ) -> Result<Task, StoreError> {
        let mut state = self.state()?;
        let task = state.tasks.get_mut(id).ok_or_else(|| task_not_found(id))?;
        update(task);
        Ok(task.clone())
    }

    fn compare_and_set_status(
        &self,
        id: &str,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let task = state.tasks.get_mut(id).ok_or_else(|| task_not_found(id))?;
        if task.status != expected {
            return Ok(false);
        }
        task.touch_status(new);
        Ok(true)
    }

    fn all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let state = self.state()?;
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    fn append_message(&self, recipient: &str, message: Message) -> Result<(), StoreError> {
        self.state()?
            .unread
            .entry(recipient.to_string())
            .or_default()
            .push_back(message);
        Ok(())
    }

    fn unread(&self, agent: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .state()?
            .unread
            .get(agent)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn mark_read(&self, agent: &str, ids: &[MessageId]) -> Result<usize, StoreError> {
        let mut state = self.state()?;
        let Some(queue) = state.unread.get_mut(agent) else {
            return Ok(0);
        };
        let (read, keep): (Vec<Message>, Vec<Message>) =
            queue.drain(..).partition(|m| ids.contains(&m.id));
        queue.extend(keep);
        let count = read.len();
        state.archive.entry(agent.to_string()).or_default().extend(read);
        Ok(count)
    }

    fn archived(&self, agent: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .state()?
            .archive
            .get(agent)
            .cloned()
            .unwrap_or_default())
    }

    fn remember(&self, agent: &str, text: &str) -> Result<(), StoreError> {
        self.state()?
            .memories
            .entry(agent.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    fn recall(&self, agent: &str, query: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let state = self.state()?;
        let Some(memories) = state.memories.get(agent) else {
            return Ok(Vec::new());
        };
        Ok(memories
            .iter()
            .rev()
            .filter(|m| {
                let lower = m.to_lowercase();
                terms.is_empty() || terms.iter().any(|t| lower.contains(t.as_str()))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn save_history(&self, agent: &str, entries: &[HistoryEntry]) -> Result<(), StoreError> {
        self.state()?
            .histories
            .insert(agent.to_string(), entries.to_vec());
        Ok(())
    }

    fn load_history(&self, agent: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .state()?
            .histories
            .get(agent)
            .cloned()
            .unwrap_or_default())
    }

    fn put_approval(&self, request: ApprovalRequest) -> Result<(), StoreError> {
        self.state()?
            .approvals
            .insert(request.id.clone(), request);
        Ok(())
    }

    fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.state()?.approvals.get(id).cloned())
    }
}
