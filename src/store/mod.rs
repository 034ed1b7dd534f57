//! Durable store capability.
//!
//! The runtime consumes persistence through the [`Store`] trait: tasks,
//! mailboxes, memories, agent histories and approval requests. Task status
//! transitions go through [`Store::compare_and_set_status`] so two loops can
//! never claim the same task. [`memory::MemoryStore`] is the in-process
//! implementation.

pub mod memory;

use crate::agent::history::HistoryEntry;
use crate::approval::ApprovalRequest;
use crate::error::StoreError;
use crate::messaging::{Message, MessageId};
use crate::tasks::{Task, TaskId, TaskStatus};

pub use memory::MemoryStore;

pub trait Store: Send + Sync {
    fn insert_task(&self, task: Task) -> Result<(), StoreError>;

    fn get_task(&self, id: &str) -> Result<Task, StoreError>;

    /// Apply `update` to a task atomically and return the new value.
    fn update_task(
        &self,
        id: &str,
        update: &mut dyn FnMut(&mut Task),
    ) -> Result<Task, StoreError>;

    /// Move a task from `expected` to `new`. Returns `false` (and changes
    /// nothing) when the current status is not `expected`.
    fn compare_and_set_status(
        &self,
        id: &str,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, StoreError>;

    fn all_tasks(&self) -> Result<Vec<Task>, StoreError>;

    fn append_message(&self, recipient: &str, message: Message) -> Result<(), StoreError>;

    /// Unread messages in arrival order.
    fn unread(&self, agent: &str) -> Result<Vec<Message>, StoreError>;

    /// Archive the given unread messages. Returns how many were archived.
    fn mark_read(&self, agent: &str, ids: &[MessageId]) -> Result<usize, StoreError>;

    fn archived(&self, agent: &str) -> Result<Vec<Message>, StoreError>;

    fn remember(&self, agent: &str, text: &str) -> Result<(), StoreError>;

    fn recall(&self, agent: &str, query: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    fn save_history(&self, agent: &str, entries: &[HistoryEntry]) -> Result<(), StoreError>;

    fn load_history(&self, agent: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    fn put_approval(&self, request: ApprovalRequest) -> Result<(), StoreError>;

    fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError>;

    fn tasks_for(&self, assignee: &str) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .all_tasks()?
            .into_iter()
            .filter(|t| t.assignee == assignee)
            .collect())
    }

    /// Non-terminal tasks currently assigned to `assignee`.
    fn open_task_count(&self, assignee: &str) -> Result<usize, StoreError> {
        Ok(self
            .tasks_for(assignee)?
            .iter()
            .filter(|t| !t.status.is_terminal())
            .count())
    }

    fn children_of(&self, parent: &str) -> Result<Vec<Task>, StoreError> {
        let parent = self.get_task(parent)?;
        parent
            .children
            .iter()
            .map(|id| self.get_task(id))
            .collect()
    }

    fn dependents_of(&self, id: &str) -> Result<Vec<TaskId>, StoreError> {
        Ok(self
            .all_tasks()?
            .into_iter()
            .filter(|t| t.dependencies.contains(id))
            .map(|t| t.id)
            .collect())
    }
}
