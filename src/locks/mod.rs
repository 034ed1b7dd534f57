//! Resource lock manager.
//!
//! Grants read/write/exclusive locks on named resources with an expiry. A
//! write or exclusive request conflicts with any live lock on the resource;
//! a read request conflicts only with a live write or exclusive lock. Expired
//! locks are treated as released and swept by a background reaper.
//!
//! Locks are never upgraded in place: changing mode means releasing and
//! acquiring again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::journal::{Journal, JournalEntry};
use crate::error::RuntimeError;
use crate::org::AgentId;
use crate::tasks::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    File,
    Document,
    Config,
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Read,
    Write,
    Exclusive,
}

impl LockMode {
    fn is_shared(&self) -> bool {
        matches!(self, LockMode::Read)
    }

    /// Whether a request in `self` mode can coexist with a live `held` lock.
    pub fn compatible_with(&self, held: LockMode) -> bool {
        self.is_shared() && held.is_shared()
    }
}

/// The task and agent on whose behalf a lock is held.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHolder {
    pub task_id: TaskId,
    pub agent_id: AgentId,
}

impl LockHolder {
    pub fn new(task_id: &str, agent_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} (agent {})", self.task_id, self.agent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub holder: LockHolder,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of an acquisition request.
#[derive(Debug, Clone, PartialEq)]
pub enum LockGrant {
    Granted(ResourceLock),
    Conflict { holder: LockHolder, mode: LockMode },
}

impl LockGrant {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockGrant::Granted(_))
    }

    /// Convert a conflict into [`RuntimeError::ResourceConflict`].
    pub fn into_result(self, resource: &str) -> Result<ResourceLock, RuntimeError> {
        match self {
            LockGrant::Granted(lock) => Ok(lock),
            LockGrant::Conflict { holder, .. } => Err(RuntimeError::ResourceConflict {
                resource: resource.to_string(),
                holder,
            }),
        }
    }
}

/// Current state of a resource as seen by `is_locked`.
#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    Unlocked,
    Shared(Vec<LockHolder>),
    Held { holder: LockHolder, mode: LockMode },
}

/// Thread-safe lock table. Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct ResourceLockManager {
    table: Arc<Mutex<HashMap<String, Vec<ResourceLock>>>>,
    journal: Journal,
}

impl ResourceLockManager {
    pub fn new(journal: Journal) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            journal,
        }
    }

    /// Request a lock. Expired entries are purged before the conflict check.
    ///
    /// A holder that already holds the resource in the same mode gets its
    /// expiry refreshed; a different mode from the same holder conflicts.
    pub fn acquire(
        &self,
        resource_id: &str,
        kind: ResourceKind,
        mode: LockMode,
        holder: LockHolder,
        ttl: Duration,
    ) -> LockGrant {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let entries = table.entry(resource_id.to_string()).or_default();
        let expired = drain_expired(entries, now);
        let grant = grant_or_conflict(entries, resource_id, kind, mode, holder, now, expires_at);
        drop(table);

        for lock in &expired {
            self.log_forced_release(lock);
        }
        grant
    }

    /// Release every lock `holder` has on `resource_id`.
    pub fn release(&self, resource_id: &str, holder: &LockHolder) -> Result<(), RuntimeError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let released = match table.get_mut(resource_id) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|l| &l.holder != holder);
                let released = before - entries.len();
                if entries.is_empty() {
                    table.remove(resource_id);
                }
                released
            }
            None => 0,
        };
        if released == 0 {
            return Err(RuntimeError::NotLockHolder {
                resource: resource_id.to_string(),
                holder: holder.clone(),
            });
        }
        tracing::debug!(resource = %resource_id, holder = %holder, "Lock released");
        Ok(())
    }

    /// Release every lock held on behalf of `task_id`. Returns the resources freed.
    pub fn release_task(&self, task_id: &str) -> Vec<String> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut freed = Vec::new();
        table.retain(|resource, entries| {
            let before = entries.len();
            entries.retain(|l| l.holder.task_id != task_id);
            if entries.len() != before {
                freed.push(resource.clone());
            }
            !entries.is_empty()
        });
        freed.sort();
        freed
    }

    /// State of a resource, ignoring expired locks.
    pub fn is_locked(&self, resource_id: &str) -> LockState {
        let now = Utc::now();
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let live: Vec<&ResourceLock> = table
            .get(resource_id)
            .map(|entries| entries.iter().filter(|l| !l.is_expired(now)).collect())
            .unwrap_or_default();
        if let Some(held) = live.iter().find(|l| !l.mode.is_shared()) {
            return LockState::Held {
                holder: held.holder.clone(),
                mode: held.mode,
            };
        }
        if live.is_empty() {
            LockState::Unlocked
        } else {
            LockState::Shared(live.iter().map(|l| l.holder.clone()).collect())
        }
    }

    /// Whether `holder` currently holds a live lock permitting mutation.
    pub fn may_mutate(&self, resource_id: &str, holder: &LockHolder) -> bool {
        matches!(self.is_locked(resource_id), LockState::Held { holder: h, .. } if &h == holder)
    }

    /// Live locks held on behalf of a task.
    pub fn held_by_task(&self, task_id: &str) -> Vec<ResourceLock> {
        let now = Utc::now();
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut locks: Vec<ResourceLock> = table
            .values()
            .flatten()
            .filter(|l| l.holder.task_id == task_id && !l.is_expired(now))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        locks
    }

    /// Remove all expired locks, logging each forced release.
    pub fn reap_expired(&self) -> Vec<ResourceLock> {
        let now = Utc::now();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut reaped = Vec::new();
        table.retain(|_, entries| {
            reaped.extend(drain_expired(entries, now));
            !entries.is_empty()
        });
        drop(table);
        for lock in &reaped {
            self.log_forced_release(lock);
        }
        reaped
    }

    /// Spawn the background reaper. Stops when `cancel` fires.
    pub fn spawn_reaper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.reap_expired();
                    }
                }
            }
            tracing::debug!("Lock reaper stopped");
        })
    }

    fn log_forced_release(&self, lock: &ResourceLock) {
        tracing::warn!(
            resource = %lock.resource_id,
            holder = %lock.holder,
            mode = ?lock.mode,
            "Expired lock force-released"
        );
        self.journal.record(JournalEntry::LockForcedRelease {
            timestamp: crate::agent::journal::now_iso(),
            resource: lock.resource_id.clone(),
            task_id: lock.holder.task_id.clone(),
            agent_id: lock.holder.agent_id.clone(),
        });
    }
}

fn drain_expired(entries: &mut Vec<ResourceLock>, now: DateTime<Utc>) -> Vec<ResourceLock> {
    let (expired, live): (Vec<_>, Vec<_>) = entries.drain(..).partition(|l| l.is_expired(now));
    *entries = live;
    expired
}

fn grant_or_conflict(
    entries: &mut Vec<ResourceLock>,
    resource_id: &str,
    kind: ResourceKind,
    mode: LockMode,
    holder: LockHolder,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> LockGrant {
    if let Some(existing) = entries
        .iter_mut()
        .find(|l| l.holder == holder && l.mode == mode)
    {
        existing.expires_at = expires_at;
        return LockGrant::Granted(existing.clone());
    }

    if let Some(blocking) = entries.iter().find(|l| !mode.compatible_with(l.mode)) {
        tracing::debug!(
            resource = %resource_id,
            requested = ?mode,
            holder = %blocking.holder,
            "Lock conflict"
        );
        return LockGrant::Conflict {
            holder: blocking.holder.clone(),
            mode: blocking.mode,
        };
    }

    let lock = ResourceLock {
        resource_id: resource_id.to_string(),
        kind,
        holder,
        mode,
        acquired_at: now,
        expires_at,
    };
    tracing::debug!(resource = %resource_id, mode = ?mode, holder = %lock.holder, "Lock granted");
    entries.push(lock.clone());
    LockGrant::Granted(lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResourceLockManager {
        ResourceLockManager::new(Journal::disabled())
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn exclusive_conflicts_name_the_holder() {
        let locks = manager();
        let t1 = LockHolder::new("task-1", "dev-1");
        let t2 = LockHolder::new("task-2", "dev-2");

        let grant = locks.acquire("/src/a.ts", ResourceKind::File, LockMode::Exclusive, t1.clone(), TTL);
        assert!(grant.is_granted());

        let second = locks.acquire("/src/a.ts", ResourceKind::File, LockMode::Exclusive, t2, TTL);
        assert_eq!(
            second,
            LockGrant::Conflict {
                holder: t1,
                mode: LockMode::Exclusive
            }
        );
    }

    #[test]
    fn readers_share_but_block_writers() {
        let locks = manager();
        let r1 = LockHolder::new("t1", "a");
        let r2 = LockHolder::new("t2", "b");
        let w = LockHolder::new("t3", "c");

        assert!(locks.acquire("doc", ResourceKind::Document, LockMode::Read, r1.clone(), TTL).is_granted());
        assert!(locks.acquire("doc", ResourceKind::Document, LockMode::Read, r2.clone(), TTL).is_granted());
        assert_eq!(locks.is_locked("doc"), LockState::Shared(vec![r1.clone(), r2]));

        let grant = locks.acquire("doc", ResourceKind::Document, LockMode::Write, w, TTL);
        assert!(!grant.is_granted());
    }

    #[test]
    fn write_blocks_readers() {
        let locks = manager();
        let w = LockHolder::new("t1", "a");
        assert!(locks.acquire("cfg", ResourceKind::Config, LockMode::Write, w.clone(), TTL).is_granted());
        let grant = locks.acquire("cfg", ResourceKind::Config, LockMode::Read, LockHolder::new("t2", "b"), TTL);
        assert!(matches!(grant, LockGrant::Conflict { holder, .. } if holder == w));
    }

    #[test]
    fn same_holder_cannot_upgrade_in_place() {
        let locks = manager();
        let h = LockHolder::new("t1", "a");
        assert!(locks.acquire("f", ResourceKind::File, LockMode::Read, h.clone(), TTL).is_granted());
        assert!(!locks.acquire("f", ResourceKind::File, LockMode::Write, h.clone(), TTL).is_granted());

        locks.release("f", &h).unwrap();
        assert!(locks.acquire("f", ResourceKind::File, LockMode::Write, h, TTL).is_granted());
    }

    #[test]
    fn reacquire_same_mode_refreshes() {
        let locks = manager();
        let h = LockHolder::new("t1", "a");
        assert!(locks.acquire("f", ResourceKind::File, LockMode::Write, h.clone(), TTL).is_granted());
        assert!(locks.acquire("f", ResourceKind::File, LockMode::Write, h.clone(), TTL).is_granted());
        assert_eq!(locks.held_by_task("t1").len(), 1);
    }

    #[test]
    fn release_requires_holder() {
        let locks = manager();
        let h = LockHolder::new("t1", "a");
        let err = locks.release("f", &h).unwrap_err();
        assert!(matches!(err, RuntimeError::NotLockHolder { .. }));
    }

    #[test]
    fn expired_lock_is_treated_as_released() {
        let locks = manager();
        let h1 = LockHolder::new("t1", "a");
        let h2 = LockHolder::new("t2", "b");
        assert!(locks.acquire("f", ResourceKind::File, LockMode::Exclusive, h1, Duration::ZERO).is_granted());
        assert_eq!(locks.is_locked("f"), LockState::Unlocked);
        assert!(locks.acquire("f", ResourceKind::File, LockMode::Exclusive, h2.clone(), TTL).is_granted());
        assert!(locks.may_mutate("f", &h2));
    }

    #[test]
    fn purged_lock_is_journalled_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("journal.jsonl");
        let locks = ResourceLockManager::new(Journal::at(&path).unwrap());
        let h1 = LockHolder::new("t1", "a");
        let h2 = LockHolder::new("t2", "b");
        locks.acquire("f", ResourceKind::File, LockMode::Exclusive, h1, Duration::ZERO);
        assert!(locks.acquire("f", ResourceKind::File, LockMode::Exclusive, h2.clone(), TTL).is_granted());
        assert!(locks.acquire("f", ResourceKind::File, LockMode::Exclusive, h2, TTL).is_granted());

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event_type"], "lock_forced_release");
        assert_eq!(lines[0]["resource"], "f");
        assert_eq!(lines[0]["task_id"], "t1");
    }

    #[test]
    fn reaper_sweeps_expired_locks() {
        let locks = manager();
        locks.acquire("a", ResourceKind::File, LockMode::Write, LockHolder::new("t1", "x"), Duration::ZERO);
        locks.acquire("b", ResourceKind::File, LockMode::Write, LockHolder::new("t2", "y"), TTL);
        let reaped = locks.reap_expired();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].resource_id, "a");
        assert!(matches!(locks.is_locked("b"), LockState::Held { .. }));
    }

    #[test]
    fn release_task_frees_everything_for_task() {
        let locks = manager();
        let h = LockHolder::new("t1", "x");
        locks.acquire("a", ResourceKind::File, LockMode::Write, h.clone(), TTL);
        locks.acquire("b", ResourceKind::File, LockMode::Read, h, TTL);
        assert_eq!(locks.release_task("t1"), vec!["a", "b"]);
        assert_eq!(locks.is_locked("a"), LockState::Unlocked);
    }

    #[test]
    fn at_most_one_writer_under_contention() {
        let locks = manager();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let locks = locks.clone();
                std::thread::spawn(move || {
                    locks
                        .acquire(
                            "hot",
                            ResourceKind::File,
                            LockMode::Exclusive,
                            LockHolder::new(&format!("t{i}"), "a"),
                            TTL,
                        )
                        .is_granted()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();
        assert_eq!(granted, 1);
    }
}
