//! Per-agent reasoning history with a token budget.
//!
//! Token counts use the 1 token ~ 4 chars heuristic. Before each reasoning
//! step the loop calls [`History::make_room`] with the size of the new input;
//! entries are evicted oldest-first from the lowest importance class present
//! until history plus input fits the budget. Pinned entries (the task
//! statement) are never evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default context budget in tokens.
pub const DEFAULT_CONTEXT_BUDGET: usize = 150_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    Task,
    Message,
    Thought,
    Action,
    Observation,
    Memory,
}

/// Eviction class. Lower classes go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    Normal,
    High,
    Pinned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
    pub importance: Importance,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(role: HistoryRole, content: impl Into<String>, importance: Importance) -> Self {
        Self {
            role,
            content: content.into(),
            importance,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// Estimated token count of `text` (chars / 4, rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone)]
pub struct History {
    entries: Vec<HistoryEntry>,
    budget: usize,
    evicted: usize,
}

impl History {
    pub fn new(budget: usize) -> Self {
        Self::from_entries(Vec::new(), budget)
    }

    pub fn from_entries(entries: Vec<HistoryEntry>, budget: usize) -> Self {
        Self {
            entries,
            budget,
            evicted: 0,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn record(&mut self, role: HistoryRole, content: impl Into<String>, importance: Importance) {
        self.push(HistoryEntry::new(role, content, importance));
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn token_estimate(&self) -> usize {
        self.entries.iter().map(HistoryEntry::tokens).sum()
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Total entries evicted over this history's lifetime.
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    /// Evict until history plus `incoming` tokens fits the budget. Returns
    /// how many entries were evicted; stops early if only pinned entries
    /// remain.
    pub fn make_room(&mut self, incoming: usize) -> usize {
        let mut total = self.token_estimate();
        let mut evicted = 0;
        while total + incoming > self.budget {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.importance != Importance::Pinned)
                .min_by_key(|(i, e)| (e.importance, *i))
                .map(|(i, _)| i);
            let Some(index) = victim else {
                tracing::warn!(
                    tokens = total + incoming,
                    budget = self.budget,
                    "Only pinned history remains; context budget still exceeded"
                );
                break;
            };
            total -= self.entries.remove(index).tokens();
            evicted += 1;
        }
        if evicted > 0 {
            self.evicted += evicted;
            tracing::debug!(evicted, tokens = total, budget = self.budget, "History evicted to fit budget");
        }
        evicted
    }

    /// Drop everything that is not pinned, e.g. between activations.
    pub fn clear_unpinned(&mut self) {
        self.entries.retain(|e| e.importance == Importance::Pinned);
    }

    /// Unpin earlier task statements so a new activation can pin its own.
    pub fn demote_pinned(&mut self) {
        for entry in &mut self.entries {
            if entry.importance == Importance::Pinned {
                entry.importance = Importance::High;
            }
        }
    }

    pub fn into_entries(self) -> Vec<HistoryEntry> {
        self.entries
    }
}
