//! JSONL runtime journal for replaying what the runtime did.
//!
//! Writes one tagged JSON object per line to
//! `{workspace_parent}/.rankflow-logs/journal-{ISO8601}.jsonl`, flushing after
//! each event. The journal is shared by every loop, the lock reaper and the
//! router, so the writer sits behind a mutex. A write failure is logged and
//! otherwise ignored; journaling never fails a round.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

use crate::error::ReasonCode;

/// Current UTC time as an ISO 8601 string with milliseconds.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// A structured journal entry serialized as a single JSON line.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum JournalEntry {
    ActivationStart {
        timestamp: String,
        agent: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        objective: String,
    },

    ActionChosen {
        timestamp: String,
        agent: String,
        round: u32,
        thought: String,
        action: serde_json::Value,
    },

    Observation {
        timestamp: String,
        agent: String,
        round: u32,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<ReasonCode>,
        content: String,
    },

    ApprovalRequested {
        timestamp: String,
        request_id: String,
        actor: String,
        approver: String,
        risk: String,
        action: String,
    },

    ApprovalResolved {
        timestamp: String,
        request_id: String,
        resolution: String,
    },

    LockForcedRelease {
        timestamp: String,
        resource: String,
        task_id: String,
        agent_id: String,
    },

    MessageDropped {
        timestamp: String,
        message_id: String,
        from: String,
        to: String,
        reason: ReasonCode,
    },

    ActivationEnd {
        timestamp: String,
        agent: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<ReasonCode>,
        rounds: u32,
    },
}

/// Append-only shared journal. Cloning shares the same file.
#[derive(Clone, Default)]
pub struct Journal {
    sink: Option<Arc<Mutex<BufWriter<fs::File>>>>,
    path: Option<PathBuf>,
}

impl Journal {
    /// A journal that drops every entry.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open a timestamped journal next to (not inside) the workspace.
    pub fn for_workspace(workspace_path: &Path) -> anyhow::Result<Self> {
        let parent = workspace_path.parent().ok_or_else(|| {
            anyhow::anyhow!(
                "Workspace path '{}' has no parent directory",
                workspace_path.display()
            )
        })?;
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        Self::at(&parent.join(".rankflow-logs").join(format!("journal-{stamp}.jsonl")))
    }

    /// Open (or append to) a journal at an explicit path.
    pub fn at(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Some(Arc::new(Mutex::new(BufWriter::new(file)))),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Serialize an entry as one JSON line and flush.
    pub fn record(&self, entry: JournalEntry) {
        let Some(sink) = &self.sink else {
            return;
        };
        let mut writer = sink.lock().unwrap_or_else(|e| e.into_inner());
        let result = serde_json::to_writer(&mut *writer, &entry)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            tracing::warn!("Failed to write journal entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        let file = fs::File::open(path).expect("open journal");
        std::io::BufReader::new(file)
            .lines()
            .map(|l| serde_json::from_str(&l.expect("line")).expect("valid JSON"))
            .collect()
    }

    #[test]
    fn creates_journal_in_sibling_dir() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::for_workspace(&tmp.path().join("workspace")).unwrap();
        let path = journal.path().unwrap().to_owned();

        assert!(path.exists());
        assert!(path.starts_with(tmp.path().join(".rankflow-logs")));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("journal-") && name.ends_with(".jsonl"));
    }

    #[test]
    fn entries_are_tagged_lines() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::at(&tmp.path().join("j.jsonl")).unwrap();

        journal.record(JournalEntry::ActivationStart {
            timestamp: now_iso(),
            agent: "dev".into(),
            task: Some("t1".into()),
            objective: "ship it".into(),
        });
        journal.record(JournalEntry::Observation {
            timestamp: now_iso(),
            agent: "dev".into(),
            round: 1,
            success: false,
            reason: Some(ReasonCode::ApprovalDenied),
            content: "denied".into(),
        });
        journal.record(JournalEntry::ActivationEnd {
            timestamp: now_iso(),
            agent: "dev".into(),
            task: None,
            status: "completed".into(),
            reason: None,
            rounds: 2,
        });

        let lines = read_lines(journal.path().unwrap());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event_type"], "activation_start");
        assert_eq!(lines[1]["event_type"], "observation");
        assert_eq!(lines[1]["reason"], "approval_denied");
        assert_eq!(lines[2]["event_type"], "activation_end");
        assert!(lines[2].get("task").is_none());
        assert!(lines[2].get("reason").is_none());
    }

    #[test]
    fn disabled_journal_is_a_no_op() {
        let journal = Journal::disabled();
        journal.record(JournalEntry::LockForcedRelease {
            timestamp: now_iso(),
            resource: "f".into(),
            task_id: "t".into(),
            agent_id: "a".into(),
        });
        assert!(journal.path().is_none());
    }

    #[test]
    fn clones_share_one_file() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::at(&tmp.path().join("shared.jsonl")).unwrap();
        let other = journal.clone();
        for j in [&journal, &other] {
            j.record(JournalEntry::ApprovalResolved {
                timestamp: now_iso(),
                request_id: "r".into(),
                resolution: "approved".into(),
            });
        }
        assert_eq!(read_lines(journal.path().unwrap()).len(), 2);
    }
}
