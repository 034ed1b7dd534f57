//! Message envelopes, mailbox delivery and cross-scope relay.

pub mod relay;
pub mod router;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::org::AgentId;
use crate::tasks::TaskId;

pub use relay::{LocalLink, RelayBackoff, RelayInbox, RelayQueue, RelayTransport, RelayWorker};
pub use router::{
    BroadcastOptions, BroadcastScope, DeliveryReceipt, LocalDelivery, MessageRouter, WakeReason,
    WakeSignal,
};

/// Identifier of a message (UUID v4 string).
pub type MessageId = String;

/// Sender address used for runtime-generated notices.
pub const SYSTEM_SENDER: &str = "system";

/// Time-to-live applied when a message is built without an explicit one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Direct,
    Broadcast,
    TaskAssignment,
    TaskReport,
    ApprovalRequest,
    ApprovalDecision,
    ConflictEscalation,
    DeliveryFailure,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub from: AgentId,
    pub to: AgentId,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    pub urgency: f32,
    pub response_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MessageContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub thread_id: Option<String>,
    pub reply_to: Option<MessageId>,
    pub task_id: Option<TaskId>,
    pub project_id: Option<String>,
}

/// Immutable message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub header: Header,
    pub body: Body,
    pub metadata: Metadata,
}

impl Message {
    pub fn direct(from: &str, to: &str, kind: MessageKind, content: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            header: Header {
                from: from.to_string(),
                to: to.to_string(),
                timestamp: Utc::now(),
                priority: Priority::Normal,
                ttl_ms: DEFAULT_TTL.as_millis() as u64,
            },
            body: Body {
                kind,
                content: content.to_string(),
                payload: None,
                context: None,
            },
            metadata: Metadata {
                thread_id: Some(id.clone()),
                ..Default::default()
            },
            id,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.header.ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.body.payload = Some(payload);
        self
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.metadata.task_id = Some(task_id.to_string());
        self
    }

    pub fn requiring_response(mut self, urgency: f32) -> Self {
        self.body.context = Some(MessageContext {
            urgency,
            response_required: true,
        });
        self
    }

    /// Build a reply on the same thread.
    pub fn reply(&self, from: &str, kind: MessageKind, content: &str) -> Self {
        let mut reply = Message::direct(from, &self.header.from, kind, content);
        reply.metadata.thread_id = self.metadata.thread_id.clone();
        reply.metadata.reply_to = Some(self.id.clone());
        reply.metadata.task_id = self.metadata.task_id.clone();
        reply.metadata.project_id = self.metadata.project_id.clone();
        reply
    }

    /// Creation time plus ttl.
    pub fn deadline(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::milliseconds(self.header.ttl_ms.min(i64::MAX as u64) as i64);
        self.header
            .timestamp
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline()
    }

    /// Time left before the deadline, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline() - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn needs_response(&self) -> bool {
        self.body.kind == MessageKind::ApprovalRequest
            || self
                .body
                .context
                .as_ref()
                .map(|c| c.response_required)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_creation_plus_ttl() {
        let msg = Message::direct("a", "b", MessageKind::Direct, "hi").with_ttl(Duration::from_millis(1000));
        let created = msg.header.timestamp;
        assert!(!msg.is_expired(created + chrono::Duration::milliseconds(999)));
        assert!(msg.is_expired(created + chrono::Duration::milliseconds(1000)));
        assert_eq!(msg.remaining(created + chrono::Duration::milliseconds(2000)), Duration::ZERO);
    }

    #[test]
    fn reply_threads_to_original() {
        let original = Message::direct("a", "b", MessageKind::Direct, "question").with_task("t1");
        let reply = original.reply("b", MessageKind::Direct, "answer");
        assert_eq!(reply.header.to, "a");
        assert_eq!(reply.metadata.reply_to.as_deref(), Some(original.id.as_str()));
        assert_eq!(reply.metadata.thread_id, original.metadata.thread_id);
        assert_eq!(reply.metadata.task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn approval_requests_need_response() {
        let msg = Message::direct("a", "b", MessageKind::ApprovalRequest, "may I?");
        assert!(msg.needs_response());
        let plain = Message::direct("a", "b", MessageKind::Direct, "fyi");
        assert!(!plain.needs_response());
        assert!(plain.requiring_response(0.9).needs_response());
    }
}
