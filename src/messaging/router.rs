//! Message router.
//!
//! Same-scope sends (sender and recipient share a rank-0 root) are recorded
//! in the recipient's mailbox before `send` returns. Cross-scope sends are
//! handed to the [`RelayQueue`] and acknowledged as accepted-for-relay.
//! Every delivery emits a [`WakeSignal`]; the scheduler decides whether that
//! starts a loop or is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::relay::RelayQueue;
use super::{Message, MessageId, MessageKind, Priority, SYSTEM_SENDER};
use crate::agent::journal::{now_iso, Journal, JournalEntry};
use crate::error::{ReasonCode, RuntimeError, StoreError, ValidationError};
use crate::org::{AgentId, Organization};
use crate::store::Store;
use crate::tasks::TaskId;

/// Why a loop is being woken.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WakeReason {
    MessageDelivered { message_id: MessageId },
    TaskReady { task_id: TaskId },
    External { note: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WakeSignal {
    pub agent: AgentId,
    pub reason: WakeReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryReceipt {
    /// Recorded in the recipient's mailbox.
    Delivered { message_id: MessageId, recipient: AgentId },
    /// Queued for the cross-scope relay; delivery is not yet confirmed.
    AcceptedForRelay { message_id: MessageId, recipient: AgentId },
    /// Dropped without delivery.
    Dropped { message_id: MessageId, reason: ReasonCode },
}

impl DeliveryReceipt {
    pub fn message_id(&self) -> &str {
        match self {
            DeliveryReceipt::Delivered { message_id, .. }
            | DeliveryReceipt::AcceptedForRelay { message_id, .. }
            | DeliveryReceipt::Dropped { message_id, .. } => message_id,
        }
    }
}

/// Who a broadcast reaches. The sender itself is never included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastScope {
    Department(String),
    Subordinates(AgentId),
    /// Everyone in the sender's organisational scope.
    Organization,
}

#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    pub kind: MessageKind,
    pub priority: Priority,
    pub ttl: Option<Duration>,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            kind: MessageKind::Broadcast,
            priority: Priority::Normal,
            ttl: None,
        }
    }
}

/// Writes a message into a mailbox and signals the recipient.
#[derive(Clone)]
pub struct LocalDelivery {
    store: Arc<dyn Store>,
    wake_tx: UnboundedSender<WakeSignal>,
}

impl LocalDelivery {
    pub fn new(store: Arc<dyn Store>, wake_tx: UnboundedSender<WakeSignal>) -> Self {
        Self { store, wake_tx }
    }

    pub fn deliver(&self, message: Message) -> Result<(), StoreError> {
        let recipient = message.header.to.clone();
        let message_id = message.id.clone();
        self.store.append_message(&recipient, message)?;
        // The scheduler may already be shut down; the message stays in the mailbox.
        let _ = self.wake_tx.send(WakeSignal {
            agent: recipient,
            reason: WakeReason::MessageDelivered { message_id },
        });
        Ok(())
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    org: Arc<Organization>,
    store: Arc<dyn Store>,
    local: LocalDelivery,
    relay: RelayQueue,
    journal: Journal,
    default_ttl: Duration,
}

impl MessageRouter {
    pub fn new(
        org: Arc<Organization>,
        store: Arc<dyn Store>,
        local: LocalDelivery,
        relay: RelayQueue,
        journal: Journal,
        default_ttl: Duration,
    ) -> Self {
        Self {
            org,
            store,
            local,
            relay,
            journal,
            default_ttl,
        }
    }

    /// Build a message carrying the configured default ttl.
    pub fn compose(&self, from: &str, to: &str, kind: MessageKind, content: &str) -> Message {
        Message::direct(from, to, kind, content).with_ttl(self.default_ttl)
    }

    pub fn send(&self, message: Message) -> Result<DeliveryReceipt, RuntimeError> {
        let from = message.header.from.clone();
        let to = message.header.to.clone();
        if from != SYSTEM_SENDER && self.org.get(&from).is_none() {
            return Err(RuntimeError::UnknownAgent(from));
        }
        if !self.org.is_active(&to) {
            return Err(RuntimeError::UnknownAgent(to));
        }
        if from == to {
            return Err(ValidationError::MalformedMessage("sender and recipient are the same".into()).into());
        }

        if message.is_expired(Utc::now()) {
            self.drop_expired(&message);
            return Ok(DeliveryReceipt::Dropped {
                message_id: message.id,
                reason: ReasonCode::MessageExpired,
            });
        }

        let message_id = message.id.clone();
        if from == SYSTEM_SENDER || self.org.same_scope(&from, &to) {
            self.local.deliver(message)?;
            tracing::debug!(message = %message_id, from = %from, to = %to, "Message delivered");
            Ok(DeliveryReceipt::Delivered {
                message_id,
                recipient: to,
            })
        } else {
            self.relay.enqueue(message)?;
            tracing::debug!(message = %message_id, from = %from, to = %to, "Message queued for relay");
            Ok(DeliveryReceipt::AcceptedForRelay {
                message_id,
                recipient: to,
            })
        }
    }

    /// Send `content` to every agent in `scope`, one envelope per recipient.
    pub fn broadcast(
        &self,
        from: &str,
        scope: BroadcastScope,
        content: &str,
        options: BroadcastOptions,
    ) -> Result<Vec<DeliveryReceipt>, RuntimeError> {
        let recipients = match &scope {
            BroadcastScope::Department(dept) => self.org.department_members(dept),
            BroadcastScope::Subordinates(id) => self.org.direct_subordinates(id),
            BroadcastScope::Organization => {
                let root = self
                    .org
                    .root_of(from)
                    .ok_or_else(|| RuntimeError::UnknownAgent(from.to_string()))?;
                self.org.scope_members(&root)
            }
        };

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        recipients
            .iter()
            .filter(|r| r.as_str() != from)
            .map(|to| {
                let message = Message::direct(from, to, options.kind, content)
                    .with_priority(options.priority)
                    .with_ttl(ttl);
                self.send(message)
            })
            .collect()
    }

    /// Unread messages for `agent` in arrival order. Does not mark them read.
    pub fn receive_unread(&self, agent: &str) -> Result<Vec<Message>, RuntimeError> {
        Ok(self.store.unread(agent)?)
    }

    pub fn mark_read(&self, agent: &str, ids: &[MessageId]) -> Result<usize, RuntimeError> {
        Ok(self.store.mark_read(agent, ids)?)
    }

    fn drop_expired(&self, message: &Message) {
        tracing::warn!(
            message = %message.id,
            from = %message.header.from,
            to = %message.header.to,
            "Message expired before delivery; dropped"
        );
        self.journal.record(JournalEntry::MessageDropped {
            timestamp: now_iso(),
            message_id: message.id.clone(),
            from: message.header.from.clone(),
            to: message.header.to.clone(),
            reason: ReasonCode::MessageExpired,
        });
    }
}
