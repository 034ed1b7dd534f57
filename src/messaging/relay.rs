//! Cross-scope relay.
//!
//! Messages between different organisational roots are queued here and
//! forwarded by a single worker in FIFO order, which keeps per-sender,
//! per-recipient ordering. A failed forward is retried with exponential
//! backoff until the message's deadline; after that the message is dropped
//! and the sender receives a `delivery_failure` notice.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::router::LocalDelivery;
use super::{Message, MessageKind, Priority, SYSTEM_SENDER};
use crate::agent::journal::{now_iso, Journal, JournalEntry};
use crate::error::{ReasonCode, RuntimeError};

/// A link to another organisational scope.
pub trait RelayTransport: Send + Sync {
    /// Hand `message` to the remote scope. An `Err` is retried by the worker.
    fn forward<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), String>>;
}

/// Link to a scope hosted in this process. Can be taken offline to model an
/// unavailable relay.
pub struct LocalLink {
    delivery: LocalDelivery,
    online: AtomicBool,
}

impl LocalLink {
    pub fn new(delivery: LocalDelivery) -> Self {
        Self {
            delivery,
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        tracing::info!(online, "Relay link state changed");
    }
}

impl RelayTransport for LocalLink {
    fn forward<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            if !self.online.load(Ordering::SeqCst) {
                return Err("relay link offline".to_string());
            }
            self.delivery
                .deliver(message.clone())
                .map_err(|e| e.to_string())
        })
    }
}

/// Sending half of the relay queue. Cheap to clone.
#[derive(Clone)]
pub struct RelayQueue {
    tx: UnboundedSender<Message>,
    pending: Arc<AtomicUsize>,
}

/// Receiving half, consumed by [`RelayWorker`].
pub struct RelayInbox {
    rx: UnboundedReceiver<Message>,
    pending: Arc<AtomicUsize>,
}

impl RelayQueue {
    pub fn channel() -> (RelayQueue, RelayInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            RelayQueue {
                tx,
                pending: pending.clone(),
            },
            RelayInbox { rx, pending },
        )
    }

    pub fn enqueue(&self, message: Message) -> Result<(), RuntimeError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(message).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            RuntimeError::TransportFailure("relay queue closed".into())
        })
    }

    /// Messages accepted but not yet delivered or dropped.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RelayBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

pub struct RelayWorker {
    inbox: RelayInbox,
    transport: Arc<dyn RelayTransport>,
    local: LocalDelivery,
    journal: Journal,
    backoff: RelayBackoff,
}

enum RelayOutcome {
    Forwarded,
    Dropped(ReasonCode),
    Cancelled,
}

impl RelayWorker {
    pub fn new(
        inbox: RelayInbox,
        transport: Arc<dyn RelayTransport>,
        local: LocalDelivery,
        journal: Journal,
        backoff: RelayBackoff,
    ) -> Self {
        Self {
            inbox,
            transport,
            local,
            journal,
            backoff,
        }
    }

    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = self.inbox.rx.recv() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };
                let outcome = self.relay_one(&message, &cancel).await;
                match outcome {
                    RelayOutcome::Forwarded => {
                        tracing::debug!(message = %message.id, to = %message.header.to, "Relayed across scopes");
                    }
                    RelayOutcome::Dropped(reason) => self.drop_message(&message, reason),
                    RelayOutcome::Cancelled => break,
                }
                self.inbox.pending.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!("Relay worker stopped");
        })
    }

    async fn relay_one(&self, message: &Message, cancel: &CancellationToken) -> RelayOutcome {
        let mut delay = self.backoff.initial;
        let mut attempt: u32 = 0;
        loop {
            if message.is_expired(Utc::now()) {
                return if attempt == 0 {
                    RelayOutcome::Dropped(ReasonCode::MessageExpired)
                } else {
                    RelayOutcome::Dropped(ReasonCode::TransportFailure)
                };
            }
            attempt += 1;
            match self.transport.forward(message).await {
                Ok(()) => return RelayOutcome::Forwarded,
                Err(e) => {
                    tracing::warn!(message = %message.id, attempt, "Relay attempt failed: {e}");
                }
            }
            let remaining = message.remaining(Utc::now());
            if remaining.is_zero() {
                return RelayOutcome::Dropped(ReasonCode::TransportFailure);
            }
            tokio::select! {
                _ = cancel.cancelled() => return RelayOutcome::Cancelled,
                _ = tokio::time::sleep(delay.min(remaining)) => {}
            }
            delay = (delay * 2).min(self.backoff.max);
        }
    }

    fn drop_message(&self, message: &Message, reason: ReasonCode) {
        tracing::warn!(
            message = %message.id,
            from = %message.header.from,
            to = %message.header.to,
            %reason,
            "Cross-scope message dropped"
        );
        self.journal.record(JournalEntry::MessageDropped {
            timestamp: now_iso(),
            message_id: message.id.clone(),
            from: message.header.from.clone(),
            to: message.header.to.clone(),
            reason,
        });

        if message.header.from == SYSTEM_SENDER {
            return;
        }
        let notice = message
            .reply(
                SYSTEM_SENDER,
                MessageKind::DeliveryFailure,
                &format!(
                    "Message to {} could not be delivered before its deadline",
                    message.header.to
                ),
            )
            .with_priority(Priority::High)
            .with_payload(json!({
                "message_id": message.id,
                "recipient": message.header.to,
                "reason": reason,
            }));
        if let Err(e) = self.local.deliver(notice) {
            tracing::error!(sender = %message.header.from, "Failed to deliver failure notice: {e}");
        }
    }
}
