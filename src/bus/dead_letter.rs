//! Dead Letter Queue
//!
//! Terminal store for messages that expired, could not be delivered, or were
//! never acknowledged. Nothing is replayed automatically; operators pull
//! entries out with [`DeadLetterQueue::take`].

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Duration, Instant};
use tracing::warn;

use super::message::Message;
use crate::config::DeadLetterConfig;
use crate::metrics;

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Its ttl elapsed before delivery.
    Expired,
    /// Every delivery attempt and fallback recipient failed.
    DeliveryFailed,
    /// An exactly-once message was not acknowledged in time.
    DeliveryTimeout,
    /// No handler is registered for the recipient.
    NoRecipient,
}

impl DeadLetterReason {
    /// snake_case name, also the metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::Expired => "expired",
            DeadLetterReason::DeliveryFailed => "delivery_failed",
            DeadLetterReason::DeliveryTimeout => "delivery_timeout",
            DeadLetterReason::NoRecipient => "no_recipient",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dead-lettered message.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// Id of the failed message.
    pub message_id: String,
    /// The message itself.
    pub message: Message,
    /// Classification.
    pub reason: DeadLetterReason,
    /// Rendered last error.
    pub error: String,
    /// Free-form diagnostic context (recipient, attempts, ...).
    pub context: Value,
    /// When it was dead-lettered.
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    recorded: Instant,
}

/// Bounded in-memory dead-letter store.
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    config: DeadLetterConfig,
}

impl fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("len", &self.len())
            .field("max_entries", &self.config.max_entries)
            .finish()
    }
}

impl DeadLetterQueue {
    /// Empty queue.
    pub fn new(config: DeadLetterConfig) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            config,
        }
    }

    /// Record a failed message. Drops the oldest entry when full.
    pub fn add(&self, message: Message, reason: DeadLetterReason, error: impl Into<String>, context: Value) {
        let error = error.into();
        warn!(
            message_id = %message.id,
            recipient = %message.recipient,
            reason = %reason,
            error = %error,
            "message dead-lettered"
        );
        metrics::inc_dead_letter(reason.as_str());

        let mut entries = self.entries.lock();
        if self.config.max_entries > 0 && entries.len() >= self.config.max_entries {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            message_id: message.id.clone(),
            message,
            reason,
            error,
            context,
            timestamp: Utc::now(),
            recorded: Instant::now(),
        });
    }

    /// Remove entries older than `retention`. Returns how many were removed.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.recorded.elapsed() <= retention);
        before - entries.len()
    }

    /// [`cleanup`](Self::cleanup) with the configured retention.
    pub fn cleanup_default(&self) -> usize {
        self.cleanup(Duration::from_secs(self.config.retention_secs))
    }

    /// Most recent entry for `message_id`.
    pub fn find(&self, message_id: &str) -> Option<DeadLetter> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|e| e.message_id == message_id)
            .cloned()
    }

    /// Remove and return the most recent entry for `message_id`.
    pub fn take(&self, message_id: &str) -> Option<DeadLetter> {
        let mut entries = self.entries.lock();
        let idx = entries.iter().rposition(|e| e.message_id == message_id)?;
        entries.remove(idx)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entry counts per reason.
    pub fn counts_by_reason(&self) -> HashMap<DeadLetterReason, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.lock().iter() {
            *counts.entry(entry.reason).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DeadLetterConfig::default())
    }
}
