//! # Stage: Message Bus
//!
//! ## Responsibility
//! Decoupled delivery between components: validate → route → enqueue →
//! deliver → acknowledge. Direct messages go through a four-lane priority
//! queue; broadcasts fan out by strategy; stream messages are buffered for
//! filtered subscribers; everything undeliverable lands in the dead-letter
//! queue.
//!
//! ## Guarantees
//! - Ordered: FIFO within a lane, strict precedence across lanes.
//! - Expiry: a message whose ttl elapsed is never delivered; it is
//!   dead-lettered instead.
//! - Exactly-once: a recipient never receives the same message id twice
//!   within the dedupe window; unacknowledged messages are dead-lettered
//!   when their ttl elapses.
//! - Non-silent: every terminal failure produces a dead-letter entry and a
//!   [`RouterEvent`].
//!
//! ## NOT Responsible For
//! - Persistence: all queues and buffers are in memory
//! - Replaying dead letters (an operator pulls them with
//!   [`DeadLetterQueue::take`])
//! - Fairness across priority lanes

pub mod broadcast;
pub mod dead_letter;
pub mod message;
pub mod queue;
pub mod stream;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{BusConfig, StreamSettings};
use crate::events::{EventBus, RouterEvent};
use crate::{metrics, RouterError};

// Re-exports for convenience
pub use broadcast::{choose_strategy, BroadcastReport, RecipientDirectory, ALL_AGENTS};
pub use dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterReason};
pub use message::{
    Ack, BroadcastStrategy, ChannelHandler, DeliveryError, DeliveryMode, Message, MessageHandler,
    Priority, Recipient, RoutingOptions, SendOptions,
};
pub use queue::{PriorityQueue, QueueError, QueueStats};
pub use stream::{
    ChannelSubscriber, DrainReport, StreamNotice, StreamRegistry, StreamStats, StreamSubscriber,
    Subscription, SubscriptionFilter,
};

/// Stream used by streamed broadcasts that name none.
pub const DEFAULT_BROADCAST_STREAM: &str = "broadcast";

/// Message type used when the sender sets none.
pub const DEFAULT_MESSAGE_TYPE: &str = "message";

/// What happened to one dispatched message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// A handler accepted it.
    Delivered {
        /// Recipient that took it (a fallback if the primary failed).
        recipient: String,
    },
    /// Exactly-once message accepted, acknowledgement outstanding.
    AwaitingAck {
        /// Recipient that must acknowledge.
        recipient: String,
    },
    /// Appended to a stream buffer.
    Published {
        /// Target stream.
        stream_id: String,
    },
    /// Exactly-once message already delivered to this recipient; skipped.
    Duplicate {
        /// Recipient that already has it.
        recipient: String,
    },
    /// Moved to the dead-letter queue.
    DeadLettered {
        /// Why.
        reason: DeadLetterReason,
    },
}

/// Bus counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    /// Messages accepted by `send`/`submit`.
    pub accepted: u64,
    /// Messages rejected by validation.
    pub rejected: u64,
    /// Completed deliveries (acknowledged, for exactly-once).
    pub delivered: u64,
    /// Suppressed duplicate deliveries.
    pub duplicates: u64,
    /// Messages moved to the dead-letter queue.
    pub dead_lettered: u64,
    /// Messages waiting in the queue.
    pub queued: usize,
    /// Exactly-once deliveries awaiting acknowledgement.
    pub pending_acks: usize,
}

/// Why one recipient could not take a message.
enum Failure {
    NoHandler,
    Expired,
    Failed(String),
}

/// Claim on an exactly-once `(recipient, message_id)` while its handler runs.
/// Released on drop, after the outcome has been recorded.
struct InFlight<'a> {
    slots: &'a DashMap<(String, String), ()>,
    key: (String, String),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.slots.remove(&self.key);
    }
}

struct PendingAck {
    message: Message,
    deadline: Instant,
}

/// Bounded memory of `(recipient, message_id)` pairs already delivered.
struct DedupeWindow {
    order: VecDeque<(String, String)>,
    seen: HashSet<(String, String)>,
    capacity: usize,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, key: &(String, String)) -> bool {
        self.seen.contains(key)
    }

    fn insert(&mut self, key: (String, String)) {
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

struct BusInner {
    config: BusConfig,
    events: EventBus,
    queue: PriorityQueue<Message>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    directory: RecipientDirectory,
    streams: Arc<StreamRegistry>,
    dead_letters: DeadLetterQueue,
    pending_acks: DashMap<(String, String), PendingAck>,
    delivered_ids: Mutex<DedupeWindow>,
    in_flight: DashMap<(String, String), ()>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Priority message bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("queued", &self.inner.queue.len())
            .field("recipients", &self.inner.handlers.len())
            .field("dead_letters", &self.inner.dead_letters.len())
            .finish()
    }
}

impl MessageBus {
    /// Create a bus. The default broadcast stream exists from the start.
    pub fn new(config: BusConfig, events: EventBus) -> Self {
        let default_ttl = Duration::from_millis(config.default_ttl_ms);
        let streams = Arc::new(StreamRegistry::new(
            config.streams.clone(),
            default_ttl,
            events.clone(),
        ));
        streams.create_stream(DEFAULT_BROADCAST_STREAM, None);

        Self {
            inner: Arc::new(BusInner {
                queue: PriorityQueue::with_capacity(config.queue_capacity),
                dead_letters: DeadLetterQueue::new(config.dead_letter.clone()),
                delivered_ids: Mutex::new(DedupeWindow::new(config.dedupe_window)),
                config,
                events,
                handlers: DashMap::new(),
                directory: RecipientDirectory::new(),
                streams,
                pending_acks: DashMap::new(),
                in_flight: DashMap::new(),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                duplicates: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
            }),
        }
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.inner.config.default_ttl_ms)
    }

    // ── Recipients ───────────────────────────────────────────────────────

    /// Register `handler` under `id`, replacing any previous handler.
    pub fn register_recipient(&self, id: &str, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.insert(id.to_string(), handler);
        self.inner.directory.add_recipient(id);
        debug!(recipient = id, "recipient registered");
    }

    /// Remove a recipient. Returns whether it was registered.
    pub fn unregister_recipient(&self, id: &str) -> bool {
        self.inner.directory.remove_recipient(id);
        self.inner.handlers.remove(id).is_some()
    }

    /// Recipient directory (groups and coalitions for broadcast tokens).
    pub fn directory(&self) -> &RecipientDirectory {
        &self.inner.directory
    }

    // ── Send path ────────────────────────────────────────────────────────

    /// Reject malformed messages.
    ///
    /// # Errors
    ///
    /// [`RouterError::Validation`] naming the first problem found.
    pub fn validate(&self, message: &Message) -> Result<(), RouterError> {
        let problem = if message.id.trim().is_empty() {
            Some("message id is required".to_string())
        } else if message.sender.trim().is_empty() {
            Some("sender id is required".to_string())
        } else if message.recipient.id().trim().is_empty() {
            Some("recipient id is required".to_string())
        } else if message.ttl(self.default_ttl()).is_zero() {
            Some("ttl must be positive".to_string())
        } else {
            let size = message.payload_bytes();
            (size > self.inner.config.max_payload_bytes).then(|| {
                format!(
                    "payload of {size} bytes exceeds limit of {}",
                    self.inner.config.max_payload_bytes
                )
            })
        };

        match problem {
            Some(reason) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::inc_bus_message("rejected");
                debug!(message_id = %message.id, reason = %reason, "message rejected");
                Err(RouterError::Validation(reason))
            }
            None => Ok(()),
        }
    }

    /// Build a message from `sender` to `recipient` and enqueue it.
    /// `"stream:<id>"` addresses a stream. Returns the message id.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub fn send(
        &self,
        sender: &str,
        recipient: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<String, RouterError> {
        let message_type = options
            .message_type
            .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string());
        let message = Message::new(sender, recipient, message_type, payload)
            .with_priority(options.priority)
            .with_routing(options.routing);
        self.submit(message)
    }

    /// Validate, route and enqueue a prebuilt message.
    ///
    /// # Errors
    ///
    /// - [`RouterError::Validation`] for a malformed message
    /// - [`RouterError::StreamNotFound`] for a stream that does not exist
    /// - [`RouterError::QueueFull`] when the queue is at capacity
    pub fn submit(&self, message: Message) -> Result<String, RouterError> {
        self.validate(&message)?;
        if let Recipient::Stream(stream_id) = &message.recipient {
            if !self.inner.streams.exists(stream_id) {
                return Err(RouterError::StreamNotFound(stream_id.clone()));
            }
        }

        let id = message.id.clone();
        let priority = message.priority;
        if let Err(e) = self.inner.queue.push(priority, message) {
            warn!(message_id = %id, error = %e, "message not enqueued");
            metrics::inc_bus_message("queue_full");
            return Err(e.into());
        }
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::inc_bus_message("accepted");
        debug!(message_id = %id, priority = %priority, "message enqueued");
        Ok(id)
    }

    // ── Deliver path ─────────────────────────────────────────────────────

    /// Dispatch the head of the highest non-empty lane.
    /// Returns `None` when the queue is empty.
    pub async fn process_next(&self) -> Option<(String, DeliveryOutcome)> {
        let (_, message) = self.inner.queue.pop()?;
        let id = message.id.clone();
        Some((id, self.dispatch(message).await))
    }

    /// Dispatch everything currently queued, in priority order.
    pub async fn process_all(&self) -> Vec<(String, DeliveryOutcome)> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn dispatch(&self, message: Message) -> DeliveryOutcome {
        if message.is_expired(self.default_ttl()) {
            self.dead_letter(message, DeadLetterReason::Expired, "ttl elapsed before delivery", Value::Null);
            return DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::Expired,
            };
        }

        match message.recipient.clone() {
            Recipient::Stream(stream_id) => match self.inner.streams.publish(&stream_id, message.clone()) {
                Ok(()) => {
                    self.inner.events.publish(RouterEvent::MessageDelivered {
                        message_id: message.id.clone(),
                        recipient: message.recipient.to_string(),
                    });
                    metrics::inc_bus_message("published");
                    DeliveryOutcome::Published { stream_id }
                }
                Err(e) => {
                    let context = json!({ "stream_id": stream_id });
                    self.dead_letter(message, DeadLetterReason::NoRecipient, e.to_string(), context);
                    DeliveryOutcome::DeadLettered {
                        reason: DeadLetterReason::NoRecipient,
                    }
                }
            },
            Recipient::Agent(primary) => self.deliver_with_fallback(message, primary).await,
        }
    }

    async fn deliver_with_fallback(&self, message: Message, primary: String) -> DeliveryOutcome {
        let candidates: Vec<String> = std::iter::once(primary.clone())
            .chain(message.routing.fallback_recipients.iter().cloned())
            .collect();

        let mut errors: Vec<String> = Vec::new();
        let mut only_missing = true;
        for recipient in &candidates {
            match self.deliver_to(&message, recipient).await {
                Ok(outcome) => return outcome,
                Err(Failure::Expired) => {
                    self.dead_letter(message, DeadLetterReason::Expired, "ttl elapsed during delivery", Value::Null);
                    return DeliveryOutcome::DeadLettered {
                        reason: DeadLetterReason::Expired,
                    };
                }
                Err(Failure::NoHandler) => {
                    errors.push(format!("{recipient}: no handler registered"));
                }
                Err(Failure::Failed(e)) => {
                    only_missing = false;
                    errors.push(format!("{recipient}: {e}"));
                }
            }
        }

        let reason = if only_missing {
            DeadLetterReason::NoRecipient
        } else {
            DeadLetterReason::DeliveryFailed
        };
        let error = errors.last().cloned().unwrap_or_default();
        self.inner.events.publish(RouterEvent::MessageError {
            message_id: message.id.clone(),
            recipient: primary,
            error: error.clone(),
        });
        let context = json!({ "tried": candidates, "errors": errors });
        self.dead_letter(message, reason, error, context);
        DeliveryOutcome::DeadLettered { reason }
    }

    /// Deliver to one recipient, retrying up to `delivery_attempts` times.
    async fn deliver_to(&self, message: &Message, recipient: &str) -> Result<DeliveryOutcome, Failure> {
        let handler = self
            .inner
            .handlers
            .get(recipient)
            .map(|h| Arc::clone(h.value()))
            .ok_or(Failure::NoHandler)?;

        let exactly_once = message.routing.delivery_mode == DeliveryMode::ExactlyOnce;
        let key = (recipient.to_string(), message.id.clone());
        let _claim = if exactly_once {
            match self.claim(&key) {
                Some(claim) => Some(claim),
                None => {
                    self.inner.duplicates.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_bus_message("duplicate");
                    debug!(message_id = %message.id, recipient, "duplicate suppressed");
                    return Ok(DeliveryOutcome::Duplicate {
                        recipient: recipient.to_string(),
                    });
                }
            }
        } else {
            None
        };

        let expires_at = message.expires_at(self.default_ttl());
        let attempts = self.inner.config.delivery_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let now = Instant::now();
            if now >= expires_at {
                return Err(Failure::Expired);
            }
            let remaining = expires_at - now;

            let error = match tokio::time::timeout(remaining, handler.handle(message)).await {
                Ok(Ok(Ack::Pending)) if exactly_once => {
                    self.inner.pending_acks.insert(
                        key.clone(),
                        PendingAck {
                            message: message.clone(),
                            deadline: expires_at,
                        },
                    );
                    debug!(message_id = %message.id, recipient, "awaiting acknowledgement");
                    return Ok(DeliveryOutcome::AwaitingAck {
                        recipient: recipient.to_string(),
                    });
                }
                Ok(Ok(_)) => {
                    self.mark_delivered(message, recipient);
                    return Ok(DeliveryOutcome::Delivered {
                        recipient: recipient.to_string(),
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => DeliveryError::Timeout(remaining),
            };

            debug!(message_id = %message.id, recipient, attempt, error = %error, "delivery attempt failed");
            last_error = error.to_string();
            if attempt + 1 < attempts {
                let pause = Duration::from_millis(self.inner.config.retry_delay_ms)
                    .min(expires_at.saturating_duration_since(Instant::now()));
                tokio::time::sleep(pause).await;
            }
        }
        Err(Failure::Failed(last_error))
    }

    /// Reserve `key` for one delivery. `None` if it was already delivered,
    /// is awaiting acknowledgement, or another dispatch holds it.
    fn claim(&self, key: &(String, String)) -> Option<InFlight<'_>> {
        let delivered = self.inner.delivered_ids.lock();
        if delivered.contains(key) || self.inner.pending_acks.contains_key(key) {
            return None;
        }
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlight {
                    slots: &self.inner.in_flight,
                    key: key.clone(),
                })
            }
        }
    }

    fn mark_delivered(&self, message: &Message, recipient: &str) {
        if message.routing.delivery_mode == DeliveryMode::ExactlyOnce {
            self.inner
                .delivered_ids
                .lock()
                .insert((recipient.to_string(), message.id.clone()));
        }
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::inc_bus_message("delivered");
        self.inner.events.publish(RouterEvent::MessageDelivered {
            message_id: message.id.clone(),
            recipient: recipient.to_string(),
        });
    }

    fn dead_letter(&self, message: Message, reason: DeadLetterReason, error: impl Into<String>, context: Value) {
        let message_id = message.id.clone();
        self.inner.dead_letters.add(message, reason, error, context);
        self.inner.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.inner.events.publish(RouterEvent::MessageDeadLettered {
            message_id,
            reason: reason.as_str().to_string(),
        });
    }

    // ── Acknowledge ──────────────────────────────────────────────────────

    /// Acknowledge an exactly-once delivery. Acknowledging a delivery that
    /// already completed is a no-op.
    ///
    /// # Errors
    ///
    /// - [`RouterError::DeliveryTimeout`] if the ttl elapsed first (the
    ///   message is in the dead-letter queue)
    /// - [`RouterError::Validation`] if nothing was delivered to `recipient`
    pub fn acknowledge(&self, message_id: &str, recipient: &str) -> Result<(), RouterError> {
        let key = (recipient.to_string(), message_id.to_string());
        // Move from pending to delivered under the window lock so a concurrent
        // dispatch never sees the key in neither.
        let now = Instant::now();
        let removed = {
            let mut delivered = self.inner.delivered_ids.lock();
            let removed = self.inner.pending_acks.remove(&key);
            if removed.as_ref().is_some_and(|(_, p)| now <= p.deadline) {
                delivered.insert(key.clone());
            }
            removed
        };
        if let Some((_, pending)) = removed {
            if now > pending.deadline {
                self.expire_ack(pending.message, recipient);
                return Err(RouterError::DeliveryTimeout {
                    message_id: message_id.to_string(),
                });
            }
            self.mark_delivered(&pending.message, recipient);
            return Ok(());
        }

        if self.inner.delivered_ids.lock().contains(&key) {
            return Ok(());
        }
        if self
            .inner
            .dead_letters
            .find(message_id)
            .is_some_and(|d| d.reason == DeadLetterReason::DeliveryTimeout)
        {
            return Err(RouterError::DeliveryTimeout {
                message_id: message_id.to_string(),
            });
        }
        Err(RouterError::Validation(format!(
            "no pending delivery of '{message_id}' to '{recipient}'"
        )))
    }

    fn expire_ack(&self, message: Message, recipient: &str) {
        let error = RouterError::DeliveryTimeout {
            message_id: message.id.clone(),
        }
        .to_string();
        self.inner.events.publish(RouterEvent::MessageError {
            message_id: message.id.clone(),
            recipient: recipient.to_string(),
            error: error.clone(),
        });
        let context = json!({ "recipient": recipient });
        self.dead_letter(message, DeadLetterReason::DeliveryTimeout, error, context);
    }

    /// Dead-letter every exactly-once delivery whose acknowledgement deadline
    /// passed. Returns how many were moved.
    pub fn sweep_pending_acks(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<(String, String)> = self
            .inner
            .pending_acks
            .iter()
            .filter(|e| now > e.value().deadline)
            .map(|e| e.key().clone())
            .collect();

        let mut moved = 0;
        for key in overdue {
            if let Some((_, pending)) = self.inner.pending_acks.remove(&key) {
                self.expire_ack(pending.message, &key.0);
                moved += 1;
            }
        }
        moved
    }

    /// Dead-letter every queued message whose ttl elapsed. Returns how many
    /// were moved.
    pub fn purge_expired(&self) -> usize {
        let default_ttl = self.default_ttl();
        let expired = self.inner.queue.remove_where(|m| m.is_expired(default_ttl));
        let count = expired.len();
        for (_, message) in expired {
            self.dead_letter(message, DeadLetterReason::Expired, "ttl elapsed in queue", Value::Null);
        }
        count
    }

    /// Run the dispatch loop until `shutdown` becomes `true` or its sender is
    /// dropped. Expired messages, overdue acknowledgements and dead letters
    /// past retention are swept at most once per `idle_wait_ms`.
    pub fn spawn_dispatcher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let idle = Duration::from_millis(bus.inner.config.idle_wait_ms.max(1));
            let mut last_sweep = Instant::now();
            info!(idle_wait_ms = idle.as_millis() as u64, "bus dispatcher started");
            loop {
                if last_sweep.elapsed() >= idle {
                    let purged = bus.purge_expired();
                    let timed_out = bus.sweep_pending_acks();
                    let retired = bus.inner.dead_letters.cleanup_default();
                    if purged + timed_out + retired > 0 {
                        debug!(purged, timed_out, retired, "bus sweep");
                    }
                    last_sweep = Instant::now();
                }
                tokio::select! {
                    next = bus.inner.queue.pop_wait(idle) => {
                        if let Some((_, message)) = next {
                            let _ = bus.dispatch(message).await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("bus dispatcher stopped");
        })
    }

    // ── Broadcast ────────────────────────────────────────────────────────

    /// Deliver one message to every recipient `tokens` resolve to
    /// (`all_agents`, `group:<id>`, `coalition:<id>` or plain ids).
    ///
    /// Broadcasts bypass the queue. Each failed recipient is dead-lettered
    /// individually.
    ///
    /// # Errors
    ///
    /// - [`RouterError::Validation`] for a malformed message or when the
    ///   tokens resolve to no recipient
    /// - [`RouterError::StreamNotFound`] if a streamed broadcast names a
    ///   stream that does not exist
    pub async fn broadcast<I, S>(
        &self,
        sender: &str,
        tokens: I,
        payload: Value,
        options: SendOptions,
    ) -> Result<BroadcastReport, RouterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let recipients = self.inner.directory.resolve(tokens);
        if recipients.is_empty() {
            return Err(RouterError::Validation(
                "broadcast resolved to no recipients".to_string(),
            ));
        }

        let message_type = options
            .message_type
            .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string());
        let message = Message::new(sender, Recipient::Agent(ALL_AGENTS.to_string()), message_type, payload)
            .with_priority(options.priority)
            .with_routing(options.routing);
        self.validate(&message)?;

        let config = &self.inner.config.broadcast;
        let strategy = choose_strategy(
            recipients.len(),
            message.payload_bytes(),
            message.priority,
            &message.routing,
            config,
        );
        debug!(
            message_id = %message.id,
            recipients = recipients.len(),
            strategy = ?strategy,
            "broadcasting"
        );
        metrics::inc_bus_message("broadcast");

        let mut report = BroadcastReport {
            message_id: message.id.clone(),
            strategy,
            recipients: recipients.clone(),
            delivered: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            stream_id: None,
        };

        match strategy {
            BroadcastStrategy::Streamed => {
                let stream_id = message
                    .routing
                    .stream_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BROADCAST_STREAM.to_string());
                let streamed = message.readdressed(Recipient::Stream(stream_id.clone()));
                self.inner.streams.publish(&stream_id, streamed)?;
                report.stream_id = Some(stream_id);
            }
            BroadcastStrategy::Parallel => {
                let results = join_all(recipients.iter().map(|r| self.deliver_one(&message, r))).await;
                report.absorb(results);
            }
            BroadcastStrategy::Batched => {
                let batch_size = config.batch_size.max(1);
                let delay = Duration::from_millis(config.batch_delay_ms);
                for (i, batch) in recipients.chunks(batch_size).enumerate() {
                    if i > 0 && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let results = join_all(batch.iter().map(|r| self.deliver_one(&message, r))).await;
                    report.absorb(results);
                }
            }
            BroadcastStrategy::Sequential => {
                for (i, recipient) in recipients.iter().enumerate() {
                    let result = self.deliver_one(&message, recipient).await;
                    let failed = result.1.is_err();
                    report.absorb([result]);
                    if failed && message.routing.stop_on_error {
                        report.skipped = recipients[i + 1..].to_vec();
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn deliver_one(&self, message: &Message, recipient: &str) -> (String, Result<(), String>) {
        let copy = message.readdressed(Recipient::Agent(recipient.to_string()));
        let result = match self.deliver_to(&copy, recipient).await {
            Ok(_) => Ok(()),
            Err(failure) => {
                let (reason, error) = match failure {
                    Failure::NoHandler => (DeadLetterReason::NoRecipient, "no handler registered".to_string()),
                    Failure::Expired => (DeadLetterReason::Expired, "ttl elapsed during delivery".to_string()),
                    Failure::Failed(e) => (DeadLetterReason::DeliveryFailed, e),
                };
                self.inner.events.publish(RouterEvent::MessageError {
                    message_id: copy.id.clone(),
                    recipient: recipient.to_string(),
                    error: error.clone(),
                });
                self.dead_letter(copy, reason, error.clone(), json!({ "broadcast": true }));
                Err(error)
            }
        };
        (recipient.to_string(), result)
    }

    // ── Streams ──────────────────────────────────────────────────────────

    /// Create a stream; see [`StreamRegistry::create_stream`].
    pub fn create_stream(&self, stream_id: &str, settings: Option<StreamSettings>) -> bool {
        self.inner.streams.create_stream(stream_id, settings)
    }

    /// Subscribe to a stream; see [`StreamRegistry::subscribe`].
    ///
    /// # Errors
    ///
    /// [`RouterError::StreamNotFound`] for an unknown stream.
    pub fn subscribe(
        &self,
        stream_id: &str,
        subscriber_id: &str,
        filter: SubscriptionFilter,
        subscriber: Arc<dyn StreamSubscriber>,
    ) -> Result<Subscription, RouterError> {
        self.inner
            .streams
            .subscribe(stream_id, subscriber_id, filter, subscriber)
    }

    /// Detach a subscription.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.streams.unsubscribe(subscription)
    }

    /// Validate a message and append it straight to `stream_id`'s buffer.
    /// Returns the message id.
    ///
    /// # Errors
    ///
    /// [`RouterError::Validation`] or [`RouterError::StreamNotFound`].
    pub fn publish(
        &self,
        stream_id: &str,
        sender: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<String, RouterError> {
        let message_type = options
            .message_type
            .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string());
        let message = Message::new(sender, Recipient::Stream(stream_id.to_string()), message_type, payload)
            .with_priority(options.priority)
            .with_routing(options.routing);
        self.validate(&message)?;
        let id = message.id.clone();
        self.inner.streams.publish(stream_id, message)?;
        metrics::inc_bus_message("published");
        Ok(id)
    }

    /// Stream registry.
    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.inner.streams
    }

    // ── Inspection ───────────────────────────────────────────────────────

    /// Dead-letter queue.
    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.inner.dead_letters
    }

    /// Queue statistics per lane.
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Bus counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            accepted: self.inner.accepted.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            duplicates: self.inner.duplicates.load(Ordering::Relaxed),
            dead_lettered: self.inner.dead_lettered.load(Ordering::Relaxed),
            queued: self.inner.queue.len(),
            pending_acks: self.inner.pending_acks.len(),
        }
    }
}

impl BroadcastReport {
    fn absorb(&mut self, results: impl IntoIterator<Item = (String, Result<(), String>)>) {
        for (recipient, result) in results {
            match result {
                Ok(()) => self.delivered.push(recipient),
                Err(e) => self.failed.push((recipient, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> BusConfig {
        BusConfig {
            retry_delay_ms: 1,
            ..BusConfig::default()
        }
    }

    fn bus() -> MessageBus {
        MessageBus::new(fast_config(), EventBus::new(256))
    }

    /// Fails the first `failures` deliveries, then acknowledges.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        async fn handle(&self, _message: &Message) -> Result<Ack, DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(DeliveryError::Rejected(format!("failure {n}")))
            } else {
                Ok(Ack::Acknowledged)
            }
        }
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    #[test]
    fn test_validation_rejects_missing_ids() {
        let bus = bus();
        assert!(matches!(
            bus.send("", "r", Value::Null, SendOptions::default()),
            Err(RouterError::Validation(_))
        ));
        assert!(matches!(
            bus.send("s", "", Value::Null, SendOptions::default()),
            Err(RouterError::Validation(_))
        ));
        let no_id = Message::new("s", "r", "t", Value::Null).with_id("");
        assert!(matches!(bus.submit(no_id), Err(RouterError::Validation(_))));
        assert_eq!(bus.stats().rejected, 3);
        assert_eq!(bus.stats().queued, 0, "rejected messages are never queued");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let bus = MessageBus::new(
            BusConfig {
                max_payload_bytes: 8,
                ..fast_config()
            },
            EventBus::default(),
        );
        let result = bus.send("s", "r", json!("far more than eight bytes"), SendOptions::default());
        assert!(matches!(result, Err(RouterError::Validation(_))));
    }

    #[test]
    fn test_send_to_unknown_stream_is_stream_not_found() {
        let bus = bus();
        let result = bus.send("s", "stream:nope", Value::Null, SendOptions::default());
        assert!(matches!(result, Err(RouterError::StreamNotFound(_))));
    }

    #[test]
    fn test_queue_full_surfaces() {
        let bus = MessageBus::new(
            BusConfig {
                queue_capacity: 1,
                ..fast_config()
            },
            EventBus::default(),
        );
        assert!(bus.send("s", "r", Value::Null, SendOptions::default()).is_ok());
        assert!(matches!(
            bus.send("s", "r", Value::Null, SendOptions::default()),
            Err(RouterError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_delivery_in_priority_order() {
        let bus = bus();
        let (handler, mut rx) = ChannelHandler::new(16, Ack::Acknowledged);
        bus.register_recipient("r", Arc::new(handler));
        for (i, p) in [Priority::Low, Priority::Critical, Priority::Medium, Priority::High]
            .into_iter()
            .enumerate()
        {
            let _ = bus.send("s", "r", json!(i), SendOptions::default().priority(p));
        }
        let outcomes = bus.process_all().await;
        assert_eq!(outcomes.len(), 4);
        let mut got = Vec::new();
        while let Ok(m) = rx.try_recv() {
            got.push(m.priority);
        }
        assert_eq!(
            got,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[tokio::test]
    async fn test_at_least_once_retries_until_success() {
        let bus = bus();
        let handler = flaky(2);
        bus.register_recipient("r", handler.clone());
        let _ = bus.send("s", "r", json!(1), SendOptions::default());
        let outcome = bus.process_next().await.map(|(_, o)| o);
        assert_eq!(
            outcome,
            Some(DeliveryOutcome::Delivered {
                recipient: "r".into()
            })
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_delivery_uses_fallback_then_dead_letters() {
        let bus = bus();
        bus.register_recipient("primary", flaky(10));
        bus.register_recipient("backup", flaky(0));
        let _ = bus.send("s", "primary", json!(1), SendOptions::default().fallback("backup"));
        let outcome = bus.process_next().await.map(|(_, o)| o);
        assert_eq!(
            outcome,
            Some(DeliveryOutcome::Delivered {
                recipient: "backup".into()
            })
        );

        let id = bus.send("s", "primary", json!(2), SendOptions::default());
        let outcome = bus.process_next().await.map(|(_, o)| o);
        assert_eq!(
            outcome,
            Some(DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::DeliveryFailed
            })
        );
        let dead = id.ok().and_then(|id| bus.dead_letters().find(&id));
        assert!(dead.is_some_and(|d| d.error.contains("failure")));
    }

    #[tokio::test]
    async fn test_unknown_recipient_dead_lettered() {
        let bus = bus();
        let _ = bus.send("s", "ghost", json!(1), SendOptions::default());
        let outcome = bus.process_next().await.map(|(_, o)| o);
        assert_eq!(
            outcome,
            Some(DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::NoRecipient
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_dead_lettered_not_delivered() {
        let bus = bus();
        let (handler, mut rx) = ChannelHandler::new(4, Ack::Acknowledged);
        bus.register_recipient("r", Arc::new(handler));
        let id = bus.send("s", "r", json!(1), SendOptions::default().ttl(Duration::from_millis(100)));
        tokio::time::advance(Duration::from_millis(150)).await;
        let outcome = bus.process_next().await.map(|(_, o)| o);
        assert_eq!(
            outcome,
            Some(DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::Expired
            })
        );
        assert!(rx.try_recv().is_err());
        assert!(id.ok().and_then(|id| bus.dead_letters().find(&id)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_moves_queued_messages() {
        let bus = bus();
        let _ = bus.send("s", "r", json!(1), SendOptions::default().ttl(Duration::from_millis(100)));
        let _ = bus.send("s", "r", json!(2), SendOptions::default());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(bus.purge_expired(), 1);
        assert_eq!(bus.stats().queued, 1);
        assert_eq!(bus.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_exactly_once_ack_completes_delivery() {
        let bus = bus();
        let (handler, _rx) = ChannelHandler::new(4, Ack::Pending);
        bus.register_recipient("r", Arc::new(handler));
        let id = bus
            .send("s", "r", json!(1), SendOptions::default().exactly_once())
            .unwrap_or_default();
        let outcome = bus.process_next().await.map(|(_, o)| o);
        assert_eq!(outcome, Some(DeliveryOutcome::AwaitingAck { recipient: "r".into() }));
        assert_eq!(bus.stats().pending_acks, 1);
        assert!(bus.acknowledge(&id, "r").is_ok());
        assert_eq!(bus.stats().pending_acks, 0);
        assert_eq!(bus.stats().delivered, 1);
        assert!(bus.acknowledge(&id, "r").is_ok(), "repeat ack is a no-op");
        assert!(matches!(bus.acknowledge(&id, "other"), Err(RouterError::Validation(_))));
    }

    #[tokio::test]
    async fn test_exactly_once_suppresses_duplicates() {
        let bus = bus();
        let (handler, mut rx) = ChannelHandler::new(4, Ack::Acknowledged);
        bus.register_recipient("r", Arc::new(handler));
        let msg = Message::new("s", "r", "t", json!(1)).with_routing(RoutingOptions {
            delivery_mode: DeliveryMode::ExactlyOnce,
            ..RoutingOptions::default()
        });
        let _ = bus.submit(msg.clone());
        let _ = bus.submit(msg);
        let outcomes: Vec<DeliveryOutcome> = bus.process_all().await.into_iter().map(|(_, o)| o).collect();
        assert_eq!(outcomes[1], DeliveryOutcome::Duplicate { recipient: "r".into() });
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.stats().duplicates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_times_out_into_dead_letters() {
        let bus = bus();
        let (handler, _rx) = ChannelHandler::new(4, Ack::Pending);
        bus.register_recipient("r", Arc::new(handler));
        let id = bus
            .send(
                "s",
                "r",
                json!(1),
                SendOptions::default().exactly_once().ttl(Duration::from_millis(100)),
            )
            .unwrap_or_default();
        let _ = bus.process_next().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(bus.sweep_pending_acks(), 1);
        assert_eq!(
            bus.dead_letters().find(&id).map(|d| d.reason),
            Some(DeadLetterReason::DeliveryTimeout)
        );
        assert!(matches!(
            bus.acknowledge(&id, "r"),
            Err(RouterError::DeliveryTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_without_sweep_is_delivery_timeout() {
        let bus = bus();
        let (handler, _rx) = ChannelHandler::new(4, Ack::Pending);
        bus.register_recipient("r", Arc::new(handler));
        let id = bus
            .send(
                "s",
                "r",
                json!(1),
                SendOptions::default().exactly_once().ttl(Duration::from_millis(100)),
            )
            .unwrap_or_default();
        let _ = bus.process_next().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(
            bus.acknowledge(&id, "r"),
            Err(RouterError::DeliveryTimeout { .. })
        ));
        assert_eq!(bus.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_recipient_publishes_to_stream() {
        let bus = bus();
        bus.create_stream("alerts", None);
        let (sub, mut rx) = ChannelSubscriber::new(4);
        let _ = bus.subscribe("alerts", "ops", SubscriptionFilter::all(), Arc::new(sub));
        let _ = bus.send("s", "stream:alerts", json!({"level": "high"}), SendOptions::default());
        let outcome = bus.process_next().await.map(|(_, o)| o);
        assert_eq!(
            outcome,
            Some(DeliveryOutcome::Published {
                stream_id: "alerts".into()
            })
        );
        let _ = bus.streams().drain("alerts").await;
        assert!(matches!(rx.try_recv(), Ok(StreamNotice::Message(_))));
    }

    #[tokio::test]
    async fn test_broadcast_parallel_reports_failures() {
        let bus = bus();
        let (ok, _rx) = ChannelHandler::new(4, Ack::Acknowledged);
        bus.register_recipient("a", Arc::new(ok));
        bus.register_recipient("b", flaky(10));
        let report = bus
            .broadcast("s", [ALL_AGENTS, "ghost"], json!(1), SendOptions::default())
            .await;
        let Ok(report) = report else {
            panic!("broadcast failed: {report:?}");
        };
        assert_eq!(report.strategy, BroadcastStrategy::Parallel);
        assert_eq!(report.delivered, vec!["a"]);
        let failed: Vec<&str> = report.failed.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(failed, vec!["b", "ghost"]);
        assert_eq!(bus.dead_letters().len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_sequential_stops_on_error() {
        let bus = bus();
        bus.register_recipient("a", flaky(0));
        bus.register_recipient("b", flaky(10));
        bus.register_recipient("c", flaky(0));
        let report = bus
            .broadcast("s", ["a", "b", "c"], json!(1), SendOptions::default().ordered(true))
            .await;
        let Ok(report) = report else {
            panic!("broadcast failed: {report:?}");
        };
        assert_eq!(report.strategy, BroadcastStrategy::Sequential);
        assert_eq!(report.delivered, vec!["a"]);
        assert_eq!(report.skipped, vec!["c"]);
    }

    #[tokio::test]
    async fn test_broadcast_batched_over_threshold() {
        let config = BusConfig {
            broadcast: crate::config::BroadcastConfig {
                parallel_max_recipients: 2,
                batch_size: 2,
                ..Default::default()
            },
            ..fast_config()
        };
        let bus = MessageBus::new(config, EventBus::default());
        for id in ["a", "b", "c", "d", "e"] {
            bus.register_recipient(id, flaky(0));
            bus.directory().add_to_group("team", id);
        }
        let report = bus
            .broadcast("s", ["group:team"], json!(1), SendOptions::default())
            .await;
        assert!(report.is_ok_and(|r| r.strategy == BroadcastStrategy::Batched && r.delivered.len() == 5));
    }

    #[tokio::test]
    async fn test_broadcast_streamed_for_large_payload() {
        let config = BusConfig {
            broadcast: crate::config::BroadcastConfig {
                stream_payload_threshold_bytes: 4,
                ..Default::default()
            },
            ..fast_config()
        };
        let bus = MessageBus::new(config, EventBus::default());
        bus.register_recipient("a", flaky(0));
        let report = bus
            .broadcast("s", ["a"], json!("a large payload"), SendOptions::default())
            .await;
        let Ok(report) = report else {
            panic!("broadcast failed: {report:?}");
        };
        assert_eq!(report.strategy, BroadcastStrategy::Streamed);
        assert_eq!(report.stream_id.as_deref(), Some(DEFAULT_BROADCAST_STREAM));
        assert_eq!(bus.streams().stats(DEFAULT_BROADCAST_STREAM).map(|s| s.buffered), Some(1));
    }

    #[tokio::test]
    async fn test_broadcast_to_nobody_is_validation_error() {
        let bus = bus();
        let result = bus
            .broadcast("s", ["group:empty"], json!(1), SendOptions::default())
            .await;
        assert!(matches!(result, Err(RouterError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_delivers_and_stops() {
        let bus = bus();
        let (handler, mut rx) = ChannelHandler::new(4, Ack::Acknowledged);
        bus.register_recipient("r", Arc::new(handler));
        let (tx, shutdown) = watch::channel(false);
        let handle = bus.spawn_dispatcher(shutdown);
        let _ = bus.send("s", "r", json!("hello"), SendOptions::default());
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(received, Ok(Some(_))));
        let _ = tx.send(true);
        assert!(handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_retires_dead_letters_past_retention() {
        let mut config = fast_config();
        config.idle_wait_ms = 10;
        config.dead_letter.retention_secs = 1;
        let bus = MessageBus::new(config, EventBus::new(64));
        let (tx, shutdown) = watch::channel(false);
        let handle = bus.spawn_dispatcher(shutdown);

        let _ = bus.send("s", "nobody", json!(1), SendOptions::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.dead_letters().len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(bus.dead_letters().is_empty());
        let _ = tx.send(true);
        assert!(handle.await.is_ok());
    }

    /// Holds every delivery for 50ms and counts calls.
    struct Slow {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for Slow {
        async fn handle(&self, _message: &Message) -> Result<Ack, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Ack::Acknowledged)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exactly_once_concurrent_dispatch_delivers_once() {
        let bus = bus();
        let handler = Arc::new(Slow {
            calls: AtomicU32::new(0),
        });
        bus.register_recipient("r", handler.clone());
        let msg = Message::new("s", "r", "t", json!(1)).with_routing(RoutingOptions {
            delivery_mode: DeliveryMode::ExactlyOnce,
            ..RoutingOptions::default()
        });
        assert!(bus.submit(msg.clone()).is_ok());
        assert!(bus.submit(msg).is_ok());

        let first = tokio::spawn({
            let bus = bus.clone();
            async move { bus.process_next().await.map(|(_, o)| o) }
        });
        let second = tokio::spawn({
            let bus = bus.clone();
            async move { bus.process_next().await.map(|(_, o)| o) }
        });
        let mut outcomes = vec![first.await.ok().flatten(), second.await.ok().flatten()];
        outcomes.sort_by_key(|o| matches!(o, Some(DeliveryOutcome::Duplicate { .. })));

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes[0], Some(DeliveryOutcome::Delivered { recipient: "r".into() }));
        assert_eq!(outcomes[1], Some(DeliveryOutcome::Duplicate { recipient: "r".into() }));
        assert_eq!(bus.stats().delivered, 1);
        assert_eq!(bus.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_failed_exactly_once_delivery_releases_claim() {
        let bus = bus();
        bus.register_recipient("r", flaky(3));
        let msg = Message::new("s", "r", "t", json!(1)).with_routing(RoutingOptions {
            delivery_mode: DeliveryMode::ExactlyOnce,
            ..RoutingOptions::default()
        });
        assert!(bus.submit(msg.clone()).is_ok());
        let first = bus.process_next().await.map(|(_, o)| o);
        assert!(matches!(first, Some(DeliveryOutcome::DeadLettered { .. })));

        assert!(bus.submit(msg).is_ok());
        let retry = bus.process_next().await.map(|(_, o)| o);
        assert_eq!(retry, Some(DeliveryOutcome::Delivered { recipient: "r".into() }));
    }
}
