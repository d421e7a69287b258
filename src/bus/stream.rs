//! Event Stream Registry
//!
//! Named streams with a bounded buffer each. `publish` appends; a drain step
//! (run periodically by [`StreamRegistry::spawn_drainer`] or on demand)
//! hands buffered messages in batches to every subscription whose filter
//! matches. Messages no subscription matches are dropped from delivery and
//! counted as unmatched.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{DeliveryError, Message, Priority};
use crate::config::StreamSettings;
use crate::events::{EventBus, RouterEvent};
use crate::RouterError;

/// Conjunction of optional filters. An unset filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFilter {
    /// Allowed message types.
    pub types: Option<HashSet<String>>,
    /// Allowed senders.
    pub senders: Option<HashSet<String>>,
    /// Allowed priorities.
    pub priorities: Option<HashSet<Priority>>,
    /// Inclusive timestamp window.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl SubscriptionFilter {
    /// Match-all filter.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only messages of these types.
    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Only messages from these senders.
    pub fn senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.senders = Some(senders.into_iter().map(Into::into).collect());
        self
    }

    /// Only messages with these priorities.
    pub fn priorities(mut self, priorities: impl IntoIterator<Item = Priority>) -> Self {
        self.priorities = Some(priorities.into_iter().collect());
        self
    }

    /// Only messages stamped within `[from, to]`.
    pub fn time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.time_range = Some((from, to));
        self
    }

    /// Whether `message` passes every set filter.
    pub fn matches(&self, message: &Message) -> bool {
        self.types
            .as_ref()
            .map_or(true, |t| t.contains(&message.message_type))
            && self
                .senders
                .as_ref()
                .map_or(true, |s| s.contains(&message.sender))
            && self
                .priorities
                .as_ref()
                .map_or(true, |p| p.contains(&message.priority))
            && self
                .time_range
                .map_or(true, |(from, to)| message.timestamp >= from && message.timestamp <= to)
    }
}

/// Delivery callbacks for one subscription.
#[async_trait]
pub trait StreamSubscriber: Send + Sync {
    /// A matching message was drained from the stream.
    async fn on_message(&self, stream_id: &str, message: &Message) -> Result<(), DeliveryError>;

    /// `on_message` failed for `message_id`.
    async fn on_error(&self, _stream_id: &str, _message_id: &str, _error: &DeliveryError) {}

    /// The stream was terminated.
    async fn on_complete(&self, _stream_id: &str) {}
}

/// What a [`ChannelSubscriber`] forwards.
#[derive(Debug, Clone)]
pub enum StreamNotice {
    /// A delivered message.
    Message(Box<Message>),
    /// The stream was terminated.
    Completed,
}

/// Subscriber that forwards deliveries into an `mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    tx: mpsc::Sender<StreamNotice>,
}

impl ChannelSubscriber {
    /// Subscriber plus its receiving end.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamNotice>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StreamSubscriber for ChannelSubscriber {
    async fn on_message(&self, _stream_id: &str, message: &Message) -> Result<(), DeliveryError> {
        self.tx
            .send(StreamNotice::Message(Box::new(message.clone())))
            .await
            .map_err(|_| DeliveryError::Unavailable("subscriber dropped".to_string()))
    }

    async fn on_complete(&self, _stream_id: &str) {
        let _ = self.tx.send(StreamNotice::Completed).await;
    }
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Subscription {
    /// Subscription id.
    pub id: String,
    /// Stream subscribed to.
    pub stream_id: String,
    /// Subscribing component.
    pub subscriber_id: String,
}

/// Per-stream counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Successful subscriber deliveries.
    pub delivered: u64,
    /// Drained messages no subscription matched.
    pub unmatched: u64,
    /// Messages pushed out of a full buffer before draining.
    pub dropped: u64,
    /// Failed subscriber deliveries.
    pub errors: u64,
    /// Drained messages that had expired.
    pub expired: u64,
    /// Messages currently buffered.
    pub buffered: usize,
    /// Active subscriptions.
    pub subscribers: usize,
}

/// Outcome of one drain pass over a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Messages taken from the buffer.
    pub drained: usize,
    /// Successful subscriber deliveries.
    pub delivered: usize,
    /// Messages no subscription matched.
    pub unmatched: usize,
    /// Failed subscriber deliveries.
    pub errors: usize,
    /// Expired messages skipped.
    pub expired: usize,
}

#[derive(Clone)]
struct SubscriptionEntry {
    handle: Subscription,
    filter: SubscriptionFilter,
    subscriber: Arc<dyn StreamSubscriber>,
}

struct StreamState {
    settings: StreamSettings,
    buffer: VecDeque<Message>,
    subscriptions: Vec<SubscriptionEntry>,
    stats: StreamStats,
}

/// Registry of named streams.
pub struct StreamRegistry {
    streams: DashMap<String, Arc<Mutex<StreamState>>>,
    defaults: StreamSettings,
    default_ttl: Duration,
    events: EventBus,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl StreamRegistry {
    /// Empty registry. `defaults` apply to streams created without settings;
    /// `default_ttl` to messages that carry none.
    pub fn new(defaults: StreamSettings, default_ttl: Duration, events: EventBus) -> Self {
        Self {
            streams: DashMap::new(),
            defaults,
            default_ttl,
            events,
        }
    }

    /// Create `stream_id`, or keep the existing one. Returns whether it was new.
    pub fn create_stream(&self, stream_id: &str, settings: Option<StreamSettings>) -> bool {
        let Entry::Vacant(slot) = self.streams.entry(stream_id.to_string()) else {
            return false;
        };
        let settings = settings.unwrap_or_else(|| self.defaults.clone());
        debug!(stream_id, buffer_size = settings.buffer_size, "stream created");
        slot.insert(Arc::new(Mutex::new(StreamState {
            settings,
            buffer: VecDeque::new(),
            subscriptions: Vec::new(),
            stats: StreamStats::default(),
        })));
        true
    }

    /// Whether `stream_id` exists.
    pub fn exists(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    /// Ids of every stream, sorted.
    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn stream(&self, stream_id: &str) -> Result<Arc<Mutex<StreamState>>, RouterError> {
        self.streams
            .get(stream_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RouterError::StreamNotFound(stream_id.to_string()))
    }

    /// Attach `subscriber` to `stream_id`.
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
        let stream = self.stream(stream_id)?;
        let handle = Subscription {
            id: Uuid::new_v4().to_string(),
            stream_id: stream_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
        };
        stream.lock().subscriptions.push(SubscriptionEntry {
            handle: handle.clone(),
            filter,
            subscriber,
        });
        debug!(stream_id, subscriber_id, subscription_id = %handle.id, "subscribed");
        Ok(handle)
    }

    /// Detach a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let Ok(stream) = self.stream(&subscription.stream_id) else {
            return false;
        };
        let mut state = stream.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.handle.id != subscription.id);
        state.subscriptions.len() < before
    }

    /// Append `message` to the stream's buffer, dropping the oldest message
    /// when the buffer is full.
    ///
    /// # Errors
    ///
    /// [`RouterError::StreamNotFound`] for an unknown stream.
    pub fn publish(&self, stream_id: &str, message: Message) -> Result<(), RouterError> {
        let stream = self.stream(stream_id)?;
        let mut state = stream.lock();
        let capacity = state.settings.buffer_size.max(1);
        while state.buffer.len() >= capacity {
            if let Some(old) = state.buffer.pop_front() {
                state.stats.dropped += 1;
                debug!(stream_id, message_id = %old.id, "stream buffer overflow, oldest dropped");
            }
        }
        state.buffer.push_back(message);
        state.stats.published += 1;
        Ok(())
    }

    /// Deliver everything buffered in `stream_id` to matching subscriptions.
    ///
    /// Messages go out in batches of the stream's effective batch size; within
    /// a batch, deliveries run concurrently. No lock is held while
    /// subscribers run.
    ///
    /// # Errors
    ///
    /// [`RouterError::StreamNotFound`] for an unknown stream.
    pub async fn drain(&self, stream_id: &str) -> Result<DrainReport, RouterError> {
        let stream = self.stream(stream_id)?;
        let (messages, subscriptions, batch_size) = {
            let mut state = stream.lock();
            let messages: Vec<Message> = state.buffer.drain(..).collect();
            (
                messages,
                state.subscriptions.clone(),
                state.settings.effective_batch_size(),
            )
        };

        let mut report = DrainReport {
            drained: messages.len(),
            ..DrainReport::default()
        };

        for batch in messages.chunks(batch_size) {
            let mut deliveries = Vec::new();
            for message in batch {
                if message.is_expired(self.default_ttl) {
                    report.expired += 1;
                    continue;
                }
                let targets: Vec<&SubscriptionEntry> = subscriptions
                    .iter()
                    .filter(|s| s.filter.matches(message))
                    .collect();
                if targets.is_empty() {
                    report.unmatched += 1;
                    continue;
                }
                for target in targets {
                    deliveries.push(self.deliver(stream_id, target, message));
                }
            }
            for ok in join_all(deliveries).await {
                if ok {
                    report.delivered += 1;
                } else {
                    report.errors += 1;
                }
            }
        }

        let mut state = stream.lock();
        state.stats.delivered += report.delivered as u64;
        state.stats.unmatched += report.unmatched as u64;
        state.stats.errors += report.errors as u64;
        state.stats.expired += report.expired as u64;
        Ok(report)
    }

    async fn deliver(&self, stream_id: &str, target: &SubscriptionEntry, message: &Message) -> bool {
        let recipient = format!("{stream_id}/{}", target.handle.subscriber_id);
        match target.subscriber.on_message(stream_id, message).await {
            Ok(()) => {
                self.events.publish(RouterEvent::MessageDelivered {
                    message_id: message.id.clone(),
                    recipient,
                });
                true
            }
            Err(e) => {
                warn!(stream_id, subscriber_id = %target.handle.subscriber_id, error = %e, "stream delivery failed");
                target.subscriber.on_error(stream_id, &message.id, &e).await;
                self.events.publish(RouterEvent::MessageError {
                    message_id: message.id.clone(),
                    recipient,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Drain every stream once.
    pub async fn drain_all(&self) -> DrainReport {
        let mut total = DrainReport::default();
        for stream_id in self.stream_ids() {
            if let Ok(r) = self.drain(&stream_id).await {
                total.drained += r.drained;
                total.delivered += r.delivered;
                total.unmatched += r.unmatched;
                total.errors += r.errors;
                total.expired += r.expired;
            }
        }
        total
    }

    /// Remove `stream_id`, notifying each subscriber via `on_complete`.
    /// Buffered messages are discarded.
    ///
    /// # Errors
    ///
    /// [`RouterError::StreamNotFound`] for an unknown stream.
    pub async fn terminate_stream(&self, stream_id: &str) -> Result<StreamStats, RouterError> {
        let (_, stream) = self
            .streams
            .remove(stream_id)
            .ok_or_else(|| RouterError::StreamNotFound(stream_id.to_string()))?;
        let (subscriptions, stats) = {
            let mut state = stream.lock();
            let subs = std::mem::take(&mut state.subscriptions);
            state.stats.buffered = state.buffer.len();
            state.stats.subscribers = subs.len();
            (subs, state.stats.clone())
        };
        join_all(subscriptions.iter().map(|s| s.subscriber.on_complete(stream_id))).await;
        info!(stream_id, subscribers = subscriptions.len(), "stream terminated");
        Ok(stats)
    }

    /// Counters for `stream_id`.
    pub fn stats(&self, stream_id: &str) -> Option<StreamStats> {
        let stream = self.stream(stream_id).ok()?;
        let state = stream.lock();
        Some(StreamStats {
            buffered: state.buffer.len(),
            subscribers: state.subscriptions.len(),
            ..state.stats.clone()
        })
    }

    /// Run [`drain_all`](Self::drain_all) every `drain_interval_ms` until
    /// `shutdown` becomes `true` or its sender is dropped.
    pub fn spawn_drainer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.defaults.drain_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.drain_all().await;
                        if report.drained > 0 {
                            debug!(drained = report.drained, delivered = report.delivered, "stream drain");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("stream drainer stopped");
        })
    }
}
