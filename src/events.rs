//! # Router Events
//!
//! A bounded broadcast channel carrying typed [`RouterEvent`]s out of the
//! router and the message bus. Observability and alerting collaborators
//! subscribe and drain at their own pace.
//!
//! ## Guarantees
//! - Publishing never blocks and never fails the caller; with no subscribers
//!   the event is counted and discarded
//! - Slow subscribers lag (oldest events are overwritten) rather than exerting
//!   backpressure on the request path
//! - Events serialize as `{"type": "<snake_case kind>", ...fields}`

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::routing::Capability;

/// Budget accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// One UTC calendar day.
    Daily,
    /// One UTC calendar month.
    Monthly,
}

/// Everything the router and bus report to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterEvent {
    /// A server crossed the consecutive-failure threshold.
    ServerUnhealthy {
        /// Affected server.
        server_id: String,
        /// Failures in a row at the time of the transition.
        consecutive_failures: u32,
    },
    /// An unhealthy server passed a health check.
    ServerRecovered {
        /// Affected server.
        server_id: String,
    },
    /// A request ran out of attempts or hit its deadline.
    RequestFailed {
        /// Request identifier.
        request_id: String,
        /// Requested capability.
        capability: Capability,
        /// Attempts made.
        attempts: u32,
        /// Rendered final error.
        error: String,
    },
    /// A request produced a result.
    RequestCompleted {
        /// Request identifier.
        request_id: String,
        /// Requested capability.
        capability: Capability,
        /// Server that produced the result; `None` for cache hits.
        server_id: Option<String>,
        /// Attempts made (0 for cache hits).
        attempts: u32,
        /// Wall-clock latency of the whole request.
        latency_ms: f64,
    },
    /// A request was answered from the cache.
    CacheHit {
        /// Requested capability.
        capability: Capability,
        /// Cache key that hit.
        key: String,
    },
    /// Daily spend crossed the warning ratio.
    BudgetWarning {
        /// Affected server.
        server_id: String,
        /// Spend in the current day.
        spent: f64,
        /// Configured daily limit.
        limit: f64,
    },
    /// Spend went past a configured limit.
    BudgetExceeded {
        /// Affected server.
        server_id: String,
        /// Which limit was exceeded.
        period: BudgetPeriod,
        /// Spend in the period.
        spent: f64,
        /// Configured limit.
        limit: f64,
    },
    /// A message reached a recipient.
    MessageDelivered {
        /// Message identifier.
        message_id: String,
        /// Recipient that accepted it.
        recipient: String,
    },
    /// A delivery attempt failed.
    MessageError {
        /// Message identifier.
        message_id: String,
        /// Recipient the attempt targeted.
        recipient: String,
        /// Rendered handler error.
        error: String,
    },
    /// A message was moved to the dead-letter queue.
    MessageDeadLettered {
        /// Message identifier.
        message_id: String,
        /// Why it was dead-lettered.
        reason: String,
    },
}

impl RouterEvent {
    /// The snake_case event kind, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerUnhealthy { .. } => "server_unhealthy",
            Self::ServerRecovered { .. } => "server_recovered",
            Self::RequestFailed { .. } => "request_failed",
            Self::RequestCompleted { .. } => "request_completed",
            Self::CacheHit { .. } => "cache_hit",
            Self::BudgetWarning { .. } => "budget_warning",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageError { .. } => "message_error",
            Self::MessageDeadLettered { .. } => "message_dead_lettered",
        }
    }
}

struct EventBusInner {
    tx: broadcast::Sender<RouterEvent>,
    published: AtomicU64,
    unobserved: AtomicU64,
}

/// Cloneable handle onto the event channel. All clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("published", &self.published())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    ///
    /// A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                tx,
                published: AtomicU64::new(0),
                unobserved: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event. Never blocks.
    pub fn publish(&self, event: RouterEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        trace!(kind = event.kind(), "router event");
        if self.inner.tx.send(event).is_err() {
            // No receivers: not an error.
            self.inner.unobserved.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.tx.subscribe()
    }

    /// Total events published.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Events published while nobody was subscribed.
    pub fn unobserved(&self) -> u64 {
        self.inner.unobserved.load(Ordering::Relaxed)
    }

    /// Current number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Drain every event currently buffered for `rx` without waiting.
///
/// Lagged notifications are skipped.
pub fn drain(rx: &mut broadcast::Receiver<RouterEvent>) -> Vec<RouterEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}
