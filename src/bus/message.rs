//! Message model and recipient handlers.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Message priority levels
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Lowest priority, background traffic.
    Low = 0,
    /// Standard priority for most messages.
    #[default]
    Medium = 1,
    /// Elevated priority, drained before `Medium`.
    High = 2,
    /// Drained ahead of everything else.
    Critical = 3,
}

impl Priority {
    /// Lanes in drain order, highest first.
    pub const DRAIN_ORDER: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Lane index, 0 for `Critical` through 3 for `Low`.
    pub(crate) fn lane(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Delivery guarantee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Retried until a handler accepts it or attempts run out.
    #[default]
    AtLeastOnce,
    /// Complete only once the recipient acknowledges it; never delivered
    /// twice to the same recipient.
    ExactlyOnce,
}

/// How a broadcast fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStrategy {
    /// All recipients concurrently.
    Parallel,
    /// Fixed-size concurrent batches, optionally paused between batches.
    Batched,
    /// One recipient at a time, in order.
    Sequential,
    /// Published onto an event stream instead of delivered directly.
    Streamed,
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    /// A registered recipient handler.
    Agent(String),
    /// An event stream.
    Stream(String),
}

impl Recipient {
    /// Recipient or stream id.
    pub fn id(&self) -> &str {
        match self {
            Recipient::Agent(id) | Recipient::Stream(id) => id,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Agent(id) => f.write_str(id),
            Recipient::Stream(id) => write!(f, "stream:{id}"),
        }
    }
}

/// `"stream:<id>"` addresses a stream; anything else a recipient.
impl From<&str> for Recipient {
    fn from(s: &str) -> Self {
        match s.strip_prefix("stream:") {
            Some(stream) => Recipient::Stream(stream.to_string()),
            None => Recipient::Agent(s.to_string()),
        }
    }
}

impl From<String> for Recipient {
    fn from(s: String) -> Self {
        Recipient::from(s.as_str())
    }
}

/// Per-message routing options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingOptions {
    /// Forces a broadcast strategy; chosen by heuristics when `None`.
    pub strategy: Option<BroadcastStrategy>,
    /// Tried in order when the primary recipient cannot take the message.
    pub fallback_recipients: Vec<String>,
    /// Time to live; the bus default applies when `None`.
    pub ttl: Option<Duration>,
    /// Delivery guarantee.
    pub delivery_mode: DeliveryMode,
    /// Broadcast in recipient order.
    pub ordered: bool,
    /// Sequential broadcasts stop at the first failed recipient.
    pub stop_on_error: bool,
    /// Stream used by streamed broadcasts; the bus default stream when `None`.
    pub stream_id: Option<String>,
}

/// Options accepted by `send`, `broadcast` and `publish`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// Queue lane.
    pub priority: Priority,
    /// Application-defined message type, used by stream filters.
    pub message_type: Option<String>,
    /// Routing behaviour.
    pub routing: RoutingOptions,
}

impl SendOptions {
    /// Use lane `priority`.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Tag the message with `message_type`.
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Expire after `ttl`.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.routing.ttl = Some(ttl);
        self
    }

    /// Require acknowledgement.
    pub fn exactly_once(mut self) -> Self {
        self.routing.delivery_mode = DeliveryMode::ExactlyOnce;
        self
    }

    /// Try `recipient` if earlier recipients fail.
    pub fn fallback(mut self, recipient: impl Into<String>) -> Self {
        self.routing.fallback_recipients.push(recipient.into());
        self
    }

    /// Force a broadcast strategy.
    pub fn strategy(mut self, strategy: BroadcastStrategy) -> Self {
        self.routing.strategy = Some(strategy);
        self
    }

    /// Broadcast sequentially, stopping at the first failure if `stop_on_error`.
    pub fn ordered(mut self, stop_on_error: bool) -> Self {
        self.routing.ordered = true;
        self.routing.stop_on_error = stop_on_error;
        self
    }
}

/// One routed unit on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Unique id.
    pub id: String,
    /// Sending component.
    pub sender: String,
    /// Destination.
    pub recipient: Recipient,
    /// Queue lane.
    pub priority: Priority,
    /// Application-defined type, `"message"` unless set.
    pub message_type: String,
    /// Body.
    pub payload: Value,
    /// Routing behaviour.
    pub routing: RoutingOptions,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    created: Instant,
}

impl Message {
    /// New message with a fresh v4 id, stamped now.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<Recipient>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            priority: Priority::default(),
            message_type: message_type.into(),
            payload,
            routing: RoutingOptions::default(),
            timestamp: Utc::now(),
            created: Instant::now(),
        }
    }

    /// Replace the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the lane.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set routing options.
    pub fn with_routing(mut self, routing: RoutingOptions) -> Self {
        self.routing = routing;
        self
    }

    /// Override the creation timestamp (used by time-range filters).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Copy addressed to another recipient, same id.
    pub(crate) fn readdressed(&self, recipient: Recipient) -> Self {
        Self {
            recipient,
            ..self.clone()
        }
    }

    /// Time since the message was created.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Effective ttl: the message's own, else `default_ttl`.
    pub fn ttl(&self, default_ttl: Duration) -> Duration {
        self.routing.ttl.unwrap_or(default_ttl)
    }

    /// Instant after which the message must not be delivered.
    pub fn expires_at(&self, default_ttl: Duration) -> Instant {
        self.created + self.ttl(default_ttl)
    }

    /// Whether `age > ttl`.
    pub fn is_expired(&self, default_ttl: Duration) -> bool {
        self.age() > self.ttl(default_ttl)
    }

    /// Serialized payload size in bytes.
    pub fn payload_bytes(&self) -> usize {
        serde_json::to_vec(&self.payload).map_or(0, |v| v.len())
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────

/// Recipient's answer to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Processed and acknowledged.
    Acknowledged,
    /// Accepted; an explicit `MessageBus::acknowledge` follows later.
    Pending,
}

/// Why a recipient could not take a message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// The recipient refused the message.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The recipient is gone or cannot accept messages right now.
    #[error("recipient unavailable: {0}")]
    Unavailable(String),

    /// The handler did not answer before the message expired.
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// A message recipient.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Take delivery of `message`.
    async fn handle(&self, message: &Message) -> Result<Ack, DeliveryError>;
}

/// Handler that forwards every message into an `mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<Message>,
    ack: Ack,
}

impl ChannelHandler {
    /// Handler answering every delivery with `ack`, plus the receiving end.
    pub fn new(capacity: usize, ack: Ack) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, ack }, rx)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: &Message) -> Result<Ack, DeliveryError> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| DeliveryError::Unavailable("receiver dropped".to_string()))?;
        Ok(self.ack)
    }
}
