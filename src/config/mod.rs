//! # Router Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML configuration that an external loader hands
//! to the router: server definitions, scoring weights, failover chains,
//! cache policies, budget limits, and message-bus tuning.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Defaulted: every tunable has a documented default, so a config may list
//!   only its servers
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Hot reload (servers change only when a new config is loaded)
//! - Building runtime components (that belongs to `routing` and `bus`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::routing::Capability;

// ── Default value functions ──────────────────────────────────────────────

fn default_max_concurrent() -> u32 {
    10
}

fn default_max_queue_depth() -> u32 {
    100
}

fn default_weight_capability() -> f64 {
    0.35
}

fn default_weight_load() -> f64 {
    0.25
}

fn default_weight_response_time() -> f64 {
    0.20
}

fn default_weight_cost() -> f64 {
    0.15
}

fn default_weight_availability() -> f64 {
    0.05
}

/// Mean response time at which the latency score bottoms out.
fn default_latency_ceiling_ms() -> f64 {
    5000.0
}

fn default_max_acceptable_cost() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_step() -> f64 {
    0.1
}

fn default_failure_step() -> f64 {
    0.2
}

fn default_degraded_threshold() -> f64 {
    0.5
}

fn default_max_load() -> f64 {
    0.9
}

fn default_response_window() -> usize {
    100
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_warning_ratio() -> f64 {
    0.8
}

fn default_latency_surcharge() -> f64 {
    0.1
}

fn default_retention_hours() -> u64 {
    24
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_delivery_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    10
}

fn default_message_ttl_ms() -> u64 {
    60_000
}

fn default_idle_wait_ms() -> u64 {
    100
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_dedupe_window() -> usize {
    10_000
}

fn default_parallel_max_recipients() -> usize {
    20
}

fn default_broadcast_batch_size() -> usize {
    10
}

fn default_stream_payload_threshold_bytes() -> usize {
    64 * 1024
}

fn default_dead_letter_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_dead_letter_max_entries() -> usize {
    10_000
}

fn default_stream_buffer_size() -> usize {
    1000
}

fn default_stream_batch_size() -> usize {
    10
}

fn default_drain_interval_ms() -> u64 {
    100
}

fn default_event_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// # Example
///
/// ```toml
/// [[servers]]
/// id = "search-primary"
/// capabilities = ["search", "data_retrieval"]
/// cost_per_request = 0.01
///
/// [servers.rate_limits]
/// requests_per_minute = 600
/// max_concurrent = 20
///
/// [failover.chains]
/// search = [{ server = "search-backup" }, { capability = "data_retrieval" }]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterConfig {
    /// Backend server definitions, in registration order.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Selection scoring weights and normalisation ceilings.
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Retry, backoff and failover chains.
    #[serde(default)]
    pub failover: FailoverConfig,
    /// Health accounting and eligibility thresholds.
    #[serde(default)]
    pub health: HealthConfig,
    /// Response cache policy.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Per-server budgets and cost model.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Message pipeline, streams and dead-letter queue.
    #[serde(default)]
    pub bus: BusConfig,
    /// Outbound event channel.
    #[serde(default)]
    pub events: EventsConfig,
}

// ── Servers ──────────────────────────────────────────────────────────────

/// One backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerConfig {
    /// Unique server identifier.
    pub id: String,
    /// Capabilities this server advertises.
    pub capabilities: Vec<Capability>,
    /// Base cost charged per request.
    #[serde(default)]
    pub cost_per_request: f64,
    /// Request rate and concurrency limits.
    #[serde(default)]
    pub rate_limits: RateLimits,
    /// Queue depth treated as 100% load.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: u32,
    /// Start `initializing` and wait for a successful health check before
    /// taking traffic.
    #[serde(default)]
    pub warm_up: bool,
}

impl ServerConfig {
    /// Minimal server definition with default limits.
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            cost_per_request: 0.0,
            rate_limits: RateLimits::default(),
            max_queue_depth: default_max_queue_depth(),
            warm_up: false,
        }
    }

    /// Set the base cost per request.
    pub fn with_cost(mut self, cost_per_request: f64) -> Self {
        self.cost_per_request = cost_per_request;
        self
    }

    /// Set rate and concurrency limits.
    pub fn with_rate_limits(mut self, rate_limits: RateLimits) -> Self {
        self.rate_limits = rate_limits;
        self
    }
}

/// Request rate and concurrency limits. A rate of `0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RateLimits {
    /// Requests allowed per rolling minute window.
    #[serde(default)]
    pub requests_per_minute: u32,
    /// Requests allowed per rolling hour window.
    #[serde(default)]
    pub requests_per_hour: u32,
    /// In-flight requests treated as 100% load.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 0,
            requests_per_hour: 0,
            max_concurrent: default_max_concurrent(),
        }
    }
}

// ── Scoring ──────────────────────────────────────────────────────────────

/// Selection scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScoringConfig {
    /// Component weights; must sum to 1.0.
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Mean response time (ms) that scores zero on the latency component.
    #[serde(default = "default_latency_ceiling_ms")]
    pub latency_ceiling_ms: f64,
    /// Cost per request that scores zero on the cost component.
    #[serde(default = "default_max_acceptable_cost")]
    pub max_acceptable_cost: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            latency_ceiling_ms: default_latency_ceiling_ms(),
            max_acceptable_cost: default_max_acceptable_cost(),
        }
    }
}

/// Weighted score components.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScoreWeights {
    /// Weight of the capability-match component.
    #[serde(default = "default_weight_capability")]
    pub capability_match: f64,
    /// Weight of the inverse current-load component.
    #[serde(default = "default_weight_load")]
    pub load: f64,
    /// Weight of the inverse mean-response-time component.
    #[serde(default = "default_weight_response_time")]
    pub response_time: f64,
    /// Weight of the cost-efficiency component.
    #[serde(default = "default_weight_cost")]
    pub cost: f64,
    /// Weight of the availability-score component.
    #[serde(default = "default_weight_availability")]
    pub availability: f64,
}

impl ScoreWeights {
    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.capability_match + self.load + self.response_time + self.cost + self.availability
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capability_match: default_weight_capability(),
            load: default_weight_load(),
            response_time: default_weight_response_time(),
            cost: default_weight_cost(),
            availability: default_weight_availability(),
        }
    }
}

// ── Failover ─────────────────────────────────────────────────────────────

/// Retry and failover configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FailoverConfig {
    /// Maximum execution attempts per request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff base: the delay after attempt `n` (0-based) is `2^n * base`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Timeout applied to each backend call.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Default overall deadline when the caller does not set one.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Ordered substitutes per capability.
    #[serde(default)]
    pub chains: HashMap<Capability, Vec<FallbackTarget>>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            chains: HashMap::new(),
        }
    }
}

/// One entry in a failover chain.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTarget {
    /// Try this specific server next.
    Server(String),
    /// Try the best eligible server for a substitute capability.
    Capability(Capability),
}

// ── Health ───────────────────────────────────────────────────────────────

/// Health accounting and eligibility thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HealthConfig {
    /// Period of the background health-check tick.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Timeout applied to each probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive failures that mark a server unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Availability score gained per success (clamped at 1.0).
    #[serde(default = "default_success_step")]
    pub success_step: f64,
    /// Availability score lost per failure (clamped at 0.0).
    #[serde(default = "default_failure_step")]
    pub failure_step: f64,
    /// Availability score below which a server is `degraded`.
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f64,
    /// Load above which a server is not eligible.
    #[serde(default = "default_max_load")]
    pub max_load: f64,
    /// Response-time samples retained per server.
    #[serde(default = "default_response_window")]
    pub response_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            success_step: default_success_step(),
            failure_step: default_failure_step(),
            degraded_threshold: default_degraded_threshold(),
            max_load: default_max_load(),
            response_window: default_response_window(),
        }
    }
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheConfig {
    /// Master switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum cached entries.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Per-capability overrides of the built-in TTL table.
    #[serde(default)]
    pub policies: HashMap<Capability, CachePolicy>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            policies: HashMap::new(),
        }
    }
}

/// Cache policy for one capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CachePolicy {
    /// Entry lifetime in seconds; `0` disables caching.
    pub ttl_secs: u64,
    /// Whether this capability may be cached at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ── Budget ───────────────────────────────────────────────────────────────

/// Budget limits and cost model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BudgetConfig {
    /// Fraction of the daily limit that raises a warning.
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
    /// Cost multiplier per second of latency.
    #[serde(default = "default_latency_surcharge")]
    pub latency_surcharge: f64,
    /// How long individual ledger entries are kept.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Exclude servers over their daily limit from eligibility.
    #[serde(default)]
    pub enforce_hard_limit: bool,
    /// Limits keyed by server id.
    #[serde(default)]
    pub limits: HashMap<String, BudgetLimits>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warning_ratio: default_warning_ratio(),
            latency_surcharge: default_latency_surcharge(),
            retention_hours: default_retention_hours(),
            enforce_hard_limit: false,
            limits: HashMap::new(),
        }
    }
}

/// Spend limits for one server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BudgetLimits {
    /// Limit for one calendar day (UTC).
    pub daily_limit: f64,
    /// Limit for one calendar month (UTC), if any.
    #[serde(default)]
    pub monthly_limit: Option<f64>,
}

// ── Message bus ──────────────────────────────────────────────────────────

/// Message pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BusConfig {
    /// Total messages held across all priority lanes.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Delivery attempts per recipient for `at_least_once` messages.
    #[serde(default = "default_delivery_attempts")]
    pub delivery_attempts: u32,
    /// Pause between delivery attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// TTL applied when the sender does not set one.
    #[serde(default = "default_message_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Dispatcher wait when the queue is empty.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    /// Serialized payloads larger than this are rejected.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Delivered message ids remembered per recipient for exactly-once.
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,
    /// Broadcast strategy thresholds.
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Dead-letter retention.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    /// Defaults for newly created streams.
    #[serde(default)]
    pub streams: StreamSettings,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            delivery_attempts: default_delivery_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            default_ttl_ms: default_message_ttl_ms(),
            idle_wait_ms: default_idle_wait_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            dedupe_window: default_dedupe_window(),
            broadcast: BroadcastConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            streams: StreamSettings::default(),
        }
    }
}

/// Broadcast strategy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BroadcastConfig {
    /// Largest recipient count delivered in one parallel fan-out.
    #[serde(default = "default_parallel_max_recipients")]
    pub parallel_max_recipients: usize,
    /// Recipients per batch for batched delivery.
    #[serde(default = "default_broadcast_batch_size")]
    pub batch_size: usize,
    /// Pause between batches.
    #[serde(default)]
    pub batch_delay_ms: u64,
    /// Payloads larger than this are streamed instead of delivered directly.
    #[serde(default = "default_stream_payload_threshold_bytes")]
    pub stream_payload_threshold_bytes: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            parallel_max_recipients: default_parallel_max_recipients(),
            batch_size: default_broadcast_batch_size(),
            batch_delay_ms: 0,
            stream_payload_threshold_bytes: default_stream_payload_threshold_bytes(),
        }
    }
}

/// Dead-letter retention.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DeadLetterConfig {
    /// Entries older than this are removed by cleanup.
    #[serde(default = "default_dead_letter_retention_secs")]
    pub retention_secs: u64,
    /// Oldest entries are dropped beyond this count.
    #[serde(default = "default_dead_letter_max_entries")]
    pub max_entries: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_dead_letter_retention_secs(),
            max_entries: default_dead_letter_max_entries(),
        }
    }
}

/// Event stream settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StreamSettings {
    /// Buffered messages per stream; the oldest is dropped on overflow.
    #[serde(default = "default_stream_buffer_size")]
    pub buffer_size: usize,
    /// Deliver buffered messages to subscribers in batches.
    #[serde(default = "default_true")]
    pub batch_processing: bool,
    /// Batch size when `batch_processing` is on.
    #[serde(default = "default_stream_batch_size")]
    pub batch_size: usize,
    /// Period of the background drain step.
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
}

impl StreamSettings {
    /// Effective delivery batch size.
    pub fn effective_batch_size(&self) -> usize {
        if self.batch_processing {
            self.batch_size.max(1)
        } else {
            1
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_stream_buffer_size(),
            batch_processing: true,
            batch_size: default_stream_batch_size(),
            drain_interval_ms: default_drain_interval_ms(),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// Outbound event channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EventsConfig {
    /// Events buffered per subscriber before slow consumers start lagging.
    #[serde(default = "default_event_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_event_capacity(),
        }
    }
}

/// Export the JSON Schema for [`RouterConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RouterConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!((ScoreWeights::default().total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_thresholds_match_documented_values() {
        let health = HealthConfig::default();
        assert_eq!(health.failure_threshold, 3);
        assert!((health.max_load - 0.9).abs() < f64::EPSILON);
        assert_eq!(health.response_window, 100);
        assert!((BudgetConfig::default().warning_ratio - 0.8).abs() < f64::EPSILON);
        assert_eq!(BroadcastConfig::default().parallel_max_recipients, 20);
        assert_eq!(StreamSettings::default().buffer_size, 1000);
        assert_eq!(FailoverConfig::default().max_attempts, 3);
    }

    #[test]
    fn test_effective_batch_size_is_one_without_batching() {
        let settings = StreamSettings {
            batch_processing: false,
            ..StreamSettings::default()
        };
        assert_eq!(settings.effective_batch_size(), 1);
        assert_eq!(StreamSettings::default().effective_batch_size(), 10);
    }

    #[test]
    fn test_fallback_target_serializes_as_tagged_table() {
        let json = serde_json::to_string(&FallbackTarget::Server("b".into())).unwrap_or_default();
        assert_eq!(json, r#"{"server":"b"}"#);
        let back: Result<FallbackTarget, _> = serde_json::from_str(r#"{"capability":"search"}"#);
        assert_eq!(back.ok(), Some(FallbackTarget::Capability(Capability::Search)));
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().unwrap_or_default();
        let parsed: Result<serde_json::Value, _> = serde_json::from_str(&schema);
        assert!(parsed.is_ok());
    }
}
