//! # tokio-service-router
//!
//! An adaptive service router and priority message bus over Tokio.
//!
//! ## Architecture
//!
//! Request path (`ServiceRouter::execute`):
//! ```text
//! execute(capability, payload)
//!   → CacheManager (hit? return)
//!   → ServerRegistry::eligible → SelectionScorer::select
//!   → FailoverManager (attempt, backoff, failover chain)
//!   → CacheManager::set + CostTracker::record_usage
//! ```
//!
//! Message path (`MessageBus::send`):
//! ```text
//! validate → route → PriorityQueue(critical|high|medium|low) → deliver → acknowledge
//!                                                     ↘ StreamRegistry (fan-out)
//!                                                     ↘ DeadLetterQueue (expired / failed)
//! ```
//!
//! Every component publishes typed [`events::RouterEvent`]s onto a bounded
//! [`events::EventBus`] instead of invoking callbacks.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod bus;
pub mod cache;
pub mod config;
pub mod events;
pub mod metrics;
pub mod routing;

// Re-exports for convenience
pub use backend::{BackendError, EchoBackend, ScriptedBackend, ServiceBackend};
pub use bus::{MessageBus, Priority};
pub use cache::CacheManager;
pub use config::RouterConfig;
pub use events::{EventBus, RouterEvent};
pub use routing::{Capability, ExecuteOptions, ExecutionResult, Requirements, ServiceRouter};

use routing::failover::AttemptRecord;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Config`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Config(format!("tracing init failed: {e}")))
}

/// Top-level router and bus errors.
///
/// Callers always receive either a success payload or one of these variants
/// describing the cause (and, for exhausted requests, the attempt history).
#[derive(Error, Debug)]
pub enum RouterError {
    /// A message or request was malformed. Rejected synchronously, never queued
    /// and never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No server passed the status, capability, rate-limit and load filters.
    #[error("no eligible server for capability '{capability}'")]
    NoEligibleServer {
        /// The capability that could not be served.
        capability: Capability,
    },

    /// A single execution attempt failed. Retried per the failover policy.
    #[error("execution failed on server '{server_id}': {source}")]
    Execution {
        /// Server the attempt ran on.
        server_id: String,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// Every attempt failed or the attempt budget ran out.
    #[error("capability '{capability}' failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        /// Capability that was requested.
        capability: Capability,
        /// Number of attempts made.
        attempts: u32,
        /// Rendered last error.
        last_error: String,
        /// One record per attempt, in order.
        history: Vec<AttemptRecord>,
    },

    /// Spend crossed a configured limit. Advisory unless hard limits are enabled.
    #[error("budget exceeded for server '{server_id}': spent {spent:.4} of {limit:.4}")]
    BudgetExceeded {
        /// Server whose budget was exceeded.
        server_id: String,
        /// Amount spent in the period.
        spent: f64,
        /// Configured limit for the period.
        limit: f64,
    },

    /// An exactly-once message was not acknowledged before its ttl elapsed.
    #[error("message '{message_id}' was not acknowledged before its ttl elapsed")]
    DeliveryTimeout {
        /// The unacknowledged message.
        message_id: String,
    },

    /// Publish or subscribe against a stream that does not exist.
    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    /// Lookup of an unknown server id.
    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// A request outlived its deadline before a result could be returned.
    #[error("request '{request_id}' exceeded its deadline")]
    DeadlineExceeded {
        /// The abandoned request.
        request_id: String,
    },

    /// The message queue is at capacity.
    #[error("message queue full")]
    QueueFull,

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RouterError {
    /// Whether the failover layer may retry after this error.
    ///
    /// Only execution-class failures are transient; validation, not-found and
    /// exhaustion errors are surfaced to the caller as-is.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }
}
