//! Prometheus metrics for the router and message bus.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `record_cost`, …) are no-ops if `init_metrics` was never
//! called, so the router is always safe to run and observability simply
//! degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `router_requests_total` | Counter | `capability`, `outcome` |
//! | `router_request_duration_seconds` | Histogram | `capability` |
//! | `router_attempts_total` | Counter | `server`, `outcome` |
//! | `router_cache_lookups_total` | Counter | `result` |
//! | `router_cost_total` | Counter | `server` |
//! | `router_server_availability` | Gauge | `server` |
//! | `bus_messages_total` | Counter | `outcome` |
//! | `bus_queue_depth` | Gauge | `lane` |
//! | `bus_dead_letters_total` | Counter | `reason` |

use crate::RouterError;
use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the router, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Requests by capability and terminal outcome.
    pub requests_total: CounterVec,
    /// End-to-end request latency.
    pub request_duration: HistogramVec,
    /// Execution attempts by server and outcome.
    pub attempts_total: CounterVec,
    /// Cache lookups by result (`hit` / `miss`).
    pub cache_lookups: CounterVec,
    /// Accumulated cost per server.
    pub cost_total: CounterVec,
    /// Latest availability score per server.
    pub server_availability: GaugeVec,
    /// Bus messages by outcome.
    pub bus_messages: CounterVec,
    /// Queue depth per priority lane.
    pub bus_queue_depth: IntGaugeVec,
    /// Dead-lettered messages by reason.
    pub dead_letters: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: Result<C, prometheus::Error>) -> Result<C, RouterError>
where
    C: Collector + Clone + 'static,
{
    let collector =
        collector.map_err(|e| RouterError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| RouterError::Config(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build(registry: Registry, prefix: &str) -> Result<Metrics, RouterError> {
    let name = |n: &str| format!("{prefix}{n}");

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("router_requests_total"), "Requests by capability and outcome"),
            &["capability", "outcome"],
        ),
    )?;
    let request_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                name("router_request_duration_seconds"),
                "End-to-end request latency",
            ),
            &["capability"],
        ),
    )?;
    let attempts_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("router_attempts_total"), "Execution attempts by server and outcome"),
            &["server", "outcome"],
        ),
    )?;
    let cache_lookups = register(
        &registry,
        CounterVec::new(
            Opts::new(name("router_cache_lookups_total"), "Cache lookups by result"),
            &["result"],
        ),
    )?;
    let cost_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("router_cost_total"), "Accumulated cost per server"),
            &["server"],
        ),
    )?;
    let server_availability = register(
        &registry,
        GaugeVec::new(
            Opts::new(name("router_server_availability"), "Availability score per server"),
            &["server"],
        ),
    )?;
    let bus_messages = register(
        &registry,
        CounterVec::new(
            Opts::new(name("bus_messages_total"), "Bus messages by outcome"),
            &["outcome"],
        ),
    )?;
    let bus_queue_depth = register(
        &registry,
        IntGaugeVec::new(
            Opts::new(name("bus_queue_depth"), "Queued messages per priority lane"),
            &["lane"],
        ),
    )?;
    let dead_letters = register(
        &registry,
        CounterVec::new(
            Opts::new(name("bus_dead_letters_total"), "Dead-lettered messages by reason"),
            &["reason"],
        ),
    )?;

    Ok(Metrics {
        registry,
        requests_total,
        request_duration,
        attempts_total,
        cache_lookups,
        cost_total,
        server_availability,
        bus_messages,
        bus_queue_depth,
        dead_letters,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`RouterError::Config`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), RouterError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = build(Registry::new(), "")?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(metrics);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a finished request and record its latency.
///
/// No-op if metrics have not been initialised.
pub fn inc_request(capability: &str, outcome: &str, elapsed: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .requests_total
            .get_metric_with_label_values(&[capability, outcome])
        {
            c.inc();
        }
        if let Ok(h) = m.request_duration.get_metric_with_label_values(&[capability]) {
            h.observe(elapsed.as_secs_f64());
        }
    }
}

/// Count one execution attempt.
///
/// No-op if metrics have not been initialised.
pub fn inc_attempt(server: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.attempts_total.get_metric_with_label_values(&[server, outcome]) {
            c.inc();
        }
    }
}

/// Count one cache lookup.
pub fn inc_cache_lookup(hit: bool) {
    if let Some(m) = metrics() {
        let result = if hit { "hit" } else { "miss" };
        if let Ok(c) = m.cache_lookups.get_metric_with_label_values(&[result]) {
            c.inc();
        }
    }
}

/// Add `cost` to a server's accumulated cost. Negative values are ignored.
pub fn record_cost(server: &str, cost: f64) {
    if cost <= 0.0 {
        return;
    }
    if let Some(m) = metrics() {
        if let Ok(c) = m.cost_total.get_metric_with_label_values(&[server]) {
            c.inc_by(cost);
        }
    }
}

/// Publish a server's current availability score.
pub fn set_availability(server: &str, score: f64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.server_availability.get_metric_with_label_values(&[server]) {
            g.set(score);
        }
    }
}

/// Count a bus message outcome (`sent`, `delivered`, `failed`, `rejected`, ...).
pub fn inc_bus_message(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.bus_messages.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Set the depth gauge for one priority lane.
pub fn set_queue_depth(lane: &str, depth: usize) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.bus_queue_depth.get_metric_with_label_values(&[lane]) {
            g.set(i64::try_from(depth).unwrap_or(i64::MAX));
        }
    }
}

/// Count a dead-lettered message.
pub fn inc_dead_letter(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.dead_letters.get_metric_with_label_values(&[reason]) {
            c.inc();
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of key counters.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Request counts keyed by `"capability:outcome"`.
    pub requests_total: HashMap<String, u64>,
    /// Bus message counts keyed by outcome.
    pub bus_messages: HashMap<String, u64>,
    /// Dead-letter counts keyed by reason.
    pub dead_letters: HashMap<String, u64>,
}

fn collect_counts(collector: &CounterVec, labels: &[&str]) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in collector.collect() {
        for metric in family.get_metric() {
            let key = labels
                .iter()
                .map(|name| {
                    metric
                        .get_label()
                        .iter()
                        .find(|l| l.get_name() == *name)
                        .map_or("unknown", |l| l.get_value())
                })
                .collect::<Vec<_>>()
                .join(":");
            out.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    out
}

/// Return a structured summary of current counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        requests_total: collect_counts(&m.requests_total, &["capability", "outcome"]),
        bus_messages: collect_counts(&m.bus_messages, &["outcome"]),
        dead_letters: collect_counts(&m.dead_letters, &["reason"]),
    }
}
