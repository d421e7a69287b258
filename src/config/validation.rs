//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-references
//! between sections).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value

use std::collections::HashSet;

use super::{FallbackTarget, RouterConfig};

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "failover.max_attempts").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn check_ratio(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(invalid(field, value, "must be between 0.0 and 1.0"));
    }
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Servers ──────────────────────────────────────────────────────
    let mut ids = HashSet::new();
    for (i, server) in config.servers.iter().enumerate() {
        let path = format!("servers[{i}]");
        if server.id.trim().is_empty() {
            errors.push(invalid(format!("{path}.id"), "\"\"", "must not be empty"));
        } else if !ids.insert(server.id.as_str()) {
            errors.push(invalid(format!("{path}.id"), &server.id, "duplicate server id"));
        }
        if server.capabilities.is_empty() {
            errors.push(invalid(
                format!("{path}.capabilities"),
                "[]",
                "must list at least one capability",
            ));
        }
        if server.cost_per_request < 0.0 || !server.cost_per_request.is_finite() {
            errors.push(invalid(
                format!("{path}.cost_per_request"),
                server.cost_per_request,
                "must be a non-negative number",
            ));
        }
        if server.rate_limits.max_concurrent == 0 {
            errors.push(invalid(
                format!("{path}.rate_limits.max_concurrent"),
                0,
                "must be at least 1",
            ));
        }
        if server.max_queue_depth == 0 {
            errors.push(invalid(format!("{path}.max_queue_depth"), 0, "must be at least 1"));
        }
    }

    // ── Scoring ──────────────────────────────────────────────────────
    let weights = &config.scoring.weights;
    for (name, w) in [
        ("capability_match", weights.capability_match),
        ("load", weights.load),
        ("response_time", weights.response_time),
        ("cost", weights.cost),
        ("availability", weights.availability),
    ] {
        check_ratio(&mut errors, &format!("scoring.weights.{name}"), w);
    }
    if (weights.total() - 1.0).abs() > 1e-6 {
        errors.push(invalid("scoring.weights", weights.total(), "weights must sum to 1.0"));
    }
    if config.scoring.latency_ceiling_ms <= 0.0 {
        errors.push(invalid(
            "scoring.latency_ceiling_ms",
            config.scoring.latency_ceiling_ms,
            "must be positive",
        ));
    }
    if config.scoring.max_acceptable_cost <= 0.0 {
        errors.push(invalid(
            "scoring.max_acceptable_cost",
            config.scoring.max_acceptable_cost,
            "must be positive",
        ));
    }

    // ── Failover ─────────────────────────────────────────────────────
    if config.failover.max_attempts == 0 {
        errors.push(invalid("failover.max_attempts", 0, "must be at least 1"));
    }
    if config.failover.base_delay_ms > config.failover.max_delay_ms {
        errors.push(invalid(
            "failover.base_delay_ms",
            config.failover.base_delay_ms,
            "must be \u{2264} max_delay_ms",
        ));
    }
    if config.failover.attempt_timeout_ms == 0 {
        errors.push(invalid("failover.attempt_timeout_ms", 0, "must be positive"));
    }
    for (capability, chain) in &config.failover.chains {
        for target in chain {
            if let FallbackTarget::Server(id) = target {
                if !ids.contains(id.as_str()) {
                    errors.push(invalid(
                        format!("failover.chains.{capability}"),
                        id,
                        "references an unknown server",
                    ));
                }
            }
        }
    }

    // ── Health ───────────────────────────────────────────────────────
    if config.health.failure_threshold == 0 {
        errors.push(invalid("health.failure_threshold", 0, "must be at least 1"));
    }
    check_ratio(&mut errors, "health.success_step", config.health.success_step);
    check_ratio(&mut errors, "health.failure_step", config.health.failure_step);
    check_ratio(&mut errors, "health.degraded_threshold", config.health.degraded_threshold);
    check_ratio(&mut errors, "health.max_load", config.health.max_load);
    if config.health.response_window == 0 {
        errors.push(invalid("health.response_window", 0, "must be at least 1"));
    }

    // ── Budget ───────────────────────────────────────────────────────
    check_ratio(&mut errors, "budget.warning_ratio", config.budget.warning_ratio);
    if config.budget.retention_hours < 24 {
        errors.push(invalid(
            "budget.retention_hours",
            config.budget.retention_hours,
            "must retain at least 24 hours for daily cost",
        ));
    }
    for (server, limits) in &config.budget.limits {
        if !ids.contains(server.as_str()) {
            errors.push(invalid(
                format!("budget.limits.{server}"),
                server,
                "references an unknown server",
            ));
        }
        if limits.daily_limit <= 0.0 {
            errors.push(invalid(
                format!("budget.limits.{server}.daily_limit"),
                limits.daily_limit,
                "must be positive",
            ));
        }
    }

    // ── Bus ──────────────────────────────────────────────────────────
    if config.bus.queue_capacity == 0 {
        errors.push(invalid("bus.queue_capacity", 0, "must be at least 1"));
    }
    if config.bus.delivery_attempts == 0 {
        errors.push(invalid("bus.delivery_attempts", 0, "must be at least 1"));
    }
    if config.bus.broadcast.batch_size == 0 {
        errors.push(invalid("bus.broadcast.batch_size", 0, "must be at least 1"));
    }
    if config.bus.streams.buffer_size == 0 {
        errors.push(invalid("bus.streams.buffer_size", 0, "must be at least 1"));
    }
    if config.events.channel_capacity == 0 {
        errors.push(invalid("events.channel_capacity", 0, "must be at least 1"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
