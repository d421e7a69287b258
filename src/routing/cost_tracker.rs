//! Cost tracking and budget enforcement.
//!
//! Every successful execution is debited to its server:
//!
//! ```text
//! cost = base_cost_per_request * (1 + latency_secs * latency_surcharge)
//! ```
//!
//! Entries are kept in a rolling ledger (at least 24 h) from which the daily
//! cost is computed; calendar-month totals and lifetime totals accumulate
//! alongside. Budget alerts are latched so that crossing a threshold raises
//! exactly one event until spend falls back below it.
//!
//! Budgets are advisory unless `enforce_hard_limit` is set, in which case the
//! router excludes over-budget servers from eligibility.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::capability::Capability;
use crate::config::{BudgetConfig, BudgetLimits};
use crate::events::{BudgetPeriod, EventBus, RouterEvent};
use crate::{metrics, RouterError};

fn one_day() -> chrono::Duration {
    chrono::Duration::hours(24)
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    at: DateTime<Utc>,
    server_id: String,
    capability: Capability,
    cost: f64,
}

#[derive(Debug, Default)]
struct ServerTotals {
    month: Option<(i32, u32)>,
    monthly: f64,
    lifetime: f64,
    requests: u64,
}

#[derive(Debug, Default)]
struct AlertLatch {
    warned: bool,
    exceeded: bool,
    exceeded_month: Option<(i32, u32)>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    base_costs: HashMap<String, f64>,
    ledger: VecDeque<LedgerEntry>,
    totals: HashMap<String, ServerTotals>,
    alerts: HashMap<String, AlertLatch>,
}

impl TrackerInner {
    fn daily_cost(&self, server_id: &str, now: DateTime<Utc>) -> f64 {
        let from = now - one_day();
        self.ledger
            .iter()
            .filter(|e| e.server_id == server_id && e.at > from && e.at <= now)
            .map(|e| e.cost)
            .sum()
    }

    fn monthly_cost(&self, server_id: &str, now: DateTime<Utc>) -> f64 {
        self.totals
            .get(server_id)
            .filter(|t| t.month == Some(month_key(now)))
            .map_or(0.0, |t| t.monthly)
    }
}

fn month_key(at: DateTime<Utc>) -> (i32, u32) {
    (at.year(), at.month())
}

/// Where a server stands against its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLevel {
    /// No limit configured, or spend below the warning ratio.
    Ok,
    /// Daily spend at or above the warning ratio.
    Warning,
    /// A daily or monthly limit has been passed.
    Exceeded,
}

/// Result of [`CostTracker::check_budget`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    /// Server id.
    pub server_id: String,
    /// Cost over the last 24 hours.
    pub daily_cost: f64,
    /// Configured daily limit.
    pub daily_limit: Option<f64>,
    /// Cost in the current calendar month.
    pub monthly_cost: f64,
    /// Configured monthly limit.
    pub monthly_limit: Option<f64>,
    /// Overall standing.
    pub level: BudgetLevel,
}

/// Per-server cost totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerCost {
    /// Server id.
    pub server_id: String,
    /// Cost over the last 24 hours.
    pub daily: f64,
    /// Cost in the current calendar month.
    pub monthly: f64,
    /// Cost since the tracker was created.
    pub lifetime: f64,
    /// Requests debited since the tracker was created.
    pub requests: u64,
}

/// Point-in-time cost summary across servers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSnapshot {
    /// One row per server that has a base cost or has been debited, sorted by id.
    pub servers: Vec<ServerCost>,
    /// Sum of lifetime cost across servers.
    pub total_lifetime: f64,
    /// Ledger entries currently retained.
    pub ledger_entries: usize,
}

/// Per-server cost ledger and budget enforcer.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct CostTracker {
    config: BudgetConfig,
    events: EventBus,
    inner: Mutex<TrackerInner>,
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostTracker")
            .field("ledger_entries", &self.inner.lock().ledger.len())
            .finish()
    }
}

impl CostTracker {
    /// Create an empty tracker.
    pub fn new(config: BudgetConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    /// Set the base cost per request for `server_id`.
    pub fn set_base_cost(&self, server_id: &str, cost_per_request: f64) {
        self.inner
            .lock()
            .base_costs
            .insert(server_id.to_string(), cost_per_request.max(0.0));
    }

    /// Cost of one call at `latency` on a server with the given base cost.
    pub fn cost_for(&self, base_cost_per_request: f64, latency: Duration) -> f64 {
        base_cost_per_request * (1.0 + latency.as_secs_f64() * self.config.latency_surcharge)
    }

    /// Whether servers over budget are excluded from eligibility.
    pub fn enforces_hard_limit(&self) -> bool {
        self.config.enforce_hard_limit
    }

    /// Configured limits for a server.
    pub fn limits(&self, server_id: &str) -> Option<BudgetLimits> {
        self.config.limits.get(server_id).copied()
    }

    /// Debit one call and evaluate the server's budget. Returns the cost.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] if no base cost was set for `server_id`.
    pub fn record_usage(
        &self,
        server_id: &str,
        capability: &Capability,
        latency: Duration,
    ) -> Result<f64, RouterError> {
        self.record_usage_at(server_id, capability, latency, Utc::now())
    }

    /// [`record_usage`](Self::record_usage) with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] if no base cost was set for `server_id`.
    pub fn record_usage_at(
        &self,
        server_id: &str,
        capability: &Capability,
        latency: Duration,
        at: DateTime<Utc>,
    ) -> Result<f64, RouterError> {
        let cost = {
            let mut inner = self.inner.lock();
            let base = *inner
                .base_costs
                .get(server_id)
                .ok_or_else(|| RouterError::ServerNotFound(server_id.to_string()))?;
            let cost = self.cost_for(base, latency);

            inner.ledger.push_back(LedgerEntry {
                at,
                server_id: server_id.to_string(),
                capability: capability.clone(),
                cost,
            });
            let retention = chrono::Duration::hours(
                i64::try_from(self.config.retention_hours.max(24)).unwrap_or(24),
            );
            let cutoff = at - retention;
            while inner.ledger.front().is_some_and(|e| e.at < cutoff) {
                inner.ledger.pop_front();
            }

            let totals = inner.totals.entry(server_id.to_string()).or_default();
            let month = month_key(at);
            if totals.month != Some(month) {
                totals.month = Some(month);
                totals.monthly = 0.0;
            }
            totals.monthly += cost;
            totals.lifetime += cost;
            totals.requests += 1;
            cost
        };

        debug!(server_id, capability = %capability, cost, "usage recorded");
        metrics::record_cost(server_id, cost);
        self.evaluate(server_id, at);
        Ok(cost)
    }

    /// Cost over the 24 hours ending now.
    pub fn daily_cost(&self, server_id: &str) -> f64 {
        self.inner.lock().daily_cost(server_id, Utc::now())
    }

    /// Cost over the 24 hours ending at `now`.
    pub fn daily_cost_at(&self, server_id: &str, now: DateTime<Utc>) -> f64 {
        self.inner.lock().daily_cost(server_id, now)
    }

    /// Cost in the current calendar month.
    pub fn monthly_cost(&self, server_id: &str) -> f64 {
        self.inner.lock().monthly_cost(server_id, Utc::now())
    }

    /// Evaluate a server's budget, raising any alert not yet raised.
    pub fn check_budget(&self, server_id: &str) -> BudgetStatus {
        self.evaluate(server_id, Utc::now())
    }

    /// Servers currently over a daily or monthly limit.
    pub fn over_budget_servers(&self) -> Vec<String> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut over: Vec<String> = self
            .config
            .limits
            .iter()
            .filter(|(id, limits)| {
                inner.daily_cost(id, now) > limits.daily_limit
                    || limits
                        .monthly_limit
                        .is_some_and(|m| inner.monthly_cost(id, now) > m)
            })
            .map(|(id, _)| id.clone())
            .collect();
        over.sort();
        over
    }

    /// Err with [`RouterError::BudgetExceeded`] if `server_id` is past its
    /// daily or monthly limit.
    ///
    /// # Errors
    ///
    /// [`RouterError::BudgetExceeded`] naming the first limit that is exceeded.
    pub fn ensure_within_budget(&self, server_id: &str) -> Result<(), RouterError> {
        let Some(limits) = self.limits(server_id) else {
            return Ok(());
        };
        let now = Utc::now();
        let (daily, monthly) = {
            let inner = self.inner.lock();
            (inner.daily_cost(server_id, now), inner.monthly_cost(server_id, now))
        };
        if daily > limits.daily_limit {
            return Err(RouterError::BudgetExceeded {
                server_id: server_id.to_string(),
                spent: daily,
                limit: limits.daily_limit,
            });
        }
        if let Some(limit) = limits.monthly_limit.filter(|m| monthly > *m) {
            return Err(RouterError::BudgetExceeded {
                server_id: server_id.to_string(),
                spent: monthly,
                limit,
            });
        }
        Ok(())
    }

    /// Cost per capability across the retained ledger.
    pub fn capability_costs(&self) -> HashMap<Capability, f64> {
        let mut out = HashMap::new();
        for entry in &self.inner.lock().ledger {
            *out.entry(entry.capability.clone()).or_insert(0.0) += entry.cost;
        }
        out
    }

    /// Per-server totals.
    pub fn snapshot(&self) -> CostSnapshot {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut ids: Vec<&String> = inner.base_costs.keys().chain(inner.totals.keys()).collect();
        ids.sort();
        ids.dedup();
        let servers: Vec<ServerCost> = ids
            .into_iter()
            .map(|id| {
                let totals = inner.totals.get(id);
                ServerCost {
                    server_id: id.clone(),
                    daily: inner.daily_cost(id, now),
                    monthly: inner.monthly_cost(id, now),
                    lifetime: totals.map_or(0.0, |t| t.lifetime),
                    requests: totals.map_or(0, |t| t.requests),
                }
            })
            .collect();
        CostSnapshot {
            total_lifetime: servers.iter().map(|s| s.lifetime).sum(),
            ledger_entries: inner.ledger.len(),
            servers,
        }
    }

    fn evaluate(&self, server_id: &str, now: DateTime<Utc>) -> BudgetStatus {
        let limits = self.limits(server_id);
        let mut events = Vec::new();

        let status = {
            let mut inner = self.inner.lock();
            let daily_cost = inner.daily_cost(server_id, now);
            let monthly_cost = inner.monthly_cost(server_id, now);
            let latch = inner.alerts.entry(server_id.to_string()).or_default();
            let mut level = BudgetLevel::Ok;

            if let Some(limits) = limits {
                let daily_limit = limits.daily_limit;
                if daily_cost > daily_limit {
                    level = BudgetLevel::Exceeded;
                    if !latch.exceeded {
                        events.push(RouterEvent::BudgetExceeded {
                            server_id: server_id.to_string(),
                            period: BudgetPeriod::Daily,
                            spent: daily_cost,
                            limit: daily_limit,
                        });
                    }
                    latch.exceeded = true;
                    latch.warned = true;
                } else if daily_cost >= daily_limit * self.config.warning_ratio {
                    level = BudgetLevel::Warning;
                    if !latch.warned {
                        events.push(RouterEvent::BudgetWarning {
                            server_id: server_id.to_string(),
                            spent: daily_cost,
                            limit: daily_limit,
                        });
                    }
                    latch.warned = true;
                    latch.exceeded = false;
                } else {
                    latch.warned = false;
                    latch.exceeded = false;
                }

                if let Some(monthly_limit) = limits.monthly_limit {
                    if monthly_cost > monthly_limit {
                        level = BudgetLevel::Exceeded;
                        let month = month_key(now);
                        if latch.exceeded_month != Some(month) {
                            latch.exceeded_month = Some(month);
                            events.push(RouterEvent::BudgetExceeded {
                                server_id: server_id.to_string(),
                                period: BudgetPeriod::Monthly,
                                spent: monthly_cost,
                                limit: monthly_limit,
                            });
                        }
                    }
                }
            }

            BudgetStatus {
                server_id: server_id.to_string(),
                daily_cost,
                daily_limit: limits.map(|l| l.daily_limit),
                monthly_cost,
                monthly_limit: limits.and_then(|l| l.monthly_limit),
                level,
            }
        };

        for event in events {
            warn!(server_id, kind = event.kind(), "budget alert");
            self.events.publish(event);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use chrono::TimeZone;

    fn tracker(daily: f64, monthly: Option<f64>) -> (CostTracker, EventBus) {
        let events = EventBus::new(64);
        let mut config = BudgetConfig::default();
        config.limits.insert(
            "a".into(),
            BudgetLimits {
                daily_limit: daily,
                monthly_limit: monthly,
            },
        );
        let tracker = CostTracker::new(config, events.clone());
        tracker.set_base_cost("a", 1.0);
        (tracker, events)
    }

    fn kinds(rx: &mut tokio::sync::broadcast::Receiver<RouterEvent>) -> Vec<&'static str> {
        drain(rx).iter().map(|e| e.kind()).collect()
    }

    #[test]
    fn test_cost_includes_latency_surcharge() {
        let (tracker, _) = tracker(100.0, None);
        let cost = tracker
            .record_usage("a", &Capability::Search, Duration::from_millis(2000))
            .unwrap_or(0.0);
        assert!((cost - 1.2).abs() < 1e-9);
        assert!((tracker.daily_cost("a") - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_server_rejected() {
        let (tracker, _) = tracker(1.0, None);
        assert!(tracker
            .record_usage("ghost", &Capability::Search, Duration::ZERO)
            .is_err());
    }

    #[test]
    fn test_warning_fires_exactly_once_then_exceeded() {
        let (tracker, events) = tracker(10.0, None);
        let mut rx = events.subscribe();
        let cap = Capability::Search;

        for _ in 0..8 {
            let _ = tracker.record_usage("a", &cap, Duration::ZERO);
        }
        assert_eq!(kinds(&mut rx), vec!["budget_warning"]);

        let _ = tracker.record_usage("a", &cap, Duration::ZERO);
        let _ = tracker.check_budget("a");
        assert!(kinds(&mut rx).is_empty());

        let _ = tracker.record_usage("a", &cap, Duration::ZERO);
        assert!(kinds(&mut rx).is_empty(), "exactly at the limit is not exceeded");
        let _ = tracker.record_usage("a", &cap, Duration::ZERO);
        assert_eq!(kinds(&mut rx), vec!["budget_exceeded"]);
        assert_eq!(tracker.check_budget("a").level, BudgetLevel::Exceeded);
        assert!(kinds(&mut rx).is_empty());
    }

    #[test]
    fn test_ledger_is_rolling_24h() {
        let (tracker, _) = tracker(100.0, None);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).single().unwrap_or_default();
        let cap = Capability::Search;
        let _ = tracker.record_usage_at("a", &cap, Duration::ZERO, t0);
        let _ = tracker.record_usage_at("a", &cap, Duration::ZERO, t0 + chrono::Duration::hours(12));
        assert!((tracker.daily_cost_at("a", t0 + chrono::Duration::hours(13)) - 2.0).abs() < 1e-9);
        assert!((tracker.daily_cost_at("a", t0 + chrono::Duration::hours(25)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_old_entries_pruned_past_retention() {
        let (tracker, _) = tracker(100.0, None);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).single().unwrap_or_default();
        let cap = Capability::Search;
        let _ = tracker.record_usage_at("a", &cap, Duration::ZERO, t0);
        let _ = tracker.record_usage_at("a", &cap, Duration::ZERO, t0 + chrono::Duration::hours(30));
        assert_eq!(tracker.snapshot().ledger_entries, 1);
    }

    #[test]
    fn test_monthly_limit_alerts_once_per_month() {
        let (tracker, events) = tracker(1000.0, Some(2.5));
        let mut rx = events.subscribe();
        let cap = Capability::Search;
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap_or_default();
        for day in 0..5 {
            let _ = tracker.record_usage_at("a", &cap, Duration::ZERO, t0 + chrono::Duration::days(day));
        }
        let monthly: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, RouterEvent::BudgetExceeded { period: BudgetPeriod::Monthly, .. }))
            .collect();
        assert_eq!(monthly.len(), 1);
    }

    #[test]
    fn test_ensure_within_budget_and_over_budget_list() {
        let (tracker, _) = tracker(1.5, None);
        let cap = Capability::Search;
        let _ = tracker.record_usage("a", &cap, Duration::ZERO);
        assert!(tracker.ensure_within_budget("a").is_ok());
        let _ = tracker.record_usage("a", &cap, Duration::ZERO);
        assert!(matches!(
            tracker.ensure_within_budget("a"),
            Err(RouterError::BudgetExceeded { .. })
        ));
        assert_eq!(tracker.over_budget_servers(), vec!["a".to_string()]);
    }

    #[test]
    fn test_snapshot_totals() {
        let (tracker, _) = tracker(100.0, None);
        tracker.set_base_cost("b", 0.5);
        let _ = tracker.record_usage("a", &Capability::Search, Duration::ZERO);
        let _ = tracker.record_usage("b", &Capability::Search, Duration::ZERO);
        let snap = tracker.snapshot();
        assert_eq!(snap.servers.len(), 2);
        assert!((snap.total_lifetime - 1.5).abs() < 1e-9);
        assert_eq!(snap.servers[0].requests, 1);
        let by_cap = tracker.capability_costs();
        assert!((by_cap.get(&Capability::Search).copied().unwrap_or(0.0) - 1.5).abs() < 1e-9);
    }
}
