//! # Server Pool Registry
//!
//! ## Responsibility
//! Own the runtime state of every backend server: status, health accounting,
//! response-time samples, in-flight load and rate-limit windows. Answer
//! "which servers may take this request right now?".
//!
//! ## Guarantees
//! - Sole mutator: all metric and health updates go through this type
//! - Snapshots: readers get owned [`ServerSnapshot`] copies, never references
//!   into locked state
//! - `availability_score` stays within `[0.0, 1.0]`
//! - A server becomes `unhealthy` only after `failure_threshold` consecutive
//!   failures and leaves it only through a successful health check
//!
//! ## NOT Responsible For
//! - Ranking eligible servers (see `scorer`)
//! - Probing servers (see `health`)
//! - Budget gating (the router excludes over-budget servers via constraints)

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::capability::{Capability, Requirements};
use crate::config::{HealthConfig, ServerConfig};
use crate::events::{EventBus, RouterEvent};
use crate::{metrics, RouterError};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Lifecycle status of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Registered with warm-up; waiting for its first successful health check.
    Initializing,
    /// Taking traffic.
    Active,
    /// Availability score fell below the degraded threshold.
    Degraded,
    /// Tripped by consecutive failures.
    Unhealthy,
}

/// Fixed window counter that resets when its window rolls over.
#[derive(Debug)]
struct RateWindow {
    length: Duration,
    started: Instant,
    count: u32,
}

impl RateWindow {
    fn new(length: Duration) -> Self {
        Self {
            length,
            started: Instant::now(),
            count: 0,
        }
    }

    fn current(&self, now: Instant) -> u32 {
        if now.duration_since(self.started) >= self.length {
            0
        } else {
            self.count
        }
    }

    fn record(&mut self, now: Instant) {
        if now.duration_since(self.started) >= self.length {
            self.started = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
    }

    fn exhausted(&self, limit: u32, now: Instant) -> bool {
        limit > 0 && self.current(now) >= limit
    }
}

#[derive(Debug)]
struct ServerState {
    config: ServerConfig,
    capabilities: HashSet<Capability>,
    status: ServerStatus,
    response_times: VecDeque<f64>,
    success_count: u64,
    error_count: u64,
    active_requests: u32,
    queue_depth: u32,
    last_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    availability_score: f64,
    minute: RateWindow,
    hour: RateWindow,
}

impl ServerState {
    fn current_load(&self) -> f64 {
        let concurrency =
            f64::from(self.active_requests) / f64::from(self.config.rate_limits.max_concurrent.max(1));
        let queue = f64::from(self.queue_depth) / f64::from(self.config.max_queue_depth.max(1));
        concurrency.max(queue).clamp(0.0, 1.0)
    }

    fn mean_response_ms(&self) -> Option<f64> {
        if self.response_times.is_empty() {
            return None;
        }
        Some(self.response_times.iter().sum::<f64>() / self.response_times.len() as f64)
    }

    fn rate_limited(&self, now: Instant) -> bool {
        let limits = &self.config.rate_limits;
        self.minute.exhausted(limits.requests_per_minute, now)
            || self.hour.exhausted(limits.requests_per_hour, now)
    }

    fn snapshot(&self, order: usize, now: Instant) -> ServerSnapshot {
        ServerSnapshot {
            id: self.config.id.clone(),
            registration_order: order,
            capabilities: self.capabilities.clone(),
            status: self.status,
            cost_per_request: self.config.cost_per_request,
            current_load: self.current_load(),
            active_requests: self.active_requests,
            queue_depth: self.queue_depth,
            mean_response_ms: self.mean_response_ms(),
            success_count: self.success_count,
            error_count: self.error_count,
            availability_score: self.availability_score,
            consecutive_failures: self.consecutive_failures,
            last_check: self.last_check,
            requests_this_minute: self.minute.current(now),
            requests_this_hour: self.hour.current(now),
            rate_limited: self.rate_limited(now),
        }
    }
}

/// Point-in-time copy of one server's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSnapshot {
    /// Server id.
    pub id: String,
    /// Position in registration order (tie-breaker for scoring).
    pub registration_order: usize,
    /// Advertised capabilities.
    pub capabilities: HashSet<Capability>,
    /// Lifecycle status.
    pub status: ServerStatus,
    /// Base cost per request.
    pub cost_per_request: f64,
    /// `max(active/max_concurrent, queue_depth/max_queue_depth)`, in `[0, 1]`.
    pub current_load: f64,
    /// Requests currently executing.
    pub active_requests: u32,
    /// Externally reported queue depth.
    pub queue_depth: u32,
    /// Mean of the retained response-time samples; `None` before the first.
    pub mean_response_ms: Option<f64>,
    /// Successful outcomes.
    pub success_count: u64,
    /// Failed outcomes.
    pub error_count: u64,
    /// Health score in `[0, 1]`.
    pub availability_score: f64,
    /// Failures in a row.
    pub consecutive_failures: u32,
    /// Time of the last health check.
    pub last_check: Option<DateTime<Utc>>,
    /// Requests started in the current minute window.
    pub requests_this_minute: u32,
    /// Requests started in the current hour window.
    pub requests_this_hour: u32,
    /// Whether a rate-limit window is exhausted.
    pub rate_limited: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    servers: Vec<ServerState>,
    index: HashMap<String, usize>,
}

impl RegistryInner {
    fn get_mut(&mut self, server_id: &str) -> Result<&mut ServerState, RouterError> {
        let idx = *self
            .index
            .get(server_id)
            .ok_or_else(|| RouterError::ServerNotFound(server_id.to_string()))?;
        self.servers
            .get_mut(idx)
            .ok_or_else(|| RouterError::ServerNotFound(server_id.to_string()))
    }
}

/// Registry of backend servers and their live state.
pub struct ServerRegistry {
    config: HealthConfig,
    events: EventBus,
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.len())
            .finish()
    }
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new(config: HealthConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Add a server.
    ///
    /// Servers with `warm_up` start `initializing`; all others are `active`.
    ///
    /// # Errors
    ///
    /// [`RouterError::Validation`] for an empty or duplicate id or an empty
    /// capability list.
    pub fn register(&self, config: ServerConfig) -> Result<(), RouterError> {
        if config.id.trim().is_empty() {
            return Err(RouterError::Validation("server id must not be empty".into()));
        }
        if config.capabilities.is_empty() {
            return Err(RouterError::Validation(format!(
                "server '{}' advertises no capabilities",
                config.id
            )));
        }

        let mut inner = self.inner.write();
        if inner.index.contains_key(&config.id) {
            return Err(RouterError::Validation(format!(
                "server '{}' already registered",
                config.id
            )));
        }

        let status = if config.warm_up {
            ServerStatus::Initializing
        } else {
            ServerStatus::Active
        };
        info!(server_id = %config.id, ?status, "server registered");
        metrics::set_availability(&config.id, 1.0);

        let idx = inner.servers.len();
        inner.index.insert(config.id.clone(), idx);
        inner.servers.push(ServerState {
            capabilities: config.capabilities.iter().cloned().collect(),
            config,
            status,
            response_times: VecDeque::with_capacity(self.config.response_window),
            success_count: 0,
            error_count: 0,
            active_requests: 0,
            queue_depth: 0,
            last_check: None,
            consecutive_failures: 0,
            availability_score: 1.0,
            minute: RateWindow::new(MINUTE),
            hour: RateWindow::new(HOUR),
        });
        Ok(())
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.inner.read().servers.len()
    }

    /// True when no servers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Server ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .read()
            .servers
            .iter()
            .map(|s| s.config.id.clone())
            .collect()
    }

    /// Servers that may take a request with `requirements`, in registration
    /// order.
    ///
    /// A server is eligible when it is `active`, advertises every required
    /// capability, has no exhausted rate window, has load at or below
    /// `max_load`, and passes every constraint filter.
    pub fn get_eligible(&self, requirements: &Requirements) -> Vec<ServerSnapshot> {
        let now = Instant::now();
        let constraints = &requirements.constraints;
        let inner = self.inner.read();
        inner
            .servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == ServerStatus::Active)
            .filter(|(_, s)| requirements.is_satisfied_by(&s.capabilities))
            .filter(|(_, s)| !s.rate_limited(now))
            .filter(|(_, s)| s.current_load() <= self.config.max_load)
            .filter(|(_, s)| !constraints.excluded.contains(&s.config.id))
            .filter(|(_, s)| {
                constraints
                    .max_cost_per_request
                    .map_or(true, |max| s.config.cost_per_request <= max)
            })
            .filter(|(_, s)| match (constraints.max_response_ms, s.mean_response_ms()) {
                (Some(max), Some(mean)) => mean <= max,
                _ => true,
            })
            .map(|(order, s)| s.snapshot(order, now))
            .collect()
    }

    /// Mark a request as started on `server_id`: one more in-flight request
    /// and one more hit on each rate window.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] for an unknown id.
    pub fn begin_request(&self, server_id: &str) -> Result<(), RouterError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let server = inner.get_mut(server_id)?;
        server.active_requests = server.active_requests.saturating_add(1);
        server.minute.record(now);
        server.hour.record(now);
        Ok(())
    }

    /// Record the outcome of a request started with [`begin_request`].
    ///
    /// Successful calls add a response-time sample and raise the availability
    /// score. Failed calls go through the same accounting as a failed health
    /// check, so repeated execution failures trip the server to `unhealthy`.
    /// A success never lifts `unhealthy` or `initializing`.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] for an unknown id.
    ///
    /// [`begin_request`]: Self::begin_request
    pub fn report_outcome(
        &self,
        server_id: &str,
        latency: Duration,
        success: bool,
    ) -> Result<ServerStatus, RouterError> {
        let window = self.config.response_window.max(1);
        let (status, score, event) = {
            let mut inner = self.inner.write();
            let server = inner.get_mut(server_id)?;
            server.active_requests = server.active_requests.saturating_sub(1);
            let event = if success {
                server.success_count += 1;
                if server.response_times.len() >= window {
                    server.response_times.pop_front();
                }
                server.response_times.push_back(latency.as_secs_f64() * 1000.0);
                self.apply_success(server);
                if server.status == ServerStatus::Degraded {
                    server.status = ServerStatus::Active;
                }
                None
            } else {
                server.error_count += 1;
                self.apply_failure(server)
            };
            (server.status, server.availability_score, event)
        };

        debug!(server_id, success, latency_ms = latency.as_millis() as u64, ?status, "outcome recorded");
        metrics::set_availability(server_id, score);
        if let Some(event) = event {
            self.events.publish(event);
        }
        Ok(status)
    }

    /// Apply the result of a health check.
    ///
    /// Success resets the failure streak, raises the score and makes the
    /// server `active` (emitting `server_recovered` if it was `unhealthy`).
    /// Failure lowers the score; the `failure_threshold`-th consecutive
    /// failure makes it `unhealthy` and emits `server_unhealthy`.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] for an unknown id.
    pub fn record_health_check(
        &self,
        server_id: &str,
        success: bool,
    ) -> Result<ServerStatus, RouterError> {
        let (status, score, event) = {
            let mut inner = self.inner.write();
            let server = inner.get_mut(server_id)?;
            server.last_check = Some(Utc::now());
            let event = if success {
                let was_unhealthy = server.status == ServerStatus::Unhealthy;
                self.apply_success(server);
                server.status = ServerStatus::Active;
                if was_unhealthy {
                    info!(server_id, "server recovered");
                    Some(RouterEvent::ServerRecovered {
                        server_id: server_id.to_string(),
                    })
                } else {
                    None
                }
            } else {
                self.apply_failure(server)
            };
            (server.status, server.availability_score, event)
        };

        metrics::set_availability(server_id, score);
        if let Some(event) = event {
            self.events.publish(event);
        }
        Ok(status)
    }

    /// Set the externally observed queue depth for a server.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] for an unknown id.
    pub fn update_queue_depth(&self, server_id: &str, depth: u32) -> Result<(), RouterError> {
        self.inner.write().get_mut(server_id)?.queue_depth = depth;
        Ok(())
    }

    /// Snapshot one server.
    pub fn snapshot(&self, server_id: &str) -> Option<ServerSnapshot> {
        let now = Instant::now();
        let inner = self.inner.read();
        let idx = *inner.index.get(server_id)?;
        inner.servers.get(idx).map(|s| s.snapshot(idx, now))
    }

    /// Snapshot every server in registration order.
    pub fn snapshots(&self) -> Vec<ServerSnapshot> {
        let now = Instant::now();
        self.inner
            .read()
            .servers
            .iter()
            .enumerate()
            .map(|(order, s)| s.snapshot(order, now))
            .collect()
    }

    /// Current status of a server.
    pub fn status(&self, server_id: &str) -> Option<ServerStatus> {
        self.snapshot(server_id).map(|s| s.status)
    }

    // ── Health accounting ──────────────────────────────────────────────

    fn apply_success(&self, server: &mut ServerState) {
        server.consecutive_failures = 0;
        server.availability_score = (server.availability_score + self.config.success_step).min(1.0);
    }

    fn apply_failure(&self, server: &mut ServerState) -> Option<RouterEvent> {
        server.consecutive_failures = server.consecutive_failures.saturating_add(1);
        server.availability_score = (server.availability_score - self.config.failure_step).max(0.0);

        if server.consecutive_failures >= self.config.failure_threshold {
            if server.status == ServerStatus::Unhealthy {
                return None;
            }
            server.status = ServerStatus::Unhealthy;
            warn!(
                server_id = %server.config.id,
                consecutive_failures = server.consecutive_failures,
                "server marked unhealthy"
            );
            return Some(RouterEvent::ServerUnhealthy {
                server_id: server.config.id.clone(),
                consecutive_failures: server.consecutive_failures,
            });
        }

        if server.status == ServerStatus::Active
            && server.availability_score < self.config.degraded_threshold
        {
            server.status = ServerStatus::Degraded;
            warn!(
                server_id = %server.config.id,
                score = server.availability_score,
                "server degraded"
            );
        }
        None
    }
}
