//! Service router: the `execute` entry point.
//!
//! Ties the cache, registry, scorer, failover manager and cost tracker into
//! one request path. All state is owned by the router instance; nothing is
//! global, so tests construct isolated routers freely.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capability::{Capability, Constraints, Requirements};
use super::cost_tracker::CostTracker;
use super::failover::{AttemptRecord, FailoverManager, RequestEnvelope};
use super::health::{BackendProbe, HealthMonitor};
use super::registry::ServerRegistry;
use super::scorer::SelectionScorer;
use crate::backend::ServiceBackend;
use crate::cache::CacheManager;
use crate::config::{validation, RouterConfig, ServerConfig};
use crate::events::{EventBus, RouterEvent};
use crate::{metrics, RouterError};

/// Per-call options for [`ServiceRouter::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Caller-supplied request id. A v4 UUID is generated when absent.
    pub request_id: Option<String>,
    /// Capabilities the server must offer besides the primary one.
    pub also_required: HashSet<Capability>,
    /// Preferences and filters.
    pub constraints: Constraints,
    /// Overrides `failover.request_timeout_ms`.
    pub timeout: Option<Duration>,
    /// Skip the cache lookup (the result is still written back).
    pub bypass_cache: bool,
}

impl ExecuteOptions {
    /// Use a fixed request id.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Give up after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Also require `capability`.
    pub fn require(mut self, capability: Capability) -> Self {
        self.also_required.insert(capability);
        self
    }

    /// Prefer servers offering `capability`.
    pub fn prefer(mut self, capability: Capability) -> Self {
        self.constraints.preferred.insert(capability);
        self
    }

    /// Never route to `server_id`.
    pub fn exclude(mut self, server_id: impl Into<String>) -> Self {
        self.constraints.excluded.insert(server_id.into());
        self
    }

    /// Skip the cache lookup.
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// Successful outcome of [`ServiceRouter::execute`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Request id.
    pub request_id: String,
    /// Capability that produced the value (a fallback capability if the
    /// failover chain substituted one).
    pub capability: Capability,
    /// Result payload.
    pub value: Value,
    /// Server that produced the value; `None` for cache hits.
    pub server_id: Option<String>,
    /// Whether the value came from the cache.
    pub cached: bool,
    /// Attempts made (0 for cache hits).
    pub attempts: u32,
    /// Cost debited for this call.
    pub cost: f64,
    /// Wall time from entry to result.
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    /// One record per attempt.
    pub history: Vec<AttemptRecord>,
}

mod duration_ms {
    use serde::Serializer;
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }
}

/// Adaptive service router.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct ServiceRouter {
    config: RouterConfig,
    events: EventBus,
    registry: Arc<ServerRegistry>,
    scorer: Arc<SelectionScorer>,
    backends: Arc<DashMap<String, Arc<dyn ServiceBackend>>>,
    failover: FailoverManager,
    cache: CacheManager,
    costs: CostTracker,
}

impl std::fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRouter")
            .field("servers", &self.registry.len())
            .field("cache", &self.cache)
            .field("costs", &self.costs)
            .finish()
    }
}

impl ServiceRouter {
    /// Create a router with no servers. `config.servers` is ignored; use
    /// [`from_config`](Self::from_config) to register them.
    pub fn new(config: RouterConfig, events: EventBus) -> Self {
        let registry = Arc::new(ServerRegistry::new(config.health.clone(), events.clone()));
        let scorer = Arc::new(SelectionScorer::new(config.scoring.clone()));
        let backends: Arc<DashMap<String, Arc<dyn ServiceBackend>>> = Arc::new(DashMap::new());
        let failover = FailoverManager::new(
            config.failover.clone(),
            Arc::clone(&registry),
            Arc::clone(&scorer),
            Arc::clone(&backends),
            events.clone(),
        );
        let cache = CacheManager::new(config.cache.clone());
        let costs = CostTracker::new(config.budget.clone(), events.clone());

        Self {
            config,
            events,
            registry,
            scorer,
            backends,
            failover,
            cache,
            costs,
        }
    }

    /// Validate `config`, then build a router and register every configured
    /// server with the backend `connect` returns for it.
    ///
    /// # Errors
    ///
    /// [`RouterError::Config`] listing every validation failure, or the first
    /// registration failure.
    pub fn from_config<F>(config: RouterConfig, events: EventBus, connect: F) -> Result<Self, RouterError>
    where
        F: Fn(&ServerConfig) -> Arc<dyn ServiceBackend>,
    {
        validation::validate(&config).map_err(|errors| {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            RouterError::Config(joined.join("; "))
        })?;

        let servers = config.servers.clone();
        let router = Self::new(config, events);
        for server in servers {
            let backend = connect(&server);
            router.register_server(server, backend)?;
        }
        info!(servers = router.registry.len(), "service router ready");
        Ok(router)
    }

    /// Add a server and the backend that serves it.
    ///
    /// # Errors
    ///
    /// [`RouterError::Validation`] for an empty or duplicate id.
    pub fn register_server(
        &self,
        config: ServerConfig,
        backend: Arc<dyn ServiceBackend>,
    ) -> Result<(), RouterError> {
        let id = config.id.clone();
        let cost = config.cost_per_request;
        self.registry.register(config)?;
        self.costs.set_base_cost(&id, cost);
        self.backends.insert(id, backend);
        Ok(())
    }

    /// Execute `capability` with `payload`.
    ///
    /// Serves from the cache when possible, otherwise selects a server,
    /// retries and fails over per the failover policy, caches the result and
    /// debits its cost.
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoEligibleServer`] when no server can take the request
    /// - [`RouterError::BudgetExceeded`] when hard budget limits exclude every
    ///   otherwise-eligible server
    /// - [`RouterError::Exhausted`] after the attempt budget is spent
    /// - [`RouterError::DeadlineExceeded`] when the timeout elapses first
    pub async fn execute(
        &self,
        capability: Capability,
        payload: Value,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, RouterError> {
        let started = Instant::now();
        let request_id = options
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cache_key = CacheManager::key(&capability, &payload);

        if !options.bypass_cache {
            if let Some(value) = self.cache.get(&cache_key) {
                return Ok(self.complete_from_cache(request_id, capability, cache_key, value, started));
            }
        }

        let mut requirements = Requirements {
            capability: capability.clone(),
            also_required: options.also_required,
            constraints: options.constraints,
        };
        self.apply_budget_limits(&request_id, &mut requirements)?;

        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.failover.request_timeout_ms));
        let envelope = RequestEnvelope {
            request_id: request_id.clone(),
            requirements,
            payload,
            deadline: started + timeout,
        };

        let success = match self.failover.execute(&envelope).await {
            Ok(success) => success,
            Err(e) => {
                if let RouterError::NoEligibleServer { .. } = &e {
                    self.events.publish(RouterEvent::RequestFailed {
                        request_id: request_id.clone(),
                        capability: capability.clone(),
                        attempts: 0,
                        error: e.to_string(),
                    });
                }
                metrics::inc_request(capability.as_str(), "error", started.elapsed());
                return Err(e);
            }
        };

        let cost = match self
            .costs
            .record_usage(&success.server_id, &success.capability, success.latency)
        {
            Ok(cost) => cost,
            Err(e) => {
                warn!(server_id = %success.server_id, error = %e, "cost not recorded");
                0.0
            }
        };

        // Substituted capabilities answer a different question; only the
        // requested capability's own results are reusable.
        if success.capability == capability && envelope.remaining() > Duration::ZERO {
            self.cache.set(&cache_key, success.value.clone(), &capability);
        }

        let attempts = u32::try_from(success.history.len()).unwrap_or(u32::MAX);
        let latency = started.elapsed();
        self.events.publish(RouterEvent::RequestCompleted {
            request_id: request_id.clone(),
            capability: capability.clone(),
            server_id: Some(success.server_id.clone()),
            attempts,
            latency_ms: latency.as_secs_f64() * 1000.0,
        });
        metrics::inc_request(capability.as_str(), "ok", latency);
        debug!(
            request_id = %request_id,
            server_id = %success.server_id,
            attempts,
            cost,
            "request completed"
        );

        Ok(ExecutionResult {
            request_id,
            capability: success.capability,
            value: success.value,
            server_id: Some(success.server_id),
            cached: false,
            attempts,
            cost,
            latency,
            history: success.history,
        })
    }

    fn complete_from_cache(
        &self,
        request_id: String,
        capability: Capability,
        key: String,
        value: Value,
        started: Instant,
    ) -> ExecutionResult {
        let latency = started.elapsed();
        self.events.publish(RouterEvent::CacheHit {
            capability: capability.clone(),
            key,
        });
        self.events.publish(RouterEvent::RequestCompleted {
            request_id: request_id.clone(),
            capability: capability.clone(),
            server_id: None,
            attempts: 0,
            latency_ms: latency.as_secs_f64() * 1000.0,
        });
        metrics::inc_request(capability.as_str(), "cache_hit", latency);
        debug!(request_id = %request_id, capability = %capability, "served from cache");

        ExecutionResult {
            request_id,
            capability,
            value,
            server_id: None,
            cached: true,
            attempts: 0,
            cost: 0.0,
            latency,
            history: Vec::new(),
        }
    }

    /// Exclude over-budget servers when hard limits are on.
    fn apply_budget_limits(
        &self,
        request_id: &str,
        requirements: &mut Requirements,
    ) -> Result<(), RouterError> {
        if !self.costs.enforces_hard_limit() {
            return Ok(());
        }
        let over = self.costs.over_budget_servers();
        if over.is_empty() {
            return Ok(());
        }

        let before = self.registry.get_eligible(requirements);
        requirements.constraints.excluded.extend(over.iter().cloned());
        if before.is_empty() || !self.registry.get_eligible(requirements).is_empty() {
            return Ok(());
        }

        // Budget alone emptied the candidate set.
        let blocked = before.iter().find(|s| over.contains(&s.id));
        let err = match blocked.map(|s| self.costs.ensure_within_budget(&s.id)) {
            Some(Err(e)) => e,
            _ => RouterError::NoEligibleServer {
                capability: requirements.capability.clone(),
            },
        };
        warn!(request_id, error = %err, "request blocked by budget");
        self.events.publish(RouterEvent::RequestFailed {
            request_id: request_id.to_string(),
            capability: requirements.capability.clone(),
            attempts: 0,
            error: err.to_string(),
        });
        Err(err)
    }

    /// Health monitor over this router's servers and backends.
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.registry),
            Arc::new(BackendProbe::new(Arc::clone(&self.backends))),
            &self.config.health,
        )
    }

    /// Start periodic health checks until `shutdown` flips to `true`.
    pub fn spawn_health_monitor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.health_monitor().spawn(shutdown)
    }

    /// Server registry.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Selection scorer.
    pub fn scorer(&self) -> &Arc<SelectionScorer> {
        &self.scorer
    }

    /// Response cache.
    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Cost tracker.
    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    /// Event bus the router publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Effective configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}
