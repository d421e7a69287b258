//! Failover and retry.
//!
//! ## Responsibility
//! Run one request to completion: try the scorer's top pick, and on failure
//! walk the capability's failover chain, then re-score the remaining eligible
//! servers, with exponential backoff between attempts.
//!
//! ## Guarantees
//! - Attempts for one request are strictly sequential
//! - Every attempt is bracketed by `begin_request` / `report_outcome`, so no
//!   server is left with a phantom in-flight request
//! - No attempt outlives the request deadline; a result that arrives after
//!   the deadline is discarded
//! - Exhaustion surfaces the last error with the full attempt history
//!
//! ## NOT Responsible For
//! - Circuit-breaker state (repeated failures trip `unhealthy` in the registry)
//! - Caching and cost accounting (see `router`)

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::capability::{Capability, Requirements};
use super::registry::{ServerRegistry, ServerSnapshot};
use super::scorer::SelectionScorer;
use crate::backend::{BackendError, ServiceBackend};
use crate::config::{FailoverConfig, FallbackTarget};
use crate::events::{EventBus, RouterEvent};
use crate::{metrics, RouterError};

/// One logical call travelling through the router.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Unique request id.
    pub request_id: String,
    /// What the request needs from a server.
    pub requirements: Requirements,
    /// Payload passed to the backend.
    pub payload: Value,
    /// Point after which the request is abandoned.
    pub deadline: Instant,
}

impl RequestEnvelope {
    /// Requested capability.
    pub fn capability(&self) -> &Capability {
        &self.requirements.capability
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The backend returned a result.
    Success,
    /// The backend returned an error.
    Failed,
    /// The attempt hit its timeout.
    TimedOut,
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Server the attempt ran on.
    pub server_id: String,
    /// Capability invoked (differs from the request's for substitute chains).
    pub capability: Capability,
    /// How it ended.
    pub outcome: AttemptOutcome,
    /// Time spent in the backend call.
    pub latency_ms: f64,
    /// Rendered error for failed attempts.
    pub error: Option<String>,
}

/// Successful result of [`FailoverManager::execute`].
#[derive(Debug, Clone)]
pub struct AttemptSuccess {
    /// Server that produced the result.
    pub server_id: String,
    /// Capability that was actually invoked.
    pub capability: Capability,
    /// Backend response.
    pub value: Value,
    /// Latency of the successful attempt.
    pub latency: Duration,
    /// Every attempt, the successful one last.
    pub history: Vec<AttemptRecord>,
}

/// Next server to try and the capability to invoke on it.
struct Candidate {
    server: ServerSnapshot,
    capability: Capability,
}

/// Drives attempts for one request at a time.
pub struct FailoverManager {
    config: FailoverConfig,
    registry: Arc<ServerRegistry>,
    scorer: Arc<SelectionScorer>,
    backends: Arc<DashMap<String, Arc<dyn ServiceBackend>>>,
    events: EventBus,
}

impl FailoverManager {
    /// Create a manager over shared router state.
    pub fn new(
        config: FailoverConfig,
        registry: Arc<ServerRegistry>,
        scorer: Arc<SelectionScorer>,
        backends: Arc<DashMap<String, Arc<dyn ServiceBackend>>>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            scorer,
            backends,
            events,
        }
    }

    /// Delay after attempt `attempt` (0-based): `2^attempt * base`, capped at
    /// `max_delay_ms`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Configured failover chain for `capability`.
    pub fn chain(&self, capability: &Capability) -> &[FallbackTarget] {
        self.config
            .chains
            .get(capability)
            .map_or(&[][..], Vec::as_slice)
    }

    /// Maximum attempts per request.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Execute `request` with retries and failover.
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoEligibleServer`] if no server can take the first attempt
    /// - [`RouterError::DeadlineExceeded`] if the deadline passes first
    /// - [`RouterError::Exhausted`] when every attempt failed
    pub async fn execute(&self, request: &RequestEnvelope) -> Result<AttemptSuccess, RouterError> {
        let max_attempts = self.max_attempts();
        let mut tried: HashSet<String> = HashSet::new();
        let mut chain = self.chain(request.capability()).iter();
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut last_error = String::new();
        let mut next: Option<Candidate> = None;

        for attempt in 0..max_attempts {
            if request.remaining().is_zero() {
                return Err(self.fail_deadline(request, &history));
            }

            let candidate = match next.take() {
                Some(candidate) => candidate,
                None => {
                    let eligible = self.registry.get_eligible(&request.requirements);
                    let server = self.scorer.select(&eligible, &request.requirements)?;
                    Candidate {
                        server,
                        capability: request.capability().clone(),
                    }
                }
            };

            let record = self.attempt(request, &candidate, attempt + 1).await;
            tried.insert(candidate.server.id.clone());

            match record {
                Ok((value, latency, record)) => {
                    history.push(record);
                    if request.remaining().is_zero() {
                        // Late result: never surfaced or cached.
                        return Err(self.fail_deadline(request, &history));
                    }
                    return Ok(AttemptSuccess {
                        server_id: candidate.server.id,
                        capability: candidate.capability,
                        value,
                        latency,
                        history,
                    });
                }
                Err(record) => {
                    last_error = record.error.clone().unwrap_or_default();
                    history.push(record);
                }
            }

            if attempt + 1 < max_attempts {
                // Only back off when there is somewhere left to go.
                let Some(candidate) = self.next_candidate(request, &mut chain, &tried) else {
                    debug!(request_id = %request.request_id, attempt, "no further candidates");
                    break;
                };
                next = Some(candidate);
                let delay = self.backoff_delay(attempt).min(request.remaining());
                debug!(
                    request_id = %request.request_id,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before next attempt"
                );
                tokio::time::sleep(delay).await;
            }
        }

        let attempts = u32::try_from(history.len()).unwrap_or(u32::MAX);
        warn!(
            request_id = %request.request_id,
            capability = %request.capability(),
            attempts,
            error = %last_error,
            "request exhausted"
        );
        self.events.publish(RouterEvent::RequestFailed {
            request_id: request.request_id.clone(),
            capability: request.capability().clone(),
            attempts,
            error: last_error.clone(),
        });
        Err(RouterError::Exhausted {
            capability: request.capability().clone(),
            attempts,
            last_error,
            history,
        })
    }

    /// Pick the next server after a failure: first the failover chain in
    /// order, then the best remaining eligible server, then any eligible
    /// server even if already tried.
    fn next_candidate<'a>(
        &self,
        request: &RequestEnvelope,
        chain: &mut impl Iterator<Item = &'a FallbackTarget>,
        tried: &HashSet<String>,
    ) -> Option<Candidate> {
        let untried = {
            let mut req = request.requirements.clone();
            req.constraints.excluded.extend(tried.iter().cloned());
            req
        };

        for target in chain.by_ref() {
            match target {
                FallbackTarget::Server(id) => {
                    if let Some(server) = self
                        .registry
                        .get_eligible(&untried)
                        .into_iter()
                        .find(|s| &s.id == id)
                    {
                        info!(request_id = %request.request_id, server_id = %id, "failing over to chained server");
                        return Some(Candidate {
                            server,
                            capability: request.capability().clone(),
                        });
                    }
                    debug!(server_id = %id, "chained server not eligible, skipping");
                }
                FallbackTarget::Capability(substitute) => {
                    let mut req = untried.clone();
                    req.capability = substitute.clone();
                    let eligible = self.registry.get_eligible(&req);
                    if let Ok(server) = self.scorer.select(&eligible, &req) {
                        info!(
                            request_id = %request.request_id,
                            server_id = %server.id,
                            substitute = %substitute,
                            "failing over to substitute capability"
                        );
                        return Some(Candidate {
                            server,
                            capability: substitute.clone(),
                        });
                    }
                    debug!(substitute = %substitute, "no server for substitute capability");
                }
            }
        }

        let eligible = self.registry.get_eligible(&untried);
        let server = match self.scorer.select(&eligible, &untried) {
            Ok(server) => server,
            Err(_) => {
                let eligible = self.registry.get_eligible(&request.requirements);
                self.scorer.select(&eligible, &request.requirements).ok()?
            }
        };
        Some(Candidate {
            server,
            capability: request.capability().clone(),
        })
    }

    /// Run one attempt and report its outcome to the registry.
    async fn attempt(
        &self,
        request: &RequestEnvelope,
        candidate: &Candidate,
        number: u32,
    ) -> Result<(Value, Duration, AttemptRecord), AttemptRecord> {
        let server_id = candidate.server.id.as_str();
        let backend = self.backends.get(server_id).map(|b| Arc::clone(b.value()));
        let timeout = Duration::from_millis(self.config.attempt_timeout_ms).min(request.remaining());

        if let Err(e) = self.registry.begin_request(server_id) {
            warn!(server_id, error = %e, "could not mark request start");
        }
        let started = Instant::now();
        let result = match backend {
            Some(backend) => {
                match tokio::time::timeout(timeout, backend.call(&candidate.capability, &request.payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(timeout)),
                }
            }
            None => Err(BackendError::Unavailable(format!("no backend registered for '{server_id}'"))),
        };
        let latency = started.elapsed();

        if let Err(e) = self.registry.report_outcome(server_id, latency, result.is_ok()) {
            warn!(server_id, error = %e, "could not record outcome");
        }

        let mut record = AttemptRecord {
            attempt: number,
            server_id: server_id.to_string(),
            capability: candidate.capability.clone(),
            outcome: AttemptOutcome::Success,
            latency_ms: latency.as_secs_f64() * 1000.0,
            error: None,
        };

        match result {
            Ok(value) => {
                metrics::inc_attempt(server_id, "ok");
                debug!(request_id = %request.request_id, server_id, attempt = number, "attempt succeeded");
                Ok((value, latency, record))
            }
            Err(e) => {
                record.outcome = if matches!(e, BackendError::Timeout(_)) {
                    metrics::inc_attempt(server_id, "timeout");
                    AttemptOutcome::TimedOut
                } else {
                    metrics::inc_attempt(server_id, "error");
                    AttemptOutcome::Failed
                };
                let err = RouterError::Execution {
                    server_id: server_id.to_string(),
                    source: e,
                };
                warn!(request_id = %request.request_id, server_id, attempt = number, error = %err, "attempt failed");
                record.error = Some(err.to_string());
                Err(record)
            }
        }
    }

    fn fail_deadline(&self, request: &RequestEnvelope, history: &[AttemptRecord]) -> RouterError {
        let err = RouterError::DeadlineExceeded {
            request_id: request.request_id.clone(),
        };
        warn!(request_id = %request.request_id, attempts = history.len(), "request deadline exceeded");
        self.events.publish(RouterEvent::RequestFailed {
            request_id: request.request_id.clone(),
            capability: request.capability().clone(),
            attempts: u32::try_from(history.len()).unwrap_or(u32::MAX),
            error: err.to_string(),
        });
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::config::{HealthConfig, ServerConfig};
    use crate::events::drain;

    struct Fixture {
        registry: Arc<ServerRegistry>,
        backends: Arc<DashMap<String, Arc<dyn ServiceBackend>>>,
        events: EventBus,
    }

    impl Fixture {
        fn new() -> Self {
            let events = EventBus::new(64);
            Self {
                registry: Arc::new(ServerRegistry::new(HealthConfig::default(), events.clone())),
                backends: Arc::new(DashMap::new()),
                events,
            }
        }

        fn add(&self, config: ServerConfig, backend: ScriptedBackend) -> Arc<ScriptedBackend> {
            let backend = Arc::new(backend);
            let _ = self.registry.register(config.clone());
            self.backends.insert(config.id, backend.clone());
            backend
        }

        fn manager(&self, config: FailoverConfig) -> FailoverManager {
            FailoverManager::new(
                config,
                Arc::clone(&self.registry),
                Arc::new(SelectionScorer::default()),
                Arc::clone(&self.backends),
                self.events.clone(),
            )
        }
    }

    fn fast() -> FailoverConfig {
        FailoverConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..FailoverConfig::default()
        }
    }

    fn envelope(cap: Capability) -> RequestEnvelope {
        RequestEnvelope {
            request_id: "r1".into(),
            requirements: Requirements::new(cap),
            payload: serde_json::json!({"q": 1}),
            deadline: Instant::now() + Duration::from_secs(10),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let fixture = Fixture::new();
        let manager = fixture.manager(FailoverConfig {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            ..FailoverConfig::default()
        });
        assert_eq!(manager.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(manager.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(manager.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(manager.backoff_delay(10), Duration::from_secs(30));
        assert_eq!(manager.backoff_delay(200), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fails_over_along_chain() {
        let fixture = Fixture::new();
        fixture.add(ServerConfig::new("a", [Capability::Search]).with_cost(0.0), ScriptedBackend::failing());
        fixture.add(ServerConfig::new("b", [Capability::Search]).with_cost(0.09), ScriptedBackend::healthy());
        let mut config = fast();
        config
            .chains
            .insert(Capability::Search, vec![FallbackTarget::Server("b".into())]);
        let manager = fixture.manager(config);

        let result = manager.execute(&envelope(Capability::Search)).await;
        let success = result.map_err(|e| e.to_string());
        assert_eq!(success.as_ref().map(|s| s.server_id.as_str()), Ok("b"));
        assert_eq!(success.map(|s| s.history.len()), Ok(2));
    }

    #[tokio::test]
    async fn test_substitute_capability_invoked() {
        let fixture = Fixture::new();
        fixture.add(ServerConfig::new("a", [Capability::Search]), ScriptedBackend::failing());
        fixture.add(ServerConfig::new("d", [Capability::DataRetrieval]), ScriptedBackend::healthy());
        let mut config = fast();
        config.chains.insert(
            Capability::Search,
            vec![FallbackTarget::Capability(Capability::DataRetrieval)],
        );
        let manager = fixture.manager(config);

        let success = manager.execute(&envelope(Capability::Search)).await;
        assert_eq!(
            success.map(|s| (s.server_id, s.capability)).ok(),
            Some(("d".to_string(), Capability::DataRetrieval))
        );
    }

    #[tokio::test]
    async fn test_exhaustion_reports_history_and_emits_request_failed() {
        let fixture = Fixture::new();
        let mut rx = fixture.events.subscribe();
        let a = fixture.add(ServerConfig::new("a", [Capability::Search]), ScriptedBackend::failing());
        let b = fixture.add(ServerConfig::new("b", [Capability::Search]), ScriptedBackend::failing());
        let manager = fixture.manager(fast());

        match manager.execute(&envelope(Capability::Search)).await {
            Err(RouterError::Exhausted { capability, attempts, history, .. }) => {
                assert_eq!(capability, Capability::Search);
                assert_eq!(attempts, 3);
                assert_eq!(history.len(), 3);
                assert!(history.iter().all(|r| r.outcome == AttemptOutcome::Failed));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(a.call_count() + b.call_count(), 3);
        for id in ["a", "b"] {
            assert_eq!(fixture.registry.snapshot(id).map(|s| s.active_requests), Some(0));
        }
        assert!(drain(&mut rx).iter().any(|e| e.kind() == "request_failed"));
    }

    #[tokio::test]
    async fn test_no_eligible_server_is_immediate() {
        let fixture = Fixture::new();
        let manager = fixture.manager(fast());
        assert!(matches!(
            manager.execute(&envelope(Capability::Embedding)).await,
            Err(RouterError::NoEligibleServer { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_per_attempt() {
        let fixture = Fixture::new();
        fixture.add(
            ServerConfig::new("slow", [Capability::Search]),
            ScriptedBackend::healthy().with_delay(Duration::from_secs(5)),
        );
        let manager = fixture.manager(FailoverConfig {
            max_attempts: 1,
            attempt_timeout_ms: 100,
            ..fast()
        });
        match manager.execute(&envelope(Capability::Search)).await {
            Err(RouterError::Exhausted { history, .. }) => {
                assert_eq!(history[0].outcome, AttemptOutcome::TimedOut);
            }
            other => panic!("expected timeout exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_backoff_when_no_candidate_remains() {
        let events = EventBus::new(64);
        let health = HealthConfig {
            failure_threshold: 1,
            ..HealthConfig::default()
        };
        let fixture = Fixture {
            registry: Arc::new(ServerRegistry::new(health, events.clone())),
            backends: Arc::new(DashMap::new()),
            events,
        };
        let only = fixture.add(ServerConfig::new("only", [Capability::Search]), ScriptedBackend::failing());
        let manager = fixture.manager(FailoverConfig {
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            ..FailoverConfig::default()
        });

        let started = Instant::now();
        match manager.execute(&envelope(Capability::Search)).await {
            Err(RouterError::Exhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(only.call_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(1), "waited {:?}", started.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_is_abandoned() {
        let fixture = Fixture::new();
        fixture.add(ServerConfig::new("a", [Capability::Search]), ScriptedBackend::healthy());
        let manager = fixture.manager(fast());
        let mut request = envelope(Capability::Search);
        request.deadline = Instant::now();
        assert!(matches!(
            manager.execute(&request).await,
            Err(RouterError::DeadlineExceeded { .. })
        ));
    }
}
