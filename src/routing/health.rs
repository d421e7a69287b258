//! Periodic health monitor.
//!
//! Each tick probes every registered server concurrently (bounded by the
//! probe timeout) and feeds the result into
//! [`ServerRegistry::record_health_check`]. The monitor stops when its
//! `watch` shutdown signal flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::{ServerRegistry, ServerStatus};
use crate::backend::{BackendError, ServiceBackend};
use crate::config::HealthConfig;
use crate::RouterError;

/// Something that can tell whether a server is alive.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe one server.
    async fn probe(&self, server_id: &str) -> Result<(), BackendError>;
}

/// Probe that pings the server's [`ServiceBackend`].
#[derive(Clone)]
pub struct BackendProbe {
    backends: Arc<DashMap<String, Arc<dyn ServiceBackend>>>,
}

impl BackendProbe {
    /// Probe backends out of a shared id → backend map.
    pub fn new(backends: Arc<DashMap<String, Arc<dyn ServiceBackend>>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl HealthProbe for BackendProbe {
    async fn probe(&self, server_id: &str) -> Result<(), BackendError> {
        let backend = self
            .backends
            .get(server_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BackendError::Unavailable(format!("no backend for '{server_id}'")))?;
        backend.ping().await
    }
}

/// Runs health checks against a [`ServerRegistry`].
pub struct HealthMonitor {
    registry: Arc<ServerRegistry>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    /// Create a monitor using the interval and timeout from `config`.
    pub fn new(
        registry: Arc<ServerRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms.max(1)),
        }
    }

    /// Probe one server and record the result.
    ///
    /// A probe that exceeds the timeout counts as a failure.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] for an unknown id.
    pub async fn check(&self, server_id: &str) -> Result<ServerStatus, RouterError> {
        let ok = match tokio::time::timeout(self.probe_timeout, self.probe.probe(server_id)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(server_id, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                debug!(server_id, timeout_ms = self.probe_timeout.as_millis() as u64, "health probe timed out");
                false
            }
        };
        self.registry.record_health_check(server_id, ok)
    }

    /// Probe every registered server concurrently.
    pub async fn check_all(&self) -> Vec<(String, ServerStatus)> {
        let ids = self.registry.ids();
        let results = join_all(ids.iter().map(|id| self.check(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(status) => Some((id, status)),
                Err(e) => {
                    warn!(server_id = %id, error = %e, "health check failed to record");
                    None
                }
            })
            .collect()
    }

    /// Run [`check_all`](Self::check_all) every interval until `shutdown`
    /// becomes `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "health monitor started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let results = self.check_all().await;
                        debug!(checked = results.len(), "health tick complete");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::config::ServerConfig;
    use crate::events::EventBus;
    use crate::routing::Capability;

    struct SlowProbe;

    #[async_trait]
    impl HealthProbe for SlowProbe {
        async fn probe(&self, _server_id: &str) -> Result<(), BackendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn setup(
        backend: ScriptedBackend,
    ) -> (Arc<ServerRegistry>, Arc<DashMap<String, Arc<dyn ServiceBackend>>>) {
        let registry = Arc::new(ServerRegistry::new(HealthConfig::default(), EventBus::new(16)));
        let _ = registry.register(ServerConfig::new("a", [Capability::Search]));
        let backends: Arc<DashMap<String, Arc<dyn ServiceBackend>>> = Arc::new(DashMap::new());
        backends.insert("a".into(), Arc::new(backend));
        (registry, backends)
    }

    #[tokio::test]
    async fn test_failed_pings_make_server_unhealthy() {
        let down = || Err(BackendError::Unavailable("down".into()));
        let (registry, backends) = setup(ScriptedBackend::healthy().with_pings([down(), down(), down()]));
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::new(BackendProbe::new(backends)),
            &HealthConfig::default(),
        );
        for _ in 0..3 {
            let _ = monitor.check("a").await;
        }
        assert_eq!(registry.status("a"), Some(ServerStatus::Unhealthy));
        // Script exhausted: pings succeed again.
        assert_eq!(monitor.check("a").await.ok(), Some(ServerStatus::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let (registry, _) = setup(ScriptedBackend::healthy());
        let monitor = HealthMonitor::new(Arc::clone(&registry), Arc::new(SlowProbe), &HealthConfig::default());
        let _ = monitor.check("a").await;
        assert_eq!(registry.snapshot("a").map(|s| s.consecutive_failures), Some(1));
    }

    #[tokio::test]
    async fn test_missing_backend_is_a_failed_probe() {
        let (registry, _) = setup(ScriptedBackend::healthy());
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::new(BackendProbe::new(Arc::new(DashMap::new()))),
            &HealthConfig::default(),
        );
        let results = monitor.check_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(registry.snapshot("a").map(|s| s.consecutive_failures), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_ticks_and_stops_on_shutdown() {
        let (registry, backends) = setup(ScriptedBackend::healthy());
        let config = HealthConfig {
            interval_ms: 100,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(Arc::clone(&registry), Arc::new(BackendProbe::new(backends)), &config);
        let (tx, rx) = watch::channel(false);
        let handle = monitor.spawn(rx);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(registry.snapshot("a").and_then(|s| s.last_check).is_some());
        let _ = tx.send(true);
        assert!(handle.await.is_ok());
    }
}
