//! Loading a router configuration from disk and running against it.

use std::io::Write;
use std::sync::Arc;

use serde_json::json;
use tokio_service_router::config::loader::load_from_file;
use tokio_service_router::config::validation::ConfigError;
use tokio_service_router::config::ServerConfig;
use tokio_service_router::events::drain;
use tokio_service_router::{
    BackendError, Capability, EventBus, ExecuteOptions, MessageBus, RouterError, ScriptedBackend,
    ServiceBackend, ServiceRouter,
};

const ROUTER_TOML: &str = r#"
[[servers]]
id = "search-a"
capabilities = ["search"]
cost_per_request = 0.01

[[servers]]
id = "search-b"
capabilities = ["search"]
cost_per_request = 0.05

[failover]
max_attempts = 3
base_delay_ms = 1

[failover.chains]
search = [{ server = "search-b" }]

[cache.policies]
search = { ttl_secs = 60 }

[bus]
queue_capacity = 2
"#;

fn write_config(content: &str) -> Option<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new().ok()?;
    file.write_all(content.as_bytes()).ok()?;
    Some(file)
}

fn connect(server: &ServerConfig) -> Arc<dyn ServiceBackend> {
    if server.id == "search-a" {
        Arc::new(
            ScriptedBackend::healthy().with_calls([Err(BackendError::Unavailable("warming".into()))]),
        )
    } else {
        Arc::new(ScriptedBackend::healthy())
    }
}

#[tokio::test]
async fn test_loaded_config_drives_failover_chain_and_cache() {
    let Some(file) = write_config(ROUTER_TOML) else {
        return;
    };
    let config = load_from_file(file.path());
    let Ok(config) = config else {
        panic!("config rejected: {config:?}");
    };
    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.bus.queue_capacity, 2);

    let events = EventBus::new(128);
    let mut rx = events.subscribe();
    let bus = MessageBus::new(config.bus.clone(), events.clone());
    let router = ServiceRouter::from_config(config, events, connect);
    let Ok(router) = router else {
        panic!("router not built: {router:?}");
    };

    let payload = json!({"q": "circuit breaker"});
    let first = router
        .execute(Capability::Search, payload.clone(), ExecuteOptions::default())
        .await;
    let Ok(first) = first else {
        panic!("request failed: {first:?}");
    };
    assert_eq!(first.server_id.as_deref(), Some("search-b"));
    assert_eq!(first.attempts, 2);
    assert_eq!(first.value, payload);
    assert!(!first.cached);

    let second = router
        .execute(Capability::Search, payload.clone(), ExecuteOptions::default())
        .await;
    assert!(second.is_ok_and(|r| r.cached && r.attempts == 0 && r.value == payload));

    let kinds: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["request_completed", "cache_hit", "request_completed"]);

    // Bus capacity comes from the same file.
    assert!(bus.send("a", "b", json!(1), Default::default()).is_ok());
    assert!(bus.send("a", "b", json!(2), Default::default()).is_ok());
    assert!(matches!(
        bus.send("a", "b", json!(3), Default::default()),
        Err(RouterError::QueueFull)
    ));
}

#[test]
fn test_invalid_file_reports_every_problem() {
    let toml = r#"
[[servers]]
id = "dup"
capabilities = ["search"]

[[servers]]
id = "dup"
capabilities = []

[scoring.weights]
capability_match = 0.9
"#;
    let Some(file) = write_config(toml) else {
        return;
    };
    match load_from_file(file.path()) {
        Err(ConfigError::Validation(message)) => {
            assert!(message.contains("duplicate server id"), "{message}");
            assert!(message.contains("servers[1].capabilities"), "{message}");
            assert!(message.contains("weights must sum to 1.0"), "{message}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn test_router_rejects_invalid_config_without_registering() {
    let mut config = tokio_service_router::RouterConfig::default();
    config.failover.max_attempts = 0;
    config.servers.push(ServerConfig::new("a", [Capability::Search]));
    let built = ServiceRouter::from_config(config, EventBus::default(), connect);
    assert!(matches!(built, Err(RouterError::Config(ref m)) if m.contains("max_attempts")));
}
