//! Demo binary for tokio-service-router
//!
//! Registers echo backends, routes a handful of requests, exercises the
//! message bus, and logs every event emitted along the way.
//!
//! ## Usage
//!
//! ```text
//! service-router-demo [router.toml]
//! ```
//!
//! Without a config file three demo servers are registered.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio_service_router::bus::{Ack, ChannelHandler, ChannelSubscriber, SendOptions, SubscriptionFilter};
use tokio_service_router::config::{loader, RouterConfig, ServerConfig};
use tokio_service_router::{
    init_tracing, metrics, Capability, EchoBackend, EventBus, ExecuteOptions, MessageBus, Priority,
    ServiceBackend, ServiceRouter,
};
use tracing::{error, info, warn};

fn demo_config() -> RouterConfig {
    let mut config = RouterConfig::default();
    config.servers = vec![
        ServerConfig::new("search-primary", [Capability::Search, Capability::DataRetrieval]).with_cost(0.01),
        ServerConfig::new("search-secondary", [Capability::Search]).with_cost(0.05),
        ServerConfig::new("analytics", [Capability::Analysis, Capability::Reporting]).with_cost(0.03),
    ];
    config.failover.base_delay_ms = 50;
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured tracing (JSON or pretty, based on LOG_FORMAT env)
    let _ = init_tracing();

    // Initialize Prometheus metrics registry before any request runs.
    metrics::init_metrics()?;

    let config = match std::env::args().nth(1) {
        Some(path) => loader::load_from_file(Path::new(&path))?,
        None => demo_config(),
    };
    info!(servers = config.servers.len(), "Starting tokio-service-router demo");

    let events = EventBus::new(config.events.channel_capacity);
    let mut event_rx = events.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!(kind = event.kind(), event = ?event, "event");
        }
    });

    let bus_config = config.bus.clone();
    let router = ServiceRouter::from_config(config, events.clone(), |server| {
        info!(server_id = %server.id, "connecting echo backend");
        Arc::new(EchoBackend::with_delay(5)) as Arc<dyn ServiceBackend>
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = router.spawn_health_monitor(shutdown_rx.clone());

    // ── Routing ──────────────────────────────────────────────────────────
    let requests = [
        (Capability::Search, json!({"q": "tokio runtime"})),
        (Capability::Search, json!({"q": "tokio runtime"})),
        (Capability::Analysis, json!({"dataset": "q3", "metric": "latency"})),
        (Capability::Reporting, json!({"report": "weekly"})),
        (Capability::Embedding, json!({"text": "no server offers this"})),
    ];
    for (capability, payload) in requests {
        match router.execute(capability.clone(), payload, ExecuteOptions::default()).await {
            Ok(result) => info!(
                capability = %capability,
                server_id = ?result.server_id,
                cached = result.cached,
                attempts = result.attempts,
                cost = result.cost,
                "request completed"
            ),
            Err(e) => warn!(capability = %capability, error = %e, "request failed"),
        }
    }

    let costs = router.costs().snapshot();
    info!(total = costs.total_lifetime, "cost summary");
    info!(stats = ?router.cache().stats(), "cache summary");

    // ── Message bus ──────────────────────────────────────────────────────
    let bus = MessageBus::new(bus_config, events.clone());
    let (inbox, mut inbox_rx) = ChannelHandler::new(64, Ack::Acknowledged);
    bus.register_recipient("ops-agent", Arc::new(inbox.clone()));
    bus.register_recipient("audit-agent", Arc::new(inbox));
    bus.directory().add_to_group("ops", "ops-agent");
    bus.directory().add_to_group("ops", "audit-agent");

    bus.create_stream("alerts", None);
    let (alerts, mut alerts_rx) = ChannelSubscriber::new(64);
    bus.subscribe(
        "alerts",
        "pager",
        SubscriptionFilter::all().priorities([Priority::High, Priority::Critical]),
        Arc::new(alerts),
    )?;

    let dispatcher = bus.spawn_dispatcher(shutdown_rx.clone());
    let drainer = Arc::clone(bus.streams()).spawn_drainer(shutdown_rx);

    bus.send("router", "ops-agent", json!({"note": "daily rollup"}), SendOptions::default().priority(Priority::Low))?;
    bus.send("router", "ops-agent", json!({"note": "server flapping"}), SendOptions::default().priority(Priority::Critical))?;
    bus.publish("alerts", "monitor", json!({"server": "analytics"}), SendOptions::default().priority(Priority::High))?;
    bus.publish("alerts", "monitor", json!({"server": "noise"}), SendOptions::default().priority(Priority::Low))?;

    match bus.broadcast("router", ["group:ops"], json!({"notice": "maintenance"}), SendOptions::default()).await {
        Ok(report) => info!(strategy = ?report.strategy, delivered = report.delivered.len(), "broadcast sent"),
        Err(e) => error!(error = %e, "broadcast failed"),
    }

    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

    while let Ok(message) = inbox_rx.try_recv() {
        info!(recipient = %message.recipient, priority = %message.priority, "inbox");
    }
    while let Ok(notice) = alerts_rx.try_recv() {
        info!(notice = ?notice, "alert stream");
    }
    info!(stats = ?bus.stats(), dead_letters = bus.dead_letters().len(), "bus summary");

    // ── Shutdown ─────────────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(health, dispatcher, drainer);
    drop(router);
    drop(bus);
    drop(events);
    event_log.abort();

    info!(summary = ?metrics::get_metrics_summary(), "metrics summary");
    println!("{}", metrics::gather_metrics());
    info!("Demo complete");
    Ok(())
}
