//! Message bus benchmarks.
//!
//! - Priority queue push+pop across lanes
//! - `send` + `process_next` to an acknowledging handler
//! - Stream filter matching

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_service_router::bus::{
    Ack, DeliveryError, Message, MessageHandler, PriorityQueue, SendOptions, SubscriptionFilter,
};
use tokio_service_router::config::BusConfig;
use tokio_service_router::{EventBus, MessageBus, Priority};

fn bench_queue_push_pop(c: &mut Criterion) {
    let queue: PriorityQueue<u64> = PriorityQueue::with_capacity(1024);
    let lanes = [Priority::Low, Priority::Critical, Priority::Medium, Priority::High];

    c.bench_function("priority_queue_push_pop", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let _ = queue.push(lanes[(i % 4) as usize], black_box(i));
            i = i.wrapping_add(1);
            black_box(queue.pop());
        })
    });
}

/// Accepts everything without buffering it.
struct Sink;

#[async_trait]
impl MessageHandler for Sink {
    async fn handle(&self, _message: &Message) -> Result<Ack, DeliveryError> {
        Ok(Ack::Acknowledged)
    }
}

fn bench_send_and_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let bus = {
        let _guard = rt.enter();
        let bus = MessageBus::new(BusConfig::default(), EventBus::new(1024));
        bus.register_recipient("sink", Arc::new(Sink));
        bus
    };

    c.bench_function("send_and_dispatch", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = bus.send("bench", "sink", json!({"n": 1}), SendOptions::default().priority(Priority::High));
            black_box(bus.process_next().await);
        })
    });
}

fn bench_filter_match(c: &mut Criterion) {
    let filter = SubscriptionFilter::all()
        .types(["metric", "trace"])
        .senders(["sensor-1", "sensor-2", "sensor-3"])
        .priorities([Priority::High, Priority::Critical]);
    let message = Message::new("sensor-2", "stream:telemetry", "metric", json!({"v": 1.5}))
        .with_priority(Priority::High);

    c.bench_function("subscription_filter_match", |b| {
        b.iter(|| black_box(filter.matches(black_box(&message))));
    });
}

criterion_group!(benches, bench_queue_push_pop, bench_send_and_dispatch, bench_filter_match);
criterion_main!(benches);
