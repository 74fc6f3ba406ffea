use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use eventpipe::event::{dedup_key, EventBuilder, EventRequest};
use eventpipe::ingest::{BatchBuffer, BufferConfig};
use eventpipe::store::MemoryStore;
use serde_json::{Map, Value};

fn request(i: u64) -> EventRequest {
    let mut metadata = Map::new();
    metadata.insert("sku".to_string(), Value::from(format!("sku-{i}")));
    metadata.insert("price".to_string(), Value::from(19.99));

    EventRequest {
        event_name: "add_to_cart".to_string(),
        channel: "web".to_string(),
        campaign_id: Some("summer".to_string()),
        user_id: format!("user-{}", i % 1024),
        timestamp: 1_700_000_000 + i as i64,
        tags: Some(vec!["promo".to_string(), "mobile".to_string()]),
        metadata: Some(metadata),
    }
}

fn bench_dedup_key(c: &mut Criterion) {
    c.bench_function("dedup_key", |b| {
        b.iter(|| {
            dedup_key(
                black_box("user-42"),
                black_box("add_to_cart"),
                black_box("web"),
                black_box(1_700_000_000),
                black_box("summer"),
            )
        })
    });
}

fn bench_event_build(c: &mut Criterion) {
    let builder = EventBuilder::new(Duration::from_secs(300));
    let template = request(7);

    c.bench_function("event_build", |b| {
        b.iter(|| {
            builder
                .build(black_box(template.clone()))
                .expect("valid event")
        })
    });
}

fn bench_buffer_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let builder = EventBuilder::new(Duration::ZERO);
    let events: Vec<_> = (0..1000)
        .map(|i| builder.build(request(i)).expect("valid event"))
        .collect();

    c.bench_function("buffer_enqueue_1000", |b| {
        b.to_async(&rt).iter(|| {
            let events = events.clone();
            async move {
                let buffer = BatchBuffer::start(
                    Arc::new(MemoryStore::new()),
                    BufferConfig {
                        buffer_size: 10_000,
                        batch_size: 250,
                        flush_interval: Duration::from_secs(1),
                        flush_timeout: Duration::from_secs(5),
                    },
                    None,
                );
                for event in events {
                    buffer.enqueue(event).await.expect("enqueue");
                }
                buffer.shutdown().await;
            }
        })
    });
}

criterion_group!(
    benches,
    bench_dedup_key,
    bench_event_build,
    bench_buffer_throughput
);
criterion_main!(benches);
