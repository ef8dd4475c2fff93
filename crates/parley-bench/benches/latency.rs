//! Latency benchmarks for Parley.
//!
//! These benchmarks time a single event from `handle` until it sits in the
//! recipient's outbox.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parley_core::{EventRouter, InMemoryStore, PersistenceSink};
use parley_protocol::{ChatMessage, ClientEvent, ConnectionId, ServerEvent};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::Receiver;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn join(
    rt: &Runtime,
    router: &EventRouter,
    name: &str,
) -> (ConnectionId, Receiver<Arc<ServerEvent>>) {
    let (id, mut inbox) = router.connect().unwrap();
    rt.block_on(router.handle(&id, ClientEvent::join(name)))
        .unwrap();
    while inbox.try_recv().is_ok() {}
    (id, inbox)
}

/// Benchmark room message delivery latency.
fn bench_message_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("message_latency");

    group.bench_function("single_recipient", |b| {
        let router = EventRouter::new();
        let (alice, mut alice_inbox) = join(&rt, &router, "alice");
        let (_bob, mut bob_inbox) = join(&rt, &router, "bob");
        while alice_inbox.try_recv().is_ok() {}

        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                rt.block_on(router.handle(&alice, ClientEvent::send("ping")))
                    .unwrap();
                black_box(bob_inbox.try_recv().ok());
                while alice_inbox.try_recv().is_ok() {}
            }
            start.elapsed()
        });
    });

    group.bench_function("in_memory_store", |b| {
        let router = EventRouter::new().with_store(Arc::new(InMemoryStore::new()));
        let (alice, mut alice_inbox) = join(&rt, &router, "alice");

        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                rt.block_on(router.handle(&alice, ClientEvent::send("stored")))
                    .unwrap();
                while alice_inbox.try_recv().is_ok() {}
            }
            start.elapsed()
        });
    });

    group.bench_function("private_message", |b| {
        let router = EventRouter::new();
        let (alice, mut alice_inbox) = join(&rt, &router, "alice");
        let (bob, mut bob_inbox) = join(&rt, &router, "bob");
        while alice_inbox.try_recv().is_ok() {}

        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                rt.block_on(router.handle(&alice, ClientEvent::private(bob.clone(), "psst")))
                    .unwrap();
                black_box(bob_inbox.try_recv().ok());
                while alice_inbox.try_recv().is_ok() {}
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark history paging against a large room.
fn bench_history(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("history");

    let store = Arc::new(InMemoryStore::new());
    rt.block_on(async {
        for ts in 1..=10_000u64 {
            let message =
                ChatMessage::to_room("bob", "conn_1".into(), "general", "backlog", ts);
            store.write_message(&message).await.unwrap();
        }
    });
    let router = EventRouter::new().with_store(store);

    group.bench_function("latest_page", |b| {
        b.iter(|| rt.block_on(router.history_page(black_box("general"), None, 50)));
    });

    group.bench_function("page_before_cursor", |b| {
        b.iter(|| rt.block_on(router.history_page(black_box("general"), Some(5_000), 50)));
    });

    group.finish();
}

criterion_group!(benches, bench_message_latency, bench_history);
criterion_main!(benches);
