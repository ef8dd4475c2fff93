//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::codec::{self, Encoding};
use parley_protocol::{ChatMessage, ServerEvent};

fn message_event(body_len: usize) -> ServerEvent {
    let message = ChatMessage::to_room(
        "alice",
        "conn_1".into(),
        "general",
        "x".repeat(body_len),
        1_700_000_000_000,
    )
    .with_id("1700000000000-conn_1");
    ServerEvent::MessageReceived { message }
}

fn bench_encode_small(c: &mut Criterion) {
    let event = message_event(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("msgpack_64B", |b| b.iter(|| codec::encode(black_box(&event))));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode_as(Encoding::Json, black_box(&event)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let event = message_event(64);
    let encoded = codec::encode(&event).unwrap();
    let text = codec::encode_json(&event).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode::<ServerEvent>(black_box(&encoded)))
    });
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::decode_json::<ServerEvent>(black_box(&text)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let event = message_event(256);

    c.bench_function("roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode::<ServerEvent>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_roundtrip
);
criterion_main!(benches);
