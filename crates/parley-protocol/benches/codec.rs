//! Codec benchmarks for parley-protocol.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, WireMessage};

fn bench_encode_chat(c: &mut Criterion) {
    let message = WireMessage::chat("general", "alice", "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("chat_64B", |b| b.iter(|| codec::encode(black_box(&message))));
    group.finish();
}

fn bench_decode_chat(c: &mut Criterion) {
    let encoded = codec::encode(&WireMessage::chat("general", "alice", "x".repeat(64))).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("chat_64B", |b| {
        b.iter(|| codec::decode_bounded(black_box(&encoded), codec::DEFAULT_MAX_MESSAGE_SIZE))
    });
    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let encoded: Vec<Bytes> = (0..32)
        .map(|i| codec::encode(&WireMessage::chat("general", "alice", format!("line {}", i))).unwrap())
        .collect();

    c.bench_function("batch_32", |b| b.iter(|| codec::encode_batch(black_box(&encoded))));
}

criterion_group!(benches, bench_encode_chat, bench_decode_chat, bench_batch);
criterion_main!(benches);
