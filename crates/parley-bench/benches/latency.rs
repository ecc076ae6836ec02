//! Latency benchmarks for Parley.
//!
//! These benchmarks focus on the per-message cost of presence-aware delivery.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use parley_core::hub::{Hub, HubConfig, Member};
use parley_core::presence::{self, Action};
use parley_core::queue::outbound_queue;
use parley_core::{
    route, ChatPipeline, DeliveryPolicy, MemberInfo, MemoryStore, PresenceService, PresenceStatus,
    SessionId, StatusAwareMessage, UserId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Recipients cycling through every status.
fn recipients(count: usize) -> (Vec<UserId>, HashMap<UserId, PresenceStatus>) {
    let statuses = [PresenceStatus::Online, PresenceStatus::Away, PresenceStatus::Busy];
    let ids: Vec<UserId> = (0..count).map(|i| format!("user-{}", i)).collect();
    let lookup = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), statuses[i % statuses.len()]))
        .collect();
    (ids, lookup)
}

/// Benchmark routing one message across a room.
fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");
    let rt = Runtime::new().unwrap();

    let policy = DeliveryPolicy::default();
    for sender in [PresenceStatus::Online, PresenceStatus::Busy] {
        let message = StatusAwareMessage::new(
            Some("sender".to_string()),
            "benchmark",
            "hello",
            sender,
            &policy,
        );
        for count in [10usize, 100, 1000] {
            let (ids, lookup) = recipients(count);
            let id = BenchmarkId::new(sender.as_str(), count);
            group.bench_with_input(id, &ids, |b, ids| {
                b.to_async(&rt)
                    .iter(|| route(black_box(&message), black_box(ids), &lookup));
            });
        }
    }

    group.finish();
}

/// Benchmark capability checks.
fn bench_capabilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("capabilities");

    group.bench_function("typed", |b| {
        b.iter(|| presence::can_perform(black_box(PresenceStatus::Busy), black_box(Action::SendMessages)))
    });

    group.bench_function("named", |b| {
        b.iter(|| presence::can_perform_named(black_box("busy"), black_box("send_messages")))
    });

    group.bench_function("named_unknown", |b| {
        b.iter(|| presence::can_perform_named(black_box("offline"), black_box("send_messages")))
    });

    group.finish();
}

/// Benchmark a chat line through the whole pipeline: presence check,
/// persistence, routing and broadcast.
fn bench_chat_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("chat_pipeline");
    let rt = Runtime::new().unwrap();

    for members in [2usize, 20] {
        let (pipeline, sender) = rt.block_on(async {
            let store = Arc::new(MemoryStore::with_rooms(["benchmark"]));
            let presence = PresenceService::new(store.clone());
            let hub = Hub::spawn(HubConfig::default());

            let mut first = None;
            for i in 0..members {
                let user_id = format!("user-{}", i);
                presence.ensure(&user_id).await.unwrap();
                let info = MemberInfo::new(
                    SessionId::from(format!("conn-{}", i)),
                    user_id.clone(),
                    "benchmark",
                    Some(user_id),
                );
                let (tx, mut queue) = outbound_queue(1024);
                hub.register(Member::new(info.clone(), tx)).await.unwrap();
                tokio::spawn(async move { while queue.recv().await.is_some() {} });
                first.get_or_insert(info);
            }

            let pipeline = ChatPipeline::new(store, presence, DeliveryPolicy::default(), hub);
            (Arc::new(pipeline), first.unwrap())
        });

        group.bench_with_input(BenchmarkId::from_parameter(members), &sender, |b, sender| {
            b.to_async(&rt).iter(|| {
                let pipeline = pipeline.clone();
                let sender = sender.clone();
                async move { pipeline.handle(&sender, "hello".to_string()).await.unwrap() }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_route, bench_capabilities, bench_chat_pipeline);
criterion_main!(benches);
