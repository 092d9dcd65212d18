//! Benchmarks for the hot paths of the sync core
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use confluence_core::clock::VectorClock;
use confluence_core::conflict::{ConflictResolver, EntityUpdate};
use confluence_core::error::Result;
use confluence_core::events::{System, UnifiedEvent};
use confluence_core::resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimitConfig, SlidingWindowRateLimiter};
use serde_json::json;

fn bench_circuit_breaker(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());

    let mut group = c.benchmark_group("circuit_breaker");
    group.throughput(Throughput::Elements(1));
    group.bench_function("closed_call", |b| {
        b.to_async(&rt).iter(|| async {
            let result: Result<u64> = breaker.call(|| async { Ok(black_box(7)) }).await;
            result
        });
    });
    group.bench_function("try_acquire", |b| {
        b.iter(|| {
            let admitted = breaker.try_acquire();
            breaker.record_success();
            black_box(admitted)
        });
    });
    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    for identifiers in [1usize, 100, 10_000].iter() {
        let limiter = SlidingWindowRateLimiter::new(
            "bench",
            RateLimitConfig::new(u64::MAX / 2, Duration::from_secs(60)),
        );
        let keys: Vec<String> = (0..*identifiers).map(|i| format!("producer-{}", i)).collect();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("is_allowed", identifiers), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(limiter.is_allowed(&keys[i]))
            });
        });
    }
    group.finish();
}

fn bench_vector_clock(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_clock");

    for nodes in [2usize, 8, 32].iter() {
        let a = VectorClock::from_entries((0..*nodes).map(|n| (format!("node-{}", n), n as u64 + 1)));
        let b_clock = VectorClock::from_entries((0..*nodes).map(|n| (format!("node-{}", n), (*nodes - n) as u64)));

        group.bench_with_input(BenchmarkId::new("compare", nodes), &(a.clone(), b_clock.clone()), |b, (x, y)| {
            b.iter(|| black_box(x.compare(y)));
        });
        group.bench_with_input(BenchmarkId::new("merged", nodes), &(a, b_clock), |b, (x, y)| {
            b.iter(|| black_box(x.merged(y)));
        });
    }
    group.finish();
}

fn bench_conflict_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflict_resolver");

    let update = |source: System, node: &str, entity: usize, name: &str| {
        let event = UnifiedEvent::new(
            "USER_UPDATED",
            source,
            json!({
                "entityType": "user",
                "entityId": format!("u-{}", entity),
                "changes": {"name": name, "tier": "gold"},
            }),
        )
        .with_vector_clock(VectorClock::from_entries([(node.to_string(), 1)]));
        EntityUpdate::from_event(&event).ok().flatten()
    };

    group.bench_function("concurrent_pair", |b| {
        let mut entity = 0;
        b.iter_batched(
            || {
                entity += 1;
                (
                    ConflictResolver::default(),
                    update(System::Legacy, "legacy", entity, "Alice"),
                    update(System::Backend, "backend", entity, "Alicia"),
                )
            },
            |(resolver, first, second)| {
                if let (Some(first), Some(second)) = (first, second) {
                    resolver.process(first);
                    black_box(resolver.process(second));
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_circuit_breaker,
    bench_rate_limiter,
    bench_vector_clock,
    bench_conflict_resolution
);

criterion_main!(benches);
