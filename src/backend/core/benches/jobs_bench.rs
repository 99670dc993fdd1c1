//! Benchmarks for batch aggregation, idempotency keys and the token bucket.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;

use relist_core::jobs::{idempotency_key, ActionCode, BatchProgress, JobInput, JobStatus, Marketplace};
use relist_core::ratelimit::TokenBucketLimiter;

fn statuses(n: usize) -> Vec<JobStatus> {
    const MIX: [JobStatus; 6] = [
        JobStatus::Completed,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Running,
        JobStatus::Pending,
        JobStatus::Expired,
    ];
    (0..n).map(|i| MIX[i % MIX.len()]).collect()
}

fn bench_batch_progress(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_progress");
    for size in [10, 100, 1_000, 10_000] {
        let input = statuses(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| black_box(BatchProgress::from_statuses(input.iter().copied())));
        });
    }
    group.finish();
}

fn bench_idempotency_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("idempotency_key");
    let small = JobInput::Delete { remote_id: "r-42".into() };
    let large = JobInput::Publish {
        listing: json!({
            "title": "Wool coat",
            "description": "x".repeat(2_000),
            "price": { "amount": 4900, "currency": "EUR" },
            "attributes": (0..50).map(|i| json!({ "id": i, "value": format!("v{}", i) })).collect::<Vec<_>>(),
        }),
        photos: (0..8).map(|i| format!("https://cdn.example.test/p/{}.jpg", i)).collect(),
    };

    group.bench_function("delete", |b| {
        b.iter(|| black_box(idempotency_key(Marketplace::Vinted, ActionCode::Delete, Some(42), &small)))
    });
    group.bench_function("publish", |b| {
        b.iter(|| black_box(idempotency_key(Marketplace::Vinted, ActionCode::Publish, Some(42), &large)))
    });
    group.finish();
}

fn bench_token_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_bucket");
    group.bench_function("try_acquire_available", |b| {
        let bucket = TokenBucketLimiter::new(u32::MAX, u32::MAX, Duration::from_secs(1)).unwrap();
        b.iter(|| black_box(bucket.try_acquire()));
    });
    group.bench_function("try_acquire_exhausted", |b| {
        let bucket = TokenBucketLimiter::new(1, 1, Duration::from_secs(3600)).unwrap();
        bucket.try_acquire();
        b.iter(|| black_box(bucket.try_acquire()));
    });
    group.finish();
}

criterion_group!(benches, bench_batch_progress, bench_idempotency_key, bench_token_bucket);
criterion_main!(benches);
