//! Benchmarks for the admission hot path
//!
//! This benchmark measures:
//! - `acquire` on one hot key and across many keys
//! - key routing through the hash ring
//! - cache hits through `MultiTierCache::get`

use ai_lib_resilience::cache::{CacheConfig, MultiTierCache};
use ai_lib_resilience::resilience::rate_limiter::{RateLimiterConfig, ShardedRateLimiter};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

fn limiter(shards: usize) -> ShardedRateLimiter {
    ShardedRateLimiter::new(
        RateLimiterConfig::new()
            .with_capacity(1e12)
            .with_refill_rate(1e9)
            .with_shards(shards),
    )
    .expect("valid limiter config")
}

fn bench_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire");
    group.throughput(Throughput::Elements(1));

    for shards in [1usize, 4, 16] {
        let l = limiter(shards);
        group.bench_with_input(BenchmarkId::new("hot_key", shards), &l, |b, l| {
            b.iter(|| black_box(l.acquire(black_box("user-1"), 1)))
        });
    }

    let l = limiter(16);
    let keys: Vec<String> = (0..1024).map(|i| format!("user-{}", i)).collect();
    group.bench_function("spread_keys", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) & 1023;
            black_box(l.acquire(&keys[i], 1))
        })
    });
    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let l = limiter(16);
    c.bench_function("route", |b| b.iter(|| black_box(l.route(black_box("tenant-7:user-99")))));
}

fn bench_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let cache = MultiTierCache::in_memory(CacheConfig::new()).expect("valid cache config");
    rt.block_on(async {
        cache
            .set("hot", &"value".to_string(), Duration::from_secs(3600), &[])
            .await
            .expect("set");
    });

    c.bench_function("cache_l1_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let v: String = cache
                .get("hot", || async { Ok("loaded".to_string()) }, Duration::from_secs(3600))
                .await
                .expect("get");
            black_box(v)
        })
    });
}

criterion_group!(benches, bench_acquire, bench_routing, bench_cache_hit);
criterion_main!(benches);
