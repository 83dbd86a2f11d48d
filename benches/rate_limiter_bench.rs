//! Rate Limiter Benchmarks - Hot-Path Performance Validation
//!
//! Every outbound request and stream connect passes through the limiter,
//! so the non-blocking path and the merge path must stay cheap.
//!
//! Run with: cargo bench --bench rate_limiter_bench

use std::time::Instant;

use chrono::{TimeDelta, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rust_decimal_macros::dec;

use prediction_market_sync::domain::{PriceRecord, PriceSource, TokenBucket};
use prediction_market_sync::usecases::hybrid::PriceBook;
use prediction_market_sync::usecases::rate_limiter::RateLimiter;

/// Benchmark `try_acquire` on a limiter that never runs dry.
fn bench_try_acquire(c: &mut Criterion) {
    let limiter = RateLimiter::new("bench", 1_000_000, 1_000_000_000.0);

    c.bench_function("rate_limiter_try_acquire", |b| {
        b.iter(|| black_box(limiter.try_acquire()));
    });
}

/// Benchmark `try_acquire` on an exhausted limiter (rejection path).
fn bench_try_acquire_rejected(c: &mut Criterion) {
    let limiter = RateLimiter::new("bench", 0, 0.0);

    c.bench_function("rate_limiter_try_acquire_rejected", |b| {
        b.iter(|| black_box(limiter.try_acquire()));
    });
}

/// Benchmark raw bucket arithmetic without the lock.
fn bench_bucket_try_take(c: &mut Criterion) {
    let mut bucket = TokenBucket::new(1_000_000, 1_000_000_000.0, Instant::now());

    c.bench_function("token_bucket_try_take", |b| {
        b.iter(|| black_box(bucket.try_take(Instant::now())));
    });
}

/// Benchmark a freshest-wins merge into a warm cache.
fn bench_price_merge(c: &mut Criterion) {
    let book = PriceBook::new();
    let base = Utc::now();
    for i in 0..500 {
        book.merge(&PriceRecord::new(format!("MKT-{i}"), dec!(0.50), base, PriceSource::Rest));
    }
    let mut step = 0i64;

    c.bench_function("price_book_merge", |b| {
        b.iter(|| {
            step += 1;
            let record = PriceRecord::new(
                "MKT-250",
                dec!(0.51),
                base + TimeDelta::microseconds(step),
                PriceSource::Stream,
            );
            black_box(book.merge(&record))
        });
    });
}

criterion_group!(
    benches,
    bench_try_acquire,
    bench_try_acquire_rejected,
    bench_bucket_try_take,
    bench_price_merge,
);
criterion_main!(benches);
