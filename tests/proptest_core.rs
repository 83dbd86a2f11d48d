//! Property-Based Tests - Core Invariants
//!
//! Uses `proptest` to check the token-bucket grant bound and that the
//! freshest-wins price merge does not depend on arrival order.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;

use prediction_market_sync::domain::{PriceRecord, PriceSource, TokenBucket};
use prediction_market_sync::usecases::hybrid::PriceBook;

// ── Token Bucket Properties ─────────────────────────────────

proptest! {
    /// Over any window, grants never exceed capacity + rate * elapsed.
    #[test]
    fn bucket_grants_bounded_by_capacity_plus_refill(
        capacity in 0u32..20,
        rate in 0.0f64..50.0,
        mut offsets_ms in prop::collection::vec(0u64..5_000, 1..200),
    ) {
        offsets_ms.sort_unstable();
        let start = Instant::now();
        let mut bucket = TokenBucket::new(capacity, rate, start);

        let mut granted = 0u64;
        for offset in &offsets_ms {
            if bucket.try_take(start + Duration::from_millis(*offset)) {
                granted += 1;
            }
        }

        let elapsed = offsets_ms.last().copied().unwrap_or(0) as f64 / 1000.0;
        let bound = f64::from(capacity) + rate * elapsed;
        prop_assert!(
            granted as f64 <= bound + 1e-9,
            "granted {granted} > bound {bound}"
        );
    }

    /// Available tokens stay within [0, capacity].
    #[test]
    fn bucket_tokens_stay_in_range(
        capacity in 0u32..20,
        rate in 0.0f64..50.0,
        steps in prop::collection::vec((0u64..2_000, any::<bool>()), 1..100),
    ) {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(capacity, rate, start);
        let mut now = start;

        for (advance_ms, take) in steps {
            now += Duration::from_millis(advance_ms);
            if take {
                bucket.try_take(now);
            }
            let available = bucket.available(now);
            prop_assert!(available >= 0.0);
            prop_assert!(available <= f64::from(capacity) + 1e-9);
        }
    }
}

// ── Freshest-Wins Merge Properties ──────────────────────────

fn records(raw: &[(u8, u8, i64)]) -> Vec<PriceRecord> {
    let base = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
    let mut seen = HashSet::new();
    raw.iter()
        // One observation per (ticker, instant) so the winner is unique.
        .filter(|(ticker, _, ts)| seen.insert((*ticker, *ts)))
        .map(|(ticker, cents, ts)| {
            let source = if ts % 2 == 0 { PriceSource::Rest } else { PriceSource::Stream };
            PriceRecord::new(
                format!("MKT-{ticker}"),
                Decimal::new(i64::from(*cents), 2),
                base + TimeDelta::milliseconds(*ts),
                source,
            )
        })
        .collect()
}

fn merged(records: impl IntoIterator<Item = PriceRecord>) -> HashMap<String, PriceRecord> {
    let book = PriceBook::new();
    for record in records {
        book.merge(&record);
    }
    book.all()
}

proptest! {
    /// The cache ends with the max-timestamp record per ticker whatever
    /// the arrival order.
    #[test]
    fn merge_is_order_independent(
        raw in prop::collection::vec((0u8..4, 1u8..99, 0i64..10_000), 1..60),
        rotate in 0usize..60,
    ) {
        let records = records(&raw);

        let forward = merged(records.clone());
        let reversed = merged(records.iter().rev().cloned());
        let mut rotated_input = records.clone();
        rotated_input.rotate_left(rotate % records.len());
        let rotated = merged(rotated_input);

        prop_assert_eq!(&forward, &reversed);
        prop_assert_eq!(&forward, &rotated);

        for (ticker, winner) in &forward {
            let newest = records
                .iter()
                .filter(|r| &r.ticker == ticker)
                .map(|r| r.observed_at)
                .max()
                .unwrap();
            prop_assert_eq!(winner.observed_at, newest);
        }
    }
}
