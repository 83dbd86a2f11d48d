//! Token Bucket - Lazy-Refill Rate Limit Arithmetic
//!
//! Pure bucket math with the clock passed in, so the lock-holding
//! `RateLimiter` and the property tests share one implementation.
//! Refill is computed from elapsed time on every access; there is no
//! background timer.

use std::time::{Duration, Instant};

/// Token bucket state.
///
/// Invariant: `0 <= tokens <= capacity` after every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum number of tokens (burst size).
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Tokens currently available.
    tokens: f64,
    /// Last time `tokens` was brought up to date.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// Negative or non-finite refill rates are treated as zero.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let refill_rate = if refill_rate.is_finite() && refill_rate > 0.0 {
            refill_rate
        } else {
            0.0
        };
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Bring `tokens` up to date. A clock that moved backwards adds nothing.
    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Non-consuming estimate of available tokens.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// How long until one token is available.
    ///
    /// `None` when no token can ever become available (zero capacity, or
    /// drained with a zero refill rate).
    pub fn time_until_available(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.capacity < 1.0 || self.refill_rate <= 0.0 {
            return None;
        }
        let needed = 1.0 - self.tokens;
        Some(Duration::from_secs_f64(needed / self.refill_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_bucket_drains_to_zero() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(5, 5.0, t0);
        for _ in 0..5 {
            assert!(bucket.try_take(t0));
        }
        assert!(!bucket.try_take(t0));
        assert!(bucket.available(t0) < 1.0);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(3, 10.0, t0);
        assert!(bucket.try_take(t0));
        let later = t0 + Duration::from_secs(60);
        assert!((bucket.available(later) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_refill_after_one_second() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(5, 5.0, t0);
        for _ in 0..5 {
            bucket.try_take(t0);
        }
        assert!(bucket.try_take(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_capacity_always_denies() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(0, 100.0, t0);
        assert!(!bucket.try_take(t0 + Duration::from_secs(10)));
        assert_eq!(bucket.time_until_available(t0), None);
    }

    #[test]
    fn test_zero_refill_never_replenishes() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(2, 0.0, t0);
        assert!(bucket.try_take(t0));
        assert!(bucket.try_take(t0));
        assert!(!bucket.try_take(t0 + Duration::from_secs(3600)));
        assert_eq!(bucket.time_until_available(t0), None);
    }

    #[test]
    fn test_negative_rate_is_clamped() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new(1, -4.0, t0);
        assert!(bucket.refill_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_time_until_available_matches_rate() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1, 2.0, t0);
        assert!(bucket.try_take(t0));
        let wait = bucket.time_until_available(t0).unwrap();
        assert_eq!(wait.as_millis(), 500);
    }
}
