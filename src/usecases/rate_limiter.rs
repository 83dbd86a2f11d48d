//! Rate Limiter - Shared Token Bucket for Outbound Requests
//!
//! Wraps the domain `TokenBucket` in one mutex. Refill is lazy (computed
//! from elapsed time on each call), so there is no background timer.
//! Blocking acquisition sleeps outside the lock until the bucket can
//! grant a token.
//!
//! One instance is constructed at startup and injected into both the
//! REST client (as its `RequestQuota`) and the streaming handler, or one
//! each, per config.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::domain::TokenBucket;
use crate::ports::quota::RequestQuota;

/// Thread-safe token bucket rate limiter.
pub struct RateLimiter {
  /// Name for logging.
  name: String,
  /// Bucket state; every mutation happens under this lock.
  bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
  /// Create a full limiter.
  pub fn new(name: impl Into<String>, capacity: u32, refill_per_second: f64) -> Self {
    Self {
      name: name.into(),
      bucket: Mutex::new(TokenBucket::new(capacity, refill_per_second, now())),
    }
  }

  /// Create a limiter from config.
  pub fn from_config(name: impl Into<String>, config: &RateLimitConfig) -> Self {
    Self::new(name, config.capacity, config.refill_per_second)
  }

  /// Lock the bucket, recovering from poison.
  ///
  /// Bucket arithmetic cannot leave the state half-updated, so a panic in
  /// another holder is not a reason to stop limiting.
  fn lock(&self) -> MutexGuard<'_, TokenBucket> {
    self.bucket.lock().unwrap_or_else(|poisoned| {
      warn!(limiter = %self.name, "Rate limiter mutex was poisoned, recovering");
      poisoned.into_inner()
    })
  }

  /// Take one token.
  ///
  /// With `block = false` returns immediately. With `block = true` waits
  /// until refill grants a token; returns `false` only if no token can
  /// ever become available (zero capacity, or drained with zero refill).
  pub async fn acquire(&self, block: bool) -> bool {
    if !block {
      return self.try_acquire();
    }

    loop {
      let wait = {
        let mut bucket = self.lock();
        let now = now();
        if bucket.try_take(now) {
          return true;
        }
        bucket.time_until_available(now)
      };

      match wait {
        Some(delay) => {
          debug!(
            limiter = %self.name,
            wait_ms = delay.as_millis() as u64,
            "Rate limited, waiting for refill"
          );
          // Floor avoids a hot loop when float rounding leaves the bucket
          // a hair short of one token.
          tokio::time::sleep(delay.max(Duration::from_micros(100))).await;
        }
        None => {
          warn!(limiter = %self.name, "Rate limiter can never grant a token");
          return false;
        }
      }
    }
  }

  /// Blocking acquire bounded by `timeout`.
  pub async fn acquire_timeout(&self, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, self.acquire(true))
      .await
      .unwrap_or(false)
  }

  /// Non-blocking acquire.
  pub fn try_acquire(&self) -> bool {
    self.lock().try_take(now())
  }

  /// Non-consuming estimate of available tokens.
  pub fn available_tokens(&self) -> f64 {
    self.lock().available(now())
  }

  /// Bucket capacity.
  pub fn capacity(&self) -> f64 {
    self.lock().capacity()
  }

  /// Limiter name.
  pub fn name(&self) -> &str {
    &self.name
  }
}

#[async_trait]
impl RequestQuota for RateLimiter {
  async fn acquire(&self) -> bool {
    RateLimiter::acquire(self, true).await
  }

  fn name(&self) -> &str {
    &self.name
  }
}

/// Current time on tokio's clock, so paused-time tests control refill.
fn now() -> Instant {
  tokio::time::Instant::now().into_std()
}
