//! Use Cases Layer - Market Data Acquisition and Supervision
//!
//! Orchestrates domain logic with port interfaces to keep market prices
//! fresh and the services producing them alive.
//!
//! Use cases:
//! - `RateLimiter`: Token bucket shared by outbound request paths
//! - `ScheduledPoller`: Fixed-interval runner for any `PollWork`
//! - `MarketPoller`: REST listings -> versioned store
//! - `StreamingHandler`: Push connection with reconnect and fan-out
//! - `HybridMarketData`: REST + stream merged by freshest observation
//! - `Supervisor`: Health checks, restart backoff, circuit breaker

pub mod hybrid;
pub mod market_poller;
pub mod poller;
pub mod rate_limiter;
pub mod streaming;
pub mod supervisor;

use std::any::Any;
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Every mutex in this layer protects plain counters or maps that are
/// never left half-written.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| {
    warn!("Mutex was poisoned, recovering");
    poisoned.into_inner()
  })
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  payload
    .downcast_ref::<&str>()
    .map(|s| (*s).to_string())
    .or_else(|| payload.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown panic".to_string())
}
