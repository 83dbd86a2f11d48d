//! Domain layer - Market data types and pure algorithms.
//!
//! No I/O here (hexagonal architecture inner ring): prices, token bucket
//! arithmetic, backoff policy and lifecycle/status vocabulary. Everything
//! is testable in isolation.

pub mod backoff;
pub mod lifecycle;
pub mod price;
pub mod token_bucket;

// Re-export core types for convenience
pub use backoff::ExponentialBackoff;
pub use lifecycle::{
    ConnectionState, LifecycleError, LifecycleState, ServiceKind, ServiceRuntimeState,
    ServiceStatus,
};
pub use price::{PriceRecord, PriceSource, RecordError, Ticker};
pub use token_bucket::TokenBucket;
