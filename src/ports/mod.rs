//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) the core requires from the outside
//! world. Adapters implement these traits; tests mock them.
//!
//! Port categories:
//! - `MarketDataClient`: exchange REST listings
//! - `RequestSigner`: outbound request authentication
//! - `RequestQuota`: outbound request budget
//! - `VersionedStore`: price persistence with history
//! - `StreamConnector` / `StreamConnection`: push-streaming transport
//! - `ManagedService`: supervisor lifecycle contract
//! - `StatusRepository` / `StatusSource`: status reporting

pub mod market_data;
pub mod quota;
pub mod service;
pub mod signer;
pub mod status;
pub mod store;
pub mod transport;
