//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (HTTP, WebSockets, file I/O). Each sub-module
//! groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `api`: exchange REST client and HMAC request signing
//! - `feeds`: exchange WebSocket streaming transport
//! - `metrics`: Prometheus metrics export and health checks
//! - `persistence`: JSONL price history and status records

pub mod api;
pub mod feeds;
pub mod metrics;
pub mod persistence;
