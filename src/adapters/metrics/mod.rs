//! Metrics and Monitoring Adapters
//!
//! Prometheus gauges refreshed from supervisor snapshots, served with
//! /live, /ready and /status by one axum 0.7 server.

pub mod health;
pub mod prometheus;

pub use health::{HealthServer, HealthState};
pub use prometheus::MetricsRegistry;
