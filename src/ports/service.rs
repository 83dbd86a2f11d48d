//! Managed Service Port - Supervisor Lifecycle Contract
//!
//! The minimal contract every supervised unit satisfies: start, stop, a
//! liveness probe, and optional health/stats reporting. Concrete pollers,
//! streams and managers are registered polymorphically through it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::ServiceKind;

/// Liveness reported by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
  /// The probe itself proved liveness just now.
  Alive,
  /// The service's own last activity (self-reported heartbeat); the
  /// supervisor applies its staleness timeout to it.
  LastSeen(DateTime<Utc>),
}

/// Trait for supervised services.
///
/// `start`/`stop` must be callable repeatedly in alternation so the
/// supervisor can restart the unit; `stop` must be idempotent.
#[async_trait]
pub trait ManagedService: Send + Sync + 'static {
  /// Unique service name.
  fn name(&self) -> &str;

  /// Service kind, for reporting.
  fn kind(&self) -> ServiceKind;

  /// Start the service.
  async fn start(&self) -> anyhow::Result<()>;

  /// Stop the service and release its tasks and connections.
  async fn stop(&self) -> anyhow::Result<()>;

  /// Liveness probe invoked by the supervisor's monitor loop.
  async fn heartbeat(&self) -> anyhow::Result<Heartbeat>;

  /// Cheap synchronous health flag.
  fn is_healthy(&self) -> bool {
    true
  }

  /// Serializable stats for status records.
  fn stats(&self) -> Value {
    Value::Null
  }
}
