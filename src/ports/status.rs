//! Status Port - Cross-Process Service Status
//!
//! The supervisor periodically writes one status record per service so
//! a separate process (CLI, dashboard) can observe it without shared
//! memory. Status sources expose the live map to in-process readers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{ServiceRuntimeState, ServiceStatus};

/// Persisted status of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatusRecord {
  /// Host the supervisor runs on.
  pub host_id: String,
  /// Service name.
  pub service_name: String,
  /// Supervisor process id.
  pub pid: u32,
  /// Supervisor run identifier (changes on every process start).
  pub run_id: Uuid,
  /// Current status.
  pub status: ServiceStatus,
  /// Last successful liveness signal.
  pub heartbeat: Option<DateTime<Utc>>,
  /// Failed checks since the last healthy one.
  pub consecutive_failures: u32,
  /// Service-specific stats.
  pub stats: Value,
  /// When the record was written.
  pub written_at: DateTime<Utc>,
}

/// Trait for status record persistence.
#[async_trait]
pub trait StatusRepository: Send + Sync + 'static {
  /// Replace the record for `record.service_name`.
  async fn write(&self, record: &ServiceStatusRecord) -> anyhow::Result<()>;

  /// Load every stored record.
  async fn read_all(&self) -> anyhow::Result<Vec<ServiceStatusRecord>>;
}

/// In-process source of the live status map.
pub trait StatusSource: Send + Sync + 'static {
  /// Snapshot of every service's runtime state.
  fn service_status(&self) -> BTreeMap<String, ServiceRuntimeState>;

  /// Service-specific stats, keyed by service name.
  fn service_stats(&self) -> BTreeMap<String, Value> {
    BTreeMap::new()
  }
}
