//! Lifecycle and Status Types
//!
//! Shared state vocabulary for pollers, the streaming connection and the
//! service supervisor. Everything here is serializable so status maps can
//! be exported to dashboards and the cross-process status record as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Poller lifecycle. `Stopped` is terminal per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Started,
    Stopped,
}

/// Lifecycle contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("`{0}` is already started")]
    AlreadyStarted(String),
    #[error("`{0}` was stopped and cannot be restarted")]
    AlreadyStopped(String),
}

/// Streaming connection state machine.
///
/// DISCONNECTED -> CONNECTING -> CONNECTED -> (drop) RECONNECTING ->
/// CONNECTING | FAILED. `Failed` is reached only once reconnect attempts
/// are exhausted or auto-reconnect is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Kind of managed unit, for reporting only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Scheduled REST poller against the exchange.
    ExchangePoller,
    /// Persistent streaming connection.
    MarketStream,
    /// Combined REST + stream manager.
    HybridMarketData,
    /// Anything else (game data, future sources).
    Other(String),
}

/// Supervisor-visible status of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Registered, never started.
    Registered,
    /// `start()` in progress.
    Starting,
    /// Started and passing health checks.
    Running,
    /// Waiting out the restart backoff, or restarting.
    Restarting,
    /// Last start or probe failed; will be counted on the next check.
    Crashed,
    /// Stopped on request.
    Stopped,
    /// Circuit open: failure ceiling reached, no further auto-restart.
    Failed,
}

impl ServiceStatus {
    /// Numeric code for gauges.
    pub fn code(self) -> i64 {
        match self {
            Self::Registered => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Restarting => 3,
            Self::Crashed => 4,
            Self::Stopped => 5,
            Self::Failed => 6,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Runtime state the supervisor keeps for each service.
///
/// Owned and mutated only by the supervisor; exposed as snapshot copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRuntimeState {
    /// Current status.
    pub status: ServiceStatus,
    /// Kind reported by the service.
    pub kind: ServiceKind,
    /// When the current instance was started.
    pub started_at: Option<DateTime<Utc>>,
    /// Last successful liveness signal.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Failed checks since the last fully healthy one.
    pub consecutive_failures: u32,
    /// Backoff applied before the pending or last restart.
    pub restart_backoff_seconds: u64,
    /// Restarts performed since registration.
    pub restarts: u32,
    /// Most recent failure description.
    pub last_error: Option<String>,
}

impl ServiceRuntimeState {
    /// Fresh state for a newly registered service.
    pub fn registered(kind: ServiceKind) -> Self {
        Self {
            status: ServiceStatus::Registered,
            kind,
            started_at: None,
            last_heartbeat: None,
            consecutive_failures: 0,
            restart_backoff_seconds: 0,
            restarts: 0,
            last_error: None,
        }
    }
}
