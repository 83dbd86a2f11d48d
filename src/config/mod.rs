//! Configuration Module - TOML-based Service Configuration
//!
//! Loads and validates configuration from `config.toml`. Credentials,
//! endpoints, intervals and restart policy all live here and are passed
//! into constructors explicitly - no component reads the environment.

pub mod loader;

use std::time::Duration;

use serde::Deserialize;

use crate::domain::ExponentialBackoff;

/// Top-level service configuration.
///
/// Loaded from `config.toml` at startup and validated before any
/// component is constructed.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Process identity and logging.
  pub service: ServiceConfig,
  /// Exchange endpoints.
  pub api: ApiConfig,
  /// Request-signing credentials.
  #[serde(default)]
  pub credentials: CredentialsConfig,
  /// Outbound request quota.
  #[serde(default)]
  pub rate_limits: RateLimitConfig,
  /// REST polling.
  pub poller: PollerConfig,
  /// Streaming connection.
  #[serde(default)]
  pub stream: StreamConfig,
  /// Restart and health-check policy.
  #[serde(default)]
  pub supervisor: SupervisorConfig,
  /// Price history and status records.
  #[serde(default)]
  pub persistence: PersistenceConfig,
  /// Health and metrics endpoint.
  #[serde(default)]
  pub metrics: MetricsConfig,
}

/// Process identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Human-readable deployment name.
  pub name: String,
  /// Host identifier written into status records.
  #[serde(default = "default_host_id")]
  pub host_id: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
}

/// Exchange endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// REST API base URL.
  pub rest_base_url: String,
  /// Streaming WebSocket URL.
  pub ws_url: String,
  /// Path signed when authenticating the stream.
  #[serde(default = "default_ws_path")]
  pub ws_path: String,
  /// Request timeout in milliseconds.
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  /// Maximum retries on transient HTTP errors.
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Base delay for retry backoff in milliseconds.
  #[serde(default = "default_retry_base_delay_ms")]
  pub retry_base_delay_ms: u64,
}

/// Request-signing credentials.
///
/// Empty fields may be filled from the environment by the loader, once,
/// at startup.
#[derive(Clone, Default, Deserialize)]
pub struct CredentialsConfig {
  /// API key identifier sent in headers.
  #[serde(default)]
  pub api_key: String,
  /// Shared secret used for HMAC signing (never sent).
  #[serde(default)]
  pub api_secret: String,
}

impl std::fmt::Debug for CredentialsConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CredentialsConfig")
      .field("api_key", &self.api_key)
      .field("api_secret", &"<redacted>")
      .finish()
  }
}

/// Token bucket configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
  /// Burst capacity in requests.
  #[serde(default = "default_capacity")]
  pub capacity: u32,
  /// Sustained requests per second.
  #[serde(default = "default_refill_per_second")]
  pub refill_per_second: f64,
  /// One limiter shared by REST and stream (true) or one each (false).
  #[serde(default = "default_true")]
  pub shared: bool,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      capacity: default_capacity(),
      refill_per_second: default_refill_per_second(),
      shared: true,
    }
  }
}

/// REST polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
  /// Seconds between scheduled polls.
  #[serde(default = "default_poll_interval")]
  pub interval_secs: u64,
  /// Shortened interval while the stream is not connected (off if unset).
  #[serde(default)]
  pub disconnected_interval_secs: Option<u64>,
  /// Ticker groups fetched on each poll.
  #[serde(default)]
  pub groups: Vec<PollerGroupConfig>,
}

impl PollerConfig {
  /// Scheduled poll interval.
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  /// Optional fallback cadence while disconnected.
  pub fn disconnected_interval(&self) -> Option<Duration> {
    self.disconnected_interval_secs.map(Duration::from_secs)
  }
}

/// One group of series fetched with a single listings request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollerGroupConfig {
  /// Group label used in logs and as default series id.
  pub name: String,
  /// Series identifiers passed to the listings endpoint.
  pub series_ids: Vec<String>,
}

/// Streaming connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
  /// Run the streaming connection at all.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Reconnect after an unexpected drop.
  #[serde(default = "default_true")]
  pub auto_reconnect: bool,
  /// Reconnect attempts before FAILED (unbounded if unset).
  #[serde(default)]
  pub max_reconnect_attempts: Option<u32>,
  /// First reconnect delay in milliseconds.
  #[serde(default = "default_reconnect_initial_ms")]
  pub reconnect_initial_ms: u64,
  /// Reconnect delay ceiling in milliseconds.
  #[serde(default = "default_reconnect_max_ms")]
  pub reconnect_max_ms: u64,
  /// Tickers subscribed at startup.
  #[serde(default)]
  pub tracked_tickers: Vec<String>,
  /// Subscribe tickers first seen by the REST poller.
  #[serde(default)]
  pub track_discovered: bool,
}

impl StreamConfig {
  /// Reconnect backoff policy.
  pub fn backoff(&self) -> ExponentialBackoff {
    ExponentialBackoff::new(
      Duration::from_millis(self.reconnect_initial_ms),
      Duration::from_millis(self.reconnect_max_ms),
      self.max_reconnect_attempts,
    )
  }
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      auto_reconnect: true,
      max_reconnect_attempts: None,
      reconnect_initial_ms: default_reconnect_initial_ms(),
      reconnect_max_ms: default_reconnect_max_ms(),
      tracked_tickers: Vec::new(),
      track_discovered: false,
    }
  }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
  /// Seconds between monitor passes.
  #[serde(default = "default_monitor_interval")]
  pub monitor_interval_secs: u64,
  /// Heartbeat age after which a service counts as stale.
  #[serde(default = "default_heartbeat_timeout")]
  pub heartbeat_timeout_secs: u64,
  /// Upper bound on one health probe.
  #[serde(default = "default_probe_timeout")]
  pub probe_timeout_secs: u64,
  /// Consecutive failures that open the circuit.
  #[serde(default = "default_max_failures")]
  pub max_consecutive_failures: u32,
  /// First restart backoff in seconds.
  #[serde(default = "default_restart_base")]
  pub restart_backoff_base_secs: u64,
  /// Restart backoff ceiling in seconds.
  #[serde(default = "default_restart_max")]
  pub restart_backoff_max_secs: u64,
  /// Upper bound on one `start()` call.
  #[serde(default = "default_start_timeout")]
  pub start_timeout_secs: u64,
  /// Upper bound on one `stop()` call.
  #[serde(default = "default_stop_timeout")]
  pub stop_timeout_secs: u64,
}

impl Default for SupervisorConfig {
  fn default() -> Self {
    Self {
      monitor_interval_secs: default_monitor_interval(),
      heartbeat_timeout_secs: default_heartbeat_timeout(),
      probe_timeout_secs: default_probe_timeout(),
      max_consecutive_failures: default_max_failures(),
      restart_backoff_base_secs: default_restart_base(),
      restart_backoff_max_secs: default_restart_max(),
      start_timeout_secs: default_start_timeout(),
      stop_timeout_secs: default_stop_timeout(),
    }
  }
}

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
  /// Directory for price history and status records.
  #[serde(default = "default_data_dir")]
  pub data_dir: String,
  /// Seconds between status record writes.
  #[serde(default = "default_status_interval")]
  pub status_interval_secs: u64,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      data_dir: default_data_dir(),
      status_interval_secs: default_status_interval(),
    }
  }
}

/// Metrics and health endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Serve /live, /ready, /status and /metrics.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Bind address for the endpoint.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
    }
  }
}

// Default value functions for serde

fn default_host_id() -> String {
  "localhost".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_ws_path() -> String {
  "/trade-api/ws/v2".to_string()
}

fn default_timeout_ms() -> u64 {
  10_000
}

fn default_max_retries() -> u32 {
  3
}

fn default_retry_base_delay_ms() -> u64 {
  200
}

fn default_true() -> bool {
  true
}

fn default_capacity() -> u32 {
  10
}

fn default_refill_per_second() -> f64 {
  10.0
}

fn default_poll_interval() -> u64 {
  30
}

fn default_reconnect_initial_ms() -> u64 {
  1_000
}

fn default_reconnect_max_ms() -> u64 {
  60_000
}

fn default_monitor_interval() -> u64 {
  10
}

fn default_heartbeat_timeout() -> u64 {
  120
}

fn default_probe_timeout() -> u64 {
  5
}

fn default_max_failures() -> u32 {
  5
}

fn default_restart_base() -> u64 {
  2
}

fn default_restart_max() -> u64 {
  300
}

fn default_start_timeout() -> u64 {
  30
}

fn default_stop_timeout() -> u64 {
  10
}

fn default_data_dir() -> String {
  "data".to_string()
}

fn default_status_interval() -> u64 {
  15
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}
