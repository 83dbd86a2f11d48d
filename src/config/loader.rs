//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, filling missing credentials from the
//! environment (once, here, at startup), and validating every parameter
//! with clear error messages.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::AppConfig;

/// Environment variable consulted when `credentials.api_key` is empty.
pub const API_KEY_ENV: &str = "MARKET_SYNC_API_KEY";

/// Environment variable consulted when `credentials.api_secret` is empty.
pub const API_SECRET_ENV: &str = "MARKET_SYNC_API_SECRET";

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let mut config = parse_config(&content)?;
  fill_credentials_from_env(&mut config);

  info!(
    service = %config.service.name,
    groups = config.poller.groups.len(),
    tracked = config.stream.tracked_tickers.len(),
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig =
    toml::from_str(content).with_context(|| "Failed to parse config.toml")?;
  validate_config(&config)?;
  Ok(config)
}

fn fill_credentials_from_env(config: &mut AppConfig) {
  if config.credentials.api_key.is_empty() {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
      config.credentials.api_key = key;
    }
  }
  if config.credentials.api_secret.is_empty() {
    if let Ok(secret) = std::env::var(API_SECRET_ENV) {
      config.credentials.api_secret = secret;
    }
  }
}

/// Validate all configuration parameters.
fn validate_config(config: &AppConfig) -> Result<()> {
  anyhow::ensure!(
    !config.service.name.is_empty(),
    "service.name must not be empty"
  );

  // API validation
  anyhow::ensure!(
    !config.api.rest_base_url.is_empty(),
    "REST API URL must not be empty"
  );
  anyhow::ensure!(
    !config.stream.enabled || !config.api.ws_url.is_empty(),
    "WebSocket URL must not be empty when the stream is enabled"
  );
  anyhow::ensure!(config.api.timeout_ms > 0, "api.timeout_ms must be positive");

  // Rate limit validation
  anyhow::ensure!(
    config.rate_limits.refill_per_second.is_finite()
      && config.rate_limits.refill_per_second >= 0.0,
    "rate_limits.refill_per_second must be a non-negative number, got {}",
    config.rate_limits.refill_per_second
  );

  // Poller validation
  anyhow::ensure!(
    config.poller.interval_secs > 0,
    "poller.interval_secs must be positive"
  );
  anyhow::ensure!(
    config.poller.disconnected_interval_secs != Some(0),
    "poller.disconnected_interval_secs must be positive when set"
  );
  anyhow::ensure!(
    !config.poller.groups.is_empty(),
    "At least one poller group must be configured"
  );
  for (i, group) in config.poller.groups.iter().enumerate() {
    anyhow::ensure!(
      !group.series_ids.is_empty(),
      "Poller group {} ({}) has no series_ids",
      i,
      group.name
    );
  }

  // Stream validation
  anyhow::ensure!(
    config.stream.reconnect_initial_ms > 0
      && config.stream.reconnect_initial_ms <= config.stream.reconnect_max_ms,
    "stream.reconnect_initial_ms must be in (0, reconnect_max_ms]"
  );

  // Supervisor validation
  let sup = &config.supervisor;
  anyhow::ensure!(
    sup.monitor_interval_secs > 0,
    "supervisor.monitor_interval_secs must be positive"
  );
  anyhow::ensure!(
    sup.max_consecutive_failures >= 1,
    "supervisor.max_consecutive_failures must be at least 1"
  );
  anyhow::ensure!(
    sup.restart_backoff_base_secs <= sup.restart_backoff_max_secs,
    "supervisor.restart_backoff_base_secs must not exceed restart_backoff_max_secs"
  );
  anyhow::ensure!(
    sup.start_timeout_secs > 0 && sup.stop_timeout_secs > 0,
    "supervisor.start_timeout_secs and stop_timeout_secs must be positive"
  );

  anyhow::ensure!(
    config.persistence.status_interval_secs > 0,
    "persistence.status_interval_secs must be positive"
  );

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
    [service]
    name = "market-sync"

    [api]
    rest_base_url = "https://api.example.com"
    ws_url = "wss://api.example.com/trade-api/ws/v2"

    [poller]
    interval_secs = 15

    [[poller.groups]]
    name = "nfl"
    series_ids = ["KXNFLGAME"]
  "#;

  #[test]
  fn test_load_nonexistent_file() {
    let result = load_config("nonexistent.toml");
    assert!(result.is_err());
  }

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = parse_config(MINIMAL).unwrap();
    assert_eq!(config.poller.interval_secs, 15);
    assert_eq!(config.poller.disconnected_interval(), None);
    assert!(config.rate_limits.shared);
    assert!(config.stream.auto_reconnect);
    assert_eq!(config.stream.max_reconnect_attempts, None);
    assert_eq!(config.supervisor.max_consecutive_failures, 5);
    assert_eq!(config.api.ws_path, "/trade-api/ws/v2");
  }

  #[test]
  fn test_rejects_missing_groups() {
    let text = MINIMAL.replace(
      "[[poller.groups]]\n    name = \"nfl\"\n    series_ids = [\"KXNFLGAME\"]",
      "",
    );
    assert!(parse_config(&text).is_err());
  }

  #[test]
  fn test_rejects_zero_failure_ceiling() {
    let text = format!("{MINIMAL}\n[supervisor]\nmax_consecutive_failures = 0\n");
    assert!(parse_config(&text).is_err());
  }

  #[test]
  fn test_rejects_zero_start_timeout() {
    let text = format!("{MINIMAL}\n[supervisor]\nstart_timeout_secs = 0\n");
    assert!(parse_config(&text).is_err());
  }

  #[test]
  fn test_rejects_zero_status_interval() {
    let text = format!("{MINIMAL}\n[persistence]\nstatus_interval_secs = 0\n");
    assert!(parse_config(&text).is_err());
  }

  #[test]
  fn test_credentials_debug_is_redacted() {
    let creds = crate::config::CredentialsConfig {
      api_key: "key".into(),
      api_secret: "hunter2".into(),
    };
    assert!(!format!("{creds:?}").contains("hunter2"));
  }
}
