//! Market Data Port - Exchange Listings Interface
//!
//! Defines the trait the REST poller uses to fetch current listings.
//! Records are returned raw so the poller can reject malformed entries
//! one by one without losing the rest of the response.

use async_trait::async_trait;
use serde_json::Value;

/// Trait for exchange REST clients.
#[async_trait]
pub trait MarketDataClient: Send + Sync + 'static {
  /// Fetch the current listings for a group of series.
  ///
  /// Network and HTTP failures are returned as errors; individual
  /// records are not validated here.
  async fn fetch_listings(&self, series_ids: &[String]) -> anyhow::Result<Vec<Value>>;

  /// Release connections held by the client.
  async fn close(&self) -> anyhow::Result<()>;
}
