//! REST Market Poller - Listings to Versioned Store
//!
//! Concrete `PollWork`: for each configured series group, fetches listings
//! through the Market Data API Client, parses each record into an
//! exact-decimal `PriceRecord`, and writes it through the Versioned
//! Store's upsert-with-history. The client takes a rate limiter token per
//! wire request; an exhausted limiter surfaces here as a fetch error.
//!
//! A malformed record is skipped and counted; a network or store error
//! fails the whole run and is handled at the poller's run boundary.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::poller::{PollOutcome, PollWork};
use crate::config::PollerGroupConfig;
use crate::domain::{PriceRecord, PriceSource};
use crate::ports::market_data::MarketDataClient;
use crate::ports::store::{MarketSnapshot, VersionedStore};

/// Keys carrying the series a listing belongs to.
const SERIES_KEYS: [&str; 2] = ["series_ticker", "event_ticker"];

/// Receives every REST-sourced price after it is stored.
#[async_trait]
pub trait PriceSink: Send + Sync + 'static {
  async fn publish(&self, record: &PriceRecord);
}

/// REST poller work unit.
pub struct MarketPoller {
  name: String,
  client: Arc<dyn MarketDataClient>,
  store: Arc<dyn VersionedStore>,
  groups: Vec<PollerGroupConfig>,
  sink: Option<Arc<dyn PriceSink>>,
}

impl MarketPoller {
  pub fn new(
    name: impl Into<String>,
    client: Arc<dyn MarketDataClient>,
    store: Arc<dyn VersionedStore>,
    groups: Vec<PollerGroupConfig>,
  ) -> Self {
    Self {
      name: name.into(),
      client,
      store,
      groups,
      sink: None,
    }
  }

  /// Forward every stored price to `sink`.
  pub fn with_sink(mut self, sink: Arc<dyn PriceSink>) -> Self {
    self.sink = Some(sink);
    self
  }

  /// Configured groups.
  pub fn groups(&self) -> &[PollerGroupConfig] {
    &self.groups
  }

  async fn poll_group(&self, group: &PollerGroupConfig, outcome: &mut PollOutcome) -> Result<()> {
    // Records without their own timestamp are dated to the request, not
    // the response, so a slow reply never looks newer than it is.
    let requested_at = Utc::now();
    let listings = self
      .client
      .fetch_listings(&group.series_ids)
      .await
      .with_context(|| format!("Failed to fetch listings for group `{}`", group.name))?;
    outcome.items_fetched += listings.len() as u64;

    for raw in &listings {
      let record = match PriceRecord::from_raw(raw, PriceSource::Rest, requested_at) {
        Ok(record) => record,
        Err(e) => {
          warn!(group = %group.name, error = %e, "Skipping malformed listing");
          outcome.record_errors += 1;
          outcome.last_record_error = Some(format!("group `{}`: {e}", group.name));
          continue;
        }
      };

      let snapshot = MarketSnapshot {
        series_id: series_id(raw, group),
        record,
      };
      let upsert = self
        .store
        .upsert_with_history(&snapshot)
        .await
        .with_context(|| format!("Failed to store `{}`", snapshot.record.ticker))?;

      if upsert.created {
        outcome.items_created += 1;
      } else {
        outcome.items_updated += 1;
      }

      if let Some(sink) = &self.sink {
        sink.publish(&snapshot.record).await;
      }
    }

    debug!(
      group = %group.name,
      fetched = listings.len(),
      "Group polled"
    );
    Ok(())
  }
}

#[async_trait]
impl PollWork for MarketPoller {
  fn name(&self) -> &str {
    &self.name
  }

  #[instrument(skip(self), fields(poller = %self.name))]
  async fn poll(&self) -> Result<PollOutcome> {
    let mut outcome = PollOutcome::default();
    for group in &self.groups {
      self.poll_group(group, &mut outcome).await?;
    }
    Ok(outcome)
  }
}

fn series_id(raw: &Value, group: &PollerGroupConfig) -> String {
  SERIES_KEYS
    .iter()
    .find_map(|k| raw.get(*k).and_then(Value::as_str))
    .map_or_else(|| group.name.clone(), str::to_string)
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;
  use std::sync::Mutex;

  use rust_decimal_macros::dec;
  use serde_json::json;

  use super::*;
  use crate::ports::store::UpsertOutcome;

  struct FixedClient {
    listings: Vec<Value>,
    fail: bool,
  }

  #[async_trait]
  impl MarketDataClient for FixedClient {
    async fn fetch_listings(&self, _series_ids: &[String]) -> Result<Vec<Value>> {
      if self.fail {
        anyhow::bail!("connection reset");
      }
      Ok(self.listings.clone())
    }

    async fn close(&self) -> Result<()> {
      Ok(())
    }
  }

  #[derive(Default)]
  struct MemoryStore {
    current: Mutex<HashMap<String, MarketSnapshot>>,
  }

  #[async_trait]
  impl VersionedStore for MemoryStore {
    async fn upsert_with_history(&self, snapshot: &MarketSnapshot) -> Result<UpsertOutcome> {
      let previous = self
        .current
        .lock()
        .unwrap()
        .insert(snapshot.record.ticker.clone(), snapshot.clone());
      Ok(UpsertOutcome {
        created: previous.is_none(),
      })
    }
  }

  #[derive(Default)]
  struct CollectingSink {
    seen: Mutex<Vec<PriceRecord>>,
  }

  #[async_trait]
  impl PriceSink for CollectingSink {
    async fn publish(&self, record: &PriceRecord) {
      self.seen.lock().unwrap().push(record.clone());
    }
  }

  fn poller(client: FixedClient, store: Arc<MemoryStore>) -> MarketPoller {
    MarketPoller::new(
      "exchange",
      Arc::new(client),
      store,
      vec![PollerGroupConfig {
        name: "nfl".into(),
        series_ids: vec!["KXNFLGAME".into()],
      }],
    )
  }

  #[tokio::test]
  async fn test_counts_created_then_updated() {
    let store = Arc::new(MemoryStore::default());
    let client = FixedClient {
      listings: vec![
        json!({"ticker": "MKT-A", "yes_price": "0.52"}),
        json!({"ticker": "MKT-B", "last_price": 40}),
      ],
      fail: false,
    };
    let poller = poller(client, Arc::clone(&store));

    let first = poller.poll().await.unwrap();
    assert_eq!(first.items_fetched, 2);
    assert_eq!(first.items_created, 2);

    let second = poller.poll().await.unwrap();
    assert_eq!(second.items_updated, 2);
    assert_eq!(second.items_created, 0);

    let current = store.current.lock().unwrap();
    assert_eq!(current["MKT-B"].record.yes_price, dec!(0.40));
    assert_eq!(current["MKT-A"].series_id, "nfl");
  }

  #[tokio::test]
  async fn test_malformed_record_does_not_abort_siblings() {
    let store = Arc::new(MemoryStore::default());
    let client = FixedClient {
      listings: vec![
        json!({"yes_price": "0.52"}),
        json!({"ticker": "MKT-B", "yes_price": null}),
        json!({"ticker": "MKT-C", "yes_price": "0.10", "series_ticker": "KXNFLGAME"}),
      ],
      fail: false,
    };
    let sink = Arc::new(CollectingSink::default());
    let poller = poller(client, Arc::clone(&store)).with_sink(sink.clone());

    let outcome = poller.poll().await.unwrap();
    assert_eq!(outcome.items_fetched, 3);
    assert_eq!(outcome.items_created, 1);
    assert_eq!(outcome.record_errors, 2);
    assert!(outcome.last_record_error.is_some());

    let seen = sink.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].source, PriceSource::Rest);
    assert_eq!(store.current.lock().unwrap()["MKT-C"].series_id, "KXNFLGAME");
  }

  #[tokio::test]
  async fn test_network_error_fails_the_run() {
    let client = FixedClient {
      listings: vec![],
      fail: true,
    };
    let err = poller(client, Arc::new(MemoryStore::default()))
      .poll()
      .await
      .unwrap_err();
    assert!(format!("{err:#}").contains("connection reset"));
  }
}
