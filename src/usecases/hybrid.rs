//! Hybrid Market Data Manager - REST + Stream, Freshest Wins
//!
//! Composes the REST market poller and the streaming handler behind one
//! price cache:
//! - `start()` runs one REST poll synchronously before the stream starts,
//!   so a read right after start is already populated
//! - REST keeps polling on its interval as validation and fallback
//! - Both sources merge through `PriceBook::merge`, which keeps the
//!   observation with the greatest `observed_at` regardless of arrival
//!   order or source
//!
//! While the stream is not connected REST is effectively the only source;
//! an optional shorter poll interval applies in that state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::lock_or_recover;
use super::market_poller::{MarketPoller, PriceSink};
use super::poller::{Cadence, PollReport, PollStats, ScheduledPoller, SharedPollStats};
use super::streaming::{CallbackId, PriceCallback, StreamStats, StreamingHandler, invoke_callbacks};
use crate::domain::{ConnectionState, LifecycleError, PriceRecord, ServiceKind, Ticker};
use crate::ports::service::{Heartbeat, ManagedService};

/// Hybrid manager settings.
#[derive(Debug, Clone)]
pub struct HybridSettings {
  /// Tickers subscribed on the stream at start.
  pub tracked_tickers: Vec<Ticker>,
  /// Regular REST poll interval.
  pub poll_interval: Duration,
  /// REST poll interval while the stream is not connected.
  pub disconnected_interval: Option<Duration>,
  /// Subscribe tickers first seen through REST.
  pub track_discovered: bool,
  /// Upper bound on stopping the poller.
  pub stop_timeout: Duration,
}

/// Price cache keyed by ticker.
#[derive(Debug, Default)]
pub struct PriceBook {
  prices: RwLock<HashMap<Ticker, PriceRecord>>,
}

impl PriceBook {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store `record` unless the cached entry is at least as fresh.
  ///
  /// Returns whether the record was accepted.
  pub fn merge(&self, record: &PriceRecord) -> bool {
    let mut prices = self.prices.write().unwrap_or_else(|p| p.into_inner());
    match prices.get(&record.ticker) {
      Some(current) if !record.is_fresher_than(current) => false,
      _ => {
        prices.insert(record.ticker.clone(), record.clone());
        true
      }
    }
  }

  pub fn get(&self, ticker: &str) -> Option<PriceRecord> {
    self
      .prices
      .read()
      .unwrap_or_else(|p| p.into_inner())
      .get(ticker)
      .cloned()
  }

  pub fn all(&self) -> HashMap<Ticker, PriceRecord> {
    self.prices.read().unwrap_or_else(|p| p.into_inner()).clone()
  }

  pub fn len(&self) -> usize {
    self.prices.read().unwrap_or_else(|p| p.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

type CallbackList = Arc<Mutex<Vec<(CallbackId, PriceCallback)>>>;

/// Receives REST-sourced prices from the poller.
struct RestSink {
  book: Arc<PriceBook>,
  callbacks: CallbackList,
  streaming: Arc<StreamingHandler>,
  track_discovered: bool,
}

#[async_trait]
impl PriceSink for RestSink {
  async fn publish(&self, record: &PriceRecord) {
    if self.track_discovered {
      if let Err(e) = self.streaming.subscribe(std::slice::from_ref(&record.ticker)).await {
        warn!(ticker = %record.ticker, error = %format!("{e:#}"), "Failed to track discovered ticker");
      }
    }

    if !self.book.merge(record) {
      debug!(ticker = %record.ticker, "Discarded stale REST price");
      return;
    }

    let callbacks: Vec<PriceCallback> = lock_or_recover(&self.callbacks)
      .iter()
      .map(|(_, cb)| Arc::clone(cb))
      .collect();
    invoke_callbacks("rest", &callbacks, record);
  }
}

/// Aggregated view for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct HybridStats {
  pub connection_state: ConnectionState,
  pub cached_prices: usize,
  pub subscriptions: usize,
  pub poll: PollStats,
  pub stream: StreamStats,
}

/// Hybrid market data manager.
pub struct HybridMarketData {
  name: String,
  work: Arc<MarketPoller>,
  streaming: Arc<StreamingHandler>,
  book: Arc<PriceBook>,
  rest_callbacks: CallbackList,
  settings: HybridSettings,
  poll_stats: SharedPollStats,
  poller: tokio::sync::Mutex<Option<Arc<ScheduledPoller<MarketPoller>>>>,
  started_at: Mutex<Option<DateTime<Utc>>>,
}

impl HybridMarketData {
  /// Wire the poller's sink and the stream's cache callback.
  ///
  /// `poller` must not already carry a sink; it is replaced.
  pub fn new(
    name: impl Into<String>,
    poller: MarketPoller,
    streaming: Arc<StreamingHandler>,
    settings: HybridSettings,
  ) -> Self {
    let book = Arc::new(PriceBook::new());
    let rest_callbacks: CallbackList = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::new(RestSink {
      book: Arc::clone(&book),
      callbacks: Arc::clone(&rest_callbacks),
      streaming: Arc::clone(&streaming),
      track_discovered: settings.track_discovered,
    });

    // Registered first so the cache is current before user callbacks run.
    let stream_book = Arc::clone(&book);
    streaming.add_callback(Arc::new(move |record: &PriceRecord| -> Result<()> {
      if !stream_book.merge(record) {
        debug!(ticker = %record.ticker, "Discarded stale stream price");
      }
      Ok(())
    }));

    Self {
      name: name.into(),
      work: Arc::new(poller.with_sink(sink)),
      streaming,
      book,
      rest_callbacks,
      settings,
      poll_stats: Arc::new(Mutex::new(PollStats::default())),
      poller: tokio::sync::Mutex::new(None),
      started_at: Mutex::new(None),
    }
  }

  fn build_poller(&self) -> ScheduledPoller<MarketPoller> {
    let poller = ScheduledPoller::new(Arc::clone(&self.work), self.settings.poll_interval)
      .with_stats(Arc::clone(&self.poll_stats))
      .with_stop_timeout(self.settings.stop_timeout);

    match self.settings.disconnected_interval {
      Some(fallback) => {
        let streaming = Arc::clone(&self.streaming);
        let regular = self.settings.poll_interval;
        let cadence: Cadence = Arc::new(move || {
          if streaming.connection_state() == ConnectionState::Connected {
            regular
          } else {
            fallback
          }
        });
        poller.with_cadence(cadence)
      }
      None => poller,
    }
  }

  /// Initial REST sync, then stream, then scheduled REST polling.
  #[instrument(skip(self), fields(service = %self.name))]
  pub async fn start(&self) -> Result<()> {
    let mut slot = self.poller.lock().await;
    if slot.as_ref().is_some_and(|p| p.is_running()) {
      return Err(LifecycleError::AlreadyStarted(self.name.clone()).into());
    }
    if let Some(stale) = slot.take() {
      stale.stop().await;
    }

    let poller = Arc::new(self.build_poller());
    let report = poller.poll_once().await;
    match &report.error {
      None => info!(
        fetched = report.items_fetched,
        cached = self.book.len(),
        "Initial REST sync complete"
      ),
      Some(error) => warn!(error = %error, "Initial REST sync failed, continuing"),
    }

    if let Err(e) = self.streaming.subscribe(&self.settings.tracked_tickers).await {
      warn!(error = %format!("{e:#}"), "Failed to queue tracked tickers");
    }
    self
      .streaming
      .start()
      .await
      .context("Failed to start market stream")?;

    poller.start()?;
    *slot = Some(poller);
    *lock_or_recover(&self.started_at) = Some(Utc::now());
    Ok(())
  }

  /// Stop REST polling and the stream. Either may already be stopped.
  #[instrument(skip(self), fields(service = %self.name))]
  pub async fn stop(&self) {
    let poller = self.poller.lock().await.take();
    if let Some(poller) = poller {
      poller.stop().await;
    }
    self.streaming.stop().await;
    info!("Hybrid market data stopped");
  }

  /// Run one REST poll now (through the active poller when running).
  pub async fn poll_once(&self) -> PollReport {
    let poller = match self.poller.lock().await.as_ref() {
      Some(poller) => Arc::clone(poller),
      None => Arc::new(self.build_poller()),
    };
    poller.poll_once().await
  }

  /// Freshest known price for `ticker`.
  pub fn get_current_price(&self, ticker: &str) -> Option<PriceRecord> {
    self.book.get(ticker)
  }

  /// Snapshot of every cached price.
  pub fn get_all_prices(&self) -> HashMap<Ticker, PriceRecord> {
    self.book.all()
  }

  /// Register a callback for stream updates and accepted REST updates.
  pub fn add_price_callback(&self, callback: PriceCallback) -> CallbackId {
    let id = self.streaming.add_callback(Arc::clone(&callback));
    lock_or_recover(&self.rest_callbacks).push((id, callback));
    id
  }

  /// Remove a callback from both paths.
  pub fn remove_price_callback(&self, id: CallbackId) -> bool {
    let removed_stream = self.streaming.remove_callback(id);
    let mut rest = lock_or_recover(&self.rest_callbacks);
    let before = rest.len();
    rest.retain(|(cid, _)| *cid != id);
    removed_stream || rest.len() != before
  }

  /// Start streaming `ticker`.
  pub async fn track(&self, ticker: impl Into<Ticker>) -> Result<()> {
    self.streaming.subscribe(&[ticker.into()]).await
  }

  /// Stop streaming `ticker`. Its cached price is kept.
  pub async fn untrack(&self, ticker: impl Into<Ticker>) -> Result<()> {
    self.streaming.unsubscribe(&[ticker.into()]).await
  }

  pub fn connection_state(&self) -> ConnectionState {
    self.streaming.connection_state()
  }

  pub fn stats(&self) -> HybridStats {
    HybridStats {
      connection_state: self.streaming.connection_state(),
      cached_prices: self.book.len(),
      subscriptions: self.streaming.subscriptions().len(),
      poll: lock_or_recover(&self.poll_stats).clone(),
      stream: self.streaming.stats(),
    }
  }
}

#[async_trait]
impl ManagedService for HybridMarketData {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> ServiceKind {
    ServiceKind::HybridMarketData
  }

  async fn start(&self) -> Result<()> {
    HybridMarketData::start(self).await
  }

  async fn stop(&self) -> Result<()> {
    HybridMarketData::stop(self).await;
    Ok(())
  }

  /// Alive while the stream is connected; otherwise as fresh as the last
  /// successful REST poll.
  async fn heartbeat(&self) -> Result<Heartbeat> {
    let running = self
      .poller
      .lock()
      .await
      .as_ref()
      .is_some_and(|p| p.is_running());
    anyhow::ensure!(running, "`{}` REST poller is not running", self.name);

    if self.streaming.connection_state() == ConnectionState::Connected {
      return Ok(Heartbeat::Alive);
    }
    let last_success = lock_or_recover(&self.poll_stats).last_success_at;
    let started_at = *lock_or_recover(&self.started_at);
    match last_success.or(started_at) {
      Some(at) => Ok(Heartbeat::LastSeen(at)),
      None => anyhow::bail!("`{}` has not started", self.name),
    }
  }

  fn is_healthy(&self) -> bool {
    self.streaming.connection_state() != ConnectionState::Failed
  }

  fn stats(&self) -> Value {
    serde_json::to_value(HybridMarketData::stats(self)).unwrap_or(Value::Null)
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use rust_decimal_macros::dec;

  use super::*;
  use crate::domain::PriceSource;

  fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
  }

  #[test]
  fn test_freshest_wins_regardless_of_arrival() {
    let book = PriceBook::new();
    let rest_t0 = PriceRecord::new("MKT-A", dec!(0.52), at(0), PriceSource::Rest);
    let stream_t2 = PriceRecord::new("MKT-A", dec!(0.55), at(2), PriceSource::Stream);
    let late_rest_t1 = PriceRecord::new("MKT-A", dec!(0.50), at(1), PriceSource::Rest);

    assert!(book.merge(&rest_t0));
    assert!(book.merge(&stream_t2));
    assert!(!book.merge(&late_rest_t1));

    let current = book.get("MKT-A").unwrap();
    assert_eq!(current.yes_price, dec!(0.55));
    assert_eq!(current.source, PriceSource::Stream);
  }

  #[test]
  fn test_equal_timestamp_keeps_first() {
    let book = PriceBook::new();
    assert!(book.merge(&PriceRecord::new("MKT-A", dec!(0.40), at(5), PriceSource::Stream)));
    assert!(!book.merge(&PriceRecord::new("MKT-A", dec!(0.41), at(5), PriceSource::Rest)));
    assert_eq!(book.get("MKT-A").unwrap().yes_price, dec!(0.40));
  }

  #[test]
  fn test_tickers_are_independent() {
    let book = PriceBook::new();
    book.merge(&PriceRecord::new("MKT-A", dec!(0.40), at(5), PriceSource::Stream));
    book.merge(&PriceRecord::new("MKT-B", dec!(0.60), at(1), PriceSource::Rest));
    assert_eq!(book.len(), 2);
    assert_eq!(book.all()["MKT-B"].no_price, dec!(0.40));
    assert!(book.get("MKT-C").is_none());
  }
}
