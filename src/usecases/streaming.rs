//! Streaming Market Handler - Persistent Push Connection
//!
//! Owns one streaming connection to the exchange:
//! - Authenticates each connect through the Request Signer
//! - Re-applies the whole subscription set after every successful connect
//! - Reconnects with capped exponential backoff on unexpected drops
//! - Parses `ticker` envelopes into `PriceRecord`s and fans them out to
//!   callbacks in arrival order
//!
//! The subscription set and callback list each have their own lock;
//! callbacks are always invoked with no lock held.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::rate_limiter::RateLimiter;
use super::{lock_or_recover, panic_message};
use crate::config::StreamConfig;
use crate::domain::{
  ConnectionState, ExponentialBackoff, LifecycleError, PriceRecord, PriceSource, ServiceKind,
  Ticker,
};
use crate::ports::service::{Heartbeat, ManagedService};
use crate::ports::signer::RequestSigner;
use crate::ports::transport::{
  ChannelCommand, StreamConnection, StreamConnector, StreamEnvelope, TICKER_UPDATE,
};

/// Price update callback. An `Err` or panic is counted, never propagated.
pub type PriceCallback = Arc<dyn Fn(&PriceRecord) -> Result<()> + Send + Sync>;

/// Handle returned by callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallbackId(u64);

/// Reconnect and shutdown policy.
#[derive(Debug, Clone)]
pub struct StreamSettings {
  /// Reconnect after an unexpected drop; otherwise go straight to FAILED.
  pub auto_reconnect: bool,
  /// Delay between reconnect attempts; its attempt limit leads to FAILED.
  pub backoff: ExponentialBackoff,
  /// Upper bound on `stop()`.
  pub stop_timeout: Duration,
}

impl StreamSettings {
  pub fn from_config(config: &StreamConfig, stop_timeout: Duration) -> Self {
    Self {
      auto_reconnect: config.auto_reconnect,
      backoff: config.backoff(),
      stop_timeout,
    }
  }
}

impl Default for StreamSettings {
  fn default() -> Self {
    Self::from_config(&StreamConfig::default(), Duration::from_secs(10))
  }
}

/// Streaming statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
  pub messages_received: u64,
  pub updates_dispatched: u64,
  /// Envelopes of types other than `ticker`.
  pub ignored_messages: u64,
  pub parse_errors: u64,
  pub callback_errors: u64,
  /// Successful reconnects after a drop.
  pub reconnects: u64,
  pub connected_at: Option<DateTime<Utc>>,
  pub last_message_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

/// Why one connect attempt failed.
#[derive(Debug, Error)]
enum SessionError {
  /// Signing failed; retrying will not help.
  #[error("stream authentication failed: {0:#}")]
  Auth(anyhow::Error),
  /// Limiter can never grant a token.
  #[error("rate limiter `{0}` cannot grant a token")]
  RateLimited(String),
  /// Network-level failure; eligible for reconnect.
  #[error("stream transport failed: {0:#}")]
  Transport(anyhow::Error),
}

impl SessionError {
  fn is_retryable(&self) -> bool {
    matches!(self, Self::Transport(_))
  }
}

/// State shared with the background receive task.
struct Inner {
  name: String,
  connector: Arc<dyn StreamConnector>,
  signer: Arc<dyn RequestSigner>,
  limiter: Arc<RateLimiter>,
  settings: StreamSettings,
  state: watch::Sender<ConnectionState>,
  subscriptions: Mutex<BTreeSet<Ticker>>,
  callbacks: Mutex<Vec<(CallbackId, PriceCallback)>>,
  connection: Mutex<Option<Arc<dyn StreamConnection>>>,
  stats: Mutex<StreamStats>,
  next_callback_id: AtomicU64,
  next_command_id: AtomicU64,
}

/// Streaming market handler.
pub struct StreamingHandler {
  inner: Arc<Inner>,
  /// Serializes start/stop.
  lifecycle: tokio::sync::Mutex<()>,
  shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingHandler {
  pub fn new(
    name: impl Into<String>,
    connector: Arc<dyn StreamConnector>,
    signer: Arc<dyn RequestSigner>,
    limiter: Arc<RateLimiter>,
    settings: StreamSettings,
  ) -> Self {
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    Self {
      inner: Arc::new(Inner {
        name: name.into(),
        connector,
        signer,
        limiter,
        settings,
        state,
        subscriptions: Mutex::new(BTreeSet::new()),
        callbacks: Mutex::new(Vec::new()),
        connection: Mutex::new(None),
        stats: Mutex::new(StreamStats::default()),
        next_callback_id: AtomicU64::new(1),
        next_command_id: AtomicU64::new(1),
      }),
      lifecycle: tokio::sync::Mutex::new(()),
      shutdown_tx: Mutex::new(None),
      task: Mutex::new(None),
    }
  }

  /// Connect and start the receive loop.
  ///
  /// Signing failures are fatal (FAILED, error returned). A transport
  /// failure on the first attempt hands over to the reconnect loop when
  /// auto-reconnect is on, otherwise it is fatal too.
  #[instrument(skip(self), fields(stream = %self.inner.name))]
  pub async fn start(&self) -> Result<()> {
    let _guard = self.lifecycle.lock().await;

    if lock_or_recover(&self.task)
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
    {
      return Err(LifecycleError::AlreadyStarted(self.inner.name.clone()).into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let first = match self.inner.connect_session().await {
      Ok(connection) => Some(connection),
      Err(e) if e.is_retryable() && self.inner.settings.auto_reconnect => {
        warn!(error = %e, "Initial connect failed, retrying in background");
        self.inner.record_error(e.to_string());
        self.inner.set_state(ConnectionState::Reconnecting);
        None
      }
      Err(e) => {
        self.inner.record_error(e.to_string());
        self.inner.set_state(ConnectionState::Failed);
        return Err(e.into());
      }
    };

    let handle = tokio::spawn(run(Arc::clone(&self.inner), first, shutdown_rx));
    *lock_or_recover(&self.shutdown_tx) = Some(shutdown_tx);
    *lock_or_recover(&self.task) = Some(handle);
    Ok(())
  }

  /// Stop the receive loop and close the connection.
  ///
  /// Idempotent and bounded by the configured stop timeout.
  #[instrument(skip(self), fields(stream = %self.inner.name))]
  pub async fn stop(&self) {
    let _guard = self.lifecycle.lock().await;

    let shutdown_tx = lock_or_recover(&self.shutdown_tx).take();
    let handle = lock_or_recover(&self.task).take();
    if shutdown_tx.is_none() && handle.is_none() {
      return;
    }

    if let Some(tx) = shutdown_tx {
      tx.send_replace(true);
    }
    if let Some(mut handle) = handle {
      let timeout = self.inner.settings.stop_timeout;
      if tokio::time::timeout(timeout, &mut handle).await.is_err() {
        warn!(timeout_secs = timeout.as_secs_f64(), "Receive loop did not exit in time, aborting");
        handle.abort();
      }
    }
    if let Some(connection) = self.inner.take_connection() {
      if let Err(e) = connection.close().await {
        debug!(error = %e, "Error closing stream connection");
      }
    }

    self.inner.set_state(ConnectionState::Disconnected);
    info!("Stream stopped");
  }

  /// Add tickers to the subscription set.
  ///
  /// New tickers are sent immediately when a connection is open; either
  /// way they are re-applied on every future connect. A send failure is
  /// returned but the tickers stay in the set.
  pub async fn subscribe(&self, tickers: &[Ticker]) -> Result<()> {
    let (added, connection) = {
      let mut subscriptions = lock_or_recover(&self.inner.subscriptions);
      let added: Vec<Ticker> = tickers
        .iter()
        .filter(|t| subscriptions.insert((*t).clone()))
        .cloned()
        .collect();
      let connection = if added.is_empty() {
        None
      } else {
        lock_or_recover(&self.inner.connection).clone()
      };
      (added, connection)
    };

    if let Some(connection) = connection {
      let command = ChannelCommand::Subscribe {
        id: self.inner.next_command_id(),
        tickers: added.clone(),
      };
      connection
        .send(&command)
        .await
        .context("Failed to send subscribe command")?;
    }
    if !added.is_empty() {
      debug!(stream = %self.inner.name, tickers = ?added, "Subscribed");
    }
    Ok(())
  }

  /// Remove tickers from the subscription set.
  pub async fn unsubscribe(&self, tickers: &[Ticker]) -> Result<()> {
    let (removed, connection) = {
      let mut subscriptions = lock_or_recover(&self.inner.subscriptions);
      let removed: Vec<Ticker> = tickers
        .iter()
        .filter(|t| subscriptions.remove(*t))
        .cloned()
        .collect();
      let connection = if removed.is_empty() {
        None
      } else {
        lock_or_recover(&self.inner.connection).clone()
      };
      (removed, connection)
    };

    if let Some(connection) = connection {
      let command = ChannelCommand::Unsubscribe {
        id: self.inner.next_command_id(),
        tickers: removed,
      };
      connection
        .send(&command)
        .await
        .context("Failed to send unsubscribe command")?;
    }
    Ok(())
  }

  /// Register a price callback.
  pub fn add_callback(&self, callback: PriceCallback) -> CallbackId {
    let id = CallbackId(self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed));
    lock_or_recover(&self.inner.callbacks).push((id, callback));
    id
  }

  /// Unregister a price callback. Returns whether it was registered.
  pub fn remove_callback(&self, id: CallbackId) -> bool {
    let mut callbacks = lock_or_recover(&self.inner.callbacks);
    let before = callbacks.len();
    callbacks.retain(|(cid, _)| *cid != id);
    callbacks.len() != before
  }

  /// Snapshot of the subscription set.
  pub fn subscriptions(&self) -> BTreeSet<Ticker> {
    lock_or_recover(&self.inner.subscriptions).clone()
  }

  /// Current connection state.
  pub fn connection_state(&self) -> ConnectionState {
    *self.inner.state.borrow()
  }

  /// Receiver that observes every state transition.
  pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
    self.inner.state.subscribe()
  }

  /// Snapshot copy of the stats.
  pub fn stats(&self) -> StreamStats {
    lock_or_recover(&self.inner.stats).clone()
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }
}

impl Drop for StreamingHandler {
  fn drop(&mut self) {
    if let Some(tx) = lock_or_recover(&self.shutdown_tx).take() {
      tx.send_replace(true);
    }
  }
}

impl Inner {
  fn set_state(&self, state: ConnectionState) {
    let previous = self.state.send_replace(state);
    if previous != state {
      debug!(stream = %self.name, from = %previous, to = %state, "Connection state changed");
    }
  }

  fn record_error(&self, message: String) {
    lock_or_recover(&self.stats).last_error = Some(message);
  }

  fn next_command_id(&self) -> u64 {
    self.next_command_id.fetch_add(1, Ordering::Relaxed)
  }

  fn take_connection(&self) -> Option<Arc<dyn StreamConnection>> {
    lock_or_recover(&self.connection).take()
  }

  /// One connect attempt: limiter, sign, open, resubscribe everything.
  async fn connect_session(&self) -> Result<Arc<dyn StreamConnection>, SessionError> {
    self.set_state(ConnectionState::Connecting);

    if !self.limiter.acquire(true).await {
      return Err(SessionError::RateLimited(self.limiter.name().to_string()));
    }

    let timestamp_ms = Utc::now().timestamp_millis();
    let auth = self
      .signer
      .sign("GET", self.connector.signing_path(), timestamp_ms)
      .map_err(SessionError::Auth)?;

    let connection = self
      .connector
      .connect(&auth)
      .await
      .map_err(SessionError::Transport)?;

    // Publishing the connection and snapshotting the set under the
    // subscription lock means a concurrent subscribe either lands in this
    // snapshot or sees the connection and sends for itself.
    let tickers: Vec<Ticker> = {
      let subscriptions = lock_or_recover(&self.subscriptions);
      *lock_or_recover(&self.connection) = Some(Arc::clone(&connection));
      subscriptions.iter().cloned().collect()
    };

    if !tickers.is_empty() {
      let command = ChannelCommand::Subscribe {
        id: self.next_command_id(),
        tickers,
      };
      if let Err(e) = connection.send(&command).await {
        self.take_connection();
        let _ = connection.close().await;
        return Err(SessionError::Transport(e.context("resubscribe failed")));
      }
    }

    lock_or_recover(&self.stats).connected_at = Some(Utc::now());
    self.set_state(ConnectionState::Connected);
    info!(
      stream = %self.name,
      subscriptions = subscription_count(&self.subscriptions),
      "Stream connected"
    );
    Ok(connection)
  }

  /// Read envelopes until shutdown (`Ok`) or the connection drops (`Err`).
  async fn receive_loop(
    &self,
    connection: &Arc<dyn StreamConnection>,
    shutdown_rx: &mut watch::Receiver<bool>,
  ) -> Result<()> {
    loop {
      tokio::select! {
        biased;
        _ = shutdown_rx.changed() => return Ok(()),
        received = connection.receive() => match received {
          Ok(Some(envelope)) => self.handle_envelope(envelope),
          Ok(None) => anyhow::bail!("stream closed by peer"),
          Err(e) => return Err(e.context("stream receive failed")),
        },
      }
    }
  }

  fn handle_envelope(&self, envelope: StreamEnvelope) {
    let now = Utc::now();
    {
      let mut stats = lock_or_recover(&self.stats);
      stats.messages_received += 1;
      stats.last_message_at = Some(now);
      if envelope.kind != TICKER_UPDATE {
        stats.ignored_messages += 1;
        return;
      }
    }

    match PriceRecord::from_raw(&envelope.msg, PriceSource::Stream, now) {
      Ok(record) => self.dispatch(&record),
      Err(e) => {
        debug!(stream = %self.name, error = %e, "Unparseable ticker update");
        let mut stats = lock_or_recover(&self.stats);
        stats.parse_errors += 1;
        stats.last_error = Some(e.to_string());
      }
    }
  }

  /// Invoke every callback, in registration order, with no lock held.
  fn dispatch(&self, record: &PriceRecord) {
    let callbacks: Vec<PriceCallback> = lock_or_recover(&self.callbacks)
      .iter()
      .map(|(_, cb)| Arc::clone(cb))
      .collect();

    let failures = invoke_callbacks(&self.name, &callbacks, record);

    let mut stats = lock_or_recover(&self.stats);
    stats.updates_dispatched += 1;
    stats.callback_errors += failures;
  }
}

/// Call each callback in order, isolating errors and panics.
///
/// Returns the number of callbacks that failed.
pub(crate) fn invoke_callbacks(source: &str, callbacks: &[PriceCallback], record: &PriceRecord) -> u64 {
  let mut failures = 0;
  for callback in callbacks {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(record)));
    let failure = match outcome {
      Ok(Ok(())) => None,
      Ok(Err(e)) => Some(format!("{e:#}")),
      Err(panic) => Some(format!("callback panicked: {}", panic_message(panic.as_ref()))),
    };
    if let Some(message) = failure {
      warn!(source, ticker = %record.ticker, error = %message, "Price callback failed");
      failures += 1;
    }
  }
  failures
}

fn subscription_count(subscriptions: &Mutex<BTreeSet<Ticker>>) -> usize {
  lock_or_recover(subscriptions).len()
}

/// Background task: receive, and on drop reconnect with backoff.
async fn run(
  inner: Arc<Inner>,
  mut connection: Option<Arc<dyn StreamConnection>>,
  mut shutdown_rx: watch::Receiver<bool>,
) {
  let mut attempt: u32 = 0;

  loop {
    if let Some(active) = connection.take() {
      attempt = 0;
      let ended = inner.receive_loop(&active, &mut shutdown_rx).await;
      inner.take_connection();
      if let Err(e) = active.close().await {
        debug!(stream = %inner.name, error = %e, "Error closing dropped connection");
      }

      match ended {
        Ok(()) => return,
        Err(e) => {
          warn!(stream = %inner.name, error = %format!("{e:#}"), "Stream disconnected");
          inner.record_error(format!("{e:#}"));
        }
      }

      if !inner.settings.auto_reconnect {
        inner.set_state(ConnectionState::Failed);
        error!(stream = %inner.name, "Auto-reconnect disabled, stream failed");
        return;
      }
      inner.set_state(ConnectionState::Reconnecting);
    }

    let Some(delay) = inner.settings.backoff.next_delay(attempt) else {
      inner.set_state(ConnectionState::Failed);
      error!(stream = %inner.name, attempts = attempt, "Reconnect attempts exhausted");
      return;
    };
    attempt += 1;
    debug!(stream = %inner.name, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

    tokio::select! {
      _ = tokio::time::sleep(delay) => {}
      _ = shutdown_rx.changed() => return,
    }
    if *shutdown_rx.borrow() {
      return;
    }

    match inner.connect_session().await {
      Ok(active) => {
        lock_or_recover(&inner.stats).reconnects += 1;
        connection = Some(active);
      }
      Err(e) if e.is_retryable() => {
        warn!(stream = %inner.name, attempt, error = %e, "Reconnect attempt failed");
        inner.record_error(e.to_string());
        inner.set_state(ConnectionState::Reconnecting);
      }
      Err(e) => {
        error!(stream = %inner.name, error = %e, "Reconnect failed permanently");
        inner.record_error(e.to_string());
        inner.set_state(ConnectionState::Failed);
        return;
      }
    }
  }
}

#[async_trait]
impl ManagedService for StreamingHandler {
  fn name(&self) -> &str {
    &self.inner.name
  }

  fn kind(&self) -> ServiceKind {
    ServiceKind::MarketStream
  }

  async fn start(&self) -> Result<()> {
    StreamingHandler::start(self).await
  }

  async fn stop(&self) -> Result<()> {
    StreamingHandler::stop(self).await;
    Ok(())
  }

  async fn heartbeat(&self) -> Result<Heartbeat> {
    match self.connection_state() {
      ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting => {
        Ok(Heartbeat::Alive)
      }
      state => anyhow::bail!("stream `{}` is {state}", self.inner.name),
    }
  }

  fn is_healthy(&self) -> bool {
    self.connection_state() != ConnectionState::Failed
  }

  fn stats(&self) -> Value {
    json!({
      "state": self.connection_state(),
      "subscriptions": subscription_count(&self.inner.subscriptions),
      "stream": StreamingHandler::stats(self),
    })
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicUsize;

  use rust_decimal_macros::dec;
  use tokio::sync::mpsc;

  use super::*;
  use crate::ports::signer::AuthHeaders;

  type Inbound = mpsc::UnboundedSender<Option<StreamEnvelope>>;

  struct FakeConnection {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<StreamEnvelope>>>,
    sent: Arc<Mutex<Vec<ChannelCommand>>>,
  }

  #[async_trait]
  impl StreamConnection for FakeConnection {
    async fn send(&self, command: &ChannelCommand) -> Result<()> {
      self.sent.lock().unwrap().push(command.clone());
      Ok(())
    }

    async fn receive(&self) -> Result<Option<StreamEnvelope>> {
      Ok(self.inbound.lock().await.recv().await.flatten())
    }

    async fn close(&self) -> Result<()> {
      Ok(())
    }
  }

  #[derive(Default)]
  struct FakeConnector {
    sent: Arc<Mutex<Vec<ChannelCommand>>>,
    feeds: Mutex<Vec<Inbound>>,
    failures: Mutex<VecDeque<bool>>,
    connects: AtomicUsize,
  }

  impl FakeConnector {
    fn latest_feed(&self) -> Inbound {
      self.feeds.lock().unwrap().last().cloned().unwrap()
    }
  }

  #[async_trait]
  impl StreamConnector for FakeConnector {
    fn signing_path(&self) -> &str {
      "/trade-api/ws/v2"
    }

    async fn connect(&self, _auth: &AuthHeaders) -> Result<Arc<dyn StreamConnection>> {
      self.connects.fetch_add(1, Ordering::SeqCst);
      if self.failures.lock().unwrap().pop_front().unwrap_or(false) {
        anyhow::bail!("connection refused");
      }
      let (tx, rx) = mpsc::unbounded_channel();
      self.feeds.lock().unwrap().push(tx);
      Ok(Arc::new(FakeConnection {
        inbound: tokio::sync::Mutex::new(rx),
        sent: Arc::clone(&self.sent),
      }))
    }
  }

  struct StaticSigner {
    fail: bool,
  }

  impl RequestSigner for StaticSigner {
    fn sign(&self, method: &str, path: &str, timestamp_ms: i64) -> Result<AuthHeaders> {
      anyhow::ensure!(!self.fail, "missing api secret");
      Ok(AuthHeaders::new().with("sig", format!("{timestamp_ms}{method}{path}")))
    }
  }

  fn settings(auto_reconnect: bool, max_attempts: Option<u32>) -> StreamSettings {
    StreamSettings {
      auto_reconnect,
      backoff: ExponentialBackoff::new(
        Duration::from_millis(10),
        Duration::from_millis(80),
        max_attempts,
      ),
      stop_timeout: Duration::from_secs(1),
    }
  }

  fn handler(connector: Arc<FakeConnector>, settings: StreamSettings) -> StreamingHandler {
    StreamingHandler::new(
      "stream",
      connector,
      Arc::new(StaticSigner { fail: false }),
      Arc::new(RateLimiter::new("test", 100, 100.0)),
      settings,
    )
  }

  async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
  }

  fn tickers(names: &[&str]) -> Vec<Ticker> {
    names.iter().map(|s| s.to_string()).collect()
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_resubscribes_each_ticker_once() {
    let connector = Arc::new(FakeConnector::default());
    let handler = handler(Arc::clone(&connector), settings(true, None));

    handler.subscribe(&tickers(&["MKT-A", "MKT-B"])).await.unwrap();
    handler.start().await.unwrap();
    assert_eq!(handler.connection_state(), ConnectionState::Connected);
    handler.subscribe(&tickers(&["MKT-C", "MKT-A"])).await.unwrap();

    connector.latest_feed().send(None).unwrap();
    eventually(|| handler.stats().reconnects == 1).await;
    assert_eq!(handler.connection_state(), ConnectionState::Connected);

    let sent = connector.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].tickers(), tickers(&["MKT-A", "MKT-B"]).as_slice());
    assert_eq!(sent[1].tickers(), tickers(&["MKT-C"]).as_slice());
    assert_eq!(sent[2].tickers(), tickers(&["MKT-A", "MKT-B", "MKT-C"]).as_slice());

    handler.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_callbacks_fire_in_order_and_survive_failures() {
    let connector = Arc::new(FakeConnector::default());
    let handler = handler(Arc::clone(&connector), settings(true, None));
    let seen = Arc::new(Mutex::new(Vec::new()));

    handler.add_callback(Arc::new(|_: &PriceRecord| -> Result<()> {
      anyhow::bail!("subscriber broke")
    }));
    handler.add_callback(Arc::new(|_: &PriceRecord| -> Result<()> {
      panic!("subscriber panicked")
    }));
    let sink = Arc::clone(&seen);
    handler.add_callback(Arc::new(move |record: &PriceRecord| -> Result<()> {
      sink.lock().unwrap().push(record.yes_price);
      Ok(())
    }));

    handler.start().await.unwrap();
    let feed = connector.latest_feed();
    for price in [52, 55, 51] {
      let msg = json!({"market_ticker": "MKT-A", "price": price});
      feed.send(Some(StreamEnvelope::new(TICKER_UPDATE, msg))).unwrap();
    }
    feed
      .send(Some(StreamEnvelope::new("orderbook_delta", json!({}))))
      .unwrap();
    feed
      .send(Some(StreamEnvelope::new(TICKER_UPDATE, json!({"price": 10}))))
      .unwrap();

    eventually(|| handler.stats().messages_received == 5).await;
    assert_eq!(*seen.lock().unwrap(), vec![dec!(0.52), dec!(0.55), dec!(0.51)]);

    let stats = handler.stats();
    assert_eq!(stats.updates_dispatched, 3);
    assert_eq!(stats.callback_errors, 6);
    assert_eq!(stats.ignored_messages, 1);
    assert_eq!(stats.parse_errors, 1);

    handler.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_reconnects_reach_failed() {
    let connector = Arc::new(FakeConnector::default());
    let handler = handler(Arc::clone(&connector), settings(true, Some(2)));
    handler.start().await.unwrap();

    connector
      .failures
      .lock()
      .unwrap()
      .extend([true, true, true]);
    connector.latest_feed().send(None).unwrap();

    eventually(|| handler.connection_state() == ConnectionState::Failed).await;
    // One initial connect plus two reconnect attempts.
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    assert!(!ManagedService::is_healthy(&handler));
    handler.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_without_auto_reconnect_fails() {
    let connector = Arc::new(FakeConnector::default());
    let handler = handler(Arc::clone(&connector), settings(false, None));
    handler.start().await.unwrap();

    connector.latest_feed().send(None).unwrap();
    eventually(|| handler.connection_state() == ConnectionState::Failed).await;
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_signing_failure_is_fatal_to_start() {
    let connector = Arc::new(FakeConnector::default());
    let handler = StreamingHandler::new(
      "stream",
      Arc::clone(&connector) as Arc<dyn StreamConnector>,
      Arc::new(StaticSigner { fail: true }),
      Arc::new(RateLimiter::new("test", 10, 10.0)),
      settings(true, None),
    );

    assert!(handler.start().await.is_err());
    assert_eq!(handler.connection_state(), ConnectionState::Failed);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribe_while_disconnected_applies_on_connect() {
    let connector = Arc::new(FakeConnector::default());
    let handler = handler(Arc::clone(&connector), settings(true, None));

    handler.subscribe(&tickers(&["MKT-A"])).await.unwrap();
    handler.unsubscribe(&tickers(&["MKT-A"])).await.unwrap();
    handler.subscribe(&tickers(&["MKT-B"])).await.unwrap();
    assert!(connector.sent.lock().unwrap().is_empty());

    handler.start().await.unwrap();
    let sent = connector.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tickers(), tickers(&["MKT-B"]).as_slice());
    handler.stop().await;
  }

  #[tokio::test]
  async fn test_stop_twice_and_restart() {
    let connector = Arc::new(FakeConnector::default());
    let handler = handler(Arc::clone(&connector), settings(true, None));

    handler.stop().await;
    handler.start().await.unwrap();
    assert!(handler.start().await.is_err());
    handler.stop().await;
    handler.stop().await;
    assert_eq!(handler.connection_state(), ConnectionState::Disconnected);

    handler.start().await.unwrap();
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    handler.stop().await;
  }

  #[test]
  fn test_remove_callback() {
    let handler = handler(Arc::new(FakeConnector::default()), settings(true, None));
    let id = handler.add_callback(Arc::new(|_: &PriceRecord| -> Result<()> { Ok(()) }));
    assert!(handler.remove_callback(id));
    assert!(!handler.remove_callback(id));
  }
}
