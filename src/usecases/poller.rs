//! Scheduled Poller - Fixed-Interval Recurring Work
//!
//! Runs one named unit of work (`PollWork`) on a fixed-rate schedule in a
//! background task. Each run is isolated: errors and panics are caught at
//! the run boundary and recorded in `PollStats`, never propagated to the
//! scheduler.
//!
//! Lifecycle is CREATED -> STARTED -> STOPPED, with STOPPED terminal for
//! an instance. `PollerService` wraps the poller for supervision by
//! building a fresh instance on every start.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{lock_or_recover, panic_message};
use crate::domain::{LifecycleError, LifecycleState, ServiceKind};
use crate::ports::service::{Heartbeat, ManagedService};

/// Smallest period the scheduler will sleep between firings.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Counts produced by one successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
  /// Raw items returned by the source.
  pub items_fetched: u64,
  /// Items that replaced an existing current version.
  pub items_updated: u64,
  /// Items seen for the first time.
  pub items_created: u64,
  /// Individual items skipped as malformed.
  pub record_errors: u64,
  /// Description of the last malformed item.
  pub last_record_error: Option<String>,
}

/// A unit of work run by a `ScheduledPoller`.
#[async_trait]
pub trait PollWork: Send + Sync + 'static {
  /// Name used in logs and as the supervised service name.
  fn name(&self) -> &str;

  /// Run once. An `Err` marks the whole run as failed.
  async fn poll(&self) -> anyhow::Result<PollOutcome>;
}

/// Poller statistics. Counters never decrease; `last_*` are overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
  pub polls_completed: u64,
  pub items_fetched: u64,
  pub items_updated: u64,
  pub items_created: u64,
  pub errors: u64,
  /// Scheduled firings dropped because a run was still in flight.
  pub runs_skipped: u64,
  pub last_error: Option<String>,
  pub last_poll_at: Option<DateTime<Utc>>,
  pub last_success_at: Option<DateTime<Utc>>,
}

/// Stats shared between successive poller instances of one service.
pub type SharedPollStats = Arc<Mutex<PollStats>>;

/// Period evaluated before each sleep.
pub type Cadence = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Structured result of one `poll_once()` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
  pub items_fetched: u64,
  pub items_updated: u64,
  pub items_created: u64,
  pub record_errors: u64,
  /// Run-level failure, if the run failed.
  pub error: Option<String>,
}

impl PollReport {
  /// Whether the run completed without a run-level failure.
  pub fn is_success(&self) -> bool {
    self.error.is_none()
  }
}

/// Fixed-interval scheduler around one `PollWork`.
pub struct ScheduledPoller<W: PollWork> {
  work: Arc<W>,
  interval: Duration,
  cadence: Option<Cadence>,
  stop_timeout: Duration,
  stats: SharedPollStats,
  /// Held for the duration of every run; enforces non-overlap.
  run_lock: Arc<tokio::sync::Mutex<()>>,
  lifecycle: Mutex<LifecycleState>,
  shutdown_tx: watch::Sender<bool>,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl<W: PollWork> ScheduledPoller<W> {
  /// Create a poller in the CREATED state.
  pub fn new(work: Arc<W>, interval: Duration) -> Self {
    let (shutdown_tx, _) = watch::channel(false);
    Self {
      work,
      interval,
      cadence: None,
      stop_timeout: Duration::from_secs(10),
      stats: Arc::new(Mutex::new(PollStats::default())),
      run_lock: Arc::new(tokio::sync::Mutex::new(())),
      lifecycle: Mutex::new(LifecycleState::Created),
      shutdown_tx,
      task: Mutex::new(None),
    }
  }

  /// Use an existing stats cell (kept across restarts).
  pub fn with_stats(mut self, stats: SharedPollStats) -> Self {
    self.stats = stats;
    self
  }

  /// Re-evaluate the period before every sleep.
  pub fn with_cadence(mut self, cadence: Cadence) -> Self {
    self.cadence = Some(cadence);
    self
  }

  /// Upper bound on how long `stop()` waits for an in-flight run.
  pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
    self.stop_timeout = timeout;
    self
  }

  /// Poller name.
  pub fn name(&self) -> &str {
    self.work.name()
  }

  /// Current lifecycle state.
  pub fn state(&self) -> LifecycleState {
    *lock_or_recover(&self.lifecycle)
  }

  /// Whether the scheduler task is alive.
  pub fn is_running(&self) -> bool {
    self.state() == LifecycleState::Started
      && lock_or_recover(&self.task)
        .as_ref()
        .is_some_and(|handle| !handle.is_finished())
  }

  /// Snapshot copy of the stats.
  pub fn stats(&self) -> PollStats {
    lock_or_recover(&self.stats).clone()
  }

  /// Shared stats cell.
  pub fn shared_stats(&self) -> SharedPollStats {
    Arc::clone(&self.stats)
  }

  /// Begin scheduled runs. The first firing is one period after start.
  #[instrument(skip(self), fields(poller = %self.work.name()))]
  pub fn start(&self) -> Result<(), LifecycleError> {
    let mut lifecycle = lock_or_recover(&self.lifecycle);
    match *lifecycle {
      LifecycleState::Started => {
        return Err(LifecycleError::AlreadyStarted(self.name().to_string()));
      }
      LifecycleState::Stopped => {
        return Err(LifecycleError::AlreadyStopped(self.name().to_string()));
      }
      LifecycleState::Created => {}
    }

    let handle = tokio::spawn(schedule_loop(
      Arc::clone(&self.work),
      Arc::clone(&self.stats),
      Arc::clone(&self.run_lock),
      self.interval,
      self.cadence.clone(),
      self.shutdown_tx.subscribe(),
    ));
    *lock_or_recover(&self.task) = Some(handle);
    *lifecycle = LifecycleState::Started;

    info!(interval_secs = self.interval.as_secs_f64(), "Poller started");
    Ok(())
  }

  /// Cancel future runs and wait (bounded) for any in-flight run.
  ///
  /// Idempotent. A poller that was never started moves straight to
  /// STOPPED.
  #[instrument(skip(self), fields(poller = %self.work.name()))]
  pub async fn stop(&self) {
    {
      let mut lifecycle = lock_or_recover(&self.lifecycle);
      if *lifecycle == LifecycleState::Stopped {
        return;
      }
      *lifecycle = LifecycleState::Stopped;
    }

    self.shutdown_tx.send_replace(true);
    let handle = lock_or_recover(&self.task).take();
    let Some(mut handle) = handle else {
      return;
    };

    match tokio::time::timeout(self.stop_timeout, &mut handle).await {
      Ok(Ok(())) => info!("Poller stopped"),
      Ok(Err(e)) => warn!(error = %e, "Poller task ended abnormally"),
      Err(_) => {
        warn!(
          timeout_secs = self.stop_timeout.as_secs_f64(),
          "In-flight poll did not finish in time, aborting"
        );
        handle.abort();
      }
    }
  }

  /// Run once now, waiting for any in-flight run to finish first.
  ///
  /// Callable in any lifecycle state. Never returns an error: failures
  /// are reported in the `PollReport` and recorded in stats.
  pub async fn poll_once(&self) -> PollReport {
    let _guard = self.run_lock.lock().await;
    execute(self.work.as_ref(), &self.stats).await
  }
}

impl<W: PollWork> Drop for ScheduledPoller<W> {
  fn drop(&mut self) {
    self.shutdown_tx.send_replace(true);
  }
}

async fn schedule_loop<W: PollWork>(
  work: Arc<W>,
  stats: SharedPollStats,
  run_lock: Arc<tokio::sync::Mutex<()>>,
  interval: Duration,
  cadence: Option<Cadence>,
  mut shutdown_rx: watch::Receiver<bool>,
) {
  let period = || {
    cadence
      .as_ref()
      .map_or(interval, |c| c())
      .max(MIN_PERIOD)
  };
  let mut next = Instant::now() + period();

  loop {
    tokio::select! {
      _ = tokio::time::sleep_until(next) => {}
      _ = shutdown_rx.changed() => break,
    }
    if *shutdown_rx.borrow() {
      break;
    }

    match Arc::clone(&run_lock).try_lock_owned() {
      Ok(_guard) => {
        let report = execute(work.as_ref(), &stats).await;
        debug!(
          poller = %work.name(),
          fetched = report.items_fetched,
          updated = report.items_updated,
          created = report.items_created,
          ok = report.is_success(),
          "Scheduled poll finished"
        );
      }
      Err(_) => {
        // A manual poll_once holds the lock.
        lock_or_recover(&stats).runs_skipped += 1;
        debug!(poller = %work.name(), "Run in flight, skipping firing");
      }
    }

    // Fixed rate: firings that fell inside a long run are skipped, not queued.
    next += period();
    let now = Instant::now();
    let mut skipped = 0u64;
    while next <= now {
      next += period();
      skipped += 1;
    }
    if skipped > 0 {
      lock_or_recover(&stats).runs_skipped += skipped;
      debug!(poller = %work.name(), skipped, "Run overlapped scheduled firings");
    }
  }
}

/// Run the work once and fold the result into stats.
async fn execute<W: PollWork>(work: &W, stats: &Mutex<PollStats>) -> PollReport {
  let result = match AssertUnwindSafe(work.poll()).catch_unwind().await {
    Ok(result) => result,
    Err(panic) => Err(anyhow::anyhow!("poll panicked: {}", panic_message(panic.as_ref()))),
  };
  let finished_at = Utc::now();

  let mut stats = lock_or_recover(stats);
  stats.polls_completed += 1;
  stats.last_poll_at = Some(finished_at);

  match result {
    Ok(outcome) => {
      stats.items_fetched += outcome.items_fetched;
      stats.items_updated += outcome.items_updated;
      stats.items_created += outcome.items_created;
      stats.last_success_at = Some(finished_at);
      if outcome.record_errors > 0 {
        stats.errors += outcome.record_errors;
        stats.last_error = outcome.last_record_error.clone();
      }
      PollReport {
        items_fetched: outcome.items_fetched,
        items_updated: outcome.items_updated,
        items_created: outcome.items_created,
        record_errors: outcome.record_errors,
        error: None,
      }
    }
    Err(e) => {
      let message = format!("{e:#}");
      warn!(poller = %work.name(), error = %message, "Poll failed");
      stats.errors += 1;
      stats.last_error = Some(message.clone());
      PollReport {
        error: Some(message),
        ..PollReport::default()
      }
    }
  }
}

/// Supervisable wrapper around a poller.
///
/// Every `start()` builds a fresh `ScheduledPoller` (STOPPED is terminal
/// per instance) sharing one stats cell, so counters survive restarts.
pub struct PollerService<W: PollWork> {
  work: Arc<W>,
  kind: ServiceKind,
  interval: Duration,
  cadence: Option<Cadence>,
  stop_timeout: Duration,
  stats: SharedPollStats,
  current: tokio::sync::Mutex<Option<(Arc<ScheduledPoller<W>>, DateTime<Utc>)>>,
}

impl<W: PollWork> PollerService<W> {
  pub fn new(work: Arc<W>, kind: ServiceKind, interval: Duration) -> Self {
    Self {
      work,
      kind,
      interval,
      cadence: None,
      stop_timeout: Duration::from_secs(10),
      stats: Arc::new(Mutex::new(PollStats::default())),
      current: tokio::sync::Mutex::new(None),
    }
  }

  pub fn with_cadence(mut self, cadence: Cadence) -> Self {
    self.cadence = Some(cadence);
    self
  }

  pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
    self.stop_timeout = timeout;
    self
  }

  /// Snapshot copy of the stats.
  pub fn poll_stats(&self) -> PollStats {
    lock_or_recover(&self.stats).clone()
  }

  /// Manual run against the current (or a throwaway) poller.
  pub async fn poll_once(&self) -> PollReport {
    let poller = match self.current.lock().await.as_ref() {
      Some((poller, _)) => Arc::clone(poller),
      None => Arc::new(self.build()),
    };
    poller.poll_once().await
  }

  fn build(&self) -> ScheduledPoller<W> {
    let poller = ScheduledPoller::new(Arc::clone(&self.work), self.interval)
      .with_stats(Arc::clone(&self.stats))
      .with_stop_timeout(self.stop_timeout);
    match &self.cadence {
      Some(cadence) => poller.with_cadence(Arc::clone(cadence)),
      None => poller,
    }
  }
}

#[async_trait]
impl<W: PollWork> ManagedService for PollerService<W> {
  fn name(&self) -> &str {
    self.work.name()
  }

  fn kind(&self) -> ServiceKind {
    self.kind.clone()
  }

  async fn start(&self) -> anyhow::Result<()> {
    let mut current = self.current.lock().await;
    if let Some((poller, _)) = current.as_ref() {
      if poller.is_running() {
        return Err(LifecycleError::AlreadyStarted(self.work.name().to_string()).into());
      }
    }
    if let Some((stale, _)) = current.take() {
      stale.stop().await;
    }

    let poller = Arc::new(self.build());
    poller.start()?;
    *current = Some((poller, Utc::now()));
    Ok(())
  }

  async fn stop(&self) -> anyhow::Result<()> {
    let taken = self.current.lock().await.take();
    if let Some((poller, _)) = taken {
      poller.stop().await;
    }
    Ok(())
  }

  async fn heartbeat(&self) -> anyhow::Result<Heartbeat> {
    let current = self.current.lock().await;
    let Some((poller, started_at)) = current.as_ref() else {
      anyhow::bail!("poller `{}` is not running", self.work.name());
    };
    anyhow::ensure!(
      poller.is_running(),
      "poller `{}` scheduler has exited",
      self.work.name()
    );
    let last_success = lock_or_recover(&self.stats).last_success_at;
    Ok(Heartbeat::LastSeen(last_success.unwrap_or(*started_at)))
  }

  fn stats(&self) -> Value {
    serde_json::to_value(self.poll_stats()).unwrap_or(Value::Null)
  }
}
