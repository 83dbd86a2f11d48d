//! Service Supervisor - Health Checks, Restarts and Circuit Breaking
//!
//! Owns the lifecycle of named `ManagedService`s:
//! - `start_all`/`stop_all` isolate failures per service
//! - A monitor loop probes each running service's heartbeat (bounded by a
//!   probe timeout) and counts stale, failing or crashed services
//! - Below the failure ceiling a service is stopped and restarted after an
//!   exponential backoff; at the ceiling the circuit opens (`Failed`), the
//!   service is stopped for good and the alert callback fires
//! - Status is exported as snapshot maps and persisted periodically for
//!   out-of-process readers
//!
//! `ServiceRuntimeState` is mutated only here. Start and stop of one
//! service are serialized by a per-service lock, so two instances of one
//! named service never run at once. Starting a running service is a no-op.
//! Both calls are bounded: a start that outlives `start_timeout` counts as
//! a crash, and a stop request cancels an in-flight start rather than
//! queueing behind it.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{lock_or_recover, panic_message};
use crate::config::SupervisorConfig;
use crate::domain::{ExponentialBackoff, ServiceRuntimeState, ServiceStatus};
use crate::ports::service::{Heartbeat, ManagedService};
use crate::ports::status::{ServiceStatusRecord, StatusRepository, StatusSource};

/// Invoked with (service name, consecutive failures) when a circuit opens.
pub type AlertCallback = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// Contract errors raised by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
  #[error("service `{0}` is already registered")]
  DuplicateService(String),
  #[error("no service named `{0}` is registered")]
  UnknownService(String),
}

/// Supervisor policy.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
  pub monitor_interval: Duration,
  /// Heartbeat age beyond which a service counts as failed.
  pub heartbeat_timeout: Duration,
  pub probe_timeout: Duration,
  /// Consecutive failures that open the circuit.
  pub max_consecutive_failures: u32,
  pub restart_backoff: ExponentialBackoff,
  pub start_timeout: Duration,
  pub stop_timeout: Duration,
  /// How often status records are persisted.
  pub status_interval: Duration,
  pub host_id: String,
}

impl SupervisorSettings {
  pub fn from_config(config: &SupervisorConfig, host_id: &str, status_interval: Duration) -> Self {
    Self {
      monitor_interval: Duration::from_secs(config.monitor_interval_secs),
      heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
      probe_timeout: Duration::from_secs(config.probe_timeout_secs),
      max_consecutive_failures: config.max_consecutive_failures.max(1),
      restart_backoff: ExponentialBackoff::new(
        Duration::from_secs(config.restart_backoff_base_secs),
        Duration::from_secs(config.restart_backoff_max_secs),
        None,
      ),
      start_timeout: Duration::from_secs(config.start_timeout_secs),
      stop_timeout: Duration::from_secs(config.stop_timeout_secs),
      status_interval,
      host_id: host_id.to_string(),
    }
  }
}

/// Outcome of `start_all()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
  pub started: Vec<String>,
  /// (service name, error) for each service that failed to start.
  pub failed: Vec<(String, String)>,
}

impl StartReport {
  pub fn all_started(&self) -> bool {
    self.failed.is_empty()
  }
}

struct ServiceEntry {
  service: Arc<dyn ManagedService>,
  state: Mutex<ServiceRuntimeState>,
  /// Held across every start/stop of this service.
  ops: tokio::sync::Mutex<()>,
  /// Bumped on every stop request; an in-flight start watching it gives up.
  stop_requests: watch::Sender<u64>,
  restart_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceEntry {
  fn cancel_restart(&self) {
    if let Some(handle) = lock_or_recover(&self.restart_task).take() {
      handle.abort();
    }
  }
}

/// Service supervisor.
pub struct Supervisor {
  settings: SupervisorSettings,
  entries: RwLock<BTreeMap<String, Arc<ServiceEntry>>>,
  alert: Option<AlertCallback>,
  status_repo: Option<Arc<dyn StatusRepository>>,
  run_id: Uuid,
  shutdown_tx: watch::Sender<bool>,
  monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
  pub fn new(settings: SupervisorSettings) -> Self {
    let (shutdown_tx, _) = watch::channel(false);
    Self {
      settings,
      entries: RwLock::new(BTreeMap::new()),
      alert: None,
      status_repo: None,
      run_id: Uuid::new_v4(),
      shutdown_tx,
      monitor: Mutex::new(None),
    }
  }

  /// Called once per circuit opening.
  pub fn with_alert(mut self, alert: AlertCallback) -> Self {
    self.alert = Some(alert);
    self
  }

  /// Persist status records through `repo`.
  pub fn with_status_repository(mut self, repo: Arc<dyn StatusRepository>) -> Self {
    self.status_repo = Some(repo);
    self
  }

  /// Identifier of this supervisor run, written into status records.
  pub fn run_id(&self) -> Uuid {
    self.run_id
  }

  /// Register a service. Names must be unique.
  pub fn register(&self, service: Arc<dyn ManagedService>) -> Result<(), SupervisorError> {
    let name = service.name().to_string();
    let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
    if entries.contains_key(&name) {
      return Err(SupervisorError::DuplicateService(name));
    }

    let state = ServiceRuntimeState::registered(service.kind());
    entries.insert(
      name.clone(),
      Arc::new(ServiceEntry {
        service,
        state: Mutex::new(state),
        ops: tokio::sync::Mutex::new(()),
        stop_requests: watch::channel(0).0,
        restart_task: Mutex::new(None),
      }),
    );
    info!(service = %name, "Service registered");
    Ok(())
  }

  fn entry(&self, name: &str) -> Result<Arc<ServiceEntry>, SupervisorError> {
    self
      .entries
      .read()
      .unwrap_or_else(|p| p.into_inner())
      .get(name)
      .cloned()
      .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
  }

  fn timeouts(&self) -> OpTimeouts {
    OpTimeouts {
      start: self.settings.start_timeout,
      stop: self.settings.stop_timeout,
    }
  }

  fn snapshot_entries(&self) -> Vec<(String, Arc<ServiceEntry>)> {
    self
      .entries
      .read()
      .unwrap_or_else(|p| p.into_inner())
      .iter()
      .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
      .collect()
  }

  /// Start every registered service; one failure never blocks the rest.
  ///
  /// Services already running are left alone and reported as started.
  #[instrument(skip(self))]
  pub async fn start_all(&self) -> StartReport {
    let mut report = StartReport::default();
    for (name, entry) in self.snapshot_entries() {
      entry.cancel_restart();
      match start_entry(&name, &entry, StartMode::Manual, self.timeouts()).await {
        Ok(()) => report.started.push(name),
        Err(e) => report.failed.push((name, e)),
      }
    }
    info!(
      started = report.started.len(),
      failed = report.failed.len(),
      "Services started"
    );
    report
  }

  /// Stop every registered service and cancel pending restarts.
  #[instrument(skip(self))]
  pub async fn stop_all(&self) {
    for (name, entry) in self.snapshot_entries() {
      entry.cancel_restart();
      stop_entry(&name, &entry, self.settings.stop_timeout).await;
      let mut state = lock_or_recover(&entry.state);
      // An open circuit stays visible until `reset`.
      if state.status != ServiceStatus::Failed {
        state.status = ServiceStatus::Stopped;
      }
    }
    info!("All services stopped");
  }

  /// Start one service by name. A pending restart is cancelled; a
  /// running service is left as is.
  pub async fn start(&self, name: &str) -> Result<()> {
    let entry = self.entry(name)?;
    entry.cancel_restart();
    start_entry(name, &entry, StartMode::Manual, self.timeouts())
      .await
      .map_err(anyhow::Error::msg)
  }

  /// Stop one service by name. It will not be restarted automatically.
  pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
    let entry = self.entry(name)?;
    entry.cancel_restart();
    stop_entry(name, &entry, self.settings.stop_timeout).await;
    lock_or_recover(&entry.state).status = ServiceStatus::Stopped;
    Ok(())
  }

  /// Close the circuit manually: clear the failure count and backoff.
  ///
  /// A `Failed` service becomes `Stopped` and may be started again.
  pub fn reset(&self, name: &str) -> Result<(), SupervisorError> {
    let entry = self.entry(name)?;
    let mut state = lock_or_recover(&entry.state);
    state.consecutive_failures = 0;
    state.restart_backoff_seconds = 0;
    if state.status == ServiceStatus::Failed {
      state.status = ServiceStatus::Stopped;
    }
    info!(service = %name, "Circuit reset");
    Ok(())
  }

  /// Snapshot of every service's runtime state.
  pub fn get_status(&self) -> BTreeMap<String, ServiceRuntimeState> {
    self
      .snapshot_entries()
      .into_iter()
      .map(|(name, entry)| {
        let state = lock_or_recover(&entry.state).clone();
        (name, state)
      })
      .collect()
  }

  /// Stats reported by every service.
  pub fn get_stats(&self) -> BTreeMap<String, Value> {
    self
      .snapshot_entries()
      .into_iter()
      .map(|(name, entry)| (name, entry.service.stats()))
      .collect()
  }

  /// One monitor pass over every service.
  ///
  /// Only `Running` and `Crashed` services are examined; services that
  /// are starting, waiting to restart, stopped or failed are left alone.
  #[instrument(skip(self))]
  pub async fn check_once(self: &Arc<Self>) {
    for (name, entry) in self.snapshot_entries() {
      let (status, last_error) = {
        let state = lock_or_recover(&entry.state);
        (state.status, state.last_error.clone())
      };
      let verdict = match status {
        ServiceStatus::Running => self.probe(&entry).await,
        ServiceStatus::Crashed => {
          Err(last_error.unwrap_or_else(|| "service crashed".to_string()))
        }
        _ => continue,
      };

      match verdict {
        Ok(()) => {
          let mut state = lock_or_recover(&entry.state);
          if state.consecutive_failures > 0 {
            info!(service = %name, "Service healthy again, failure count reset");
          }
          state.consecutive_failures = 0;
          state.restart_backoff_seconds = 0;
        }
        Err(reason) => self.record_failure(&name, &entry, reason).await,
      }
    }
  }

  /// Probe one service's heartbeat.
  async fn probe(&self, entry: &ServiceEntry) -> Result<(), String> {
    let probe = AssertUnwindSafe(entry.service.heartbeat()).catch_unwind();
    let heartbeat = match tokio::time::timeout(self.settings.probe_timeout, probe).await {
      Err(_) => return Err("health probe timed out".to_string()),
      Ok(Err(panic)) => {
        return Err(format!("health probe panicked: {}", panic_message(panic.as_ref())));
      }
      Ok(Ok(Err(e))) => return Err(format!("{e:#}")),
      Ok(Ok(Ok(heartbeat))) => heartbeat,
    };

    let now = Utc::now();
    let seen = match heartbeat {
      Heartbeat::Alive => now,
      Heartbeat::LastSeen(at) => at,
    };
    lock_or_recover(&entry.state).last_heartbeat = Some(seen);

    let age = (now - seen).to_std().unwrap_or_default();
    if age > self.settings.heartbeat_timeout {
      return Err(format!("heartbeat stale for {}s", age.as_secs()));
    }
    if !entry.service.is_healthy() {
      return Err("service reports unhealthy".to_string());
    }
    Ok(())
  }

  async fn record_failure(self: &Arc<Self>, name: &str, entry: &Arc<ServiceEntry>, reason: String) {
    let max = self.settings.max_consecutive_failures;
    let (failures, restart_after) = {
      let mut state = lock_or_recover(&entry.state);
      state.consecutive_failures += 1;
      state.last_error = Some(reason.clone());
      let failures = state.consecutive_failures;

      if failures >= max {
        state.status = ServiceStatus::Failed;
        (failures, None)
      } else {
        let delay = self.settings.restart_backoff.delay_for(failures - 1);
        state.restart_backoff_seconds = delay.as_secs();
        state.status = ServiceStatus::Restarting;
        (failures, Some(delay))
      }
    };

    match restart_after {
      Some(delay) => {
        warn!(
          service = %name,
          failures,
          max,
          backoff_secs = delay.as_secs(),
          reason = %reason,
          "Service unhealthy, scheduling restart"
        );
        let handle = tokio::spawn(restart_after_backoff(
          name.to_string(),
          Arc::clone(entry),
          delay,
          self.timeouts(),
          self.shutdown_tx.subscribe(),
        ));
        if let Some(previous) = lock_or_recover(&entry.restart_task).replace(handle) {
          previous.abort();
        }
      }
      None => {
        error!(service = %name, failures, reason = %reason, "Circuit open, service marked failed");
        stop_entry(name, entry, self.settings.stop_timeout).await;
        if let Some(alert) = &self.alert {
          if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| alert(name, failures))) {
            warn!(service = %name, error = %panic_message(panic.as_ref()), "Alert callback panicked");
          }
        }
      }
    }
  }

  /// Write one status record per service.
  pub async fn persist_status(&self) -> Result<()> {
    let Some(repo) = &self.status_repo else {
      return Ok(());
    };

    let pid = std::process::id();
    for (name, entry) in self.snapshot_entries() {
      let state = lock_or_recover(&entry.state).clone();
      let record = ServiceStatusRecord {
        host_id: self.settings.host_id.clone(),
        service_name: name,
        pid,
        run_id: self.run_id,
        status: state.status,
        heartbeat: state.last_heartbeat,
        consecutive_failures: state.consecutive_failures,
        stats: entry.service.stats(),
        written_at: Utc::now(),
      };
      repo.write(&record).await?;
    }
    Ok(())
  }

  /// Monitor loop: health checks every `monitor_interval`, status records
  /// every `status_interval`, until `shutdown()`.
  pub async fn run_monitor(self: Arc<Self>) {
    let mut shutdown_rx = self.shutdown_tx.subscribe();
    let mut checks = tokio::time::interval(self.settings.monitor_interval);
    let mut persist = tokio::time::interval(self.settings.status_interval);
    checks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    persist.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick of an interval completes immediately.
    checks.tick().await;

    info!(
      interval_secs = self.settings.monitor_interval.as_secs(),
      "Supervisor monitor started"
    );
    loop {
      tokio::select! {
        biased;
        _ = shutdown_rx.changed() => break,
        _ = checks.tick() => self.check_once().await,
        _ = persist.tick() => {
          if let Err(e) = self.persist_status().await {
            warn!(error = %format!("{e:#}"), "Failed to persist service status");
          }
        }
      }
    }
    debug!("Supervisor monitor exited");
  }

  /// Spawn `run_monitor` in the background.
  pub fn spawn_monitor(self: &Arc<Self>) {
    let handle = tokio::spawn(Arc::clone(self).run_monitor());
    if let Some(previous) = lock_or_recover(&self.monitor).replace(handle) {
      previous.abort();
    }
  }

  /// Stop the monitor, cancel restarts, stop every service and write a
  /// final status record.
  #[instrument(skip(self))]
  pub async fn shutdown(&self) {
    self.shutdown_tx.send_replace(true);
    let monitor = lock_or_recover(&self.monitor).take();
    if let Some(mut handle) = monitor {
      if tokio::time::timeout(self.settings.stop_timeout, &mut handle)
        .await
        .is_err()
      {
        handle.abort();
      }
    }

    self.stop_all().await;
    if let Err(e) = self.persist_status().await {
      warn!(error = %format!("{e:#}"), "Failed to persist final service status");
    }
  }
}

impl StatusSource for Supervisor {
  fn service_status(&self) -> BTreeMap<String, ServiceRuntimeState> {
    self.get_status()
  }

  fn service_stats(&self) -> BTreeMap<String, Value> {
    self.get_stats()
  }
}

#[derive(Debug, Clone, Copy)]
struct OpTimeouts {
  start: Duration,
  stop: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
  /// `start`/`start_all`.
  Manual,
  /// Backoff expired; only proceeds while the service is still `Restarting`.
  Restart,
}

/// Start under the service's ops lock and record the outcome.
///
/// A service left in any state other than `Registered`/`Stopped` is
/// stopped first. A stop request arriving while this waits for the lock or
/// for `start()` cancels the attempt.
async fn start_entry(
  name: &str,
  entry: &ServiceEntry,
  mode: StartMode,
  timeouts: OpTimeouts,
) -> Result<(), String> {
  let mut stop_rx = entry.stop_requests.subscribe();

  let attempt = async {
    let _ops = entry.ops.lock().await;
    let previous = {
      let mut state = lock_or_recover(&entry.state);
      match (mode, state.status) {
        (_, ServiceStatus::Running) => {
          debug!(service = %name, "Service already running");
          return Ok(());
        }
        (StartMode::Restart, status) if status != ServiceStatus::Restarting => {
          debug!(service = %name, status = ?status, "Restart superseded");
          return Ok(());
        }
        (StartMode::Restart, _) => state.restarts += 1,
        (StartMode::Manual, _) => {}
      }
      std::mem::replace(&mut state.status, ServiceStatus::Starting)
    };

    if !matches!(previous, ServiceStatus::Registered | ServiceStatus::Stopped)
      && tokio::time::timeout(timeouts.stop, stop_service(name, entry))
        .await
        .is_err()
    {
      warn!(service = %name, timeout_secs = timeouts.stop.as_secs(), "Service stop timed out");
    }

    let start = AssertUnwindSafe(entry.service.start()).catch_unwind();
    let outcome = match tokio::time::timeout(timeouts.start, start).await {
      Err(_) => Err("start timed out".to_string()),
      Ok(Ok(Ok(()))) => Ok(()),
      Ok(Ok(Err(e))) => Err(format!("{e:#}")),
      Ok(Err(panic)) => Err(format!("start panicked: {}", panic_message(panic.as_ref()))),
    };

    let now = Utc::now();
    let mut state = lock_or_recover(&entry.state);
    match &outcome {
      Ok(()) => {
        state.status = ServiceStatus::Running;
        state.started_at = Some(now);
        state.last_heartbeat = Some(now);
        match mode {
          StartMode::Manual => info!(service = %name, "Service started"),
          StartMode::Restart => info!(service = %name, "Service restarted"),
        }
      }
      Err(e) => {
        state.status = ServiceStatus::Crashed;
        state.last_error = Some(e.clone());
        error!(service = %name, error = %e, "Service failed to start");
      }
    }
    outcome
  };

  tokio::select! {
    biased;
    _ = stop_rx.changed() => {
      let mut state = lock_or_recover(&entry.state);
      if state.status == ServiceStatus::Starting {
        state.status = ServiceStatus::Stopped;
      }
      info!(service = %name, "Start cancelled by stop request");
      Err("start cancelled by stop request".to_string())
    }
    outcome = attempt => outcome,
  }
}

async fn stop_service(name: &str, entry: &ServiceEntry) {
  match AssertUnwindSafe(entry.service.stop()).catch_unwind().await {
    Ok(Ok(())) => debug!(service = %name, "Service stopped"),
    Ok(Err(e)) => warn!(service = %name, error = %format!("{e:#}"), "Service stop failed"),
    Err(panic) => warn!(service = %name, error = %panic_message(panic.as_ref()), "Service stop panicked"),
  }
}

/// Cancel any in-flight start, then stop under the service's ops lock.
/// Waiting for the lock and `stop()` together are bounded by `timeout`.
async fn stop_entry(name: &str, entry: &ServiceEntry, timeout: Duration) {
  entry.stop_requests.send_modify(|n| *n = n.wrapping_add(1));
  let stop = async {
    let _ops = entry.ops.lock().await;
    stop_service(name, entry).await;
  };
  if tokio::time::timeout(timeout, stop).await.is_err() {
    warn!(service = %name, timeout_secs = timeout.as_secs(), "Service stop timed out");
  }
}

async fn restart_after_backoff(
  name: String,
  entry: Arc<ServiceEntry>,
  delay: Duration,
  timeouts: OpTimeouts,
  mut shutdown_rx: watch::Receiver<bool>,
) {
  tokio::select! {
    _ = tokio::time::sleep(delay) => {}
    _ = shutdown_rx.changed() => return,
  }

  // Failures are recorded on the entry and picked up by the next check.
  let _ = start_entry(&name, &entry, StartMode::Restart, timeouts).await;
}
