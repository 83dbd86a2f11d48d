//! Prediction Market Sync - Entry Point
//!
//! Keeps a local view of market prices in sync from a REST poll and a
//! push stream, under a supervisor that restarts failing services.
//!
//! Subcommands:
//! - `run` (default): supervised daemon until SIGINT
//! - `poll-once`: one REST poll through the versioned store, then exit
//! - `status`: print the status records written by a running daemon
//!
//! Wiring sequence for `run`:
//! 1. Load config.toml + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Build signer, rate limiter(s), REST client and history store
//! 4. Build the hybrid manager (or a bare poller when streaming is off)
//! 5. Register it with the supervisor, start it, spawn the monitor
//! 6. Spawn health/metrics server
//! 7. Wait for SIGINT, then shut everything down

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use prediction_market_sync::adapters::api::auth::HmacSigner;
use prediction_market_sync::adapters::api::client::{RestClientConfig, RestMarketDataClient};
use prediction_market_sync::adapters::feeds::WsConnector;
use prediction_market_sync::adapters::metrics::{HealthServer, HealthState, MetricsRegistry};
use prediction_market_sync::adapters::persistence::{FileStatusStore, JsonlHistoryStore};
use prediction_market_sync::config::{self, AppConfig};
use prediction_market_sync::domain::ServiceKind;
use prediction_market_sync::ports::market_data::MarketDataClient;
use prediction_market_sync::ports::service::ManagedService;
use prediction_market_sync::ports::status::StatusRepository;
use prediction_market_sync::usecases::hybrid::{HybridMarketData, HybridSettings};
use prediction_market_sync::usecases::market_poller::MarketPoller;
use prediction_market_sync::usecases::poller::PollerService;
use prediction_market_sync::usecases::rate_limiter::RateLimiter;
use prediction_market_sync::usecases::streaming::{StreamSettings, StreamingHandler};
use prediction_market_sync::usecases::supervisor::{Supervisor, SupervisorSettings};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Parsed command line.
struct Cli {
    command: Command,
    config_path: String,
}

enum Command {
    Run,
    PollOnce,
    Status,
}

impl Cli {
    fn parse() -> Result<Self> {
        let mut command = Command::Run;
        let mut config_path = DEFAULT_CONFIG_PATH.to_string();
        let mut args = std::env::args().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "run" => command = Command::Run,
                "poll-once" => command = Command::PollOnce,
                "status" => command = Command::Status,
                "--config" | "-c" => {
                    config_path = args.next().context("--config requires a path")?;
                }
                other => anyhow::bail!(
                    "Unknown argument `{other}`. Usage: market-sync [run|poll-once|status] [--config PATH]"
                ),
            }
        }

        Ok(Self {
            command,
            config_path,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse()?;

    // ── 1. Load configuration ───────────────────────────────
    let config = config::loader::load_config(&cli.config_path)
        .context("Failed to load configuration")?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level)),
        )
        .json()
        .init();

    match cli.command {
        Command::Run => run(config).await,
        Command::PollOnce => poll_once(config).await,
        Command::Status => print_status(config).await,
    }
}

/// Shared collaborators built from config.
struct Components {
    signer: Arc<HmacSigner>,
    client: Arc<RestMarketDataClient>,
    store: Arc<JsonlHistoryStore>,
    stream_limiter: Arc<RateLimiter>,
}

async fn build_components(config: &AppConfig) -> Result<Components> {
    let signer = Arc::new(HmacSigner::new(&config.credentials));
    if !signer.has_credentials() {
        warn!("No API credentials configured; signed requests will fail");
    }

    let rest_limiter = Arc::new(RateLimiter::from_config("exchange", &config.rate_limits));
    let stream_limiter = if config.rate_limits.shared {
        Arc::clone(&rest_limiter)
    } else {
        Arc::new(RateLimiter::from_config("exchange_stream", &config.rate_limits))
    };

    let client = Arc::new(
        RestMarketDataClient::new(signer.clone(), RestClientConfig::from_api(&config.api))
            .context("Failed to create REST client")?
            .with_quota(rest_limiter.clone()),
    );
    let store = Arc::new(
        JsonlHistoryStore::open(&config.persistence.data_dir)
            .await
            .context("Failed to open price history")?,
    );

    Ok(Components {
        signer,
        client,
        store,
        stream_limiter,
    })
}

fn market_poller(config: &AppConfig, components: &Components) -> MarketPoller {
    MarketPoller::new(
        "exchange_poller",
        components.client.clone(),
        components.store.clone(),
        config.poller.groups.clone(),
    )
}

/// The single supervised unit: hybrid manager, or a bare poller when
/// streaming is disabled.
fn market_data_service(config: &AppConfig, components: &Components) -> Arc<dyn ManagedService> {
    let stop_timeout = Duration::from_secs(config.supervisor.stop_timeout_secs);
    let poller = market_poller(config, components);

    if !config.stream.enabled {
        info!("Streaming disabled; supervising REST poller only");
        let service = PollerService::new(
            Arc::new(poller),
            ServiceKind::ExchangePoller,
            config.poller.interval(),
        )
        .with_stop_timeout(stop_timeout);
        return Arc::new(service);
    }

    let connector = Arc::new(WsConnector::new(
        config.api.ws_url.clone(),
        config.api.ws_path.clone(),
    ));
    let streaming = Arc::new(StreamingHandler::new(
        "exchange_stream",
        connector,
        components.signer.clone(),
        Arc::clone(&components.stream_limiter),
        StreamSettings::from_config(&config.stream, stop_timeout),
    ));

    let settings = HybridSettings {
        tracked_tickers: config.stream.tracked_tickers.clone(),
        poll_interval: config.poller.interval(),
        disconnected_interval: config.poller.disconnected_interval(),
        track_discovered: config.stream.track_discovered,
        stop_timeout,
    };
    Arc::new(HybridMarketData::new("market_data", poller, streaming, settings))
}

async fn run(config: AppConfig) -> Result<()> {
    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        groups = config.poller.groups.len(),
        stream = config.stream.enabled,
        "Starting market sync"
    );

    // ── 3. Collaborators ────────────────────────────────────
    let components = build_components(&config).await?;
    let status_store: Arc<dyn StatusRepository> = Arc::new(
        FileStatusStore::new(&config.persistence.data_dir)
            .await
            .context("Failed to open status store")?,
    );

    // ── 4. Market data service ──────────────────────────────
    let service = market_data_service(&config, &components);

    // ── 5. Supervisor ───────────────────────────────────────
    let settings = SupervisorSettings::from_config(
        &config.supervisor,
        &config.service.host_id,
        Duration::from_secs(config.persistence.status_interval_secs),
    );
    let supervisor = Arc::new(
        Supervisor::new(settings)
            .with_status_repository(status_store)
            .with_alert(Arc::new(|name: &str, failures: u32| {
                error!(service = %name, failures, "Circuit opened; service will not be restarted");
            })),
    );
    supervisor
        .register(service)
        .context("Failed to register market data service")?;

    let report = supervisor.start_all().await;
    if !report.all_started() {
        warn!(failed = ?report.failed, "Some services failed to start; the monitor will retry");
    }
    supervisor.spawn_monitor();

    // ── 6. Health and metrics server ────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let health_handle = if config.metrics.enabled {
        let metrics = Arc::new(MetricsRegistry::new().context("Failed to create metrics")?);
        let state = HealthState::new(supervisor.clone(), metrics);
        let server = HealthServer::new(state, config.metrics.bind_address.clone());
        let shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_rx).await {
                error!(error = %e, "Health server failed");
            }
        }))
    } else {
        None
    };

    info!(run_id = %supervisor.run_id(), "Market sync is running");

    // ── 7. Wait for SIGINT ──────────────────────────────────
    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("SIGINT received, initiating graceful shutdown");

    let _ = shutdown_tx.send(());
    supervisor.shutdown().await;
    if let Err(e) = components.client.close().await {
        warn!(error = %e, "Failed to close REST client");
    }

    if let Some(handle) = health_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn poll_once(config: AppConfig) -> Result<()> {
    let components = build_components(&config).await?;
    let service = PollerService::new(
        Arc::new(market_poller(&config, &components)),
        ServiceKind::ExchangePoller,
        config.poller.interval(),
    );

    let report = service.poll_once().await;
    components.client.close().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.error {
        Some(e) => anyhow::bail!("Poll failed: {e}"),
        None => Ok(()),
    }
}

async fn print_status(config: AppConfig) -> Result<()> {
    let store = FileStatusStore::new(&config.persistence.data_dir).await?;
    let records = store.read_all().await?;
    if records.is_empty() {
        info!(data_dir = %config.persistence.data_dir, "No status records found");
    }
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
