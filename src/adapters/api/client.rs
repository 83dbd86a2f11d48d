//! Exchange HTTP Client - Market Listings over REST
//!
//! Wraps reqwest with a concurrency cap, signed requests, retries with
//! exponential backoff on transient errors, and cursor pagination. When a
//! `RequestQuota` is attached, one unit is taken before every wire
//! request: each page and each retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use super::types::ListingsPage;
use crate::config::ApiConfig;
use crate::ports::market_data::MarketDataClient;
use crate::ports::quota::RequestQuota;
use crate::ports::signer::RequestSigner;

/// Listings endpoint, relative to the base URL.
const MARKETS_PATH: &str = "/markets";

/// Configuration for the exchange HTTP client.
#[derive(Debug, Clone)]
pub struct RestClientConfig {
  /// Base URL for the REST API.
  pub base_url: String,
  /// Request timeout.
  pub timeout: Duration,
  /// Maximum concurrent requests.
  pub max_concurrent: usize,
  /// Maximum retries on transient errors.
  pub max_retries: u32,
  /// Base delay between retries (exponential backoff).
  pub retry_base_delay: Duration,
  /// Records requested per page.
  pub page_limit: u32,
  /// Pages followed per series before giving up.
  pub max_pages: u32,
}

impl RestClientConfig {
  pub fn from_api(api: &ApiConfig) -> Self {
    Self {
      base_url: api.rest_base_url.trim_end_matches('/').to_string(),
      timeout: Duration::from_millis(api.timeout_ms),
      max_retries: api.max_retries,
      retry_base_delay: Duration::from_millis(api.retry_base_delay_ms),
      ..Self::default()
    }
  }
}

impl Default for RestClientConfig {
  fn default() -> Self {
    Self {
      base_url: "https://api.elections.kalshi.com/trade-api/v2".to_string(),
      timeout: Duration::from_secs(10),
      max_concurrent: 4,
      max_retries: 3,
      retry_base_delay: Duration::from_millis(200),
      page_limit: 200,
      max_pages: 50,
    }
  }
}

/// Signed, retrying HTTP client for market listings.
pub struct RestMarketDataClient {
  /// Underlying HTTP client.
  http: Client,
  /// Request signer.
  signer: Arc<dyn RequestSigner>,
  /// Client configuration.
  config: RestClientConfig,
  /// Concurrency limiter.
  semaphore: Arc<Semaphore>,
  /// Outbound request budget.
  quota: Option<Arc<dyn RequestQuota>>,
  /// Set by `close()`; later calls fail fast.
  closed: AtomicBool,
}

impl RestMarketDataClient {
  /// Create a new client.
  pub fn new(signer: Arc<dyn RequestSigner>, config: RestClientConfig) -> Result<Self> {
    let http = Client::builder()
      .timeout(config.timeout)
      .pool_max_idle_per_host(5)
      .build()
      .context("Failed to build HTTP client")?;

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

    Ok(Self {
      http,
      signer,
      config,
      semaphore,
      quota: None,
      closed: AtomicBool::new(false),
    })
  }

  /// Take one unit of `quota` before every request.
  pub fn with_quota(mut self, quota: Arc<dyn RequestQuota>) -> Self {
    self.quota = Some(quota);
    self
  }

  /// Fetch every page of listings for one series.
  async fn fetch_series(&self, series_id: &str) -> Result<Vec<Value>> {
    let url = format!("{}{}", self.config.base_url, MARKETS_PATH);
    let sign_path = Url::parse(&url)
      .with_context(|| format!("Invalid listings URL: {url}"))?
      .path()
      .to_string();

    let limit = self.config.page_limit.to_string();
    let mut markets = Vec::new();
    let mut cursor: Option<String> = None;

    for page_no in 0..self.config.max_pages {
      let mut request = self.http.get(&url).query(&[
        ("series_ticker", series_id),
        ("status", "open"),
        ("limit", limit.as_str()),
      ]);
      if let Some(c) = &cursor {
        request = request.query(&[("cursor", c.as_str())]);
      }

      let page: ListingsPage = self
        .execute_with_retry(request, "GET", &sign_path)
        .await?
        .json()
        .await
        .context("Failed to decode listings page")?;

      debug!(series = %series_id, page = page_no, count = page.markets.len(), "Listings page");
      cursor = page.next_cursor().map(str::to_string);
      markets.extend(page.markets);
      if cursor.is_none() {
        return Ok(markets);
      }
    }

    warn!(series = %series_id, max_pages = self.config.max_pages, "Listing pagination truncated");
    Ok(markets)
  }

  /// Execute a request with signing, concurrency cap and retries.
  async fn execute_with_retry(
    &self,
    request: RequestBuilder,
    method: &str,
    path: &str,
  ) -> Result<Response> {
    let _permit = self
      .semaphore
      .acquire()
      .await
      .context("Semaphore closed")?;

    let mut last_error = None;

    for attempt in 0..=self.config.max_retries {
      if attempt > 0 {
        let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying request");
        sleep(delay).await;
      }

      if let Some(quota) = &self.quota {
        anyhow::ensure!(
          quota.acquire().await,
          "request quota `{}` cannot grant a token",
          quota.name()
        );
      }

      let mut req = request.try_clone().context("Failed to clone request")?;
      let headers = self
        .signer
        .sign(method, path, Utc::now().timestamp_millis())
        .context("Failed to sign request")?;
      for (name, value) in headers.iter() {
        req = req.header(name, value);
      }

      match req.send().await {
        Ok(response) => match response.status() {
          status if status.is_success() => return Ok(response),
          StatusCode::TOO_MANY_REQUESTS => {
            warn!("Rate limited by exchange API, backing off");
            last_error = Some(anyhow::anyhow!("Rate limited (429)"));
          }
          status if status.is_server_error() => {
            warn!(status = %status, "Server error, retrying");
            last_error = Some(anyhow::anyhow!("Server error: {status}"));
          }
          status => {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error {status}: {body}");
          }
        },
        Err(e) => {
          warn!(error = %e, attempt, "Request failed");
          last_error = Some(e.into());
        }
      }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Max retries exceeded")))
  }
}

#[async_trait]
impl MarketDataClient for RestMarketDataClient {
  #[instrument(skip(self), fields(series = series_ids.len()))]
  async fn fetch_listings(&self, series_ids: &[String]) -> Result<Vec<Value>> {
    anyhow::ensure!(!self.closed.load(Ordering::Acquire), "market data client is closed");

    let mut listings = Vec::new();
    for series_id in series_ids {
      let markets = self
        .fetch_series(series_id)
        .await
        .with_context(|| format!("Failed to fetch series `{series_id}`"))?;
      listings.extend(markets);
    }
    Ok(listings)
  }

  async fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::Release);
    self.semaphore.close();
    Ok(())
  }
}
