//! Price History Store - Append-only JSONL Versioned Prices
//!
//! Implements the versioned store port with daily JSONL files in the
//! format `history/YYYY-MM-DD.jsonl`. Each line is one price version;
//! lines are never rewritten. The current version per ticker is kept in
//! memory and rebuilt from the files on open, so `created` stays accurate
//! across restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::Ticker;
use crate::ports::store::{MarketSnapshot, UpsertOutcome, VersionedStore};

/// One line of the history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceVersion {
    /// Per-ticker version number, starting at 1.
    pub version: u64,
    /// When this version was written.
    pub recorded_at: DateTime<Utc>,
    /// The versioned entity.
    pub snapshot: MarketSnapshot,
}

impl PriceVersion {
    /// Same prices and series as `snapshot`.
    fn matches(&self, snapshot: &MarketSnapshot) -> bool {
        self.snapshot.series_id == snapshot.series_id
            && self.snapshot.record.yes_price == snapshot.record.yes_price
            && self.snapshot.record.no_price == snapshot.record.no_price
    }
}

/// Append-only JSONL price history with an in-memory current pointer.
pub struct JsonlHistoryStore {
    /// Directory holding the daily history files.
    history_dir: PathBuf,
    /// Current version per ticker. Held across the append so versions
    /// land in the file in the same order they are numbered.
    current: Mutex<HashMap<Ticker, PriceVersion>>,
}

impl JsonlHistoryStore {
    /// Open the store in `data_dir`, replaying existing history.
    pub async fn open(data_dir: &str) -> Result<Self> {
        let history_dir = Path::new(data_dir).join("history");
        fs::create_dir_all(&history_dir)
            .await
            .context("Failed to create history directory")?;

        let current = load_current(&history_dir).await?;
        info!(
            dir = %history_dir.display(),
            tickers = current.len(),
            "Price history loaded"
        );

        Ok(Self {
            history_dir,
            current: Mutex::new(current),
        })
    }

    /// Current version for a ticker.
    pub async fn current(&self, ticker: &str) -> Option<PriceVersion> {
        self.current.lock().await.get(ticker).cloned()
    }

    /// Number of tickers with a current version.
    pub async fn len(&self) -> usize {
        self.current.lock().await.len()
    }

    /// Every stored version of a ticker, oldest first.
    #[instrument(skip(self))]
    pub async fn history(&self, ticker: &str) -> Result<Vec<PriceVersion>> {
        let mut versions: Vec<PriceVersion> = read_all_versions(&self.history_dir)
            .await?
            .into_iter()
            .filter(|v| v.snapshot.record.ticker == ticker)
            .collect();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    async fn append(&self, version: &PriceVersion) -> Result<()> {
        let date = version.recorded_at.format("%Y-%m-%d").to_string();
        let path = self.history_dir.join(format!("{date}.jsonl"));

        let mut json = serde_json::to_string(version).context("Failed to serialize price version")?;
        json.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context("Failed to open history file")?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write price version")?;

        file.flush().await.context("Failed to flush history file")?;

        Ok(())
    }
}

#[async_trait]
impl VersionedStore for JsonlHistoryStore {
    async fn upsert_with_history(&self, snapshot: &MarketSnapshot) -> Result<UpsertOutcome> {
        let mut current = self.current.lock().await;
        let ticker = &snapshot.record.ticker;

        let (created, version) = match current.get(ticker) {
            Some(existing) if existing.matches(snapshot) => {
                debug!(ticker = %ticker, "Price unchanged, no new version");
                return Ok(UpsertOutcome { created: false });
            }
            Some(existing) => (false, existing.version + 1),
            None => (true, 1),
        };

        let entry = PriceVersion {
            version,
            recorded_at: Utc::now(),
            snapshot: snapshot.clone(),
        };
        self.append(&entry)
            .await
            .with_context(|| format!("Failed to append history for `{ticker}`"))?;
        current.insert(ticker.clone(), entry);

        Ok(UpsertOutcome { created })
    }
}

/// Latest version per ticker across every history file.
async fn load_current(dir: &Path) -> Result<HashMap<Ticker, PriceVersion>> {
    let mut current: HashMap<Ticker, PriceVersion> = HashMap::new();
    for version in read_all_versions(dir).await? {
        let ticker = version.snapshot.record.ticker.clone();
        match current.get(&ticker) {
            Some(existing) if existing.version >= version.version => {}
            _ => {
                current.insert(ticker, version);
            }
        }
    }
    Ok(current)
}

async fn read_all_versions(dir: &Path) -> Result<Vec<PriceVersion>> {
    let mut versions = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .context("Failed to read history directory")?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "jsonl") {
            continue;
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PriceVersion>(line) {
                Ok(version) => versions.push(version),
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        error = %e,
                        "Skipping malformed history line"
                    );
                }
            }
        }
    }

    Ok(versions)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::{PriceRecord, PriceSource};

    fn snapshot(ticker: &str, yes: rust_decimal::Decimal) -> MarketSnapshot {
        MarketSnapshot {
            series_id: "KXNFLGAME".into(),
            record: PriceRecord::new(
                ticker,
                yes,
                Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap(),
                PriceSource::Rest,
            ),
        }
    }

    #[tokio::test]
    async fn test_created_then_updated() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path().to_str().unwrap()).await.unwrap();

        let first = store.upsert_with_history(&snapshot("MKT-A", dec!(0.40))).await.unwrap();
        let second = store.upsert_with_history(&snapshot("MKT-A", dec!(0.45))).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(store.current("MKT-A").await.unwrap().version, 2);
        assert_eq!(store.history("MKT-A").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_price_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path().to_str().unwrap()).await.unwrap();

        store.upsert_with_history(&snapshot("MKT-A", dec!(0.40))).await.unwrap();
        let again = store.upsert_with_history(&snapshot("MKT-A", dec!(0.40))).await.unwrap();

        assert!(!again.created);
        assert_eq!(store.history("MKT-A").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_replays_current_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        {
            let store = JsonlHistoryStore::open(&path).await.unwrap();
            store.upsert_with_history(&snapshot("MKT-A", dec!(0.40))).await.unwrap();
            store.upsert_with_history(&snapshot("MKT-A", dec!(0.55))).await.unwrap();
            store.upsert_with_history(&snapshot("MKT-B", dec!(0.10))).await.unwrap();
        }

        let store = JsonlHistoryStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);
        let current = store.current("MKT-A").await.unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.snapshot.record.yes_price, dec!(0.55));

        let outcome = store.upsert_with_history(&snapshot("MKT-B", dec!(0.20))).await.unwrap();
        assert!(!outcome.created);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let history = dir.path().join("history");
        std::fs::create_dir_all(&history).unwrap();
        std::fs::write(history.join("2026-01-05.jsonl"), "not json\n\n").unwrap();

        let store = JsonlHistoryStore::open(dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(store.len().await, 0);
    }
}
