//! Versioned Store Port - Upsert with History
//!
//! Prices are written through a store that keeps every historical
//! version (SCD Type 2): new versions are appended and the current
//! pointer moves; history is never deleted or rewritten.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::PriceRecord;

/// Entity written by the REST poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSnapshot {
  /// Series the market belongs to.
  pub series_id: String,
  /// Observed price.
  #[serde(flatten)]
  pub record: PriceRecord,
}

/// Result of one upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertOutcome {
  /// True when the entity did not exist before.
  pub created: bool,
}

/// Trait for versioned persistence providers.
#[async_trait]
pub trait VersionedStore: Send + Sync + 'static {
  /// Insert or re-point the current version, appending history.
  async fn upsert_with_history(&self, snapshot: &MarketSnapshot) -> anyhow::Result<UpsertOutcome>;
}
