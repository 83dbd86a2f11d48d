//! Request Quota Port - Outbound Request Budget
//!
//! Adapters that talk to the exchange take one unit of quota before every
//! wire request, retries and extra pages included.

use async_trait::async_trait;

/// Trait for outbound request budgets.
#[async_trait]
pub trait RequestQuota: Send + Sync + 'static {
  /// Wait for one unit of quota. `false` means none can ever be granted.
  async fn acquire(&self) -> bool;

  /// Name for logging.
  fn name(&self) -> &str;
}
