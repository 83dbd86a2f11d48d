//! Streaming Transport Port - Push-Channel Connection Interface
//!
//! The streaming handler talks to a connector that opens authenticated
//! connections, and to connections that send channel commands and yield
//! already-decoded envelopes. Wire framing stays in the adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::signer::AuthHeaders;
use crate::domain::Ticker;

/// Envelope type carrying a ticker price update.
pub const TICKER_UPDATE: &str = "ticker";

/// Outbound channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
  /// Start receiving ticker updates for these markets.
  Subscribe { id: u64, tickers: Vec<Ticker> },
  /// Stop receiving ticker updates for these markets.
  Unsubscribe { id: u64, tickers: Vec<Ticker> },
}

impl ChannelCommand {
  /// Command id.
  pub fn id(&self) -> u64 {
    match self {
      Self::Subscribe { id, .. } | Self::Unsubscribe { id, .. } => *id,
    }
  }

  /// Tickers the command applies to.
  pub fn tickers(&self) -> &[Ticker] {
    match self {
      Self::Subscribe { tickers, .. } | Self::Unsubscribe { tickers, .. } => tickers,
    }
  }
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamEnvelope {
  /// Type discriminator (`ticker`, `orderbook_delta`, `trade`, `fill`, ...).
  #[serde(rename = "type")]
  pub kind: String,
  /// Subscription id assigned by the server.
  #[serde(default)]
  pub sid: Option<u64>,
  /// Server sequence number.
  #[serde(default)]
  pub seq: Option<u64>,
  /// Message body.
  #[serde(default)]
  pub msg: Value,
}

impl StreamEnvelope {
  /// Build an envelope (adapters and tests).
  pub fn new(kind: impl Into<String>, msg: Value) -> Self {
    Self {
      kind: kind.into(),
      sid: None,
      seq: None,
      msg,
    }
  }
}

/// Opens streaming connections.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
  /// Path included in the handshake signature.
  fn signing_path(&self) -> &str;

  /// Open an authenticated connection.
  async fn connect(&self, auth: &AuthHeaders) -> anyhow::Result<Arc<dyn StreamConnection>>;
}

/// One open streaming connection.
///
/// `send` and `receive` may be called concurrently from different tasks.
#[async_trait]
pub trait StreamConnection: Send + Sync {
  /// Send a channel command.
  async fn send(&self, command: &ChannelCommand) -> anyhow::Result<()>;

  /// Next decoded envelope; `Ok(None)` when the peer closed the stream.
  async fn receive(&self) -> anyhow::Result<Option<StreamEnvelope>>;

  /// Close the connection. Safe to call more than once.
  async fn close(&self) -> anyhow::Result<()>;
}
