//! Shared test doubles for integration tests.
//!
//! `ChannelConnector` hands out in-memory stream connections whose inbound
//! side is driven by the test through an unbounded channel; `None` on the
//! channel simulates the server closing the connection.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use prediction_market_sync::ports::signer::AuthHeaders;
use prediction_market_sync::ports::transport::{
    ChannelCommand, StreamConnection, StreamConnector, StreamEnvelope, TICKER_UPDATE,
};

pub type Feed = mpsc::UnboundedSender<Option<StreamEnvelope>>;

pub struct ChannelConnection {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<StreamEnvelope>>>,
    sent: Arc<Mutex<Vec<ChannelCommand>>>,
}

#[async_trait]
impl StreamConnection for ChannelConnection {
    async fn send(&self, command: &ChannelCommand) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }

    async fn receive(&self) -> anyhow::Result<Option<StreamEnvelope>> {
        Ok(self.inbound.lock().await.recv().await.flatten())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ChannelConnector {
    pub sent: Arc<Mutex<Vec<ChannelCommand>>>,
    feeds: Mutex<Vec<Feed>>,
    pub connects: AtomicUsize,
}

impl ChannelConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inbound side of the most recent connection.
    pub fn latest_feed(&self) -> Feed {
        self.feeds.lock().unwrap().last().cloned().unwrap()
    }

    /// Every ticker sent in subscribe commands, in order.
    pub fn subscribed(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, ChannelCommand::Subscribe { .. }))
            .flat_map(|c| c.tickers().to_vec())
            .collect()
    }
}

#[async_trait]
impl StreamConnector for ChannelConnector {
    fn signing_path(&self) -> &str {
        "/trade-api/ws/v2"
    }

    async fn connect(&self, _auth: &AuthHeaders) -> anyhow::Result<Arc<dyn StreamConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push(tx);
        Ok(Arc::new(ChannelConnection {
            inbound: tokio::sync::Mutex::new(rx),
            sent: Arc::clone(&self.sent),
        }))
    }
}

/// Ticker update carrying a price in cents and a Unix-seconds timestamp.
pub fn ticker_update(ticker: &str, cents: i64, ts: i64) -> StreamEnvelope {
    StreamEnvelope::new(
        TICKER_UPDATE,
        json!({"market_ticker": ticker, "price": cents, "ts": ts}),
    )
}

/// Poll `condition` until it holds, yielding to background tasks.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
