//! Exchange WebSocket Transport - tokio-tungstenite Stream Connection
//!
//! Implements the streaming transport port:
//! - Signed handshake (auth headers on the upgrade request)
//! - JSON channel commands with increasing ids
//! - Text frames decoded into `StreamEnvelope`s; control frames and
//!   undecodable frames are skipped
//!
//! The socket is split so `send` and `receive` never contend on one lock.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument};

use crate::ports::signer::AuthHeaders;
use crate::ports::transport::{
    ChannelCommand, StreamConnection, StreamConnector, StreamEnvelope, TICKER_UPDATE,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens authenticated WebSocket connections.
pub struct WsConnector {
    /// WebSocket URL.
    ws_url: String,
    /// Path signed for the handshake.
    signing_path: String,
}

impl WsConnector {
    pub fn new(ws_url: impl Into<String>, signing_path: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            signing_path: signing_path.into(),
        }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    fn signing_path(&self) -> &str {
        &self.signing_path
    }

    #[instrument(skip(self, auth), fields(url = %self.ws_url))]
    async fn connect(&self, auth: &AuthHeaders) -> Result<Arc<dyn StreamConnection>> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .context("Invalid WebSocket URL")?;
        for (name, value) in auth.iter() {
            request.headers_mut().insert(
                HeaderName::from_bytes(name.as_bytes()).context("Invalid auth header name")?,
                HeaderValue::from_str(value).context("Invalid auth header value")?,
            );
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .context("WebSocket connection failed")?;
        let (sink, stream) = ws_stream.split();

        info!("Exchange WebSocket connected");
        Ok(Arc::new(WsConnection {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }))
    }
}

/// One open WebSocket.
pub struct WsConnection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn send(&self, command: &ChannelCommand) -> Result<()> {
        let text = encode_command(command);
        debug!(command = %text, "Sending channel command");
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .context("Failed to send WebSocket frame")
    }

    async fn receive(&self) -> Result<Option<StreamEnvelope>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<StreamEnvelope>(&text) {
                    Ok(envelope) => return Ok(Some(envelope)),
                    Err(e) => debug!(error = %e, "Skipping undecodable frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by server");
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(anyhow::anyhow!("WebSocket error: {e}")),
                None => return Ok(None),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // Closing an already-closed socket reports an error we do not care about.
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "WebSocket close");
        }
        Ok(())
    }
}

/// Serialize a channel command as the exchange expects it.
pub fn encode_command(command: &ChannelCommand) -> String {
    let cmd = match command {
        ChannelCommand::Subscribe { .. } => "subscribe",
        ChannelCommand::Unsubscribe { .. } => "unsubscribe",
    };
    json!({
        "id": command.id(),
        "cmd": cmd,
        "params": {
            "channels": [TICKER_UPDATE],
            "market_tickers": command.tickers(),
        },
    })
    .to_string()
}
