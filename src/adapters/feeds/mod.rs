//! Streaming Feed Adapters - Exchange Push Channel
//!
//! WebSocket transport for the streaming handler: authenticated
//! handshake, channel commands and envelope decoding.

pub mod ws_transport;

pub use ws_transport::{WsConnection, WsConnector};
