//! Exchange REST API Adapter
//!
//! Implements the Market Data API Client and Request Signer ports over
//! HTTPS.
//!
//! Sub-modules:
//! - `auth`: HMAC-SHA256 request signing
//! - `client`: HTTP client with concurrency cap, retries and pagination
//! - `types`: Listings page envelope

pub mod auth;
pub mod client;
pub mod types;
