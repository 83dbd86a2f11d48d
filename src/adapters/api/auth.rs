//! Request Signing - HMAC-SHA256 Authentication Headers
//!
//! Signs REST requests and the streaming handshake with
//! `base64(HMAC-SHA256(secret, timestamp_ms + METHOD + path))`.
//! Credentials arrive through `CredentialsConfig`; nothing here reads
//! the environment.

use anyhow::Result;
use base64::Engine;

use crate::config::CredentialsConfig;
use crate::ports::signer::{AuthHeaders, RequestSigner};

/// Header carrying the API key id.
pub const KEY_HEADER: &str = "X-API-KEY";
/// Header carrying the signing timestamp in milliseconds.
pub const TIMESTAMP_HEADER: &str = "X-API-TIMESTAMP";
/// Header carrying the base64 signature.
pub const SIGNATURE_HEADER: &str = "X-API-SIGNATURE";

/// HMAC-SHA256 request signer.
pub struct HmacSigner {
    /// API key sent in headers.
    api_key: String,
    /// Shared secret (never sent in headers).
    api_secret: String,
}

impl HmacSigner {
    /// Create a signer from explicit credentials.
    pub fn new(credentials: &CredentialsConfig) -> Self {
        Self {
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
        }
    }

    /// Whether both key and secret are present.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// Compute the signature for one request.
    ///
    /// The secret is NEVER included in the output, only the HMAC.
    pub fn signature(&self, timestamp_ms: i64, method: &str, path: &str) -> String {
        let message = format!("{timestamp_ms}{method}{path}");
        let mac = hmac_sha256::HMAC::mac(message.as_bytes(), self.api_secret.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac)
    }
}

impl RequestSigner for HmacSigner {
    fn sign(&self, method: &str, path: &str, timestamp_ms: i64) -> Result<AuthHeaders> {
        anyhow::ensure!(
            self.has_credentials(),
            "API credentials are not configured (credentials.api_key / credentials.api_secret)"
        );

        let method = method.to_ascii_uppercase();
        Ok(AuthHeaders::new()
            .with(KEY_HEADER, self.api_key.as_str())
            .with(TIMESTAMP_HEADER, timestamp_ms.to_string())
            .with(SIGNATURE_HEADER, self.signature(timestamp_ms, &method, path)))
    }
}
