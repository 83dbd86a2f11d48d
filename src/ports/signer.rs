//! Request Signer Port - Outbound Request Authentication
//!
//! Produces the authentication headers attached to REST requests and to
//! the streaming handshake.

/// Authentication headers for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders {
  headers: Vec<(String, String)>,
}

impl AuthHeaders {
  /// Empty header set.
  pub fn new() -> Self {
    Self::default()
  }

  /// Append one header.
  pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Iterate `(name, value)` pairs.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Look up a header by name.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }

  /// Number of headers.
  pub fn len(&self) -> usize {
    self.headers.len()
  }

  /// Whether no headers are present.
  pub fn is_empty(&self) -> bool {
    self.headers.is_empty()
  }
}

/// Trait for request signers.
///
/// A missing or unusable key is an error: it is fatal to the caller's
/// `start()` and handled by the supervisor's restart policy.
pub trait RequestSigner: Send + Sync + 'static {
  /// Sign `method` + `path` at `timestamp_ms` (Unix milliseconds).
  fn sign(&self, method: &str, path: &str, timestamp_ms: i64) -> anyhow::Result<AuthHeaders>;
}
