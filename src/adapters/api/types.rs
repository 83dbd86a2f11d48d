//! Exchange REST Wire Types
//!
//! Only the envelope is typed; listing bodies stay raw JSON so the price
//! parser can reject individual malformed records without failing the
//! whole page.

use serde::Deserialize;
use serde_json::Value;

/// One page of the market listings endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingsPage {
  /// Raw market records.
  #[serde(default)]
  pub markets: Vec<Value>,
  /// Cursor for the next page; absent or empty on the last page.
  #[serde(default)]
  pub cursor: Option<String>,
}

impl ListingsPage {
  /// Cursor for the next page, if any.
  pub fn next_cursor(&self) -> Option<&str> {
    self.cursor.as_deref().filter(|c| !c.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_page_parsing() {
    let page: ListingsPage = serde_json::from_str(
      r#"{"markets":[{"ticker":"MKT-A"},{"bogus":true}],"cursor":""}"#,
    )
    .unwrap();
    assert_eq!(page.markets.len(), 2);
    assert_eq!(page.next_cursor(), None);

    let page: ListingsPage = serde_json::from_str(r#"{"cursor":"abc"}"#).unwrap();
    assert!(page.markets.is_empty());
    assert_eq!(page.next_cursor(), Some("abc"));
  }
}
