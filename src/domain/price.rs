//! Price Records - Exact Fixed-Point Market Prices
//!
//! Defines the `PriceRecord` cache entry shared by the REST and streaming
//! paths, plus the parsing rules that turn a raw exchange record (listing
//! or ticker message body) into one. Prices are always `Decimal`, never
//! binary floats: JSON numbers are re-read from their textual form.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Unique symbol identifying one tradable market.
pub type Ticker = String;

/// Keys carrying the ticker symbol, in lookup order.
const TICKER_KEYS: [&str; 2] = ["ticker", "market_ticker"];

/// Keys carrying the YES price in dollars.
const YES_DOLLAR_KEYS: [&str; 2] = ["yes_price", "last_price_dollars"];

/// Keys carrying the YES price in integer cents.
const YES_CENT_KEYS: [&str; 2] = ["last_price", "price"];

/// Keys carrying the NO price in dollars.
const NO_DOLLAR_KEYS: [&str; 1] = ["no_price"];

/// Keys carrying the observation time (RFC 3339 or Unix seconds/ms).
const TIMESTAMP_KEYS: [&str; 3] = ["observed_at", "updated_at", "ts"];

/// Unix timestamps above this are treated as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Which delivery path produced a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Scheduled REST polling.
    Rest,
    /// Persistent push-streaming connection.
    Stream,
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rest => write!(f, "rest"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// One observed price for one ticker.
///
/// Ephemeral: the hybrid cache always replaces it with a fresher
/// observation and never persists it directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    /// Market symbol.
    pub ticker: Ticker,
    /// YES outcome price in dollars, in [0, 1].
    pub yes_price: Decimal,
    /// NO outcome price in dollars, in [0, 1].
    pub no_price: Decimal,
    /// When the exchange observed this price.
    pub observed_at: DateTime<Utc>,
    /// Delivery path.
    pub source: PriceSource,
}

/// Reasons a single raw record is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no ticker")]
    MissingTicker,
    #[error("record has no YES price")]
    MissingPrice,
    #[error("field `{field}` is not a valid price: {value}")]
    InvalidPrice { field: &'static str, value: String },
    #[error("field `{field}` is out of range [0, 1]: {value}")]
    OutOfRange { field: &'static str, value: Decimal },
    #[error("field `{0}` is not a valid timestamp")]
    InvalidTimestamp(&'static str),
}

impl PriceRecord {
    /// Build a record directly (tests, adapters with typed payloads).
    pub fn new(
        ticker: impl Into<Ticker>,
        yes_price: Decimal,
        observed_at: DateTime<Utc>,
        source: PriceSource,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            yes_price,
            no_price: Decimal::ONE - yes_price,
            observed_at,
            source,
        }
    }

    /// Parse a raw exchange record into a price.
    ///
    /// `fallback_observed_at` is used when the record carries no timestamp
    /// of its own; REST callers pass the instant the request was issued so
    /// a slow response never looks newer than it is.
    pub fn from_raw(
        raw: &Value,
        source: PriceSource,
        fallback_observed_at: DateTime<Utc>,
    ) -> Result<Self, RecordError> {
        let obj = raw.as_object().ok_or(RecordError::NotAnObject)?;

        let ticker = TICKER_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(RecordError::MissingTicker)?
            .to_string();

        let yes_price = match dollar_field(obj, &YES_DOLLAR_KEYS)? {
            Some(p) => p,
            None => cent_field(obj, &YES_CENT_KEYS)?.ok_or(RecordError::MissingPrice)?,
        };
        check_range("yes_price", yes_price)?;

        let no_price = match dollar_field(obj, &NO_DOLLAR_KEYS)? {
            Some(p) => p,
            None => Decimal::ONE - yes_price,
        };
        check_range("no_price", no_price)?;

        let observed_at = timestamp_field(obj)?.unwrap_or(fallback_observed_at);

        Ok(Self {
            ticker,
            yes_price,
            no_price,
            observed_at,
            source,
        })
    }

    /// Whether this observation should replace `other` in a cache.
    pub fn is_fresher_than(&self, other: &Self) -> bool {
        self.observed_at > other.observed_at
    }
}

/// Parse a JSON price value into an exact decimal.
///
/// Strings and numbers are both accepted; numbers are re-parsed from
/// their textual form so no binary float ever touches the value.
pub fn parse_decimal(field: &'static str, value: &Value) -> Result<Decimal, RecordError> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(RecordError::InvalidPrice {
                field,
                value: other.to_string(),
            });
        }
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| RecordError::InvalidPrice { field, value: text })
}

/// First present dollar-denominated key; present-but-null is an error.
fn dollar_field(
    obj: &Map<String, Value>,
    keys: &[&'static str],
) -> Result<Option<Decimal>, RecordError> {
    for key in keys {
        if let Some(value) = obj.get(*key) {
            return parse_decimal(*key, value).map(Some);
        }
    }
    Ok(None)
}

/// First present cent-denominated key, converted to dollars.
fn cent_field(
    obj: &Map<String, Value>,
    keys: &[&'static str],
) -> Result<Option<Decimal>, RecordError> {
    for key in keys {
        if let Some(value) = obj.get(*key) {
            return parse_decimal(*key, value).map(|c| Some(c / dec!(100)));
        }
    }
    Ok(None)
}

fn check_range(field: &'static str, value: Decimal) -> Result<(), RecordError> {
    if value < Decimal::ZERO || value > Decimal::ONE {
        return Err(RecordError::OutOfRange { field, value });
    }
    Ok(())
}

fn timestamp_field(obj: &Map<String, Value>) -> Result<Option<DateTime<Utc>>, RecordError> {
    for key in TIMESTAMP_KEYS {
        let Some(value) = obj.get(key) else {
            continue;
        };
        let parsed = match value {
            Value::Null => continue,
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Value::Number(n) => n.as_i64().and_then(|raw| {
                if raw > MILLIS_THRESHOLD {
                    Utc.timestamp_millis_opt(raw).single()
                } else {
                    Utc.timestamp_opt(raw, 0).single()
                }
            }),
            _ => None,
        };
        return parsed.map(Some).ok_or(RecordError::InvalidTimestamp(key));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    #[test]
    fn test_parses_string_and_number_prices_exactly() {
        let raw = json!({"ticker": "MKT-A", "yes_price": "0.52", "no_price": 0.48});
        let rec = PriceRecord::from_raw(&raw, PriceSource::Rest, epoch()).unwrap();
        assert_eq!(rec.yes_price, dec!(0.52));
        assert_eq!(rec.no_price, dec!(0.48));
        assert_eq!(rec.observed_at, epoch());
    }

    #[test]
    fn test_cents_are_converted_and_no_price_derived() {
        let raw = json!({"market_ticker": "MKT-B", "price": 37, "ts": 1_700_000_100});
        let rec = PriceRecord::from_raw(&raw, PriceSource::Stream, epoch()).unwrap();
        assert_eq!(rec.ticker, "MKT-B");
        assert_eq!(rec.yes_price, dec!(0.37));
        assert_eq!(rec.no_price, dec!(0.63));
        assert_eq!(rec.observed_at.timestamp(), 1_700_000_100);
    }

    #[test]
    fn test_dollar_keys_take_precedence_over_cents() {
        let raw = json!({
            "ticker": "MKT-C",
            "last_price_dollars": "0.4100",
            "last_price": 99,
            "updated_at": 1_700_000_050
        });
        let rec = PriceRecord::from_raw(&raw, PriceSource::Rest, epoch()).unwrap();
        assert_eq!(rec.yes_price, dec!(0.41));
        assert_eq!(rec.observed_at.timestamp(), 1_700_000_050);

        let cents_only = json!({"ticker": "MKT-C", "last_price": 12});
        let rec = PriceRecord::from_raw(&cents_only, PriceSource::Rest, epoch()).unwrap();
        assert_eq!(rec.yes_price, dec!(0.12));
    }

    #[test]
    fn test_rfc3339_timestamp_wins_over_fallback() {
        let raw = json!({"ticker": "X", "yes_price": 0.1, "updated_at": "2024-05-01T12:00:00Z"});
        let rec = PriceRecord::from_raw(&raw, PriceSource::Rest, epoch()).unwrap();
        assert_eq!(rec.observed_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_malformed_records_are_rejected() {
        let cases = [
            (json!("nope"), RecordError::NotAnObject),
            (json!({"yes_price": 0.5}), RecordError::MissingTicker),
            (json!({"ticker": ""}), RecordError::MissingTicker),
            (json!({"ticker": "X"}), RecordError::MissingPrice),
        ];
        for (raw, expected) in cases {
            let err = PriceRecord::from_raw(&raw, PriceSource::Rest, epoch()).unwrap_err();
            assert_eq!(err, expected);
        }
    }

    #[test]
    fn test_null_or_wrong_typed_price_is_invalid() {
        let null = json!({"ticker": "X", "yes_price": null});
        assert!(matches!(
            PriceRecord::from_raw(&null, PriceSource::Rest, epoch()),
            Err(RecordError::InvalidPrice { field: "yes_price", .. })
        ));

        let wrong = json!({"ticker": "X", "yes_price": [1]});
        assert!(PriceRecord::from_raw(&wrong, PriceSource::Rest, epoch()).is_err());
    }

    #[test]
    fn test_out_of_range_price_is_rejected() {
        let raw = json!({"ticker": "X", "yes_price": "1.5"});
        assert!(matches!(
            PriceRecord::from_raw(&raw, PriceSource::Rest, epoch()),
            Err(RecordError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_freshness_is_strict() {
        let a = PriceRecord::new("X", dec!(0.5), epoch(), PriceSource::Rest);
        let mut b = a.clone();
        assert!(!b.is_fresher_than(&a));
        b.observed_at = epoch() + chrono::Duration::milliseconds(1);
        assert!(b.is_fresher_than(&a));
    }
}
