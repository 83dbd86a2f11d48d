//! Persistence Adapters - File-based Storage
//!
//! Append-only JSONL price history behind the versioned store port, and
//! atomic JSON status records behind the status repository port.
//! No database dependency.

pub mod history_store;
pub mod status_store;

pub use history_store::{JsonlHistoryStore, PriceVersion};
pub use status_store::FileStatusStore;
