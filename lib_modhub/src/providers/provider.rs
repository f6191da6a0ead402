//! # Data Provider Capability
//!
//! The operation surface every data-serving module exposes. The four standard
//! operations are always implemented; anything else (full-market snapshots,
//! limit boards, concept lists, ...) is an *extension operation* that a
//! provider declares through [`DataProvider::operations`] and serves through
//! [`DataProvider::call`]. The router discovers extension operations against
//! that declared set, so a provider can add a capability without touching the
//! router.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{HubError, HubResult};

pub const OP_GET_PRICE: &str = "get_price";
pub const OP_GET_HISTORY: &str = "get_history";
pub const OP_GET_SNAPSHOT: &str = "get_snapshot";
pub const OP_GET_TABLE: &str = "get_table";
/// Bulk whole-market snapshot. Optional; enables snapshot coalescing.
pub const OP_GET_FULL_SNAPSHOT: &str = "get_full_snapshot";

/// Operations every provider implements.
pub const STANDARD_OPERATIONS: [&str; 4] = [OP_GET_PRICE, OP_GET_HISTORY, OP_GET_SNAPSHOT, OP_GET_TABLE];

/// Granularity of the data a provider serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataDimension {
    Tick,
    Minute,
    Daily,
    Other,
}

/// How often a provider expects to be synchronised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    Realtime,
    Daily,
    Manual,
}

/// One row of a market snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Quote {
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub change: f64,
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub vol: f64,
}

/// One OHLCV bar of a price history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Generic tabular result; every row is a JSON object.
pub type Table = Vec<Value>;

#[async_trait]
pub trait DataProvider: Send + Sync {
    fn data_dimension(&self) -> DataDimension;

    fn sync_policy(&self) -> SyncPolicy;

    fn archive_filename_template(&self) -> String {
        "data_{date}.csv".to_string()
    }

    fn get_archive_filename(&self, date: &str) -> String {
        self.archive_filename_template().replace("{date}", date)
    }

    /// Extension operations this provider serves through [`DataProvider::call`].
    fn operations(&self) -> Vec<String> {
        Vec::new()
    }

    /// True for the standard surface and for every declared extension.
    fn implements(&self, operation: &str) -> bool {
        STANDARD_OPERATIONS.contains(&operation) || self.operations().iter().any(|op| op == operation)
    }

    async fn get_price(&self, code: &str, date: Option<&str>) -> HubResult<Option<f64>>;

    async fn get_history(&self, code: &str, start: &str, end: &str) -> HubResult<Vec<Bar>>;

    async fn get_snapshot(&self, codes: &[String]) -> HubResult<Vec<Quote>>;

    async fn get_table(&self, name: &str, date: Option<&str>) -> HubResult<Table>;

    /// Whole-market snapshot. Only meaningful when `operations()` lists
    /// [`OP_GET_FULL_SNAPSHOT`].
    async fn get_full_snapshot(&self) -> HubResult<Vec<Quote>> {
        Err(HubError::Unsupported {
            provider: std::any::type_name::<Self>().to_string(),
            operation: OP_GET_FULL_SNAPSHOT.to_string(),
        })
    }

    /// Entry point for extension operations.
    async fn call(&self, operation: &str, _args: Value) -> HubResult<Value> {
        Err(HubError::Unsupported {
            provider: std::any::type_name::<Self>().to_string(),
            operation: operation.to_string(),
        })
    }
}

/// Strips an exchange suffix: `600519.SH` -> `600519`.
pub fn bare_code(code: &str) -> &str {
    code.split('.').next().unwrap_or(code)
}

/// Keeps the rows of `full` whose code matches one of `codes`, ignoring
/// exchange suffixes on either side.
pub fn filter_quotes(full: &[Quote], codes: &[String]) -> Vec<Quote> {
    let wanted: HashSet<&str> = codes.iter().map(|c| bare_code(c)).collect();
    full.iter()
        .filter(|q| wanted.contains(bare_code(&q.code)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(code: &str, price: f64) -> Quote {
        Quote {
            code: code.to_string(),
            price,
            ..Default::default()
        }
    }

    #[test]
    fn filter_ignores_exchange_suffixes() {
        let full = vec![quote("000001", 10.0), quote("600519", 1800.0), quote("000002.SZ", 15.0)];
        let picked = filter_quotes(&full, &["600519.SH".to_string(), "000002".to_string()]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].code, "600519");
        assert_eq!(picked[1].code, "000002.SZ");
    }

    #[test]
    fn filter_with_no_codes_is_empty() {
        let full = vec![quote("000001", 10.0)];
        assert!(filter_quotes(&full, &[]).is_empty());
    }
}
