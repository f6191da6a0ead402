//! # Composite Provider
//!
//! A data provider assembled from narrower sub-components instead of one type
//! that inherits every trait. The outer type implements the unified
//! [`DataProvider`] surface and forwards each operation to the sub-component
//! that owns it:
//!
//! - **`MarketFeed`**: quotes and price history (required).
//! - **`MetaSource`**: reference tables, per-stock info, concept lists (optional).
//! - **`LimitBoard`**: limit-up / limit-down pools (optional).
//!
//! Extension operations are declared only for the sub-components that are
//! present, so the router never discovers an operation the provider cannot
//! serve.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::{HubError, HubResult};
use crate::providers::provider::{
    bare_code, filter_quotes, Bar, DataDimension, DataProvider, Quote, SyncPolicy, Table,
    OP_GET_FULL_SNAPSHOT, OP_GET_TABLE,
};

pub const OP_GET_STOCK_INFO: &str = "get_stock_info";
pub const OP_GET_CONCEPTS: &str = "get_concepts";
pub const OP_GET_LIMIT_UP_POOL: &str = "get_limit_up_pool";
pub const OP_GET_LIMIT_DOWN_POOL: &str = "get_limit_down_pool";

/// Quotes and bars for the whole market.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn quotes(&self) -> HubResult<Vec<Quote>>;

    async fn history(&self, code: &str) -> HubResult<Vec<Bar>>;
}

/// Reference data.
#[async_trait]
pub trait MetaSource: Send + Sync {
    async fn table(&self, name: &str, date: Option<&str>) -> HubResult<Table>;

    async fn stock_info(&self, code: &str) -> HubResult<Value>;

    async fn concepts(&self) -> HubResult<Table>;
}

/// Daily limit boards.
#[async_trait]
pub trait LimitBoard: Send + Sync {
    async fn limit_up_pool(&self, date: Option<&str>) -> HubResult<Table>;

    async fn limit_down_pool(&self, date: Option<&str>) -> HubResult<Table>;
}

pub struct CompositeProvider {
    market: Arc<dyn MarketFeed>,
    meta: Option<Arc<dyn MetaSource>>,
    limits: Option<Arc<dyn LimitBoard>>,
    dimension: DataDimension,
    policy: SyncPolicy,
}

impl CompositeProvider {
    pub fn new(market: Arc<dyn MarketFeed>) -> Self {
        Self {
            market,
            meta: None,
            limits: None,
            dimension: DataDimension::Tick,
            policy: SyncPolicy::Realtime,
        }
    }

    pub fn with_meta(mut self, meta: Arc<dyn MetaSource>) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_limits(mut self, limits: Arc<dyn LimitBoard>) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_shape(mut self, dimension: DataDimension, policy: SyncPolicy) -> Self {
        self.dimension = dimension;
        self.policy = policy;
        self
    }

    fn unsupported(&self, operation: &str) -> HubError {
        HubError::Unsupported {
            provider: "composite".to_string(),
            operation: operation.to_string(),
        }
    }

    fn meta(&self, operation: &str) -> HubResult<&Arc<dyn MetaSource>> {
        self.meta.as_ref().ok_or_else(|| self.unsupported(operation))
    }

    fn limits(&self, operation: &str) -> HubResult<&Arc<dyn LimitBoard>> {
        self.limits.as_ref().ok_or_else(|| self.unsupported(operation))
    }
}

/// `2024-01-05` and `20240105` compare equal.
fn compact_date(date: &str) -> String {
    date.chars().filter(|c| *c != '-').collect()
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

#[async_trait]
impl DataProvider for CompositeProvider {
    fn data_dimension(&self) -> DataDimension {
        self.dimension
    }

    fn sync_policy(&self) -> SyncPolicy {
        self.policy
    }

    fn operations(&self) -> Vec<String> {
        let mut ops = vec![OP_GET_FULL_SNAPSHOT.to_string()];
        if self.meta.is_some() {
            ops.push(OP_GET_STOCK_INFO.to_string());
            ops.push(OP_GET_CONCEPTS.to_string());
        }
        if self.limits.is_some() {
            ops.push(OP_GET_LIMIT_UP_POOL.to_string());
            ops.push(OP_GET_LIMIT_DOWN_POOL.to_string());
        }
        ops
    }

    async fn get_price(&self, code: &str, date: Option<&str>) -> HubResult<Option<f64>> {
        match date {
            Some(day) => {
                let day = compact_date(day);
                let bars = self.market.history(bare_code(code)).await?;
                Ok(bars.iter().find(|b| compact_date(&b.date) == day).map(|b| b.close))
            }
            None => {
                let quotes = self.market.quotes().await?;
                Ok(quotes
                    .iter()
                    .find(|q| bare_code(&q.code) == bare_code(code))
                    .map(|q| q.price))
            }
        }
    }

    async fn get_history(&self, code: &str, start: &str, end: &str) -> HubResult<Vec<Bar>> {
        let (start, end) = (compact_date(start), compact_date(end));
        let bars = self.market.history(bare_code(code)).await?;
        Ok(bars
            .into_iter()
            .filter(|b| {
                let day = compact_date(&b.date);
                day >= start && day <= end
            })
            .collect())
    }

    async fn get_snapshot(&self, codes: &[String]) -> HubResult<Vec<Quote>> {
        let quotes = self.market.quotes().await?;
        Ok(filter_quotes(&quotes, codes))
    }

    async fn get_table(&self, name: &str, date: Option<&str>) -> HubResult<Table> {
        self.meta(OP_GET_TABLE)?.table(name, date).await
    }

    async fn get_full_snapshot(&self) -> HubResult<Vec<Quote>> {
        self.market.quotes().await
    }

    async fn call(&self, operation: &str, args: Value) -> HubResult<Value> {
        match operation {
            OP_GET_FULL_SNAPSHOT => Ok(serde_json::to_value(self.market.quotes().await?)?),
            OP_GET_STOCK_INFO => {
                let code = str_arg(&args, "code").ok_or_else(|| HubError::module("get_stock_info needs a 'code'"))?;
                self.meta(operation)?.stock_info(bare_code(code)).await
            }
            OP_GET_CONCEPTS => Ok(json!(self.meta(operation)?.concepts().await?)),
            OP_GET_LIMIT_UP_POOL => {
                let pool = self.limits(operation)?.limit_up_pool(str_arg(&args, "date")).await?;
                Ok(json!(pool))
            }
            OP_GET_LIMIT_DOWN_POOL => {
                let pool = self.limits(operation)?.limit_down_pool(str_arg(&args, "date")).await?;
                Ok(json!(pool))
            }
            other => Err(self.unsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::{MemoryLimitBoard, MemoryMarket};
    use crate::providers::provider::OP_GET_PRICE;

    fn market() -> Arc<MemoryMarket> {
        let quotes = vec![
            Quote { code: "600519".into(), price: 1800.0, ..Default::default() },
            Quote { code: "000001".into(), price: 10.0, ..Default::default() },
        ];
        let bars = vec![
            Bar { date: "2024-01-02".into(), open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 10.0 },
            Bar { date: "2024-01-03".into(), open: 1.5, high: 2.5, low: 1.0, close: 2.0, volume: 12.0 },
            Bar { date: "2024-01-04".into(), open: 2.0, high: 3.0, low: 1.5, close: 2.5, volume: 9.0 },
        ];
        Arc::new(MemoryMarket::new(quotes).with_history("600519", bars))
    }

    #[tokio::test]
    async fn operations_follow_present_components() {
        let bare = CompositeProvider::new(market());
        assert_eq!(bare.operations(), vec![OP_GET_FULL_SNAPSHOT.to_string()]);
        assert!(!bare.implements(OP_GET_LIMIT_UP_POOL));

        let with_limits = CompositeProvider::new(market()).with_limits(Arc::new(MemoryLimitBoard::default()));
        assert!(with_limits.implements(OP_GET_LIMIT_UP_POOL));
        assert!(with_limits.implements(OP_GET_PRICE));
    }

    #[tokio::test]
    async fn price_and_history_are_forwarded() {
        let provider = CompositeProvider::new(market());
        assert_eq!(provider.get_price("600519.SH", None).await.unwrap(), Some(1800.0));
        assert_eq!(provider.get_price("600519", Some("20240103")).await.unwrap(), Some(2.0));
        assert_eq!(provider.get_price("999999", None).await.unwrap(), None);

        let bars = provider.get_history("600519.SH", "2024-01-03", "20240104").await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, "2024-01-03");
    }

    #[tokio::test]
    async fn missing_component_is_unsupported() {
        let provider = CompositeProvider::new(market());
        let err = provider.get_table("daily_basic", None).await.unwrap_err();
        assert!(matches!(err, HubError::Unsupported { .. }));
        let err = provider.call(OP_GET_LIMIT_UP_POOL, Value::Null).await.unwrap_err();
        assert!(matches!(err, HubError::Unsupported { .. }));
    }
}
