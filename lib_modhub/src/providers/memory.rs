//! # In-Memory Sources
//!
//! Stand-ins for upstream scrapers: each sub-component serves rows that were
//! handed to it up front, usually straight from a module's YAML config.
//! `MemoryMarket` counts its upstream hits so callers can observe coalescing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{HubError, HubResult};
use crate::providers::composite::{LimitBoard, MarketFeed, MetaSource};
use crate::providers::provider::{bare_code, Bar, Quote, Table};

/// Shape of the `market_data` module config section that feeds these sources.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemorySourceConfig {
    pub quotes: Vec<Quote>,
    pub history: HashMap<String, Vec<Bar>>,
    pub tables: HashMap<String, Table>,
    pub stock_info: HashMap<String, Value>,
    pub concepts: Table,
    pub limit_up: Table,
    pub limit_down: Table,
}

impl MemorySourceConfig {
    pub fn from_value(value: &Value) -> HubResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn has_meta(&self) -> bool {
        !self.tables.is_empty() || !self.stock_info.is_empty() || !self.concepts.is_empty()
    }

    pub fn has_limits(&self) -> bool {
        !self.limit_up.is_empty() || !self.limit_down.is_empty()
    }
}

pub struct MemoryMarket {
    quotes: RwLock<Vec<Quote>>,
    history: HashMap<String, Vec<Bar>>,
    fetches: AtomicUsize,
}

impl MemoryMarket {
    pub fn new(quotes: Vec<Quote>) -> Self {
        Self {
            quotes: RwLock::new(quotes),
            history: HashMap::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_history(mut self, code: &str, bars: Vec<Bar>) -> Self {
        self.history.insert(bare_code(code).to_string(), bars);
        self
    }

    pub fn from_config(config: &MemorySourceConfig) -> Self {
        let mut market = Self::new(config.quotes.clone());
        for (code, bars) in &config.history {
            market = market.with_history(code, bars.clone());
        }
        market
    }

    /// Replaces the served quotes, e.g. to simulate a market tick.
    pub fn set_quotes(&self, quotes: Vec<Quote>) {
        *self.quotes.write().unwrap_or_else(PoisonError::into_inner) = quotes;
    }

    /// How many times the quote table has been read.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketFeed for MemoryMarket {
    async fn quotes(&self) -> HubResult<Vec<Quote>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.quotes.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn history(&self, code: &str) -> HubResult<Vec<Bar>> {
        Ok(self.history.get(bare_code(code)).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryMeta {
    tables: HashMap<String, Table>,
    stock_info: HashMap<String, Value>,
    concepts: Table,
}

impl MemoryMeta {
    pub fn from_config(config: &MemorySourceConfig) -> Self {
        Self {
            tables: config.tables.clone(),
            stock_info: config
                .stock_info
                .iter()
                .map(|(code, info)| (bare_code(code).to_string(), info.clone()))
                .collect(),
            concepts: config.concepts.clone(),
        }
    }
}

#[async_trait]
impl MetaSource for MemoryMeta {
    /// Tables are not dated in memory; `date` is accepted and ignored.
    async fn table(&self, name: &str, _date: Option<&str>) -> HubResult<Table> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::fetch(format!("table:{name}"), "unknown table"))
    }

    async fn stock_info(&self, code: &str) -> HubResult<Value> {
        Ok(self.stock_info.get(bare_code(code)).cloned().unwrap_or(Value::Null))
    }

    async fn concepts(&self) -> HubResult<Table> {
        Ok(self.concepts.clone())
    }
}

#[derive(Default)]
pub struct MemoryLimitBoard {
    up: Table,
    down: Table,
}

impl MemoryLimitBoard {
    pub fn new(up: Table, down: Table) -> Self {
        Self { up, down }
    }

    pub fn from_config(config: &MemorySourceConfig) -> Self {
        Self::new(config.limit_up.clone(), config.limit_down.clone())
    }
}

#[async_trait]
impl LimitBoard for MemoryLimitBoard {
    async fn limit_up_pool(&self, _date: Option<&str>) -> HubResult<Table> {
        Ok(self.up.clone())
    }

    async fn limit_down_pool(&self, _date: Option<&str>) -> HubResult<Table> {
        Ok(self.down.clone())
    }
}
