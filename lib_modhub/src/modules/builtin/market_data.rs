//! # Market Data Module
//!
//! Serves a [`CompositeProvider`] built from rows in its own config and
//! registers it with the data router under the instance's provider name.
//! The provider is owned by the instance and disappears with it.
//!
//! Config keys:
//! - `provider`: router name (defaults to the instance id). A configured
//!   name also suffixes the status widget id, `market_status_<provider>`.
//! - `interval`: seconds between status frames (default 30).
//! - `quotes`, `history`, `tables`, `stock_info`, `concepts`, `limit_up`,
//!   `limit_down`: the rows served (see [`MemorySourceConfig`]).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Value};

use crate::core::context::ModuleContext;
use crate::core::event::Event;
use crate::errors::{HubError, HubResult};
use crate::modules::module::{config_str, config_u64, Module, ModuleConfig, UiWidget};
use crate::providers::composite::CompositeProvider;
use crate::providers::memory::{MemoryLimitBoard, MemoryMarket, MemoryMeta, MemorySourceConfig};
use crate::providers::DataProvider;

pub const KIND: &str = "market_data";
const STATUS_WIDGET: &str = "market_status";
const DEFAULT_INTERVAL_SECS: u64 = 30;

#[derive(Default)]
pub struct MarketDataModule {
    ctx: Option<ModuleContext>,
    provider_name: String,
    status_widget: String,
    market: Option<Arc<MemoryMarket>>,
}

impl MarketDataModule {
    fn ctx(&self) -> HubResult<&ModuleContext> {
        self.ctx.as_ref().ok_or_else(|| HubError::module("market data module used before initialize"))
    }

    fn build_provider(config: &ModuleConfig) -> HubResult<(Arc<MemoryMarket>, CompositeProvider)> {
        let source = MemorySourceConfig::from_value(&Value::Object(config.clone()))?;
        let market = Arc::new(MemoryMarket::from_config(&source));
        let mut provider = CompositeProvider::new(market.clone());
        if source.has_meta() {
            provider = provider.with_meta(Arc::new(MemoryMeta::from_config(&source)));
        }
        if source.has_limits() {
            provider = provider.with_limits(Arc::new(MemoryLimitBoard::from_config(&source)));
        }
        Ok((market, provider))
    }

    fn status_widget(config: &ModuleConfig) -> String {
        match config_str(config, "provider") {
            Some(name) => format!("{STATUS_WIDGET}_{name}"),
            None => STATUS_WIDGET.to_string(),
        }
    }

    fn publish_status(&self) -> HubResult<()> {
        let ctx = self.ctx()?;
        let quotes = self.market.as_ref().map(|m| m.fetch_count()).unwrap_or_default();
        let status = json!({
            "provider": self.provider_name,
            "upstream_fetches": quotes,
            "routed": ctx.data().provider_names().contains(&self.provider_name),
            "time": Local::now().format("%H:%M:%S").to_string(),
        });
        ctx.broadcast_ui(&ctx.widget_id(&self.status_widget), status);
        Ok(())
    }
}

#[async_trait]
impl Module for MarketDataModule {
    fn ui_config(&self, config: &ModuleConfig) -> Vec<UiWidget> {
        vec![UiWidget::new(Self::status_widget(config), "Market Data Status")
            .with("component", json!("status-widget"))
            .with("default_col_span", json!("col-span-1"))]
    }

    async fn initialize(&mut self, ctx: ModuleContext) -> HubResult<()> {
        self.provider_name = config_str(ctx.config(), "provider")
            .unwrap_or(ctx.instance_id())
            .to_string();
        self.status_widget = Self::status_widget(ctx.config());
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn configure(&mut self) -> HubResult<()> {
        let ctx = self.ctx()?.clone();
        let (market, provider) = Self::build_provider(ctx.config())?;
        log::info!(
            "[{}] Serving provider '{}' with operations {:?}",
            ctx.instance_id(),
            self.provider_name,
            provider.operations()
        );
        ctx.register_provider(&self.provider_name, Arc::new(provider));
        self.market = Some(market);

        let interval = config_u64(ctx.config(), "interval").unwrap_or(DEFAULT_INTERVAL_SECS);
        ctx.register_cron(&format!("interval:{interval}"))
    }

    async fn on_event(&mut self, event: Event) -> HubResult<()> {
        if event.is_timer() {
            self.publish_status()?;
        }
        Ok(())
    }

    async fn on_stop(&mut self) -> HubResult<()> {
        log::info!("[{}] Provider '{}' going away", self.ctx()?.instance_id(), self.provider_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn limit_board_only_when_rows_are_configured() {
        let cfg = json!({ "quotes": [{ "code": "600519", "price": 1.0 }] });
        let (_, provider) = MarketDataModule::build_provider(cfg.as_object().unwrap()).unwrap();
        assert!(!provider.implements("get_limit_up_pool"));

        let cfg = json!({ "limit_up": [{ "code": "600519" }] });
        let (_, provider) = MarketDataModule::build_provider(cfg.as_object().unwrap()).unwrap();
        assert!(provider.implements("get_limit_up_pool"));
    }

    #[test]
    fn status_widget_follows_the_provider_name() {
        let cfg = json!({ "provider": "board" });
        assert_eq!(MarketDataModule::status_widget(cfg.as_object().unwrap()), "market_status_board");
        assert_eq!(MarketDataModule::status_widget(&ModuleConfig::new()), "market_status");
    }

    #[test]
    fn malformed_rows_fail_configuration() {
        let cfg = json!({ "quotes": "not a list" });
        assert!(MarketDataModule::build_provider(cfg.as_object().unwrap()).is_err());
    }
}
