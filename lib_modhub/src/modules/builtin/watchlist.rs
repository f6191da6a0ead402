//! # Watchlist Module
//!
//! Pushes a snapshot of a configured list of codes to its widget on every
//! tick. The list can be replaced at runtime by the dashboard with an
//! `update_config` message:
//!
//! ```json
//! { "type": "update_config", "config": { "codes": ["600519", "000001.SZ"] } }
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::context::ModuleContext;
use crate::core::event::Event;
use crate::errors::{HubError, HubResult};
use crate::modules::module::{config_str_list, config_u64, Module, ModuleConfig, UiWidget};
use crate::providers::DataProvider;

pub const KIND: &str = "watchlist";
const WIDGET: &str = "watchlist";
const DEFAULT_CODES: [&str; 3] = ["600519.SH", "000001.SZ", "600036.SH"];
const DEFAULT_INTERVAL_SECS: u64 = 3;

/// Appends the exchange suffix a bare A-share code belongs to. Codes that
/// already carry a suffix, or match no known prefix, are returned upper-cased.
pub fn normalize_code(code: &str) -> String {
    let code = code.trim().to_uppercase();
    if code.contains('.') {
        return code;
    }
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| code.starts_with(p));
    if starts(&["6", "900", "688", "689"]) {
        format!("{code}.SH")
    } else if starts(&["0", "2", "3"]) {
        format!("{code}.SZ")
    } else if starts(&["4", "8", "920"]) {
        format!("{code}.BJ")
    } else {
        code
    }
}

fn normalize_all(codes: Vec<String>) -> Vec<String> {
    codes.iter().map(|c| normalize_code(c)).filter(|c| !c.is_empty()).collect()
}

#[derive(Default)]
pub struct WatchlistModule {
    ctx: Option<ModuleContext>,
    codes: Vec<String>,
}

impl WatchlistModule {
    fn ctx(&self) -> HubResult<&ModuleContext> {
        self.ctx.as_ref().ok_or_else(|| HubError::module("watchlist used before initialize"))
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    async fn refresh(&self) -> HubResult<()> {
        let ctx = self.ctx()?;
        if self.codes.is_empty() {
            return Ok(());
        }
        match ctx.data().get_snapshot(&self.codes).await {
            Ok(quotes) => {
                ctx.broadcast_ui(&ctx.widget_id(WIDGET), json!(quotes));
            }
            Err(e) => log::warn!("[{}] Update error: {}", ctx.instance_id(), e),
        }
        Ok(())
    }
}

#[async_trait]
impl Module for WatchlistModule {
    fn ui_config(&self, _config: &ModuleConfig) -> Vec<UiWidget> {
        vec![UiWidget::new(WIDGET, "Market Watchlist")
            .with("component", json!("watchlist-widget"))
            .with("default_col_span", json!("col-span-1 md:col-span-2 lg:col-span-1"))
            .with("config_default", json!({ "codes": ["600519.SH"] }))
            .with("config_description", json!("List of stock codes to monitor."))]
    }

    async fn initialize(&mut self, ctx: ModuleContext) -> HubResult<()> {
        let codes = config_str_list(ctx.config(), "codes")
            .unwrap_or_else(|| DEFAULT_CODES.iter().map(|c| c.to_string()).collect());
        self.codes = normalize_all(codes);
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn configure(&mut self) -> HubResult<()> {
        let ctx = self.ctx()?;
        let interval = config_u64(ctx.config(), "interval").unwrap_or(DEFAULT_INTERVAL_SECS);
        log::info!("[{}] Watching {:?} every {}s", ctx.instance_id(), self.codes, interval);
        ctx.register_cron(&format!("interval:{interval}"))
    }

    async fn on_event(&mut self, event: Event) -> HubResult<()> {
        if event.is_timer() {
            self.refresh().await?;
        }
        Ok(())
    }

    async fn on_client_message(&mut self, message: Value) -> HubResult<()> {
        if message.get("type").and_then(Value::as_str) != Some("update_config") {
            return Ok(());
        }
        let new_codes = message
            .get("config")
            .and_then(Value::as_object)
            .and_then(|cfg| config_str_list(cfg, "codes"))
            .filter(|codes| !codes.is_empty());
        if let Some(codes) = new_codes {
            self.codes = normalize_all(codes);
            log::info!("[{}] Updated codes: {:?}", self.ctx()?.instance_id(), self.codes);
            self.refresh().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_get_exchange_suffixes() {
        assert_eq!(normalize_code(" 600519 "), "600519.SH");
        assert_eq!(normalize_code("688001"), "688001.SH");
        assert_eq!(normalize_code("000001"), "000001.SZ");
        assert_eq!(normalize_code("300750"), "300750.SZ");
        assert_eq!(normalize_code("830799"), "830799.BJ");
        assert_eq!(normalize_code("920001"), "920001.BJ");
        assert_eq!(normalize_code("000001.sh"), "000001.SH");
        assert_eq!(normalize_code("hk00700"), "HK00700");
    }
}
