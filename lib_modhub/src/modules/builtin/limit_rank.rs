//! # Limit Rank Module
//!
//! Ranks today's limit-up pool by sealing funds and pushes the top rows to its
//! widget. The pool comes from the `get_limit_up_pool` extension operation, so
//! whichever provider declares it is found by the router on first use.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::context::ModuleContext;
use crate::core::event::Event;
use crate::errors::{HubError, HubResult};
use crate::modules::module::{config_str, config_u64, Module, ModuleConfig, UiWidget};
use crate::providers::composite::OP_GET_LIMIT_UP_POOL;
use crate::providers::DataProvider;

pub const KIND: &str = "limit_rank";
const WIDGET: &str = "limit_rank";
const DEFAULT_SORT_FIELD: &str = "seal_funds";
const DEFAULT_TOP: u64 = 50;
const DEFAULT_INTERVAL_SECS: u64 = 10;

fn numeric(row: &Value, field: &str) -> f64 {
    match row.get(field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Sorts `rows` by `field` descending (non-numeric counts as zero) and keeps
/// the first `top`.
pub fn rank_rows(mut rows: Vec<Value>, field: &str, top: usize) -> Vec<Value> {
    rows.sort_by(|a, b| numeric(b, field).partial_cmp(&numeric(a, field)).unwrap_or(Ordering::Equal));
    rows.truncate(top);
    rows
}

#[derive(Default)]
pub struct LimitRankModule {
    ctx: Option<ModuleContext>,
    sort_field: String,
    top: usize,
    first_run: bool,
}

impl LimitRankModule {
    fn ctx(&self) -> HubResult<&ModuleContext> {
        self.ctx.as_ref().ok_or_else(|| HubError::module("limit rank used before initialize"))
    }

    async fn process(&mut self) -> HubResult<()> {
        let ctx = self.ctx()?.clone();
        let pool = match ctx.data().call(OP_GET_LIMIT_UP_POOL, json!({})).await {
            Ok(pool) => pool,
            Err(e) => {
                if self.first_run {
                    log::warn!("[{}] {} unavailable: {}", ctx.instance_id(), OP_GET_LIMIT_UP_POOL, e);
                    self.first_run = false;
                } else {
                    log::debug!("[{}] {} unavailable: {}", ctx.instance_id(), OP_GET_LIMIT_UP_POOL, e);
                }
                return Ok(());
            }
        };

        let rows = match pool {
            Value::Array(rows) => rows,
            _ => Vec::new(),
        };
        if rows.is_empty() {
            if self.first_run {
                log::info!("[{}] Limit-up pool is empty", ctx.instance_id());
                self.first_run = false;
            }
            return Ok(());
        }

        let ranked = rank_rows(rows, &self.sort_field, self.top);
        if self.first_run {
            log::info!("[{}] First run ranked {} stocks", ctx.instance_id(), ranked.len());
            self.first_run = false;
        }
        ctx.broadcast_ui(&ctx.widget_id(WIDGET), Value::Array(ranked));
        Ok(())
    }
}

#[async_trait]
impl Module for LimitRankModule {
    fn ui_config(&self, _config: &ModuleConfig) -> Vec<UiWidget> {
        vec![UiWidget::new(WIDGET, "Limit Up Rank (Funds)")
            .with("component", json!("limit-rank-widget"))
            .with("default_col_span", json!("col-span-1"))
            .with(
                "config_description",
                json!("Displays the top limit-up stocks sorted by sealing funds."),
            )]
    }

    async fn initialize(&mut self, ctx: ModuleContext) -> HubResult<()> {
        self.sort_field = config_str(ctx.config(), "sort_by").unwrap_or(DEFAULT_SORT_FIELD).to_string();
        self.top = config_u64(ctx.config(), "top").unwrap_or(DEFAULT_TOP) as usize;
        self.first_run = true;
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn configure(&mut self) -> HubResult<()> {
        let ctx = self.ctx()?;
        let interval = config_u64(ctx.config(), "interval").unwrap_or(DEFAULT_INTERVAL_SECS);
        log::info!("[{}] Started, refresh interval {}s", ctx.instance_id(), interval);
        ctx.register_cron(&format!("interval:{interval}"))
    }

    async fn on_event(&mut self, event: Event) -> HubResult<()> {
        if event.is_timer() {
            self.process().await?;
        }
        Ok(())
    }

    async fn on_stop(&mut self) -> HubResult<()> {
        log::info!("[{}] Stopped", self.ctx()?.instance_id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_rank_by_funds_descending() {
        let rows = vec![
            json!({ "code": "a", "seal_funds": 10 }),
            json!({ "code": "b", "seal_funds": "30.5" }),
            json!({ "code": "c" }),
            json!({ "code": "d", "seal_funds": 20.0 }),
        ];
        let ranked = rank_rows(rows, "seal_funds", 3);
        let codes: Vec<&str> = ranked.iter().map(|r| r["code"].as_str().unwrap()).collect();
        assert_eq!(codes, vec!["b", "d", "a"]);
    }
}
