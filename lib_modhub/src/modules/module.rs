//! # Module Capability
//!
//! What every loadable unit implements. The reconciler owns instances; a
//! module only ever sees its own [`ModuleContext`], handed over in
//! [`Module::initialize`].
//!
//! Callbacks take `&mut self` and every instance sits behind its own async
//! mutex, so a module never observes two of its callbacks at once.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::context::ModuleContext;
use crate::core::event::Event;
use crate::errors::HubResult;

/// Merged configuration of one instance.
pub type ModuleConfig = Map<String, Value>;

/// Shared, lockable handle to a live instance.
pub type InstanceHandle = Arc<tokio::sync::Mutex<Box<dyn Module>>>;

/// Non-owning handle; what scheduled jobs hold.
pub type WeakInstanceHandle = Weak<tokio::sync::Mutex<Box<dyn Module>>>;

/// A dashboard widget published by a module.
///
/// `id` is the base id the module asks for; the reconciler namespaces it per
/// instance before registering it. Everything besides `id` and `title` is
/// passed through to the dashboard untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiWidget {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Owning instance, filled in at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UiWidget {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            instance: None,
            extra: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

#[async_trait]
pub trait Module: Send {
    /// Widgets this instance publishes, given its merged config.
    fn ui_config(&self, _config: &ModuleConfig) -> Vec<UiWidget> {
        Vec::new()
    }

    /// Receives the instance context. Called once, before anything else.
    async fn initialize(&mut self, ctx: ModuleContext) -> HubResult<()>;

    /// Called right after `initialize`; the place to register jobs,
    /// subscriptions and providers.
    async fn configure(&mut self) -> HubResult<()> {
        Ok(())
    }

    async fn on_event(&mut self, _event: Event) -> HubResult<()> {
        Ok(())
    }

    /// Last callback before the instance is dropped.
    async fn on_stop(&mut self) -> HubResult<()> {
        Ok(())
    }

    /// A message sent by a dashboard client to one of this instance's widgets.
    async fn on_client_message(&mut self, _message: Value) -> HubResult<()> {
        Ok(())
    }
}

/// Reads a list of strings from `config[key]`, accepting either a YAML list
/// or a comma separated string.
pub fn config_str_list(config: &ModuleConfig, key: &str) -> Option<Vec<String>> {
    match config.get(key)? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

pub fn config_u64(config: &ModuleConfig, key: &str) -> Option<u64> {
    config.get(key).and_then(Value::as_u64)
}

pub fn config_str<'a>(config: &'a ModuleConfig, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}
