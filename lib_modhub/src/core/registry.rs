//! # Instance Registry
//!
//! Who is alive, which widget ids they own and which topics they listen to.
//! Inbound client messages and topic events are routed through this table;
//! outbound frames are not (see the dispatcher).
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::modules::module::{InstanceHandle, UiWidget};

/// Widget id as seen by clients: the base id for a class's default instance,
/// `<base>_<instance>` for any other instance of the class.
pub fn namespaced_widget_id(base: &str, instance_id: &str, class_name: &str) -> String {
    if instance_id == class_name {
        base.to_string()
    } else {
        format!("{base}_{instance_id}")
    }
}

struct InstanceEntry {
    class_name: String,
    handle: InstanceHandle,
    alive: CancellationToken,
    widgets: Vec<UiWidget>,
}

#[derive(Default)]
struct RegistryState {
    instances: BTreeMap<String, InstanceEntry>,
    widgets: HashMap<String, String>,
    topics: HashMap<String, BTreeSet<String>>,
}

#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_instance(&self, instance_id: &str, class_name: &str, handle: InstanceHandle, alive: CancellationToken) {
        let mut state = self.lock();
        state.instances.insert(
            instance_id.to_string(),
            InstanceEntry {
                class_name: class_name.to_string(),
                handle,
                alive,
                widgets: Vec::new(),
            },
        );
    }

    /// Binds `widget_id` to `instance_id`. Fails when the instance is unknown
    /// or the id is already owned by another live instance.
    pub fn register_widget(&self, widget_id: &str, instance_id: &str, mut widget: UiWidget) -> Result<(), String> {
        let mut state = self.lock();
        if !state.instances.contains_key(instance_id) {
            return Err(format!("cannot register widget '{widget_id}' for an unknown instance"));
        }
        if let Some(owner) = state.widgets.get(widget_id) {
            if owner != instance_id {
                return Err(format!("widget '{widget_id}' is already owned by '{owner}'"));
            }
        }
        state.widgets.insert(widget_id.to_string(), instance_id.to_string());
        widget.id = widget_id.to_string();
        widget.instance = Some(instance_id.to_string());
        if let Some(entry) = state.instances.get_mut(instance_id) {
            entry.widgets.retain(|w| w.id != widget_id);
            entry.widgets.push(widget);
        }
        Ok(())
    }

    pub fn subscribe(&self, instance_id: &str, topic: &str) {
        self.lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(instance_id.to_string());
    }

    /// Owner and handle of a widget.
    pub fn widget_owner(&self, widget_id: &str) -> Option<(String, InstanceHandle, CancellationToken)> {
        let state = self.lock();
        let owner = state.widgets.get(widget_id)?;
        let entry = state.instances.get(owner)?;
        Some((owner.clone(), entry.handle.clone(), entry.alive.clone()))
    }

    pub fn subscribers(&self, topic: &str) -> Vec<(String, InstanceHandle, CancellationToken)> {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                state
                    .instances
                    .get(id)
                    .map(|e| (id.clone(), e.handle.clone(), e.alive.clone()))
            })
            .collect()
    }

    /// Drops the instance with its widgets and subscriptions; cancels its
    /// liveness token. Returns false if it was not registered.
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.instances.remove(instance_id) else {
            return false;
        };
        entry.alive.cancel();
        state.widgets.retain(|_, owner| owner.as_str() != instance_id);
        for subscribers in state.topics.values_mut() {
            subscribers.remove(instance_id);
        }
        state.topics.retain(|_, subscribers| !subscribers.is_empty());
        true
    }

    pub fn contains_instance(&self, instance_id: &str) -> bool {
        self.lock().instances.contains_key(instance_id)
    }

    pub fn class_of(&self, instance_id: &str) -> Option<String> {
        self.lock().instances.get(instance_id).map(|e| e.class_name.clone())
    }

    pub fn widget_ids(&self, instance_id: &str) -> Vec<String> {
        self.lock()
            .instances
            .get(instance_id)
            .map(|e| e.widgets.iter().map(|w| w.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn topics_of(&self, instance_id: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .lock()
            .topics
            .iter()
            .filter(|(_, subs)| subs.contains(instance_id))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Every published widget, ordered by instance id.
    pub fn ui_registry(&self) -> Vec<UiWidget> {
        self.lock()
            .instances
            .values()
            .flat_map(|e| e.widgets.iter().cloned())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ModuleContext;
    use crate::errors::HubResult;
    use crate::modules::module::Module;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl Module for Noop {
        async fn initialize(&mut self, _ctx: ModuleContext) -> HubResult<()> {
            Ok(())
        }
    }

    fn handle() -> InstanceHandle {
        Arc::new(tokio::sync::Mutex::new(Box::new(Noop) as Box<dyn Module>))
    }

    #[test]
    fn namespacing_only_applies_to_named_instances() {
        assert_eq!(namespaced_widget_id("watchlist", "WatchlistModule", "WatchlistModule"), "watchlist");
        assert_eq!(namespaced_widget_id("watchlist", "tech", "WatchlistModule"), "watchlist_tech");
    }

    #[test]
    fn removal_drops_widgets_and_subscriptions() {
        let registry = Registry::new();
        let alive = CancellationToken::new();
        registry.register_instance("tech", "WatchlistModule", handle(), alive.clone());
        registry.register_instance("other", "LimitRankModule", handle(), CancellationToken::new());
        assert!(registry.register_widget("watchlist_tech", "tech", UiWidget::new("watchlist", "W")).is_ok());
        assert!(registry.register_widget("orphan", "nobody", UiWidget::new("orphan", "")).is_err());
        registry.subscribe("tech", "quotes");
        registry.subscribe("other", "quotes");

        assert_eq!(registry.subscribers("quotes").len(), 2);
        assert_eq!(registry.ui_registry()[0].instance.as_deref(), Some("tech"));

        assert!(registry.remove_instance("tech"));
        assert!(alive.is_cancelled());
        assert!(registry.widget_owner("watchlist_tech").is_none());
        assert_eq!(registry.subscribers("quotes").len(), 1);
        assert!(registry.topics_of("tech").is_empty());
        assert!(!registry.remove_instance("tech"));
    }

    #[test]
    fn widget_ids_are_not_taken_from_a_live_owner() {
        let registry = Registry::new();
        registry.register_instance("FeedModule", "FeedModule", handle(), CancellationToken::new());
        registry.register_instance("BoardModule", "BoardModule", handle(), CancellationToken::new());
        assert!(registry.register_widget("status", "FeedModule", UiWidget::new("status", "S")).is_ok());
        // re-binding by the same owner is fine
        assert!(registry.register_widget("status", "FeedModule", UiWidget::new("status", "S")).is_ok());

        let err = registry
            .register_widget("status", "BoardModule", UiWidget::new("status", "S"))
            .unwrap_err();
        assert!(err.contains("FeedModule"));
        assert_eq!(registry.widget_owner("status").map(|(owner, _, _)| owner).as_deref(), Some("FeedModule"));
        assert_eq!(registry.ui_registry().len(), 1);

        registry.remove_instance("FeedModule");
        assert!(registry.register_widget("status", "BoardModule", UiWidget::new("status", "S")).is_ok());
    }
}
