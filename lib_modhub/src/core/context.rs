//! # Runtime Context
//!
//! One `RuntimeContext` is built at startup and shared by the reconciler, the
//! server and every module instance. It owns the shared services:
//!
//! ## Core Functionality:
//! - **Data facade**: the [`HybridProvider`] router. Every provider registered
//!   through a context is wrapped in its own [`DataAggregator`] first.
//! - **Scheduler**: interval jobs tagged with the owning instance id.
//! - **Dispatcher**: outbound UI frames.
//! - **Registry**: instance handles, widget ownership and topic subscriptions,
//!   used for inbound client messages and topic events.
//! - **Cleanup hooks**: closures run when an instance is deregistered.
//!
//! Modules never see the `RuntimeContext` directly; each gets a
//! [`ModuleContext`] scoped to its own instance id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::aggregator::{DataAggregator, DEFAULT_CACHE_TTL};
use crate::core::dispatcher::Dispatcher;
use crate::core::event::Event;
use crate::core::registry::{namespaced_widget_id, Registry};
use crate::core::router::HybridProvider;
use crate::core::scheduler::{parse_interval, Scheduler};
use crate::errors::{HubError, HubResult};
use crate::modules::module::{InstanceHandle, ModuleConfig, UiWidget, WeakInstanceHandle};
use crate::providers::provider::DataProvider;
use crate::settings::RuntimeSettings;

type CleanupHook = Box<dyn FnOnce() + Send>;

pub struct RuntimeContext {
    data: Arc<HybridProvider>,
    scheduler: Scheduler,
    dispatcher: Arc<Dispatcher>,
    registry: Registry,
    cleanup_hooks: Mutex<HashMap<String, Vec<CleanupHook>>>,
    cache_ttl: Duration,
}

impl RuntimeContext {
    pub fn new(routing: &HashMap<String, String>, default_provider: Option<&str>, cache_ttl: Duration) -> Self {
        let data = HybridProvider::new(routing);
        if let Some(name) = default_provider {
            data.set_default(name);
        }
        Self {
            data: Arc::new(data),
            scheduler: Scheduler::new(),
            dispatcher: Arc::new(Dispatcher::new()),
            registry: Registry::new(),
            cleanup_hooks: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self::new(
            &settings.routing,
            settings.default_provider.as_deref(),
            Duration::from_secs(settings.cache_ttl_secs),
        )
    }

    pub fn data(&self) -> &Arc<HybridProvider> {
        &self.data
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Wraps `provider` in a coalescing cache and registers it with the router.
    pub fn register_provider(&self, name: &str, provider: Arc<dyn DataProvider>, owner: Option<&str>) {
        let wrapped = DataAggregator::new(name, provider, self.cache_ttl);
        self.data.register_provider(name, Arc::new(wrapped), owner);
    }

    /// Runs `on_event(TIMER)` on the instance every period of `expr`, tagged
    /// with the instance id. The job holds only a weak handle and skips its
    /// run once the instance is gone or deregistered.
    pub fn register_cron(
        &self,
        instance_id: &str,
        handle: WeakInstanceHandle,
        alive: CancellationToken,
        expr: &str,
    ) -> HubResult<()> {
        let period = parse_interval(expr)?;
        let tag = instance_id.to_string();
        self.scheduler.spawn_every(instance_id, period, move || {
            let handle = handle.clone();
            let alive = alive.clone();
            let tag = tag.clone();
            async move {
                let Some(instance) = handle.upgrade() else {
                    return;
                };
                let mut module = instance.lock().await;
                if alive.is_cancelled() {
                    return;
                }
                if let Err(e) = module.on_event(Event::timer()).await {
                    log::error!("Scheduled job for '{}' failed: {}", tag, e);
                }
            }
        });
        log::info!("Registered {} job for {}", expr, instance_id);
        Ok(())
    }

    /// Pushes a payload to every dashboard client; returns the receiver count.
    pub fn broadcast_ui(&self, widget_id: &str, data: Value) -> usize {
        self.dispatcher.broadcast(widget_id, data)
    }

    pub fn register_instance(&self, instance_id: &str, class_name: &str, handle: InstanceHandle, alive: CancellationToken) {
        self.registry.register_instance(instance_id, class_name, handle, alive);
    }

    /// Binds an (already namespaced) widget id to a registered instance.
    pub fn register_module_instance(&self, widget_id: &str, instance_id: &str, widget: UiWidget) -> HubResult<()> {
        self.registry
            .register_widget(widget_id, instance_id, widget)
            .map_err(|reason| HubError::InstanceStart {
                instance: instance_id.to_string(),
                reason,
            })
    }

    pub fn subscribe(&self, instance_id: &str, topic: &str) {
        self.registry.subscribe(instance_id, topic);
        log::info!("Subscribed {} to '{}'", instance_id, topic);
    }

    pub fn add_cleanup_hook(&self, instance_id: &str, hook: impl FnOnce() + Send + 'static) {
        self.cleanup_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance_id.to_string())
            .or_default()
            .push(Box::new(hook));
    }

    /// Releases everything tagged with `instance_id`: scheduled jobs, widget
    /// and topic registrations, owned providers and cleanup hooks.
    pub fn deregister_module(&self, instance_id: &str) {
        log::info!("Deregistering module resources for: {}", instance_id);
        self.scheduler.cancel_jobs(instance_id);
        self.registry.remove_instance(instance_id);
        self.data.deregister_owner(instance_id);

        let hooks = self
            .cleanup_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id)
            .unwrap_or_default();
        for hook in hooks {
            hook();
        }
    }

    /// Delivers `event` to every subscriber of its topic on a task of its own;
    /// returns how many deliveries were started.
    pub fn publish(&self, event: Event) -> usize {
        let subscribers = self.registry.subscribers(&event.topic);
        for (instance_id, handle, alive) in &subscribers {
            let event = event.clone();
            let instance_id = instance_id.clone();
            let handle = Arc::clone(handle);
            let alive = alive.clone();
            tokio::spawn(async move {
                let mut module = handle.lock().await;
                if alive.is_cancelled() {
                    return;
                }
                if let Err(e) = module.on_event(event).await {
                    log::error!("Module {} failed handling event: {}", instance_id, e);
                }
            });
        }
        subscribers.len()
    }

    /// Hands an inbound client message to the instance owning `widget_id`.
    pub async fn route_client_message(&self, widget_id: &str, message: Value) -> HubResult<()> {
        let (instance_id, handle, alive) = self
            .registry
            .widget_owner(widget_id)
            .ok_or_else(|| HubError::UnknownWidget(widget_id.to_string()))?;
        let mut module = handle.lock().await;
        if alive.is_cancelled() {
            return Err(HubError::UnknownWidget(widget_id.to_string()));
        }
        log::debug!("Routing client message for '{}' to {}", widget_id, instance_id);
        module.on_client_message(message).await
    }

    /// Published widgets of every active instance.
    pub fn ui_registry(&self) -> Vec<UiWidget> {
        self.registry.ui_registry()
    }

    /// Cancels every scheduled job.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(&HashMap::new(), None, DEFAULT_CACHE_TTL)
    }
}

/// The view of the runtime a single module instance gets.
#[derive(Clone)]
pub struct ModuleContext {
    runtime: Arc<RuntimeContext>,
    instance_id: String,
    class_name: String,
    config: ModuleConfig,
    /// `(base id, assigned id)` per published widget.
    widgets: Vec<(String, String)>,
    handle: WeakInstanceHandle,
    alive: CancellationToken,
}

impl ModuleContext {
    pub fn new(
        runtime: Arc<RuntimeContext>,
        instance_id: &str,
        class_name: &str,
        config: ModuleConfig,
        widgets: Vec<(String, String)>,
        handle: WeakInstanceHandle,
        alive: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            instance_id: instance_id.to_string(),
            class_name: class_name.to_string(),
            config,
            widgets,
            handle,
            alive,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Merged configuration of this instance.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Widget ids assigned to this instance, in `ui_config` order.
    pub fn widgets(&self) -> Vec<&str> {
        self.widgets.iter().map(|(_, id)| id.as_str()).collect()
    }

    /// The id this instance publishes `base` under.
    pub fn widget_id(&self, base: &str) -> String {
        self.widgets
            .iter()
            .find(|(b, _)| b == base)
            .map(|(_, id)| id.clone())
            .unwrap_or_else(|| namespaced_widget_id(base, &self.instance_id, &self.class_name))
    }

    pub fn is_active(&self) -> bool {
        !self.alive.is_cancelled()
    }

    pub fn data(&self) -> Arc<HybridProvider> {
        Arc::clone(self.runtime.data())
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    pub fn register_cron(&self, expr: &str) -> HubResult<()> {
        self.runtime
            .register_cron(&self.instance_id, self.handle.clone(), self.alive.clone(), expr)
    }

    pub fn broadcast_ui(&self, widget_id: &str, data: Value) -> usize {
        self.runtime.broadcast_ui(widget_id, data)
    }

    pub fn subscribe(&self, topic: &str) {
        self.runtime.subscribe(&self.instance_id, topic);
    }

    pub fn publish(&self, event: Event) -> usize {
        self.runtime.publish(event)
    }

    /// Registers a provider owned by this instance; it is removed again when
    /// the instance stops.
    pub fn register_provider(&self, name: &str, provider: Arc<dyn DataProvider>) {
        self.runtime.register_provider(name, provider, Some(&self.instance_id));
    }

    pub fn add_cleanup_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.runtime.add_cleanup_hook(&self.instance_id, hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::EVENT_TIMER;
    use crate::modules::module::Module;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Probe {
        ctx: Option<ModuleContext>,
        timers: Arc<AtomicUsize>,
        topics: Arc<AtomicUsize>,
        messages: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Module for Probe {
        async fn initialize(&mut self, ctx: ModuleContext) -> HubResult<()> {
            self.ctx = Some(ctx);
            Ok(())
        }

        async fn on_event(&mut self, event: Event) -> HubResult<()> {
            if event.event_type == EVENT_TIMER {
                self.timers.fetch_add(1, Ordering::SeqCst);
            } else {
                self.topics.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn on_client_message(&mut self, message: Value) -> HubResult<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct Started {
        handle: InstanceHandle,
        ctx: ModuleContext,
        timers: Arc<AtomicUsize>,
        topics: Arc<AtomicUsize>,
        messages: Arc<Mutex<Vec<Value>>>,
    }

    async fn start(runtime: &Arc<RuntimeContext>, id: &str) -> Started {
        let probe = Probe::default();
        let (timers, topics, messages) = (probe.timers.clone(), probe.topics.clone(), probe.messages.clone());
        let handle: InstanceHandle = Arc::new(tokio::sync::Mutex::new(Box::new(probe) as Box<dyn Module>));
        let alive = CancellationToken::new();
        runtime.register_instance(id, "Probe", Arc::clone(&handle), alive.clone());
        let ctx = ModuleContext::new(
            Arc::clone(runtime),
            id,
            "Probe",
            ModuleConfig::new(),
            vec![],
            Arc::downgrade(&handle),
            alive,
        );
        handle.lock().await.initialize(ctx.clone()).await.unwrap();
        Started { handle, ctx, timers, topics, messages }
    }

    #[tokio::test]
    async fn deregistration_stops_timer_and_runs_hooks() {
        let runtime = Arc::new(RuntimeContext::default());
        let probe = start(&runtime, "p1").await;
        probe.ctx.register_cron("interval:60").unwrap();
        assert!(probe.ctx.register_cron("interval:soon").is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.timers.load(Ordering::SeqCst), 1);

        let hook_ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&hook_ran);
        probe.ctx.add_cleanup_hook(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        runtime.deregister_module("p1");
        assert_eq!(runtime.scheduler().job_count("p1"), 0);
        assert_eq!(hook_ran.load(Ordering::SeqCst), 1);
        assert!(!probe.ctx.is_active());
        drop(probe.handle);
    }

    #[tokio::test]
    async fn client_messages_follow_widget_ownership() {
        let runtime = Arc::new(RuntimeContext::default());
        let probe = start(&runtime, "tech").await;
        runtime
            .register_module_instance("watchlist_tech", "tech", UiWidget::new("watchlist", "Watchlist"))
            .unwrap();

        runtime
            .route_client_message("watchlist_tech", serde_json::json!({ "type": "ping" }))
            .await
            .unwrap();
        assert_eq!(probe.messages.lock().unwrap().len(), 1);

        let err = runtime.route_client_message("nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, HubError::UnknownWidget(_)));
        assert!(runtime.register_module_instance("x", "ghost", UiWidget::new("x", "")).is_err());
    }

    #[tokio::test]
    async fn published_events_reach_subscribers_only() {
        let runtime = Arc::new(RuntimeContext::default());
        let a = start(&runtime, "a").await;
        let b = start(&runtime, "b").await;
        a.ctx.subscribe("quotes");

        assert_eq!(runtime.publish(Event::new("DATA", "quotes", Value::Null)), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.topics.load(Ordering::SeqCst), 1);
        assert_eq!(b.topics.load(Ordering::SeqCst), 0);

        runtime.deregister_module("a");
        assert_eq!(runtime.publish(Event::new("DATA", "quotes", Value::Null)), 0);
    }

    #[tokio::test]
    async fn providers_are_owned_by_their_instance() {
        use crate::providers::memory::MemoryMarket;
        use crate::providers::CompositeProvider;

        let runtime = Arc::new(RuntimeContext::default());
        let probe = start(&runtime, "feed").await;
        let market = Arc::new(MemoryMarket::new(Vec::new()));
        probe.ctx.register_provider("market", Arc::new(CompositeProvider::new(market)));
        assert_eq!(runtime.data().provider_names(), vec!["market".to_string()]);

        runtime.deregister_module("feed");
        assert!(runtime.data().provider_names().is_empty());
    }
}
