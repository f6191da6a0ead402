//! # Hybrid Provider (Capability Router)
//!
//! A facade over every registered data provider. Each request names an
//! operation; the router picks the provider that should serve it:
//!
//! 1. A routing rule names a registered provider: use it.
//! 2. The default provider implements the operation: use it.
//! 3. Scan providers in registration order for the first one that declares the
//!    operation, remember the answer in the routing table, use it.
//! 4. Otherwise fail with [`HubError::ProviderNotFound`].
//!
//! Standard operations are implemented by every provider, so for them step 2
//! always wins once a default exists. Extension operations only reach step 3
//! when neither a rule nor the default covers them, which lets a newly loaded
//! module add a capability without any routing config.
//!
//! Routing rules come from three places: built-in domain bindings, config
//! overrides (which win over built-ins), and discovery. Discovered rules are
//! written once per operation and dropped again when their provider goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{HubError, HubResult};
use crate::providers::provider::{
    Bar, DataDimension, DataProvider, Quote, SyncPolicy, Table, OP_GET_FULL_SNAPSHOT, OP_GET_HISTORY, OP_GET_PRICE,
    OP_GET_SNAPSHOT, OP_GET_TABLE, STANDARD_OPERATIONS,
};

/// Domain bindings applied unless config says otherwise.
pub const BUILTIN_ROUTES: &[(&str, &str)] = &[
    ("get_limit_up_pool", "limit_board"),
    ("get_limit_down_pool", "limit_board"),
    ("get_concepts", "reference"),
    ("get_stock_info", "stock_info"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOrigin {
    Builtin,
    Config,
    Discovered,
}

#[derive(Debug, Clone)]
struct Route {
    provider: String,
    origin: RouteOrigin,
}

struct ProviderEntry {
    name: String,
    provider: Arc<dyn DataProvider>,
    owner: Option<String>,
}

#[derive(Default)]
struct RouterState {
    default: Option<String>,
    providers: Vec<ProviderEntry>,
    routing: HashMap<String, Route>,
}

impl RouterState {
    fn get(&self, name: &str) -> Option<&Arc<dyn DataProvider>> {
        self.providers.iter().find(|e| e.name == name).map(|e| &e.provider)
    }
}

pub struct HybridProvider {
    state: RwLock<RouterState>,
    discovery_scans: AtomicUsize,
}

impl HybridProvider {
    /// Builds a router whose table is the built-in bindings overlaid with `overrides`.
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut routing: HashMap<String, Route> = BUILTIN_ROUTES
            .iter()
            .map(|(op, provider)| {
                (
                    op.to_string(),
                    Route {
                        provider: provider.to_string(),
                        origin: RouteOrigin::Builtin,
                    },
                )
            })
            .collect();
        for (op, provider) in overrides {
            routing.insert(
                op.clone(),
                Route {
                    provider: provider.clone(),
                    origin: RouteOrigin::Config,
                },
            );
        }
        Self {
            state: RwLock::new(RouterState {
                routing,
                ..Default::default()
            }),
            discovery_scans: AtomicUsize::new(0),
        }
    }

    /// Names the default provider. It does not have to be registered yet.
    pub fn set_default(&self, name: &str) {
        self.write().default = Some(name.to_string());
        log::info!("Default data provider set to '{}'", name);
    }

    /// Adds (or replaces, keeping its position) a provider. `owner` tags the
    /// entry with the module instance that registered it.
    pub fn register_provider(&self, name: &str, provider: Arc<dyn DataProvider>, owner: Option<&str>) {
        let mut state = self.write();
        let owner = owner.map(str::to_string);
        match state.providers.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.provider = provider;
                entry.owner = owner;
                log::info!("Replaced data provider: {}", name);
            }
            None => {
                state.providers.push(ProviderEntry {
                    name: name.to_string(),
                    provider,
                    owner,
                });
                log::info!("Registered data provider: {}", name);
            }
        }
        if state.default.is_none() {
            log::info!("Setting {} as default provider.", name);
            state.default = Some(name.to_string());
        }
    }

    /// Removes a provider, its discovered routes and, if it was the default,
    /// promotes the earliest remaining provider.
    pub fn remove_provider(&self, name: &str) -> bool {
        let mut state = self.write();
        let before = state.providers.len();
        state.providers.retain(|e| e.name != name);
        if state.providers.len() == before {
            return false;
        }
        Self::forget(&mut state, name);
        log::info!("Removed data provider: {}", name);
        true
    }

    /// Removes every provider registered by `owner`; returns their names.
    pub fn deregister_owner(&self, owner: &str) -> Vec<String> {
        let mut state = self.write();
        let removed: Vec<String> = state
            .providers
            .iter()
            .filter(|e| e.owner.as_deref() == Some(owner))
            .map(|e| e.name.clone())
            .collect();
        state.providers.retain(|e| e.owner.as_deref() != Some(owner));
        for name in &removed {
            Self::forget(&mut state, name);
            log::info!("Removed data provider '{}' owned by '{}'", name, owner);
        }
        removed
    }

    fn forget(state: &mut RouterState, name: &str) {
        state
            .routing
            .retain(|_, r| !(r.origin == RouteOrigin::Discovered && r.provider == name));
        if state.default.as_deref() == Some(name) {
            state.default = state.providers.first().map(|e| e.name.clone());
            match &state.default {
                Some(next) => log::info!("Default provider '{}' removed, falling back to '{}'", name, next),
                None => log::warn!("Default provider '{}' removed, no providers left", name),
            }
        }
    }

    /// Resolves `operation` to a provider name and handle.
    pub fn resolve(&self, operation: &str) -> HubResult<(String, Arc<dyn DataProvider>)> {
        {
            let state = self.read();
            if let Some(route) = state.routing.get(operation) {
                if let Some(p) = state.get(&route.provider) {
                    return Ok((route.provider.clone(), Arc::clone(p)));
                }
                log::debug!(
                    "Routed {} to {} but provider not registered, falling back",
                    operation,
                    route.provider
                );
            }
            if let Some(name) = &state.default {
                if let Some(p) = state.get(name) {
                    if p.implements(operation) {
                        return Ok((name.clone(), Arc::clone(p)));
                    }
                }
            }
        }
        self.discover(operation)
    }

    fn discover(&self, operation: &str) -> HubResult<(String, Arc<dyn DataProvider>)> {
        self.discovery_scans.fetch_add(1, Ordering::SeqCst);
        let mut state = self.write();
        let found = state
            .providers
            .iter()
            .find(|e| e.provider.implements(operation))
            .map(|e| (e.name.clone(), Arc::clone(&e.provider)));

        let Some((name, provider)) = found else {
            return Err(HubError::ProviderNotFound(operation.to_string()));
        };
        if !state.routing.contains_key(operation) {
            state.routing.insert(
                operation.to_string(),
                Route {
                    provider: name.clone(),
                    origin: RouteOrigin::Discovered,
                },
            );
            log::info!("Auto-routed operation '{}' to provider '{}'", operation, name);
        }
        Ok((name, provider))
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn DataProvider>> {
        self.read().get(name).cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.read().providers.iter().map(|e| e.name.clone()).collect()
    }

    pub fn default_name(&self) -> Option<String> {
        self.read().default.clone()
    }

    pub fn route_for(&self, operation: &str) -> Option<(String, RouteOrigin)> {
        self.read()
            .routing
            .get(operation)
            .map(|r| (r.provider.clone(), r.origin))
    }

    /// Number of auto-discovery scans performed so far.
    pub fn discovery_scans(&self) -> usize {
        self.discovery_scans.load(Ordering::SeqCst)
    }

    fn default_provider(&self) -> Option<Arc<dyn DataProvider>> {
        let state = self.read();
        state.default.as_deref().and_then(|n| state.get(n)).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RouterState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DataProvider for HybridProvider {
    fn data_dimension(&self) -> DataDimension {
        self.default_provider()
            .map(|p| p.data_dimension())
            .unwrap_or(DataDimension::Tick)
    }

    fn sync_policy(&self) -> SyncPolicy {
        self.default_provider()
            .map(|p| p.sync_policy())
            .unwrap_or(SyncPolicy::Realtime)
    }

    fn archive_filename_template(&self) -> String {
        self.default_provider()
            .map(|p| p.archive_filename_template())
            .unwrap_or_else(|| "data_{date}.csv".to_string())
    }

    /// Union of every registered provider's extension operations.
    fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self
            .read()
            .providers
            .iter()
            .flat_map(|e| e.provider.operations())
            .collect();
        ops.sort();
        ops.dedup();
        ops
    }

    fn implements(&self, operation: &str) -> bool {
        STANDARD_OPERATIONS.contains(&operation) || self.read().providers.iter().any(|e| e.provider.implements(operation))
    }

    async fn get_price(&self, code: &str, date: Option<&str>) -> HubResult<Option<f64>> {
        let (_, provider) = self.resolve(OP_GET_PRICE)?;
        provider.get_price(code, date).await
    }

    async fn get_history(&self, code: &str, start: &str, end: &str) -> HubResult<Vec<Bar>> {
        let (_, provider) = self.resolve(OP_GET_HISTORY)?;
        provider.get_history(code, start, end).await
    }

    async fn get_snapshot(&self, codes: &[String]) -> HubResult<Vec<Quote>> {
        let (_, provider) = self.resolve(OP_GET_SNAPSHOT)?;
        provider.get_snapshot(codes).await
    }

    async fn get_table(&self, name: &str, date: Option<&str>) -> HubResult<Table> {
        let (_, provider) = self.resolve(OP_GET_TABLE)?;
        provider.get_table(name, date).await
    }

    async fn get_full_snapshot(&self) -> HubResult<Vec<Quote>> {
        let (_, provider) = self.resolve(OP_GET_FULL_SNAPSHOT)?;
        provider.get_full_snapshot().await
    }

    async fn call(&self, operation: &str, args: Value) -> HubResult<Value> {
        let (_, provider) = self.resolve(operation)?;
        provider.call(operation, args).await
    }
}
