//! # Module Catalog
//!
//! The table of module kinds this process can instantiate. A definition file
//! names a kind; the reconciler looks the kind up here to build an instance.
//! Embedders register their own kinds next to (or instead of) the built-ins.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::modules::module::Module;

pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ModuleCatalog {
    factories: BTreeMap<String, ModuleFactory>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-filled with the kinds shipped in this crate.
    #[cfg(feature = "builtin")]
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        crate::modules::builtin::register_all(&mut catalog);
        catalog
    }

    /// Adds or replaces a kind.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        if self.factories.insert(kind.to_string(), Arc::new(factory)).is_some() {
            log::warn!("Module kind '{}' registered twice, keeping the latest", kind);
        }
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Module>> {
        self.factories.get(kind).map(|factory| factory())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}
