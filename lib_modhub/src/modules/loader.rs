//! # Module Loader (Reconciler)
//!
//! Keeps the set of running module instances in line with what the definition
//! sources and the instance config ask for.
//!
//! ## Core Functionality:
//! - **Scan**: tracks the mtime of every definition source in the watched
//!   directories (and of `instances.yaml`). New or modified sources are
//!   (re)loaded; deleted sources unload their classes and stop every instance
//!   of them. A modified class is replaced and its instances are restarted.
//!   A source that fails to load keeps whatever it exported before.
//! - **Reconcile**: the desired set is the explicit instance list plus one
//!   default instance (id = class name) per class not explicitly configured.
//!   Instances start in dependency order using repeated passes until a pass
//!   starts nothing; whatever is left is pending and retried on every scan.
//! - **Start / Stop**: merges config layers, publishes widgets, initializes
//!   the module; stopping calls `on_stop` and then releases every runtime
//!   resource tagged with the instance id before returning.
//!
//! A dependency is satisfied by any active instance whose id *or* class name
//! matches. Dependents are not stopped when a dependency goes away.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::context::{ModuleContext, RuntimeContext};
use crate::core::registry::namespaced_widget_id;
use crate::errors::{HubError, HubResult};
use crate::modules::catalog::ModuleCatalog;
use crate::modules::definition::{discover_sources, load_definitions, ClassDefinition};
use crate::modules::module::{InstanceHandle, ModuleConfig};
use crate::settings::{load_instance_specs, load_override, merge_into, InstanceSpec, RuntimeSettings, INSTANCES_FILE};

struct ActiveInstance {
    spec: InstanceSpec,
    handle: InstanceHandle,
}

#[derive(Default)]
struct LoaderState {
    stamps: HashMap<PathBuf, SystemTime>,
    classes: HashMap<String, ClassDefinition>,
    source_classes: HashMap<PathBuf, Vec<String>>,
    instances_stamp: Option<SystemTime>,
    active: BTreeMap<String, ActiveInstance>,
    /// Instance id -> dependencies still missing after the last reconcile.
    pending: BTreeMap<String, Vec<String>>,
}

impl LoaderState {
    fn is_module_active(&self, name_or_id: &str) -> bool {
        self.active.contains_key(name_or_id) || self.active.values().any(|a| a.spec.module == name_or_id)
    }

    fn missing_dependencies(&self, class: &ClassDefinition) -> Vec<String> {
        class
            .dependencies
            .iter()
            .filter(|d| !self.is_module_active(d))
            .cloned()
            .collect()
    }

    fn instances_of(&self, class_names: &HashSet<String>) -> Vec<String> {
        self.active
            .iter()
            .filter(|(_, a)| class_names.contains(&a.spec.module))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

pub struct ModuleLoader {
    runtime: Arc<RuntimeContext>,
    catalog: ModuleCatalog,
    watch_dirs: Vec<PathBuf>,
    config_dir: PathBuf,
    scan_interval: Duration,
    state: Mutex<LoaderState>,
    running: AtomicBool,
}

impl ModuleLoader {
    pub fn new(runtime: Arc<RuntimeContext>, catalog: ModuleCatalog, settings: &RuntimeSettings) -> Self {
        Self {
            runtime,
            catalog,
            watch_dirs: settings.watch_dirs.clone(),
            config_dir: settings.config_dir.clone(),
            scan_interval: Duration::from_secs(settings.scan_interval_secs.max(1)),
            state: Mutex::new(LoaderState::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    /// Creates missing watch directories.
    pub fn ensure_watch_dirs(&self) {
        for dir in &self.watch_dirs {
            if let Err(e) = std::fs::create_dir_all(dir) {
                log::warn!("Cannot create watch directory {}: {}", dir.display(), e);
            }
        }
    }

    /// Runs the scan loop until `shutdown` fires or [`ModuleLoader::shutdown`]
    /// is called.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        log::info!("Starting module watcher on: {:?}", self.watch_dirs);
        self.running.store(true, Ordering::SeqCst);
        self.scan_once().await;

        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.tick().await;
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Module loader received shutdown signal.");
                    break;
                }
                _ = ticker.tick() => {
                    if self.running.load(Ordering::SeqCst) {
                        self.scan_once().await;
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One scan-and-reconcile round. Reconciles when something changed or
    /// instances are still waiting on dependencies. Returns whether it did.
    pub async fn scan_once(&self) -> bool {
        let mut state = self.state.lock().await;
        let changed = self.scan_definitions(&mut state).await;
        if changed || !state.pending.is_empty() {
            self.reconcile(&mut state).await;
            true
        } else {
            false
        }
    }

    async fn scan_definitions(&self, state: &mut LoaderState) -> bool {
        let mut changed = false;
        let sources = discover_sources(&self.watch_dirs);
        let present: HashSet<PathBuf> = sources.iter().map(|(p, _)| p.clone()).collect();

        for (path, mtime) in sources {
            let is_new = !state.stamps.contains_key(&path);
            let is_modified = state.stamps.get(&path).is_some_and(|known| mtime > *known);
            state.stamps.insert(path.clone(), mtime);
            if !(is_new || is_modified) {
                continue;
            }
            changed = true;
            log::info!("Loading definition from: {}", path.display());
            match load_definitions(&path, mtime, &self.catalog) {
                Ok(classes) => self.apply_definitions(state, path, classes).await,
                Err(e) => log::error!("{}", e),
            }
        }

        let gone: Vec<PathBuf> = state
            .stamps
            .keys()
            .filter(|p| !present.contains(*p))
            .cloned()
            .collect();
        for path in gone {
            state.stamps.remove(&path);
            self.unload_source(state, &path).await;
            changed = true;
        }

        let instances_stamp = std::fs::metadata(self.config_dir.join(INSTANCES_FILE))
            .and_then(|m| m.modified())
            .ok();
        if instances_stamp != state.instances_stamp {
            state.instances_stamp = instances_stamp;
            changed = true;
        }
        changed
    }

    /// Replaces the classes exported by `path`, stopping instances of classes
    /// that changed or disappeared so reconcile can restart them.
    async fn apply_definitions(&self, state: &mut LoaderState, path: PathBuf, classes: Vec<ClassDefinition>) {
        if classes.is_empty() {
            log::warn!("No module class found in {}", path.display());
        }
        let previous = state.source_classes.remove(&path).unwrap_or_default();
        let exported: HashSet<String> = classes.iter().map(|c| c.name.clone()).collect();

        let mut restart = HashSet::new();
        for name in &previous {
            if exported.contains(name) {
                continue;
            }
            // another source may already have taken the class over
            let owned_here = state.classes.get(name).is_some_and(|c| c.source == path);
            if owned_here {
                state.classes.remove(name);
                restart.insert(name.clone());
            }
        }
        for class in classes {
            if let Some(other) = state.classes.get(&class.name) {
                if other.source != path {
                    log::warn!(
                        "Class {} from {} replaces the one from {}",
                        class.name,
                        path.display(),
                        other.source.display()
                    );
                }
                if other.differs_from(&class) {
                    log::info!("Class {} changed", class.name);
                } else {
                    log::debug!("Class {} reloaded unchanged", class.name);
                }
                restart.insert(class.name.clone());
            }
            log::debug!("Registered class: {}", class.name);
            state.classes.insert(class.name.clone(), class);
        }
        state.source_classes.insert(path, exported.into_iter().collect());

        for id in state.instances_of(&restart) {
            log::info!("Restarting {} on reload", id);
            self.stop_instance(state, &id).await;
        }
    }

    async fn unload_source(&self, state: &mut LoaderState, path: &Path) {
        let Some(names) = state.source_classes.remove(path) else {
            return;
        };
        log::info!("Definition removed: {}", path.display());
        let mut removed = HashSet::new();
        for name in names {
            let owned_here = state.classes.get(&name).is_some_and(|c| c.source.as_path() == path);
            if owned_here {
                state.classes.remove(&name);
                removed.insert(name);
            }
        }
        for id in state.instances_of(&removed) {
            self.stop_instance(state, &id).await;
        }
    }

    fn desired_instances(&self, state: &LoaderState) -> Vec<InstanceSpec> {
        let mut desired = match load_instance_specs(&self.config_dir) {
            Ok(specs) => specs,
            Err(e) => {
                log::error!("Error loading {}: {}", INSTANCES_FILE, e);
                Vec::new()
            }
        };
        let configured: HashSet<String> = desired.iter().map(|s| s.module.clone()).collect();
        let mut ids: HashSet<String> = desired.iter().map(|s| s.id.clone()).collect();

        let mut class_names: Vec<&String> = state.classes.keys().collect();
        class_names.sort();
        for class_name in class_names {
            if configured.contains(class_name) {
                continue;
            }
            if !ids.insert(class_name.clone()) {
                log::warn!("Default instance for {} clashes with a configured id, skipping", class_name);
                continue;
            }
            desired.push(InstanceSpec::default_for(class_name));
        }
        desired
    }

    async fn reconcile(&self, state: &mut LoaderState) {
        let desired = self.desired_instances(state);
        let by_id: HashMap<&str, &InstanceSpec> = desired.iter().map(|s| (s.id.as_str(), s)).collect();

        // Instances no longer wanted, or wanted with a different spec.
        let stale: Vec<String> = state
            .active
            .iter()
            .filter(|(id, a)| by_id.get(id.as_str()).is_none_or(|spec| **spec != a.spec))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.stop_instance(state, &id).await;
        }

        let mut waiting: Vec<&InstanceSpec> = desired
            .iter()
            .filter(|s| !state.active.contains_key(&s.id))
            .filter(|s| {
                let known = state.classes.contains_key(&s.module);
                if !known {
                    log::warn!("Class {} not found for instance {}", s.module, s.id);
                }
                known
            })
            .collect();

        let mut progressed = true;
        while !waiting.is_empty() && progressed {
            progressed = false;
            let mut retry = Vec::new();
            for spec in waiting {
                let Some(class) = state.classes.get(&spec.module).cloned() else {
                    continue;
                };
                let missing = state.missing_dependencies(&class);
                if !missing.is_empty() {
                    log::debug!("Instance {} ({}) missing deps: {:?}", spec.id, spec.module, missing);
                    retry.push(spec);
                    continue;
                }
                match self.start_instance(spec, &class).await {
                    Ok(handle) => {
                        state.active.insert(
                            spec.id.clone(),
                            ActiveInstance {
                                spec: spec.clone(),
                                handle,
                            },
                        );
                        progressed = true;
                    }
                    Err(e) => log::error!("{}", e),
                }
            }
            waiting = retry;
        }

        state.pending.clear();
        if !waiting.is_empty() {
            log::warn!(
                "Some modules could not be loaded due to missing dependencies: {:?}",
                waiting.iter().map(|s| s.id.as_str()).collect::<Vec<_>>()
            );
            for spec in waiting {
                let missing = state
                    .classes
                    .get(&spec.module)
                    .map(|c| state.missing_dependencies(c))
                    .unwrap_or_default();
                log::warn!("  - {}: Missing {:?}", spec.id, missing);
                state.pending.insert(spec.id.clone(), missing);
            }
        }
    }

    fn merged_config(&self, spec: &InstanceSpec, class: &ClassDefinition) -> ModuleConfig {
        let mut config = class.defaults.clone();
        let mut layers = vec![class.name.as_str()];
        if spec.id != class.name {
            layers.push(spec.id.as_str());
        }
        for name in layers {
            match load_override(&self.config_dir, name) {
                Ok(Some(layer)) => merge_into(&mut config, &layer),
                Ok(None) => {}
                Err(e) => log::warn!("Ignoring override file for {}: {}", name, e),
            }
        }
        merge_into(&mut config, &spec.config);
        config
    }

    async fn start_instance(&self, spec: &InstanceSpec, class: &ClassDefinition) -> HubResult<InstanceHandle> {
        log::info!("Starting instance: {} ({})", spec.id, class.name);
        let fail = |reason: String| HubError::InstanceStart {
            instance: spec.id.clone(),
            reason,
        };

        let module = self
            .catalog
            .create(&class.kind)
            .ok_or_else(|| fail(format!("kind '{}' is not in the catalog", class.kind)))?;
        let config = self.merged_config(spec, class);
        let widgets = module.ui_config(&config);

        let handle: InstanceHandle = Arc::new(Mutex::new(module));
        let alive = CancellationToken::new();
        self.runtime
            .register_instance(&spec.id, &class.name, Arc::clone(&handle), alive.clone());

        let mut widget_ids = Vec::with_capacity(widgets.len());
        for mut widget in widgets {
            let base = widget.id.clone();
            let mut widget_id = namespaced_widget_id(&base, &spec.id, &class.name);
            let taken = self
                .runtime
                .registry()
                .widget_owner(&widget_id)
                .is_some_and(|(owner, _, _)| owner != spec.id);
            if taken {
                let own = format!("{}_{}", base, spec.id);
                log::warn!("Widget '{}' is taken, {} publishes it as '{}'", widget_id, spec.id, own);
                widget_id = own;
            }
            if widget_id != base {
                widget.title = format!("{} ({})", widget.title, spec.id);
            }
            if let Err(e) = self.runtime.register_module_instance(&widget_id, &spec.id, widget) {
                self.runtime.deregister_module(&spec.id);
                return Err(e);
            }
            widget_ids.push((base, widget_id));
        }

        let ctx = ModuleContext::new(
            Arc::clone(&self.runtime),
            &spec.id,
            &class.name,
            config,
            widget_ids,
            Arc::downgrade(&handle),
            alive,
        );

        let started = {
            let mut module = handle.lock().await;
            match module.initialize(ctx).await {
                Ok(()) => module.configure().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = started {
            self.runtime.deregister_module(&spec.id);
            return Err(fail(e.to_string()));
        }
        Ok(handle)
    }

    async fn stop_instance(&self, state: &mut LoaderState, instance_id: &str) {
        let Some(active) = state.active.remove(instance_id) else {
            return;
        };
        log::info!("Stopping instance: {}", instance_id);
        let mut module = active.handle.lock().await;
        if let Err(e) = module.on_stop().await {
            log::error!("Error stopping {}: {}", instance_id, e);
        }
        self.runtime.deregister_module(instance_id);
    }

    /// Stops the scan loop and every active instance.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state.active.keys().cloned().collect();
        for id in ids {
            self.stop_instance(&mut state, &id).await;
        }
        state.pending.clear();
        self.runtime.shutdown();
        log::info!("Module loader stopped");
    }

    pub async fn active_instances(&self) -> Vec<String> {
        self.state.lock().await.active.keys().cloned().collect()
    }

    /// Class name of an active instance.
    pub async fn instance_class(&self, instance_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .active
            .get(instance_id)
            .map(|a| a.spec.module.clone())
    }

    pub async fn pending_instances(&self) -> BTreeMap<String, Vec<String>> {
        self.state.lock().await.pending.clone()
    }

    pub async fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.classes.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_module_active(&self, name_or_id: &str) -> bool {
        self.state.lock().await.is_module_active(name_or_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::Event;
    use crate::modules::module::{Module, UiWidget};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    static STOPS: AtomicUsize = AtomicUsize::new(0);

    /// Publishes one widget and a timer; fails to initialize when told to.
    struct Probe {
        ctx: Option<ModuleContext>,
    }

    #[async_trait]
    impl Module for Probe {
        fn ui_config(&self, _config: &ModuleConfig) -> Vec<UiWidget> {
            vec![UiWidget::new("probe", "Probe")]
        }

        async fn initialize(&mut self, ctx: ModuleContext) -> HubResult<()> {
            if ctx.config().get("fail").and_then(|v| v.as_bool()) == Some(true) {
                return Err(HubError::module("asked to fail"));
            }
            self.ctx = Some(ctx);
            Ok(())
        }

        async fn configure(&mut self) -> HubResult<()> {
            if let Some(ctx) = &self.ctx {
                ctx.register_cron("interval:60")?;
            }
            Ok(())
        }

        async fn on_event(&mut self, _event: Event) -> HubResult<()> {
            Ok(())
        }

        async fn on_stop(&mut self) -> HubResult<()> {
            STOPS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        modules: PathBuf,
        config: PathBuf,
        loader: ModuleLoader,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let modules = dir.path().join("modules");
        let config = dir.path().join("config");
        fs::create_dir_all(&modules).unwrap();
        fs::create_dir_all(config.join("modules")).unwrap();

        let mut catalog = ModuleCatalog::new();
        catalog.register("probe", || Box::new(Probe { ctx: None }));
        let settings = RuntimeSettings {
            watch_dirs: vec![modules.clone()],
            config_dir: config.clone(),
            ..Default::default()
        };
        let loader = ModuleLoader::new(Arc::new(RuntimeContext::default()), catalog, &settings);
        Fixture {
            _dir: dir,
            modules,
            config,
            loader,
        }
    }

    #[tokio::test]
    async fn dependencies_start_first_and_missing_ones_stay_pending() {
        let fx = fixture();
        fs::write(
            fx.modules.join("mods.yaml"),
            "classes:\n  - name: A\n    kind: probe\n    dependencies: [B]\n  - name: C\n    kind: probe\n    dependencies: [Ghost]\n",
        )
        .unwrap();
        fs::write(fx.modules.join("b.yaml"), "classes:\n  - name: B\n    kind: probe\n").unwrap();

        assert!(fx.loader.scan_once().await);
        assert_eq!(fx.loader.active_instances().await, vec!["A".to_string(), "B".to_string()]);
        let pending = fx.loader.pending_instances().await;
        assert_eq!(pending.get("C"), Some(&vec!["Ghost".to_string()]));

        // pending instances keep the loop reconciling
        assert!(fx.loader.scan_once().await);
    }

    #[tokio::test]
    async fn config_layers_apply_in_order() {
        let fx = fixture();
        fs::write(
            fx.modules.join("p.yaml"),
            "classes:\n  - name: P\n    kind: probe\n    config:\n      a: manifest\n      b: manifest\n      c: manifest\n      d: manifest\n",
        )
        .unwrap();
        fs::write(fx.config.join("modules/P.yaml"), "b: class\nc: class\nd: class\n").unwrap();
        fs::write(fx.config.join("modules/p2.yaml"), "c: instance\nd: instance\n").unwrap();
        fs::write(
            fx.config.join(INSTANCES_FILE),
            "instances:\n  - id: p2\n    module: P\n    config:\n      d: explicit\n",
        )
        .unwrap();

        let state = LoaderState::default();
        let desired = fx.loader.desired_instances(&state);
        assert_eq!(desired.len(), 1);
        let class = ClassDefinition {
            name: "P".into(),
            kind: "probe".into(),
            source: fx.modules.join("p.yaml"),
            modified: SystemTime::now(),
            dependencies: vec![],
            defaults: serde_json::from_str(r#"{"a":"manifest","b":"manifest","c":"manifest","d":"manifest"}"#).unwrap(),
        };
        let cfg = fx.loader.merged_config(&desired[0], &class);
        assert_eq!(cfg["a"], "manifest");
        assert_eq!(cfg["b"], "class");
        assert_eq!(cfg["c"], "instance");
        assert_eq!(cfg["d"], "explicit");
    }

    #[tokio::test]
    async fn failed_start_rolls_back_registrations() {
        let fx = fixture();
        fs::write(fx.modules.join("p.yaml"), "classes:\n  - name: P\n    kind: probe\n    config:\n      fail: true\n").unwrap();

        fx.loader.scan_once().await;
        assert!(fx.loader.active_instances().await.is_empty());
        assert!(fx.loader.pending_instances().await.is_empty());
        let runtime = fx.loader.runtime();
        assert!(runtime.ui_registry().is_empty());
        assert!(!runtime.registry().contains_instance("P"));
        assert_eq!(runtime.scheduler().job_count("P"), 0);
    }

    #[tokio::test]
    async fn named_instances_get_namespaced_widgets() {
        let fx = fixture();
        fs::write(fx.modules.join("p.yaml"), "classes:\n  - name: P\n    kind: probe\n").unwrap();
        fs::write(
            fx.config.join(INSTANCES_FILE),
            "instances:\n  - id: P\n    module: P\n  - id: second\n    module: P\n",
        )
        .unwrap();

        fx.loader.scan_once().await;
        let mut ids: Vec<String> = fx.loader.runtime().ui_registry().into_iter().map(|w| w.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["probe".to_string(), "probe_second".to_string()]);
        let second = fx
            .loader
            .runtime()
            .ui_registry()
            .into_iter()
            .find(|w| w.id == "probe_second")
            .unwrap();
        assert_eq!(second.title, "Probe (second)");
    }

    #[tokio::test]
    async fn colliding_widget_ids_are_namespaced_at_start() {
        let fx = fixture();
        fs::write(fx.modules.join("p.yaml"), "classes:\n  - name: P\n    kind: probe\n  - name: Q\n    kind: probe\n").unwrap();

        fx.loader.scan_once().await;
        assert_eq!(fx.loader.active_instances().await, vec!["P".to_string(), "Q".to_string()]);

        let runtime = fx.loader.runtime();
        let mut widgets: Vec<(String, Option<String>, String)> = runtime
            .ui_registry()
            .into_iter()
            .map(|w| (w.id, w.instance, w.title))
            .collect();
        widgets.sort();
        assert_eq!(
            widgets,
            vec![
                ("probe".to_string(), Some("P".to_string()), "Probe".to_string()),
                ("probe_Q".to_string(), Some("Q".to_string()), "Probe (Q)".to_string()),
            ]
        );
        let owner = runtime.registry().widget_owner("probe").map(|(owner, _, _)| owner);
        assert_eq!(owner.as_deref(), Some("P"));
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let fx = fixture();
        fs::write(fx.modules.join("p.yaml"), "classes:\n  - name: P\n    kind: probe\n  - name: Q\n    kind: probe\n").unwrap();
        fx.loader.scan_once().await;
        assert_eq!(fx.loader.runtime().scheduler().job_count("P"), 1);

        let before = STOPS.load(Ordering::SeqCst);
        fx.loader.shutdown().await;
        assert!(fx.loader.active_instances().await.is_empty());
        assert!(STOPS.load(Ordering::SeqCst) >= before + 2);
        assert_eq!(fx.loader.runtime().scheduler().job_count("P"), 0);
        assert!(!fx.loader.is_running());
    }
}
