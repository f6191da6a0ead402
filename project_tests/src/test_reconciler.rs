use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use lib_modhub::core::{ModuleContext, RuntimeContext};
use lib_modhub::modules::module::config_str;
use lib_modhub::{HubResult, Module, ModuleCatalog, ModuleConfig, ModuleLoader, RuntimeSettings, UiWidget};
use serde_json::json;

type Journal = Arc<Mutex<Vec<String>>>;

/// Writes `init:<id>[:<tag>]` and `stop:<id>` lines to a shared journal.
struct Probe {
    journal: Journal,
    ctx: Option<ModuleContext>,
}

#[async_trait]
impl Module for Probe {
    fn ui_config(&self, _config: &ModuleConfig) -> Vec<UiWidget> {
        vec![UiWidget::new("probe", "Probe").with("component", json!("probe-widget"))]
    }

    async fn initialize(&mut self, ctx: ModuleContext) -> HubResult<()> {
        let line = match config_str(ctx.config(), "tag") {
            Some(tag) => format!("init:{}:{}", ctx.instance_id(), tag),
            None => format!("init:{}", ctx.instance_id()),
        };
        self.journal.lock().unwrap().push(line);
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn configure(&mut self) -> HubResult<()> {
        if let Some(ctx) = &self.ctx {
            ctx.register_cron("interval:60")?;
            ctx.subscribe("probe.topic");
        }
        Ok(())
    }

    async fn on_stop(&mut self) -> HubResult<()> {
        if let Some(ctx) = &self.ctx {
            self.journal.lock().unwrap().push(format!("stop:{}", ctx.instance_id()));
        }
        Ok(())
    }
}

struct Harness {
    _root: tempfile::TempDir,
    core: PathBuf,
    prod: PathBuf,
    config: PathBuf,
    journal: Journal,
    loader: ModuleLoader,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let core = root.path().join("modules/core");
        let prod = root.path().join("modules/prod");
        let config = root.path().join("config");
        fs::create_dir_all(&core).unwrap();
        fs::create_dir_all(&prod).unwrap();
        fs::create_dir_all(config.join("modules")).unwrap();

        let journal: Journal = Arc::default();
        let mut catalog = ModuleCatalog::new();
        let shared = Arc::clone(&journal);
        catalog.register("probe", move || {
            Box::new(Probe {
                journal: Arc::clone(&shared),
                ctx: None,
            })
        });

        let settings = RuntimeSettings {
            watch_dirs: vec![core.clone(), prod.clone()],
            config_dir: config.clone(),
            ..Default::default()
        };
        let runtime = Arc::new(RuntimeContext::from_settings(&settings));
        let loader = ModuleLoader::new(runtime, catalog, &settings);
        Harness {
            _root: root,
            core,
            prod,
            config,
            journal,
            loader,
        }
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn clear_journal(&self) {
        self.journal.lock().unwrap().clear();
    }

    async fn active(&self) -> Vec<String> {
        self.loader.active_instances().await
    }
}

/// Writes a file and pushes its mtime forward so a rescan sees a change even
/// on coarse-grained filesystems.
fn write_bumped(path: &Path, text: &str, ahead_secs: u64) {
    fs::write(path, text).unwrap();
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(ahead_secs)).unwrap();
}

#[tokio::test]
async fn dependencies_across_directories_start_in_order() {
    let h = Harness::new();
    fs::write(
        h.core.join("consumer.yaml"),
        "classes:\n  - name: Consumer\n    kind: probe\n    dependencies: [Feed]\n",
    )
    .unwrap();
    fs::write(h.prod.join("feed.yaml"), "classes:\n  - name: Feed\n    kind: probe\n").unwrap();

    assert!(h.loader.scan_once().await);
    assert_eq!(h.journal(), vec!["init:Feed".to_string(), "init:Consumer".to_string()]);
    assert!(h.loader.pending_instances().await.is_empty());
    assert!(h.loader.is_module_active("Consumer").await);

    // nothing changed and nothing pending: no reconcile
    assert!(!h.loader.scan_once().await);
}

#[tokio::test]
async fn pending_instances_start_once_their_dependency_appears() {
    let h = Harness::new();
    fs::write(
        h.core.join("consumer.yaml"),
        "classes:\n  - name: Consumer\n    kind: probe\n    dependencies: [Feed]\n",
    )
    .unwrap();

    h.loader.scan_once().await;
    assert!(h.active().await.is_empty());
    let pending = h.loader.pending_instances().await;
    assert_eq!(pending.get("Consumer"), Some(&vec!["Feed".to_string()]));

    // a dependency is satisfied by an instance id as well as a class name
    fs::write(
        h.config.join("instances.yaml"),
        "instances:\n  - id: Feed\n    module: Source\n",
    )
    .unwrap();
    fs::write(h.prod.join("source.yaml"), "classes:\n  - name: Source\n    kind: probe\n").unwrap();

    h.loader.scan_once().await;
    assert_eq!(h.active().await, vec!["Consumer".to_string(), "Feed".to_string()]);
    assert!(h.loader.pending_instances().await.is_empty());
}

#[tokio::test]
async fn removed_definition_releases_every_resource() {
    let h = Harness::new();
    let path = h.core.join("probe.yaml");
    fs::write(&path, "classes:\n  - name: Lone\n    kind: probe\n").unwrap();
    h.loader.scan_once().await;

    let runtime = Arc::clone(h.loader.runtime());
    assert_eq!(runtime.scheduler().job_count("Lone"), 1);
    assert_eq!(runtime.ui_registry().len(), 1);
    assert_eq!(runtime.registry().subscribers("probe.topic").len(), 1);

    fs::remove_file(&path).unwrap();
    assert!(h.loader.scan_once().await);

    assert!(h.active().await.is_empty());
    assert!(h.loader.class_names().await.is_empty());
    assert!(h.journal().contains(&"stop:Lone".to_string()));
    assert_eq!(runtime.scheduler().job_count("Lone"), 0);
    assert!(runtime.ui_registry().is_empty());
    assert!(runtime.registry().subscribers("probe.topic").is_empty());
}

#[tokio::test]
async fn modified_definition_restarts_its_instances() {
    let h = Harness::new();
    let path = h.core.join("probe.yaml");
    fs::write(&path, "classes:\n  - name: Hot\n    kind: probe\n    config:\n      tag: v1\n").unwrap();
    h.loader.scan_once().await;
    assert_eq!(h.journal(), vec!["init:Hot:v1".to_string()]);
    h.clear_journal();

    write_bumped(&path, "classes:\n  - name: Hot\n    kind: probe\n    config:\n      tag: v2\n", 5);
    assert!(h.loader.scan_once().await);
    assert_eq!(h.journal(), vec!["stop:Hot".to_string(), "init:Hot:v2".to_string()]);
    assert_eq!(h.active().await, vec!["Hot".to_string()]);
    assert_eq!(h.loader.runtime().scheduler().job_count("Hot"), 1);
}

#[tokio::test]
async fn broken_reload_keeps_the_running_class() {
    let h = Harness::new();
    let path = h.core.join("probe.yaml");
    fs::write(&path, "classes:\n  - name: Steady\n    kind: probe\n").unwrap();
    h.loader.scan_once().await;
    h.clear_journal();

    write_bumped(&path, "classes:\n  - name: Steady\n    kind: no_such_kind\n", 5);
    h.loader.scan_once().await;
    assert!(h.journal().is_empty());
    assert_eq!(h.active().await, vec!["Steady".to_string()]);
    assert_eq!(h.loader.class_names().await, vec!["Steady".to_string()]);
}

#[tokio::test]
async fn class_moved_to_another_source_keeps_running() {
    let h = Harness::new();
    let old_home = h.core.join("b.yaml");
    fs::write(&old_home, "classes:\n  - name: Nomad\n    kind: probe\n").unwrap();
    h.loader.scan_once().await;
    assert_eq!(h.active().await, vec!["Nomad".to_string()]);
    h.clear_journal();

    // a.yaml is scanned before b.yaml, so the class is re-exported first
    fs::write(h.core.join("a.yaml"), "classes:\n  - name: Nomad\n    kind: probe\n").unwrap();
    write_bumped(&old_home, "classes: []\n", 5);
    assert!(h.loader.scan_once().await);

    assert_eq!(h.loader.class_names().await, vec!["Nomad".to_string()]);
    assert_eq!(h.active().await, vec!["Nomad".to_string()]);
    assert_eq!(h.journal(), vec!["stop:Nomad".to_string(), "init:Nomad".to_string()]);

    h.loader.scan_once().await;
    assert_eq!(h.active().await, vec!["Nomad".to_string()]);
}

#[tokio::test]
async fn instance_list_changes_are_reconciled() {
    let h = Harness::new();
    fs::write(h.core.join("probe.yaml"), "classes:\n  - name: Watch\n    kind: probe\n").unwrap();
    h.loader.scan_once().await;
    assert_eq!(h.active().await, vec!["Watch".to_string()]);
    h.clear_journal();

    // configuring the class explicitly replaces its implicit default instance
    write_bumped(
        &h.config.join("instances.yaml"),
        "instances:\n  - id: tech\n    module: Watch\n    config:\n      tag: t\n  - id: banks\n    module: Watch\n",
        5,
    );
    fs::write(h.config.join("modules/Watch.yaml"), "tag: class-wide\n").unwrap();
    assert!(h.loader.scan_once().await);

    assert_eq!(h.active().await, vec!["banks".to_string(), "tech".to_string()]);
    let journal = h.journal();
    assert_eq!(journal[0], "stop:Watch");
    assert!(journal.contains(&"init:tech:t".to_string()));
    assert!(journal.contains(&"init:banks:class-wide".to_string()));

    let mut widgets: Vec<(String, String)> = h
        .loader
        .runtime()
        .ui_registry()
        .into_iter()
        .map(|w| (w.id, w.title))
        .collect();
    widgets.sort();
    assert_eq!(
        widgets,
        vec![
            ("probe_banks".to_string(), "Probe (banks)".to_string()),
            ("probe_tech".to_string(), "Probe (tech)".to_string()),
        ]
    );
}

#[tokio::test]
async fn unknown_class_in_instance_list_is_skipped() {
    let h = Harness::new();
    fs::write(h.core.join("probe.yaml"), "classes:\n  - name: Real\n    kind: probe\n").unwrap();
    fs::write(
        h.config.join("instances.yaml"),
        "instances:\n  - id: ghost\n    module: Missing\n",
    )
    .unwrap();

    h.loader.scan_once().await;
    assert_eq!(h.active().await, vec!["Real".to_string()]);
    assert!(h.loader.pending_instances().await.is_empty());
}

#[tokio::test]
async fn client_messages_reach_the_owning_instance_only_while_active() {
    let h = Harness::new();
    let path = h.core.join("probe.yaml");
    fs::write(&path, "classes:\n  - name: Talk\n    kind: probe\n").unwrap();
    h.loader.scan_once().await;

    let runtime = Arc::clone(h.loader.runtime());
    runtime.route_client_message("probe", json!({ "type": "ping" })).await.unwrap();

    h.loader.shutdown().await;
    assert!(runtime.route_client_message("probe", json!({ "type": "ping" })).await.is_err());
    assert!(h.journal().contains(&"stop:Talk".to_string()));
}
