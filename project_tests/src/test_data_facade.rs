use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use lib_modhub::core::{RouteOrigin, RuntimeContext, UiFrame};
use lib_modhub::providers::DataProvider;
use lib_modhub::{ModuleCatalog, ModuleLoader, RuntimeSettings};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

const MARKET: &str = r#"
classes:
  - name: FeedModule
    kind: market_data
    config:
      provider: feed
      interval: 60
      quotes:
        - { code: "600519", name: "Moutai", price: 1800.0 }
        - { code: "000001", name: "Ping An", price: 10.5 }
        - { code: "300750", name: "CATL", price: 190.0 }
  - name: BoardModule
    kind: market_data
    config:
      provider: board
      interval: 60
      limit_up:
        - { code: "600001", seal_funds: 100 }
        - { code: "600002", seal_funds: 900 }
        - { code: "600003", seal_funds: 500 }
"#;

const CONSUMERS: &str = r#"
classes:
  - name: WatchlistModule
    kind: watchlist
    dependencies: [FeedModule]
    config:
      codes: "600519, 000001"
      interval: 60
  - name: LimitRankModule
    kind: limit_rank
    dependencies: [BoardModule]
    config:
      interval: 60
      top: 2
"#;

struct Harness {
    _root: tempfile::TempDir,
    runtime: Arc<RuntimeContext>,
    loader: ModuleLoader,
}

fn harness(routing: HashMap<String, String>) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let modules = root.path().join("modules");
    fs::create_dir_all(&modules).unwrap();
    fs::write(modules.join("market.yaml"), MARKET).unwrap();
    fs::write(modules.join("consumers.yaml"), CONSUMERS).unwrap();

    let settings = RuntimeSettings {
        watch_dirs: vec![modules],
        config_dir: root.path().join("config"),
        default_provider: Some("feed".to_string()),
        routing,
        ..Default::default()
    };
    let runtime = Arc::new(RuntimeContext::from_settings(&settings));
    let loader = ModuleLoader::new(Arc::clone(&runtime), ModuleCatalog::with_builtin(), &settings);
    Harness {
        _root: root,
        runtime,
        loader,
    }
}

/// Waits for the next frame addressed to `widget_id`.
async fn next_frame(rx: &mut UnboundedReceiver<Arc<UiFrame>>, widget_id: &str) -> Value {
    let wait = async {
        loop {
            match rx.recv().await {
                Some(frame) if frame.widget_id == widget_id => return frame.data.clone(),
                Some(_) => continue,
                None => return Value::Null,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn builtin_modules_share_the_routed_cache() {
    let h = harness(HashMap::new());
    let mut rx = h.runtime.dispatcher().add_client("test");
    h.loader.scan_once().await;

    assert_eq!(
        h.loader.active_instances().await,
        vec![
            "BoardModule".to_string(),
            "FeedModule".to_string(),
            "LimitRankModule".to_string(),
            "WatchlistModule".to_string(),
        ]
    );
    // providers register in start order; the configured default still wins
    assert_eq!(h.runtime.data().provider_names(), vec!["board".to_string(), "feed".to_string()]);
    assert_eq!(h.runtime.data().default_name().as_deref(), Some("feed"));

    let quotes = next_frame(&mut rx, "watchlist").await;
    let codes: Vec<&str> = quotes
        .as_array()
        .unwrap()
        .iter()
        .map(|q| q["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["600519", "000001"]);

    // `feed` has no limit board, so the pool is found on `board` by discovery
    let ranked = next_frame(&mut rx, "limit_rank").await;
    let ranked: Vec<&str> = ranked
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["code"].as_str().unwrap())
        .collect();
    assert_eq!(ranked, vec!["600002", "600003"]);
    assert!(h.runtime.data().discovery_scans() >= 1);

    let updated = h.runtime.dispatcher().last_updates();
    for widget in ["watchlist", "limit_rank", "market_status_feed", "market_status_board"] {
        assert!(updated.contains_key(widget), "no frame for {widget}");
    }

    h.loader.shutdown().await;
}

#[tokio::test]
async fn configured_routes_win_and_survive_provider_loss() {
    let routing = HashMap::from([("get_limit_up_pool".to_string(), "board".to_string())]);
    let h = harness(routing);
    h.loader.scan_once().await;

    let data = h.runtime.data();
    assert_eq!(
        data.route_for("get_limit_up_pool"),
        Some(("board".to_string(), RouteOrigin::Config))
    );
    let pool = data.call("get_limit_up_pool", json!({})).await.unwrap();
    assert_eq!(pool.as_array().unwrap().len(), 3);

    h.loader.shutdown().await;
    assert!(data.provider_names().is_empty());
    assert_eq!(
        data.route_for("get_limit_up_pool"),
        Some(("board".to_string(), RouteOrigin::Config))
    );
    assert!(data.call("get_limit_up_pool", json!({})).await.is_err());
}

#[tokio::test]
async fn watchlist_codes_can_be_replaced_from_the_dashboard() {
    let h = harness(HashMap::new());
    let mut rx = h.runtime.dispatcher().add_client("test");
    h.loader.scan_once().await;
    next_frame(&mut rx, "watchlist").await;

    h.runtime
        .route_client_message(
            "watchlist",
            json!({ "type": "update_config", "config": { "codes": ["300750"] } }),
        )
        .await
        .unwrap();

    let quotes = next_frame(&mut rx, "watchlist").await;
    assert_eq!(quotes.as_array().unwrap().len(), 1);
    assert_eq!(quotes[0]["code"], "300750");

    h.loader.shutdown().await;
}
