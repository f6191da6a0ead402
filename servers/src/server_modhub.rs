use anyhow::Result;
use lib_modhub::core::RuntimeContext;
use lib_modhub::{ModuleCatalog, ModuleLoader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

mod modhub_logic;
use modhub_logic::{config, downstream, logger};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    logger::setup_logging(&log_dir, &log_level)?;

    let settings = config.runtime_settings();
    log::info!("Runtime settings: {:?}", settings);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let runtime = Arc::new(RuntimeContext::from_settings(&settings));
    let loader = Arc::new(ModuleLoader::new(
        Arc::clone(&runtime),
        ModuleCatalog::with_builtin(),
        &settings,
    ));
    loader.ensure_watch_dirs();

    let loader_handle = tokio::spawn(Arc::clone(&loader).run(shutdown_tx.subscribe()));

    let downstream_handle = tokio::spawn(downstream::run(
        config.port.unwrap_or(8000),
        downstream::AppState {
            runtime: Arc::clone(&runtime),
            loader: Arc::clone(&loader),
        },
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for components to shut down
    let (_, served) = tokio::try_join!(loader_handle, downstream_handle)?;
    if let Err(e) = served {
        log::error!("Downstream server failed: {}", e);
    }
    loader.shutdown().await;

    log::info!("Shutdown complete.");
    Ok(())
}
