use crate::modhub_logic::model::ClientMessage;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::StreamExt;
use lib_modhub::ModuleLoader;
use lib_modhub::core::RuntimeContext;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeContext>,
    pub loader: Arc<ModuleLoader>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/modules", get(modules_handler))
        .route("/api/modules/ui_registry", get(ui_registry_handler))
        .route("/api/status", get(status_handler))
        .with_state(state)
}

pub async fn run(port: u16, state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("Downstream server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn ui_registry_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.ui_registry())
}

async fn modules_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "active": state.loader.active_instances().await,
        "pending": state.loader.pending_instances().await,
        "classes": state.loader.class_names().await,
    }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let updates: serde_json::Map<String, serde_json::Value> = state
        .runtime
        .dispatcher()
        .last_updates()
        .into_iter()
        .map(|(widget, at)| (widget, json!(at.format("%Y-%m-%d %H:%M:%S").to_string())))
        .collect();
    Json(serde_json::Value::Object(updates))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = format!("ws-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    let dispatcher = Arc::clone(state.runtime.dispatcher());
    let mut frames = dispatcher.add_client(&client_id);
    log::info!("Client {} connected", client_id);

    loop {
        tokio::select! {
            // Handle incoming messages from the client
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if let Err(e) = state.runtime.route_client_message(&msg.widget_id, msg.message).await {
                                    log::warn!("Client {}: {}", client_id, e);
                                }
                            }
                            Err(e) => log::debug!("Client {} sent an unreadable message: {}", client_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            // Forward UI frames broadcast by modules
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let text = frame.to_message().to_string();
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break; // client disconnected
                }
            }
        }
    }

    dispatcher.remove_client(&client_id);
    log::info!("Client {} disconnected", client_id);
}
