//! # UI Frame Dispatcher
//!
//! The `Dispatcher` fans module output out to every connected dashboard
//! client. Modules call `broadcast_ui(widget_id, data)` on their context; the
//! context turns that into a [`UiFrame`] and hands it here.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: each frame is wrapped in an `Arc` once. Every
//!     client receives a new pointer to the *same* frame, never a clone of the
//!     payload.
//!
//! 2.  **Lazy Disconnect Cleanup**: a client whose receiver has been dropped is
//!     detected on the next broadcast (its `send` fails) and removed in the
//!     same pass.
//!
//! 3.  **No Backpressure**: channels are unbounded. A slow client only grows its
//!     own queue; broadcasting never waits on it.
//!
//! The dispatcher also remembers when each widget last received a frame, which
//! the server exposes as a health view of the dashboard.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// # UI Frame
///
/// What a dashboard client receives: the target widget and the payload for it.
#[derive(Debug, Clone, Serialize)]
pub struct UiFrame {
    /// Namespaced widget id the payload is addressed to.
    pub widget_id: String,
    /// Arbitrary widget payload.
    pub data: Value,
    /// When the module produced the frame.
    pub sent_at: DateTime<Local>,
}

impl UiFrame {
    /// Wire form sent to dashboard clients.
    pub fn to_message(&self) -> Value {
        json!({
            "type": "update",
            "widget_id": self.widget_id,
            "data": self.data,
            "ts": self.sent_at.to_rfc3339(),
        })
    }
}

/// # Client Handle
///
/// One connected client (usually a WebSocket session) and the sending half of
/// its dedicated channel.
struct ClientHandle {
    id: String,
    sender: mpsc::UnboundedSender<Arc<UiFrame>>,
}

/// # Core Dispatcher
///
/// Manages registration, removal and broadcasting to all clients.
#[derive(Default)]
pub struct Dispatcher {
    clients: Mutex<Vec<ClientHandle>>,
    last_updates: Mutex<BTreeMap<String, DateTime<Local>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Add Client
    ///
    /// Creates an unbounded channel for the client and returns the receiving
    /// half, which the client's own task drains.
    pub fn add_client(&self, id: &str) -> mpsc::UnboundedReceiver<Arc<UiFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(ClientHandle {
            id: id.to_string(),
            sender: tx,
        });
        log::info!("Client '{}' registered with dispatcher", id);
        rx
    }

    /// # Broadcast
    ///
    /// Sends one frame to every client; returns how many received it.
    /// Clients whose receiver is gone are dropped from the list.
    pub fn broadcast(&self, widget_id: &str, data: Value) -> usize {
        let frame = Arc::new(UiFrame {
            widget_id: widget_id.to_string(),
            data,
            sent_at: Local::now(),
        });
        self.last_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(frame.widget_id.clone(), frame.sent_at);

        let mut clients = self.lock();
        clients.retain(|client| match client.sender.send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(_) => {
                log::info!("Client '{}' disconnected. Removing from dispatcher.", client.id);
                false
            }
        });
        clients.len()
    }

    /// Removes a specific client by its ID.
    pub fn remove_client(&self, id: &str) {
        self.lock().retain(|c| c.id != id);
        log::info!("Client '{}' explicitly removed.", id);
    }

    /// Last frame time per widget id.
    pub fn last_updates(&self) -> BTreeMap<String, DateTime<Local>> {
        self.last_updates.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ClientHandle>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_reach_every_client() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.add_client("a");
        let mut b = dispatcher.add_client("b");

        assert_eq!(dispatcher.broadcast("watchlist", json!({ "n": 1 })), 2);

        let fa = a.recv().await.unwrap();
        let fb = b.recv().await.unwrap();
        assert!(Arc::ptr_eq(&fa, &fb));
        assert_eq!(fa.widget_id, "watchlist");
        assert_eq!(fa.data["n"], 1);
        assert_eq!(fa.to_message()["type"], "update");
        assert!(dispatcher.last_updates().contains_key("watchlist"));
    }

    #[tokio::test]
    async fn dropped_clients_are_pruned() {
        let dispatcher = Dispatcher::new();
        let _keep = dispatcher.add_client("keep");
        let gone = dispatcher.add_client("gone");
        drop(gone);

        assert_eq!(dispatcher.broadcast("w", Value::Null), 1);
        assert_eq!(dispatcher.client_count(), 1);

        dispatcher.remove_client("keep");
        assert_eq!(dispatcher.client_count(), 0);
    }
}
