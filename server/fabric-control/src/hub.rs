//! Per-client push fan-out, generic over the event type carried.
//!
//! IMPORTANT: one writer per connection owns the socket's write half; other
//! tasks never write to it directly, they enqueue onto this client's `mpsc`
//! channel, which that connection's write task drains. This mirrors the
//! teacher's `PushHub` for its control stream. The `/ws` control channel and
//! the `/bridge` audio channel each get their own `ClientHub<ServerEvent>` /
//! `ClientHub<BridgeEvent>` instance — they are independent connections
//! with independent client sets.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{mpsc, RwLock};

pub type ClientId = u64;

/// Bound on a client's outbound queue. A client that can't keep up is
/// dropped rather than allowed to back-pressure the whole hub.
const CLIENT_QUEUE_DEPTH: usize = 256;

pub struct ClientHub<T> {
    clients: RwLock<HashMap<ClientId, mpsc::Sender<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for ClientHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ClientHub<T> {
    pub fn new() -> Self {
        Self { clients: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Register a new client connection, returning its id and the queue the
    /// connection's write task should drain.
    pub async fn register(&self) -> (ClientId, mpsc::Receiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        self.clients.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unregister(&self, id: ClientId) {
        self.clients.write().await.remove(&id);
    }

    /// Send to one client only (used for `get-*` request/response pairs).
    pub async fn send_to(&self, id: ClientId, event: T) {
        if let Some(tx) = self.clients.read().await.get(&id) {
            let _ = tx.try_send(event);
        }
    }

    /// Broadcast to every connected client (route mutations, endpoint
    /// lifecycle events).
    pub async fn broadcast(&self, event: T) {
        let clients = self.clients.read().await;
        for tx in clients.values() {
            let _ = tx.try_send(event.clone());
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
