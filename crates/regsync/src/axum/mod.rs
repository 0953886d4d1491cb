use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::Table;
use crate::store::SyncProvider;
use crate::transport::Transport;

pub mod handler;

pub use handler::WebSocketHandler;

/// Axum state wrapper for the sync provider
pub struct SyncState<T: Transport> {
    provider: SyncProvider<T>,
    clients: Arc<ClientManager>,
}

impl<T: Transport> Clone for SyncState<T> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            clients: self.clients.clone(),
        }
    }
}

impl<T: Transport> SyncState<T> {
    /// Create a new sync state around a mounted provider
    pub fn new(provider: SyncProvider<T>) -> Self {
        Self {
            provider,
            clients: Arc::new(ClientManager::new()),
        }
    }

    /// Get the sync provider
    pub fn provider(&self) -> &SyncProvider<T> {
        &self.provider
    }

    /// Get the client manager
    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }
}

/// Manages connected WebSocket clients and their table subscriptions
pub struct ClientManager {
    /// Map of client ID to client info
    clients: RwLock<HashMap<String, ClientInfo>>,
    /// Map of table to the client IDs subscribed to it
    subscriptions: RwLock<HashMap<Table, Vec<String>>>,
}

/// Information about a connected client
pub struct ClientInfo {
    pub id: String,
    pub sender: tokio::sync::mpsc::UnboundedSender<crate::protocol::ServerMessage>,
}

impl ClientManager {
    /// Create a new client manager
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new client
    pub async fn register_client(
        &self,
        sender: tokio::sync::mpsc::UnboundedSender<crate::protocol::ServerMessage>,
    ) -> String {
        let client_id = Uuid::new_v4().to_string();
        let client_info = ClientInfo {
            id: client_id.clone(),
            sender,
        };

        self.clients
            .write()
            .await
            .insert(client_id.clone(), client_info);
        tracing::info!("Registered client: {}", client_id);
        client_id
    }

    /// Unregister a client and clean up their subscriptions
    pub async fn unregister_client(&self, client_id: &str) {
        self.clients.write().await.remove(client_id);

        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|_, client_ids| {
            client_ids.retain(|id| id != client_id);
            !client_ids.is_empty()
        });

        tracing::info!("Unregistered client: {}", client_id);
    }

    /// Subscribe a client to a table
    pub async fn subscribe_client(&self, client_id: &str, table: Table) {
        let mut subscriptions = self.subscriptions.write().await;

        subscriptions
            .entry(table)
            .or_insert_with(Vec::new)
            .push(client_id.to_string());

        tracing::debug!("Client {} subscribed to table '{}'", client_id, table);
    }

    /// Unsubscribe a client from a table
    pub async fn unsubscribe_client(&self, client_id: &str, table: Table) {
        let mut subscriptions = self.subscriptions.write().await;

        if let Some(client_ids) = subscriptions.get_mut(&table) {
            client_ids.retain(|id| id != client_id);
            if client_ids.is_empty() {
                subscriptions.remove(&table);
            }
        }

        tracing::debug!("Client {} unsubscribed from table '{}'", client_id, table);
    }

    /// Broadcast a message to all clients subscribed to a table
    pub async fn broadcast_to_subscribers(
        &self,
        table: Table,
        message: crate::protocol::ServerMessage,
    ) {
        let subscriptions = self.subscriptions.read().await;

        if let Some(client_ids) = subscriptions.get(&table) {
            let clients = self.clients.read().await;

            // Clone the Arc per subscriber, not the message itself
            let message_arc = std::sync::Arc::new(message);

            for client_id in client_ids {
                if let Some(client_info) = clients.get(client_id) {
                    if client_info.sender.send((*message_arc).clone()).is_err() {
                        tracing::warn!("Failed to send message to client {}", client_id);
                    }
                }
            }
        }
    }

    /// Send a message to a specific client
    pub async fn send_to_client(&self, client_id: &str, message: crate::protocol::ServerMessage) {
        let clients = self.clients.read().await;
        if let Some(client_info) = clients.get(client_id) {
            if client_info.sender.send(message).is_err() {
                tracing::warn!("Failed to send message to client {}", client_id);
            }
        }
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a router exposing the provider over a WebSocket endpoint
pub fn router_with_sync<T: Transport>(provider: SyncProvider<T>) -> Router<SyncState<T>> {
    let state = SyncState::new(provider);
    router_with_sync_state(state)
}

/// Create a router using an existing [`SyncState`]
///
/// Useful when the same state is shared with other parts of the application
/// so WebSocket clients and the change forwarder use one ClientManager.
pub fn router_with_sync_state<T: Transport>(state: SyncState<T>) -> Router<SyncState<T>> {
    // Bridge applied changes to subscribed WebSocket clients
    start_change_forwarder(state.provider.clone(), state.clients.clone());

    Router::new()
        .route("/sync", get(websocket_handler::<T>))
        .with_state(state)
}

/// Start a background task that forwards applied changes to WebSocket clients
fn start_change_forwarder<T: Transport>(
    provider: SyncProvider<T>,
    client_manager: Arc<ClientManager>,
) {
    tokio::spawn(async move {
        let mut change_rx = provider.subscribe_to_changes();

        tracing::info!("Started change forwarder for sync provider");

        loop {
            match change_rx.recv().await {
                Ok((table, change)) => {
                    tracing::debug!("Forwarding change for table '{}': {:?}", table, change);

                    let message = crate::protocol::ServerMessage::TableChange { table, change };
                    client_manager.broadcast_to_subscribers(table, message).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Change forwarder lagged behind, skipped {} changes. Continuing...",
                        skipped
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::error!("Change forwarder channel closed - provider dropped");
                    break;
                }
            }
        }

        tracing::warn!("Change forwarder ended");
    });
}

/// WebSocket handler endpoint
async fn websocket_handler<T: Transport>(
    ws: WebSocketUpgrade,
    State(state): State<SyncState<T>>,
) -> Response {
    ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state).handle())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::model::fixtures;
    use crate::protocol::{Change, ServerMessage};
    use crate::transport::MemoryTransport;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn change_forwarder_reaches_subscribed_clients() {
        let backend = MemoryTransport::new();
        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;

        let client_manager = Arc::new(ClientManager::new());
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client_id = client_manager.register_client(client_tx).await;

        client_manager
            .subscribe_client(&client_id, Table::Guests)
            .await;

        start_change_forwarder(provider.clone(), client_manager.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        backend.insert_record(&fixtures::guest(4)).unwrap();

        let message = timeout(Duration::from_secs(5), client_rx.recv())
            .await
            .expect("should receive message")
            .expect("should have message");

        match message {
            ServerMessage::TableChange { table, change } => {
                assert_eq!(table, Table::Guests);
                assert!(matches!(change, Change::Insert { .. }));
            }
            other => panic!("expected TableChange, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsubscribed_clients_hear_nothing() {
        let backend = MemoryTransport::new();
        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;

        let client_manager = Arc::new(ClientManager::new());
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client_id = client_manager.register_client(client_tx).await;
        client_manager
            .subscribe_client(&client_id, Table::Guests)
            .await;
        client_manager.unsubscribe_client(&client_id, Table::Guests).await;

        start_change_forwarder(provider.clone(), client_manager.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        backend.insert_record(&fixtures::guest(4)).unwrap();

        let result = timeout(Duration::from_millis(100), client_rx.recv()).await;
        assert!(result.is_err(), "unsubscribed client should stay quiet");
    }
}
