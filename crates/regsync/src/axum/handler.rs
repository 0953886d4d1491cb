use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::SyncState;
use crate::protocol::{decode_message, encode_message, ClientMessage, ServerMessage};
use crate::transport::Transport;

/// Handles WebSocket connections for individual dashboard clients
pub struct WebSocketHandler<T: Transport> {
    socket: WebSocket,
    state: SyncState<T>,
}

impl<T: Transport> WebSocketHandler<T> {
    /// Create a new WebSocket handler
    pub fn new(socket: WebSocket, state: SyncState<T>) -> Self {
        Self { socket, state }
    }

    /// Handle the WebSocket connection
    pub async fn handle(self) {
        let (mut ws_sender, mut ws_receiver) = self.socket.split();

        // Channel for sending messages to this client
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        let client_id = self.state.clients().register_client(tx).await;
        let client_id_clone = client_id.clone();

        info!("New WebSocket connection for client {}", client_id);

        // Forward queued server messages onto the socket
        let sender_task = {
            let client_id = client_id.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    match encode_message(&message) {
                        Ok(encoded) => {
                            if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                                error!(
                                    "Failed to send WebSocket message to client {}: {}",
                                    client_id, e
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to encode message for client {}: {}", client_id, e);
                        }
                    }
                }
                debug!("Sender task ended for client {}", client_id);
            })
        };

        // Handle incoming messages from the socket
        let receiver_task = {
            let state = self.state.clone();
            let client_id = client_id.clone();

            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if let Err(e) = handle_client_message(&state, &client_id, &data).await {
                                error!("Error handling client message: {}", e);

                                let error_msg = ServerMessage::Error {
                                    message: format!("Error processing message: {}", e),
                                };
                                state.clients().send_to_client(&client_id, error_msg).await;
                            }
                        }
                        Ok(Message::Text(text)) => {
                            warn!(
                                "Received unexpected text message from client {}: {}",
                                client_id, text
                            );
                        }
                        Ok(Message::Close(_)) => {
                            info!("Client {} closed connection normally", client_id);
                            break;
                        }
                        Ok(Message::Ping(_)) => {
                            debug!("Received ping from client {}", client_id);
                            // Axum answers pongs on its own
                        }
                        Ok(Message::Pong(_)) => {
                            debug!("Received pong from client {}", client_id);
                        }
                        Err(e) => {
                            warn!("WebSocket error for client {}: {}", client_id, e);
                            break;
                        }
                    }
                }
                debug!("Receiver task ended for client {}", client_id);
            })
        };

        // Either task ending means the connection is done
        let completion_reason = tokio::select! {
            _ = sender_task => "sender task completed",
            _ = receiver_task => "receiver task completed",
        };

        info!(
            "WebSocket connection ending for client {} ({})",
            client_id, completion_reason
        );

        self.state
            .clients()
            .unregister_client(&client_id_clone)
            .await;

        info!("Client {} fully disconnected", client_id_clone);
    }
}

/// Handle a message from a dashboard client
async fn handle_client_message<T: Transport>(
    state: &SyncState<T>,
    client_id: &str,
    data: &[u8],
) -> crate::SyncResult<()> {
    let message: ClientMessage = decode_message(data)?;

    match message {
        ClientMessage::Subscribe { table } => {
            debug!("Client {} subscribing to table '{}'", client_id, table);

            state.clients().subscribe_client(client_id, table).await;

            // Prime the subscriber with the current contents
            let snapshot = ServerMessage::Snapshot {
                table,
                rows: state.provider().table_snapshot(table),
            };
            state.clients().send_to_client(client_id, snapshot).await;

            let ack = ServerMessage::Ack { request_id: None };
            state.clients().send_to_client(client_id, ack).await;
        }

        ClientMessage::Unsubscribe { table } => {
            debug!("Client {} unsubscribing from table '{}'", client_id, table);

            state.clients().unsubscribe_client(client_id, table).await;

            let ack = ServerMessage::Ack { request_id: None };
            state.clients().send_to_client(client_id, ack).await;
        }

        ClientMessage::GetSnapshot { table } => {
            debug!(
                "Client {} requesting snapshot of table '{}'",
                client_id, table
            );

            let snapshot = ServerMessage::Snapshot {
                table,
                rows: state.provider().table_snapshot(table),
            };
            state.clients().send_to_client(client_id, snapshot).await;
        }
    }

    Ok(())
}
