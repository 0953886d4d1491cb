use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ChannelHandle, ChannelStatus, Transport};
use crate::error::RemoteError;
use crate::model::Table;
use crate::protocol::{decode_message, encode_message, Change, ClientMessage, ServerMessage};

type FetchReply = oneshot::Sender<Result<Vec<JsonValue>, RemoteError>>;

/// WebSocket transport speaking the regsync wire protocol
///
/// Connects to the endpoint served by the `axum` module of another regsync
/// node, mapping `Subscribe`/`Snapshot`/`TableChange` frames onto the
/// [`Transport`] contract. Fetches are answered by snapshot frames; channel
/// subscriptions by acks.
pub struct WsTransport {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
}

enum Command {
    Fetch {
        table: Table,
        reply: FetchReply,
    },
    Open {
        table: Table,
        id: u64,
        events: mpsc::UnboundedSender<Change>,
        status: mpsc::UnboundedSender<ChannelStatus>,
    },
    Close {
        id: u64,
    },
}

impl WsTransport {
    /// Connect to a regsync WebSocket endpoint, e.g. `ws://host:3400/sync`.
    pub async fn connect(url: &str) -> Result<Self, RemoteError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        info!("connected to sync endpoint {}", url);

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(io_loop(stream, command_rx));

        Ok(Self {
            commands,
            next_id: AtomicU64::new(1),
        })
    }
}

impl Transport for WsTransport {
    async fn fetch_table(&self, table: Table) -> Result<Vec<JsonValue>, RemoteError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Fetch { table, reply })
            .map_err(|_| RemoteError::ConnectionLost("websocket task ended".to_string()))?;
        response
            .await
            .map_err(|_| RemoteError::ConnectionLost("websocket task ended".to_string()))?
    }

    fn open_channel(
        &self,
        table: Table,
        events: mpsc::UnboundedSender<Change>,
        status: mpsc::UnboundedSender<ChannelStatus>,
    ) -> ChannelHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command = Command::Open {
            table,
            id,
            events,
            status: status.clone(),
        };
        if self.commands.send(command).is_err() {
            let _ = status.send(ChannelStatus::ChannelError);
        }
        ChannelHandle::new(table, id)
    }

    fn close_channel(&self, handle: ChannelHandle) {
        let _ = self.commands.send(Command::Close { id: handle.id() });
    }
}

struct Subscription {
    id: u64,
    table: Table,
    events: mpsc::UnboundedSender<Change>,
    status: mpsc::UnboundedSender<ChannelStatus>,
}

/// Requests the server acknowledges in order, so a FIFO matches acks to
/// their origin.
enum AckWaiter {
    Subscribe { channel_id: u64 },
    Unsubscribe,
}

#[derive(Default)]
struct IoState {
    subscriptions: Vec<Subscription>,
    pending_acks: VecDeque<AckWaiter>,
    pending_fetches: HashMap<Table, VecDeque<FetchReply>>,
}

impl IoState {
    fn handle_frame(&mut self, data: &[u8]) {
        let message: ServerMessage = match decode_message(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable server frame: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Snapshot { table, rows } => {
                // A snapshot answers the oldest waiting fetch; the priming
                // snapshot after a subscribe has no waiter and is dropped
                // (the initial bulk fetch covers that data).
                if let Some(queue) = self.pending_fetches.get_mut(&table) {
                    if let Some(reply) = queue.pop_front() {
                        let _ = reply.send(Ok(rows));
                        return;
                    }
                }
                debug!("unsolicited snapshot for {} dropped", table);
            }
            ServerMessage::TableChange { table, change } => {
                for sub in self.subscriptions.iter().filter(|s| s.table == table) {
                    let _ = sub.events.send(change.clone());
                }
            }
            ServerMessage::Ack { .. } => match self.pending_acks.pop_front() {
                Some(AckWaiter::Subscribe { channel_id }) => {
                    if let Some(sub) = self.subscriptions.iter().find(|s| s.id == channel_id) {
                        let _ = sub.status.send(ChannelStatus::Subscribed);
                    }
                }
                Some(AckWaiter::Unsubscribe) => {}
                None => debug!("ack with no pending request"),
            },
            ServerMessage::Error { message } => {
                warn!("server error: {}", message);
            }
        }
    }

    fn has_subscription(&self, table: Table) -> bool {
        self.subscriptions.iter().any(|s| s.table == table)
    }

    /// Drop everything when the connection is gone.
    fn disconnect(self, reason: &str) {
        for sub in self.subscriptions {
            let _ = sub.status.send(ChannelStatus::Closed);
        }
        for (_, queue) in self.pending_fetches {
            for reply in queue {
                let _ = reply.send(Err(RemoteError::ConnectionLost(reason.to_string())));
            }
        }
    }
}

async fn io_loop(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (mut sink, mut source) = stream.split();
    let mut state = IoState::default();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Fetch { table, reply }) => {
                    match send_frame(&mut sink, &ClientMessage::GetSnapshot { table }).await {
                        Ok(()) => {
                            state.pending_fetches.entry(table).or_default().push_back(reply);
                        }
                        Err(reason) => {
                            let _ = reply.send(Err(RemoteError::ConnectionLost(reason)));
                        }
                    }
                }
                Some(Command::Open { table, id, events, status }) => {
                    if state.has_subscription(table) {
                        // The wire subscription already exists; attach locally.
                        state.subscriptions.push(Subscription { id, table, events, status: status.clone() });
                        let _ = status.send(ChannelStatus::Subscribed);
                    } else {
                        match send_frame(&mut sink, &ClientMessage::Subscribe { table }).await {
                            Ok(()) => {
                                state.pending_acks.push_back(AckWaiter::Subscribe { channel_id: id });
                                state.subscriptions.push(Subscription { id, table, events, status });
                            }
                            Err(_) => {
                                let _ = status.send(ChannelStatus::ChannelError);
                            }
                        }
                    }
                }
                Some(Command::Close { id }) => {
                    let table = state
                        .subscriptions
                        .iter()
                        .find(|s| s.id == id)
                        .map(|s| s.table);
                    state.subscriptions.retain(|s| s.id != id);

                    // Tear the wire subscription down with the last local one.
                    if let Some(table) = table {
                        if !state.has_subscription(table)
                            && send_frame(&mut sink, &ClientMessage::Unsubscribe { table }).await.is_ok()
                        {
                            state.pending_acks.push_back(AckWaiter::Unsubscribe);
                        }
                    }
                }
                None => {
                    debug!("transport dropped, ending websocket task");
                    return;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Binary(data))) => state.handle_frame(&data),
                Some(Ok(Message::Close(_))) | None => {
                    warn!("sync endpoint closed the connection");
                    state.disconnect("connection closed");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("websocket error: {}", e);
                    state.disconnect("websocket error");
                    return;
                }
            },
        }
    }
}

async fn send_frame<S>(sink: &mut S, message: &ClientMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = encode_message(message).map_err(|e| e.to_string())?;
    sink.send(Message::Binary(frame))
        .await
        .map_err(|e| e.to_string())
}
