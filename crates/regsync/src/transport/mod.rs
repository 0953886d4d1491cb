use std::future::Future;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::model::Table;
use crate::protocol::Change;

pub mod memory;
pub mod polling;

#[cfg(feature = "ws")]
pub mod ws;

pub use memory::MemoryTransport;
pub use polling::PollingTransport;

#[cfg(feature = "ws")]
pub use ws::WsTransport;

/// Lifecycle events reported by a push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The subscription was acknowledged by the service.
    Subscribed,
    /// The channel failed; the subscription is not live.
    ChannelError,
    /// The subscription attempt timed out.
    TimedOut,
    /// The service closed the channel.
    Closed,
}

/// Handle to an open push channel, used to close it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    table: Table,
    id: u64,
}

impl ChannelHandle {
    pub fn new(table: Table, id: u64) -> Self {
        Self { table, id }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Adapter boundary to the remote data service
///
/// One implementation per backing service; everything above this trait is
/// transport agnostic.
pub trait Transport: Send + Sync + 'static {
    /// Fetch every row of `table`, newest first.
    fn fetch_table(
        &self,
        table: Table,
    ) -> impl Future<Output = Result<Vec<JsonValue>, RemoteError>> + Send;

    /// Open a push channel for `table`.
    ///
    /// Change events and status transitions are delivered through `events`
    /// and `status` until the channel is closed. A dropped receiver must not
    /// fault the transport.
    fn open_channel(
        &self,
        table: Table,
        events: mpsc::UnboundedSender<Change>,
        status: mpsc::UnboundedSender<ChannelStatus>,
    ) -> ChannelHandle;

    /// Close a previously opened channel. Closing twice is a no-op.
    fn close_channel(&self, handle: ChannelHandle);
}
