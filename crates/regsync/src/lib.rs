//! # regsync - Realtime Registration Sync
//!
//! The realtime synchronization layer of an event-registration platform.
//!
//! regsync keeps in-memory copies of the six registration collections
//! (students, guests, groups, singles, QR codes, attendance logs) converged
//! with a remote data service: one bulk fetch per collection at mount, one
//! push channel per table thereafter, quorum connection tracking with bounded
//! reconnect retries, and toast-style notifications for the UI layer.

pub mod config;
pub mod error;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod transport;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use config::SyncConfig;
pub use error::{RemoteError, SyncError, SyncResult};
pub use model::{
    AttendanceLog, Entity, Guest, Group, PerformanceType, QrCode, QrOwner, RecordKey, Single,
    Student, Table,
};
pub use notify::{Notification, Notifier, Severity};
pub use protocol::{Change, ClientMessage, ServerMessage};
pub use store::{Collection, CollectionHandle, SyncProvider, TableSubscription};
pub use sync::{ChannelState, ConnectionStatus};
pub use transport::{ChannelHandle, ChannelStatus, MemoryTransport, PollingTransport, Transport};

#[cfg(feature = "ws")]
pub use transport::WsTransport;

#[cfg(feature = "axum")]
pub use axum::{router_with_sync, router_with_sync_state, SyncState, WebSocketHandler};
