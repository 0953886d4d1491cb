use thiserror::Error;

use crate::model::Table;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync layer
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote service error: {0}")]
    Remote(#[from] RemoteError),

    #[error("malformed {table} record: {source}")]
    Decode {
        table: Table,
        #[source]
        source: serde_json::Error,
    },

    #[error("provider is not mounted")]
    NotMounted,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[cfg(feature = "axum")]
    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported at the remote data service boundary
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("remote service unreachable: {0}")]
    Unreachable(String),

    #[error("query on {table} failed: {message}")]
    Query { table: Table, message: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}
