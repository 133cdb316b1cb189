//! Error types for the sync subsystem.
//!
//! Transport failures have no variant here: a lost connection becomes a
//! `Disconnected` event and a scheduled reconnect, never an `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A second handler was registered for a message target.
    #[error("a handler for target `{0}` is already registered")]
    DuplicateHandler(String),

    /// A directed server send named an identity that never connected.
    #[error("invalid destination for server message: {0}")]
    UnknownDestination(String),

    #[error("invalid tier address `{0}`")]
    InvalidAddress(String),

    #[error("tier `{0}` cannot run a sync manager")]
    InvalidTier(String),

    /// The socket pump task is gone; the frame was not written.
    #[error("socket is closed")]
    SocketClosed,

    #[error("failed to encode message: {0}")]
    Serialization(#[from] serde_json::Error),
}
