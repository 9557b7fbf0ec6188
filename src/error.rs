//! Error types for the dictation rooms client.

use thiserror::Error;

/// Errors that can occur when using the dictation rooms client.
///
/// Only [`NotConfigured`](RoomError::NotConfigured) and
/// [`Connection`](RoomError::Connection) cross the core/consumer boundary as
/// join failures. Malformed broadcast payloads and host-authority violations
/// are absorbed internally (logged, never raised) so a single misbehaving
/// client cannot destabilize the room for other participants.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The channel backend has not been configured (no credentials / endpoint).
    /// Fatal; retrying without reconfiguration cannot succeed.
    #[error("channel backend not configured")]
    NotConfigured,

    /// Subscribing to or communicating over the channel failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A broadcast could not be published over the channel.
    #[error("publish error: {0}")]
    Publish(String),

    /// Attempted a room operation, but the session has left the room or its
    /// channel loop has already exited.
    #[error("not joined to a room")]
    NotJoined,

    /// Failed to serialize or deserialize a payload or descriptor.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred (descriptor persistence).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for dictation rooms operations.
pub type Result<T> = std::result::Result<T, RoomError>;
