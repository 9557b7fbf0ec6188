//! Channel abstraction for the presence+broadcast transport.
//!
//! The [`Channel`] trait models the minimal pub/sub + presence primitive the
//! room protocol is built on: topic subscription, best-effort fire-and-forget
//! broadcasts (echoed back to the sender), and presence snapshots of the
//! currently connected identities.
//!
//! Connection setup is intentionally NOT part of this trait — backends have
//! fundamentally different bootstrap parameters (URLs, API keys, in-process
//! brokers). Construct a channel externally, then hand it to
//! [`RoomSession::join`](crate::RoomSession::join).
//!
//! # Implementing a Custom Channel
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use dictation_rooms::channel::{Channel, ChannelEvent};
//! use dictation_rooms::error::RoomError;
//! use dictation_rooms::protocol::PresenceRecord;
//!
//! struct MyChannel { /* ... */ }
//!
//! #[async_trait]
//! impl Channel for MyChannel {
//!     async fn subscribe(&mut self, topic: &str, presence_key: &str) -> Result<(), RoomError> {
//!         todo!()
//!     }
//!
//!     async fn track(&mut self, record: PresenceRecord) -> Result<(), RoomError> {
//!         todo!()
//!     }
//!
//!     async fn publish(&mut self, event: &str, payload: serde_json::Value) -> Result<(), RoomError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<ChannelEvent, RoomError>> {
//!         // Return None when the channel is closed cleanly
//!         todo!()
//!     }
//!
//!     async fn unsubscribe(&mut self) -> Result<(), RoomError> {
//!         todo!()
//!     }
//! }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RoomError;
use crate::protocol::PresenceRecord;

/// Presence snapshot: the identities *currently connected* to a topic.
///
/// The first record per identity is authoritative (one device per player
/// name; a duplicate simultaneous connection under the same name overwrites
/// the earlier registration). A snapshot must never be treated as the full
/// roster — the transport drops identities on the slightest connection blip.
pub type PresenceSnapshot = HashMap<String, Vec<PresenceRecord>>;

/// An event delivered by a subscribed channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The set of currently connected identities changed.
    PresenceSync(PresenceSnapshot),
    /// A broadcast arrived. The payload is raw JSON so one malformed message
    /// cannot take the channel down; the session parses and, if necessary,
    /// discards it.
    Broadcast {
        /// Wire event name, e.g. `"game_start"`.
        event: String,
        /// Raw payload.
        payload: Value,
    },
}

/// A presence+broadcast channel for one room topic.
///
/// # Delivery guarantees
///
/// Implementations must echo a sender's own broadcasts back to it, but give
/// no cross-client ordering between presence syncs and broadcasts: a
/// `game_start` may be observed by a guest before that guest's presence view
/// reflects the host online. Consumers treat roster and phase state as
/// independently arriving, eventually-consistent facts.
///
/// # Cancel Safety
///
/// [`recv`](Channel::recv) **MUST** be cancel-safe because the session loop
/// polls it inside `tokio::select!`. Channel-based implementations (wrapping
/// an `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Channel: Send + 'static {
    /// Subscribe to a topic, registering `presence_key` as the identity this
    /// client tracks presence under.
    ///
    /// Resolves once the subscription is acknowledged.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotConfigured`] if the backend is not set up, or
    /// [`RoomError::Connection`] if the subscription could not be
    /// established.
    async fn subscribe(&mut self, topic: &str, presence_key: &str) -> Result<(), RoomError>;

    /// Publish this client's presence record.
    ///
    /// Re-tracking replaces the previously tracked record.
    async fn track(&mut self, record: PresenceRecord) -> Result<(), RoomError>;

    /// Broadcast `(event, payload)` to every subscriber of the topic,
    /// including this client. Best-effort; there is no delivery receipt.
    async fn publish(&mut self, event: &str, payload: Value) -> Result<(), RoomError>;

    /// Receive the next channel event.
    ///
    /// Returns:
    /// - `Some(Ok(event))` — a presence sync or broadcast arrived
    /// - `Some(Err(e))` — the channel failed
    /// - `None` — the channel closed cleanly
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](Channel)).
    async fn recv(&mut self) -> Option<Result<ChannelEvent, RoomError>>;

    /// Unsubscribe from the topic and withdraw this client's presence.
    ///
    /// After this call, `recv` may return `None` and further operations may
    /// fail.
    async fn unsubscribe(&mut self) -> Result<(), RoomError>;
}
