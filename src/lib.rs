//! # Dictation Rooms
//!
//! Channel-agnostic Rust client for coordinating shared, timed dictation
//! sessions between a host and guests, with no authoritative server.
//!
//! Correctness is derived entirely from eventually-delivered, non-ordered
//! presence snapshots and fire-and-forget broadcasts:
//!
//! - **Monotonic roster** — players seen once are retained for the whole
//!   session; connection blips only toggle their `online` flag
//! - **Host-authoritative phases** — `Lobby → Generating → Ready →
//!   Dictating`, driven exclusively by the host; guests mirror broadcasts
//! - **Live scores & results** — clamped score propagation and a
//!   last-write-wins result ledger
//! - **Bounded-time resumption** — a persisted descriptor lets a reloaded
//!   process offer to rejoin for up to ten minutes
//! - **Channel-agnostic** — implement the [`Channel`] trait for any
//!   presence+broadcast backend; an in-process [`LocalBroker`] ships behind
//!   the default `channel-local` feature
//!
//! ## Quick Start
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), dictation_rooms::RoomError> {
//! use dictation_rooms::{JoinParams, LocalBroker, RoomEvent, RoomSession, RoomState, SessionConfig};
//!
//! let broker = LocalBroker::new();
//!
//! let (host, mut events) = RoomSession::join(
//!     broker.channel(),
//!     JoinParams::new("ABCD", "Alice").as_host(),
//!     SessionConfig::new(),
//! )
//! .await?;
//!
//! host.request_state_transition(RoomState::Generating).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         RoomEvent::StateChanged { state } => {
//!             assert_eq!(state, RoomState::Generating);
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod channels;
pub mod error;
pub mod event;
pub mod protocol;
pub mod reconnect;
pub mod session;

// Re-export primary types for ergonomic imports.
pub use channel::{Channel, ChannelEvent, PresenceSnapshot};
pub use error::{Result, RoomError};
pub use event::RoomEvent;
pub use protocol::{
    Broadcast, GameStartPayload, Player, PresenceRecord, ResultRecord, RoomState, Theme,
};
pub use reconnect::{
    DescriptorStore, FileDescriptorStore, MemoryDescriptorStore, ReconnectionManager,
    SessionDescriptor, SESSION_TTL,
};
pub use session::{JoinParams, RoomSession, SessionConfig};

#[cfg(feature = "channel-local")]
pub use channels::local::{LocalBroker, LocalChannel};
