//! Built-in [`Channel`](crate::channel::Channel) implementations.
//!
//! Currently one implementation ships with the crate:
//!
//! - [`local`] — an in-process presence+broadcast broker, available when the
//!   `channel-local` feature is enabled (it is enabled by default).
//!
//! Backend-as-a-service channels (Supabase Realtime, Phoenix, …) live in
//! separate adapter crates; see the [`Channel`](crate::channel::Channel)
//! trait documentation for the contract they must satisfy.

#[cfg(feature = "channel-local")]
pub mod local;

#[cfg(feature = "channel-local")]
pub use local::{LocalBroker, LocalChannel};
