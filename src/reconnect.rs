//! Bounded-time session resumption after a process reload.
//!
//! [`ReconnectionManager`] persists a small [`SessionDescriptor`] on every
//! join and, on the next process start, offers the consumer an explicit
//! confirm/abandon choice while the descriptor is younger than
//! [`SESSION_TTL`]. It never auto-rejoins. The descriptor timestamp is fixed
//! at creation and never refreshed by later activity: a live session can run
//! arbitrarily long, but a reload more than ten minutes after the join
//! forfeits resumability.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::event::RoomEvent;
use crate::session::{now_ms, JoinParams, RoomSession, SessionConfig};

/// How long a persisted session stays resumable, measured from creation.
pub const SESSION_TTL: Duration = Duration::from_secs(10 * 60);

// ── Descriptor ──────────────────────────────────────────────────────

/// The persisted record enabling reconnection after a reload.
///
/// Serialized as JSON with camelCase keys:
/// `{"roomCode": "ABCD", "playerName": "Bob", "isHost": false, "timestamp": 1700000000000}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    /// Code of the room that was joined.
    pub room_code: String,
    /// Identity the session was joined under.
    pub player_name: String,
    /// Whether that identity hosted the room. Preserved on resume.
    pub is_host: bool,
    /// Creation time, epoch milliseconds. Never refreshed.
    pub timestamp: u64,
}

impl SessionDescriptor {
    /// Whether the descriptor is past its TTL at the given reference time.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > SESSION_TTL.as_millis() as u64
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// Durable single-slot storage for the session descriptor.
///
/// The seam that makes the manager testable with an in-memory store; the
/// production analog is a small JSON file (or platform key-value storage).
pub trait DescriptorStore: Send + Sync {
    /// Load the stored descriptor, if any.
    fn load(&self) -> Result<Option<SessionDescriptor>>;
    /// Store a descriptor, replacing any previous one.
    fn save(&self, descriptor: &SessionDescriptor) -> Result<()>;
    /// Remove the stored descriptor. A no-op if none is stored.
    fn clear(&self) -> Result<()>;
}

/// File-backed descriptor store (one JSON document per path).
#[derive(Debug, Clone)]
pub struct FileDescriptorStore {
    path: PathBuf,
}

impl FileDescriptorStore {
    /// Create a store persisting to the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DescriptorStore for FileDescriptorStore {
    fn load(&self) -> Result<Option<SessionDescriptor>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(e) => {
                // A corrupt descriptor is treated as absent, not fatal.
                warn!("discarding corrupt session descriptor: {e}");
                self.clear()?;
                Ok(None)
            }
        }
    }

    fn save(&self, descriptor: &SessionDescriptor) -> Result<()> {
        let json = serde_json::to_string(descriptor)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory descriptor store for tests and ephemeral consumers.
#[derive(Debug, Default)]
pub struct MemoryDescriptorStore {
    slot: StdMutex<Option<SessionDescriptor>>,
}

impl MemoryDescriptorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<SessionDescriptor>> {
        // Descriptor writes cannot leave the slot in a torn state, so a
        // poisoned lock is safe to recover.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DescriptorStore for MemoryDescriptorStore {
    fn load(&self) -> Result<Option<SessionDescriptor>> {
        Ok(self.slot().clone())
    }

    fn save(&self, descriptor: &SessionDescriptor) -> Result<()> {
        *self.slot() = Some(descriptor.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot() = None;
        Ok(())
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Orchestrates resume-after-reload by wrapping [`RoomSession::join`].
///
/// Lifecycle:
/// 1. [`join`](ReconnectionManager::join) — joins and persists a descriptor.
/// 2. After a reload, [`pending_resume`](ReconnectionManager::pending_resume)
///    reports whether there is something to offer the user. Expired
///    descriptors are discarded silently ("nothing to resume", not an error).
/// 3. The consumer chooses: [`resume`](ReconnectionManager::resume) or
///    [`abandon`](ReconnectionManager::abandon).
pub struct ReconnectionManager<S: DescriptorStore> {
    store: S,
}

impl<S: DescriptorStore> ReconnectionManager<S> {
    /// Create a manager over the given descriptor store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Join a room and persist a fresh descriptor for it.
    ///
    /// # Errors
    ///
    /// Propagates [`RoomSession::join`] failures (no descriptor is written)
    /// and descriptor store failures.
    pub async fn join(
        &self,
        channel: impl Channel,
        params: JoinParams,
        config: SessionConfig,
    ) -> Result<(RoomSession, tokio::sync::broadcast::Receiver<RoomEvent>)> {
        let (session, events) = RoomSession::join(channel, params, config).await?;
        self.store.save(&SessionDescriptor {
            room_code: session.room_code().to_string(),
            player_name: session.player_name().to_string(),
            is_host: session.is_host(),
            timestamp: now_ms(),
        })?;
        Ok((session, events))
    }

    /// The descriptor to offer for resumption, using the wall clock.
    ///
    /// See [`pending_resume_at`](ReconnectionManager::pending_resume_at).
    pub fn pending_resume(&self) -> Result<Option<SessionDescriptor>> {
        self.pending_resume_at(now_ms())
    }

    /// The descriptor to offer for resumption at the given reference time.
    ///
    /// Returns `Ok(None)` when there is nothing to resume: no descriptor is
    /// stored, or the stored one is past its TTL (in which case it is
    /// discarded silently). A returned descriptor is an *offer*; the consumer
    /// must explicitly confirm or abandon — this method never rejoins.
    pub fn pending_resume_at(&self, now_ms: u64) -> Result<Option<SessionDescriptor>> {
        let Some(descriptor) = self.store.load()? else {
            return Ok(None);
        };
        if descriptor.is_expired_at(now_ms) {
            debug!(
                room = %descriptor.room_code,
                "session descriptor expired; nothing to resume"
            );
            self.store.clear()?;
            return Ok(None);
        }
        Ok(Some(descriptor))
    }

    /// Resume the described session with the stored identity, preserving the
    /// host flag.
    ///
    /// The stored descriptor is cleared before the attempt; a successful
    /// resume is a new join and records a new descriptor with a fresh
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Surfaces any [`RoomSession::join`] failure to the consumer. The old
    /// descriptor stays cleared either way.
    pub async fn resume(
        &self,
        channel: impl Channel,
        descriptor: SessionDescriptor,
        config: SessionConfig,
    ) -> Result<(RoomSession, tokio::sync::broadcast::Receiver<RoomEvent>)> {
        self.store.clear()?;
        let mut params = JoinParams::new(descriptor.room_code, descriptor.player_name);
        if descriptor.is_host {
            params = params.as_host();
        }
        self.join(channel, params, config).await
    }

    /// Decline a pending resume offer, discarding the descriptor.
    pub fn abandon(&self) -> Result<()> {
        self.store.clear()
    }

    /// Leave the room and discard the persisted descriptor.
    pub async fn leave(&self, session: &mut RoomSession) -> Result<()> {
        session.leave().await;
        self.store.clear()
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn descriptor_at(timestamp: u64) -> SessionDescriptor {
        SessionDescriptor {
            room_code: "ABCD".into(),
            player_name: "Bob".into(),
            is_host: false,
            timestamp,
        }
    }

    #[test]
    fn fresh_descriptor_is_offered() {
        let manager = ReconnectionManager::new(MemoryDescriptorStore::new());
        // 3 minutes old.
        manager
            .store()
            .save(&descriptor_at(T0 - 3 * 60 * 1000))
            .unwrap();

        let pending = manager.pending_resume_at(T0).unwrap();
        assert_eq!(pending, Some(descriptor_at(T0 - 3 * 60 * 1000)));
    }

    #[test]
    fn ttl_boundary_nine_fifty_nine_is_offered() {
        let manager = ReconnectionManager::new(MemoryDescriptorStore::new());
        let age = 9 * 60 * 1000 + 59 * 1000; // 9min59s
        manager.store().save(&descriptor_at(T0 - age)).unwrap();

        assert!(manager.pending_resume_at(T0).unwrap().is_some());
    }

    #[test]
    fn ttl_boundary_ten_min_one_sec_is_absent() {
        let manager = ReconnectionManager::new(MemoryDescriptorStore::new());
        let age = 10 * 60 * 1000 + 1000; // 10min1s
        manager.store().save(&descriptor_at(T0 - age)).unwrap();

        assert!(manager.pending_resume_at(T0).unwrap().is_none());
        // Discarded, not just hidden.
        assert!(manager.store().load().unwrap().is_none());
    }

    #[test]
    fn exactly_ttl_is_still_offered() {
        let manager = ReconnectionManager::new(MemoryDescriptorStore::new());
        let age = SESSION_TTL.as_millis() as u64;
        manager.store().save(&descriptor_at(T0 - age)).unwrap();

        assert!(manager.pending_resume_at(T0).unwrap().is_some());
    }

    #[test]
    fn no_descriptor_is_a_noop() {
        let manager = ReconnectionManager::new(MemoryDescriptorStore::new());
        assert!(manager.pending_resume_at(T0).unwrap().is_none());
    }

    #[test]
    fn abandon_discards_descriptor() {
        let manager = ReconnectionManager::new(MemoryDescriptorStore::new());
        manager.store().save(&descriptor_at(T0)).unwrap();

        manager.abandon().unwrap();
        assert!(manager.store().load().unwrap().is_none());
    }

    #[test]
    fn timestamp_in_the_future_is_not_expired() {
        // Clock skew across a reload must not forfeit the session.
        let descriptor = descriptor_at(T0 + 5000);
        assert!(!descriptor.is_expired_at(T0));
    }

    #[test]
    fn descriptor_wire_format_uses_camel_case() {
        let json = serde_json::to_value(descriptor_at(T0)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "roomCode": "ABCD",
                "playerName": "Bob",
                "isHost": false,
                "timestamp": T0,
            })
        );
    }

    #[test]
    fn file_store_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "dictation-rooms-descriptor-{}.json",
            std::process::id()
        ));
        let store = FileDescriptorStore::new(&path);
        store.clear().unwrap();

        assert!(store.load().unwrap().is_none());
        store.save(&descriptor_at(T0)).unwrap();
        assert_eq!(store.load().unwrap(), Some(descriptor_at(T0)));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        // Clearing an already-clear store is fine.
        store.clear().unwrap();
    }

    #[test]
    fn file_store_discards_corrupt_descriptor() {
        let path = std::env::temp_dir().join(format!(
            "dictation-rooms-corrupt-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "{not json").unwrap();
        let store = FileDescriptorStore::new(&path);

        assert!(store.load().unwrap().is_none());
        assert!(store.load().unwrap().is_none()); // file was removed
    }
}
