#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for dictation rooms integration tests.
//!
//! Provides a scripted [`MockChannel`] plus helpers for constructing common
//! channel events: presence snapshots and raw broadcast payloads.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use dictation_rooms::channel::{Channel, ChannelEvent, PresenceSnapshot};
use dictation_rooms::protocol::PresenceRecord;
use dictation_rooms::RoomError;

/// Install a log subscriber for the test run; `RUST_LOG` controls
/// verbosity. Safe to call from every test, only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One scripted incoming item: `Some(Ok(..))` delivers an event,
/// `Some(Err(..))` a channel failure, `None` a clean close.
pub type Scripted = Option<Result<ChannelEvent, RoomError>>;

/// Traffic recorded by a [`MockChannel`].
#[derive(Debug, Default)]
pub struct Recorded {
    /// `(event, payload)` pairs published by the session.
    pub published: Vec<(String, Value)>,
    /// Presence records tracked by the session, in order.
    pub tracked: Vec<PresenceRecord>,
    /// `(topic, presence_key)` subscriptions.
    pub subscribed: Vec<(String, String)>,
    /// Whether `unsubscribe` was called.
    pub unsubscribed: bool,
}

/// A scripted mock channel for integration testing.
///
/// Incoming events are consumed in order by `recv()`; once exhausted, `recv`
/// pends forever so the session loop stays alive until `leave`. All outgoing
/// traffic is recorded in the shared [`Recorded`] handle.
pub struct MockChannel {
    incoming: VecDeque<Scripted>,
    recorded: Arc<StdMutex<Recorded>>,
}

impl MockChannel {
    /// Create a mock channel with the given scripted incoming events.
    pub fn new(incoming: Vec<Scripted>) -> (Self, Arc<StdMutex<Recorded>>) {
        let recorded = Arc::new(StdMutex::new(Recorded::default()));
        let channel = Self {
            incoming: VecDeque::from(incoming),
            recorded: Arc::clone(&recorded),
        };
        (channel, recorded)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn subscribe(&mut self, topic: &str, presence_key: &str) -> Result<(), RoomError> {
        self.recorded
            .lock()
            .unwrap()
            .subscribed
            .push((topic.into(), presence_key.into()));
        Ok(())
    }

    async fn track(&mut self, record: PresenceRecord) -> Result<(), RoomError> {
        self.recorded.lock().unwrap().tracked.push(record);
        Ok(())
    }

    async fn publish(&mut self, event: &str, payload: Value) -> Result<(), RoomError> {
        self.recorded
            .lock()
            .unwrap()
            .published
            .push((event.into(), payload));
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ChannelEvent, RoomError>> {
        if let Some(item) = self.incoming.pop_front() {
            item
        } else {
            std::future::pending().await
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), RoomError> {
        self.recorded.lock().unwrap().unsubscribed = true;
        Ok(())
    }
}

// ── Event builders ──────────────────────────────────────────────────

/// Build a presence snapshot event from `(name, is_host, score)` triples.
pub fn presence_sync(entries: &[(&str, bool, u8)]) -> ChannelEvent {
    let mut snapshot = PresenceSnapshot::new();
    for (name, is_host, score) in entries {
        snapshot.insert(
            (*name).to_string(),
            vec![PresenceRecord {
                online_at: 1_000,
                is_host: *is_host,
                score: *score,
            }],
        );
    }
    ChannelEvent::PresenceSync(snapshot)
}

/// Raw `state_update` broadcast event.
pub fn state_update(state: &str) -> ChannelEvent {
    ChannelEvent::Broadcast {
        event: "state_update".into(),
        payload: json!({ "state": state }),
    }
}

/// Raw `score_update` broadcast event.
pub fn score_update(player_name: &str, score: u8) -> ChannelEvent {
    ChannelEvent::Broadcast {
        event: "score_update".into(),
        payload: json!({ "playerName": player_name, "score": score }),
    }
}

/// Raw `results_update` broadcast event.
pub fn results_update(player_name: &str, score: u8, error_count: u32) -> ChannelEvent {
    ChannelEvent::Broadcast {
        event: "results_update".into(),
        payload: json!({
            "playerName": player_name,
            "score": score,
            "errorCount": error_count,
            "errorTypes": ["accord"],
        }),
    }
}

/// Raw `game_start` broadcast event with a small dictation blob.
pub fn game_start(text: &str) -> ChannelEvent {
    ChannelEvent::Broadcast {
        event: "game_start".into(),
        payload: json!({
            "dictation": { "text": text },
            "theme": { "name": "Compétition", "icon": "⚔️" },
        }),
    }
}

/// Raw `play_again` broadcast event.
pub fn play_again(player_name: &str, is_host: bool) -> ChannelEvent {
    ChannelEvent::Broadcast {
        event: "play_again".into(),
        payload: json!({ "playerName": player_name, "isHost": is_host }),
    }
}
