//! Wire types for the room coordination protocol.
//!
//! Every type in this module produces JSON identical to the payloads the
//! original web clients exchange over the presence+broadcast channel:
//!
//! - presence records use `snake_case` keys (`online_at`, `is_host`, `score`)
//! - broadcast payloads use `camelCase` keys (`playerName`, `errorCount`, …)
//! - room phases serialize as SCREAMING_SNAKE_CASE strings (`"LOBBY"`, …)

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum score a player can report.
pub const MAX_SCORE: u8 = 100;

/// Derive the channel topic for a room code.
///
/// ```
/// assert_eq!(dictation_rooms::protocol::room_topic("ABCD"), "room:ABCD");
/// ```
pub fn room_topic(room_code: &str) -> String {
    format!("room:{room_code}")
}

/// Clamp a raw score into the valid `[0, 100]` range.
pub fn clamp_score(score: i32) -> u8 {
    score.clamp(0, i32::from(MAX_SCORE)) as u8
}

// ── Room phases ─────────────────────────────────────────────────────

/// Phase of a room, driven exclusively by the host.
///
/// ```text
/// Lobby ──> Generating ──> Ready ──> Dictating ──> Lobby
///               │            │
///               └─> Lobby    └─> Generating (host regenerates)
/// ```
///
/// Guests never validate transitions; they passively mirror the last
/// broadcast state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    /// Waiting for participants; the host configures the round.
    #[default]
    Lobby,
    /// The host is producing the exercise content.
    Generating,
    /// Content is ready; the host may launch the round.
    Ready,
    /// The round is running.
    Dictating,
}

impl RoomState {
    /// Whether the host may legally drive a transition from `self` to `to`.
    ///
    /// `Ready -> Dictating` normally happens through
    /// [`start_game`](crate::RoomSession::start_game) rather than an explicit
    /// `state_update`, but the edge is legal either way.
    pub fn can_transition_to(self, to: RoomState) -> bool {
        matches!(
            (self, to),
            (RoomState::Lobby, RoomState::Generating)
                | (RoomState::Generating, RoomState::Ready)
                | (RoomState::Generating, RoomState::Lobby)
                | (RoomState::Ready, RoomState::Dictating)
                | (RoomState::Ready, RoomState::Generating)
                | (RoomState::Ready, RoomState::Lobby)
                | (RoomState::Dictating, RoomState::Lobby)
        )
    }
}

// ── Presence ────────────────────────────────────────────────────────

/// The record a client tracks under its own identity on the presence channel.
///
/// Re-tracked whenever the local score changes, so a reconnect redelivers the
/// latest value instead of the join-time zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    /// When this client came online, epoch milliseconds.
    pub online_at: u64,
    /// Whether this client created the room.
    pub is_host: bool,
    /// Last score the client tracked for itself.
    pub score: u8,
}

impl PresenceRecord {
    /// Presence record published at join time.
    pub fn joining(online_at: u64, is_host: bool) -> Self {
        Self {
            online_at,
            is_host,
            score: 0,
        }
    }
}

// ── Roster ──────────────────────────────────────────────────────────

/// A participant as retained in the local roster.
///
/// Entries are created the first time an identity appears in a presence
/// snapshot and are never evicted while the session lives — only the
/// `online` flag toggles across connection blips. The `is_host` flag is
/// fixed when the entry is first observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Player {
    /// Unique identity within the room.
    pub name: String,
    /// Whether this player hosts the room. Immutable once observed.
    pub is_host: bool,
    /// Whether the player appeared in the most recent presence snapshot.
    pub online: bool,
    /// Current score, `0..=100`.
    pub score: u8,
    /// Timestamp of the player's last observed presence record, epoch ms.
    pub last_seen: u64,
}

// ── Broadcast payloads ──────────────────────────────────────────────

/// Cosmetic theme attached to a round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Theme {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Payload of the `game_start` broadcast.
///
/// The `dictation` blob is opaque to this crate — it is produced and
/// consumed by the exercise-content layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameStartPayload {
    /// Opaque exercise content.
    pub dictation: Value,
    /// Display theme for the round.
    pub theme: Theme,
}

/// Payload of the `state_update` broadcast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateUpdatePayload {
    pub state: RoomState,
}

/// Payload of the `score_update` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreUpdatePayload {
    pub player_name: String,
    pub score: u8,
}

/// One player's final result for a round. At most one per player; a
/// redelivered record replaces the previous one (last-write-wins).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub player_name: String,
    pub score: u8,
    pub error_count: u32,
    /// Categories of mistakes made, e.g. `"accord"`, `"conjugaison"`.
    #[serde(default)]
    pub error_types: BTreeSet<String>,
}

/// Payload of the `play_again` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlayAgainPayload {
    pub player_name: String,
    pub is_host: bool,
}

// ── Broadcast envelope ──────────────────────────────────────────────

/// A typed broadcast message exchanged within a room.
///
/// On the wire each message is a fire-and-forget `(event, payload)` pair;
/// [`Broadcast::event`] and [`Broadcast::payload_json`] produce that pair and
/// [`Broadcast::parse`] reverses it. Unknown event names or malformed
/// payloads yield an error that the session absorbs (logged, never
/// propagated).
#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    /// The host launches the round, carrying the exercise content.
    GameStart(GameStartPayload),
    /// The host drives the room to a new phase.
    StateUpdate(StateUpdatePayload),
    /// A player reports live progress.
    ScoreUpdate(ScoreUpdatePayload),
    /// A player reports their final result for the round.
    ResultsUpdate(ResultRecord),
    /// A player asks for another round.
    PlayAgain(PlayAgainPayload),
}

/// Event name of the `game_start` broadcast.
pub const EVENT_GAME_START: &str = "game_start";
/// Event name of the `state_update` broadcast.
pub const EVENT_STATE_UPDATE: &str = "state_update";
/// Event name of the `score_update` broadcast.
pub const EVENT_SCORE_UPDATE: &str = "score_update";
/// Event name of the `results_update` broadcast.
pub const EVENT_RESULTS_UPDATE: &str = "results_update";
/// Event name of the `play_again` broadcast.
pub const EVENT_PLAY_AGAIN: &str = "play_again";

impl Broadcast {
    /// Wire event name of this message.
    pub fn event(&self) -> &'static str {
        match self {
            Broadcast::GameStart(_) => EVENT_GAME_START,
            Broadcast::StateUpdate(_) => EVENT_STATE_UPDATE,
            Broadcast::ScoreUpdate(_) => EVENT_SCORE_UPDATE,
            Broadcast::ResultsUpdate(_) => EVENT_RESULTS_UPDATE,
            Broadcast::PlayAgain(_) => EVENT_PLAY_AGAIN,
        }
    }

    /// Serialize the payload half of the wire pair.
    pub fn payload_json(&self) -> serde_json::Result<Value> {
        match self {
            Broadcast::GameStart(p) => serde_json::to_value(p),
            Broadcast::StateUpdate(p) => serde_json::to_value(p),
            Broadcast::ScoreUpdate(p) => serde_json::to_value(p),
            Broadcast::ResultsUpdate(p) => serde_json::to_value(p),
            Broadcast::PlayAgain(p) => serde_json::to_value(p),
        }
    }

    /// Parse an incoming `(event, payload)` pair into a typed message.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] for unknown event names or payloads
    /// that do not match the event's expected shape.
    pub fn parse(event: &str, payload: Value) -> serde_json::Result<Self> {
        match event {
            EVENT_GAME_START => serde_json::from_value(payload).map(Broadcast::GameStart),
            EVENT_STATE_UPDATE => serde_json::from_value(payload).map(Broadcast::StateUpdate),
            EVENT_SCORE_UPDATE => serde_json::from_value(payload).map(Broadcast::ScoreUpdate),
            EVENT_RESULTS_UPDATE => serde_json::from_value(payload).map(Broadcast::ResultsUpdate),
            EVENT_PLAY_AGAIN => serde_json::from_value(payload).map(Broadcast::PlayAgain),
            other => Err(serde::de::Error::custom(format!(
                "unknown broadcast event: {other}"
            ))),
        }
    }
}
