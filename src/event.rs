//! Consumer-facing events emitted by a [`RoomSession`](crate::RoomSession).
//!
//! Events are delivered on a [`tokio::sync::broadcast`] channel so any number
//! of consumers (lobby view, score overlay, results screen) can subscribe
//! independently. Payloads are read-only snapshots; the session retains
//! exclusive ownership of the underlying state.

use crate::protocol::{GameStartPayload, Player, ResultRecord, RoomState};

/// An event emitted by a room session.
///
/// Slow consumers on the broadcast channel lag and skip events rather than
/// blocking the session loop; every payload is a full snapshot where it
/// matters ([`RosterChanged`](RoomEvent::RosterChanged),
/// [`ResultsUpdated`](RoomEvent::ResultsUpdated)), so a skipped intermediate
/// event is recovered by the next one.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The session subscribed to the room topic and published its presence.
    /// Always the first event.
    Joined {
        /// Code of the joined room.
        room_code: String,
    },
    /// The retained roster changed: a player appeared for the first time, an
    /// `online` flag toggled, or a score merged in. Players are ordered host
    /// first, then name ascending.
    RosterChanged {
        /// Full ordered roster snapshot.
        players: Vec<Player>,
    },
    /// The room moved to a new phase.
    StateChanged {
        /// The phase now in effect.
        state: RoomState,
    },
    /// The host launched the round. The room is now
    /// [`Dictating`](RoomState::Dictating).
    GameStarted {
        /// Exercise content and theme, identical on every participant.
        payload: GameStartPayload,
    },
    /// A player reported live progress.
    ScoreUpdated {
        /// Player whose score changed.
        player_name: String,
        /// New score, already clamped to `0..=100`.
        score: u8,
    },
    /// The aggregated result ledger changed, ordered by player name.
    ResultsUpdated {
        /// Full result snapshot, one record per reporting player.
        results: Vec<ResultRecord>,
    },
    /// A player asked for another round. The host consumer decides whether
    /// to transition the room back to the lobby.
    PlayAgainRequested {
        /// Player who voted.
        player_name: String,
        /// Whether the vote came from the host.
        is_host: bool,
        /// Total distinct votes collected this round.
        votes: usize,
    },
    /// The session left the room; roster, results, and votes were cleared.
    /// Terminal.
    Left,
    /// The channel closed or failed. Local state is kept so consumers can
    /// render the last good snapshot. Terminal.
    Closed {
        /// Failure description, or `None` for a clean close.
        reason: Option<String>,
    },
}
