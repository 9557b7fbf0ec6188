#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-shape tests for the room coordination protocol.
//!
//! Verifies that every broadcast payload, presence record, and the persisted
//! session descriptor serialize to the exact JSON the original web clients
//! exchange, and that `Broadcast::parse` reverses `event()`/`payload_json()`.

use std::collections::BTreeSet;

use serde_json::json;

use dictation_rooms::protocol::{
    clamp_score, room_topic, Broadcast, GameStartPayload, PlayAgainPayload, PresenceRecord,
    ResultRecord, RoomState, ScoreUpdatePayload, StateUpdatePayload, Theme,
};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

/// Serialize `val` to JSON, then deserialize back to `T` and return it.
fn round_trip<T: serde::Serialize + serde::de::DeserializeOwned>(val: &T) -> T {
    let json = serde_json::to_string(val).expect("serialize");
    serde_json::from_str(&json).expect("deserialize")
}

// ════════════════════════════════════════════════════════════════════
// Topic derivation and score clamping
// ════════════════════════════════════════════════════════════════════

#[test]
fn room_topic_prefixes_code() {
    assert_eq!(room_topic("ABCD"), "room:ABCD");
    assert_eq!(room_topic(""), "room:");
}

#[test]
fn clamp_score_bounds() {
    assert_eq!(clamp_score(-5), 0);
    assert_eq!(clamp_score(0), 0);
    assert_eq!(clamp_score(40), 40);
    assert_eq!(clamp_score(100), 100);
    assert_eq!(clamp_score(150), 100);
    assert_eq!(clamp_score(i32::MIN), 0);
    assert_eq!(clamp_score(i32::MAX), 100);
}

// ════════════════════════════════════════════════════════════════════
// RoomState
// ════════════════════════════════════════════════════════════════════

#[test]
fn room_state_serializes_screaming_snake_case() {
    assert_eq!(serde_json::to_value(RoomState::Lobby).unwrap(), "LOBBY");
    assert_eq!(
        serde_json::to_value(RoomState::Generating).unwrap(),
        "GENERATING"
    );
    assert_eq!(serde_json::to_value(RoomState::Ready).unwrap(), "READY");
    assert_eq!(
        serde_json::to_value(RoomState::Dictating).unwrap(),
        "DICTATING"
    );
}

#[test]
fn room_state_default_is_lobby() {
    assert_eq!(RoomState::default(), RoomState::Lobby);
}

#[test]
fn phase_machine_edges() {
    use RoomState::*;

    // Legal edges.
    assert!(Lobby.can_transition_to(Generating));
    assert!(Generating.can_transition_to(Ready));
    assert!(Generating.can_transition_to(Lobby)); // generation failed
    assert!(Ready.can_transition_to(Dictating));
    assert!(Ready.can_transition_to(Generating)); // host regenerates
    assert!(Ready.can_transition_to(Lobby));
    assert!(Dictating.can_transition_to(Lobby)); // play again

    // Illegal edges.
    assert!(!Lobby.can_transition_to(Ready));
    assert!(!Lobby.can_transition_to(Dictating));
    assert!(!Lobby.can_transition_to(Lobby));
    assert!(!Generating.can_transition_to(Dictating));
    assert!(!Dictating.can_transition_to(Generating));
    assert!(!Dictating.can_transition_to(Ready));
}

// ════════════════════════════════════════════════════════════════════
// Presence record
// ════════════════════════════════════════════════════════════════════

#[test]
fn presence_record_wire_format() {
    let record = PresenceRecord {
        online_at: 1_700_000_000_000,
        is_host: true,
        score: 42,
    };
    assert_eq!(
        serde_json::to_value(&record).unwrap(),
        json!({ "online_at": 1_700_000_000_000u64, "is_host": true, "score": 42 })
    );
}

#[test]
fn presence_record_joining_has_zero_score() {
    let record = PresenceRecord::joining(123, false);
    assert_eq!(record.online_at, 123);
    assert!(!record.is_host);
    assert_eq!(record.score, 0);
}

// ════════════════════════════════════════════════════════════════════
// Broadcast payload fixtures (camelCase keys, exact shapes)
// ════════════════════════════════════════════════════════════════════

#[test]
fn score_update_payload_wire_format() {
    let payload = ScoreUpdatePayload {
        player_name: "Bob".into(),
        score: 40,
    };
    assert_eq!(
        serde_json::to_value(&payload).unwrap(),
        json!({ "playerName": "Bob", "score": 40 })
    );
}

#[test]
fn result_record_wire_format() {
    let record = ResultRecord {
        player_name: "Bob".into(),
        score: 85,
        error_count: 3,
        error_types: BTreeSet::from(["accord".to_string(), "conjugaison".to_string()]),
    };
    assert_eq!(
        serde_json::to_value(&record).unwrap(),
        json!({
            "playerName": "Bob",
            "score": 85,
            "errorCount": 3,
            "errorTypes": ["accord", "conjugaison"],
        })
    );
}

#[test]
fn result_record_error_types_default_to_empty() {
    let record: ResultRecord =
        serde_json::from_value(json!({ "playerName": "Bob", "score": 1, "errorCount": 0 }))
            .unwrap();
    assert!(record.error_types.is_empty());
}

#[test]
fn play_again_payload_wire_format() {
    let payload = PlayAgainPayload {
        player_name: "Alice".into(),
        is_host: true,
    };
    assert_eq!(
        serde_json::to_value(&payload).unwrap(),
        json!({ "playerName": "Alice", "isHost": true })
    );
}

#[test]
fn state_update_payload_wire_format() {
    let payload = StateUpdatePayload {
        state: RoomState::Generating,
    };
    assert_eq!(
        serde_json::to_value(payload).unwrap(),
        json!({ "state": "GENERATING" })
    );
}

#[test]
fn game_start_payload_carries_opaque_dictation() {
    let payload = GameStartPayload {
        dictation: json!({ "text": "Les feuilles tombent.", "words": 3 }),
        theme: Theme {
            name: "Compétition".into(),
            icon: Some("⚔️".into()),
        },
    };
    let back = round_trip(&payload);
    assert_eq!(back, payload);
    assert_eq!(
        serde_json::to_value(&payload).unwrap(),
        json!({
            "dictation": { "text": "Les feuilles tombent.", "words": 3 },
            "theme": { "name": "Compétition", "icon": "⚔️" },
        })
    );
}

#[test]
fn theme_icon_is_optional() {
    let theme: Theme = serde_json::from_value(json!({ "name": "X" })).unwrap();
    assert_eq!(theme.icon, None);
    // And it is omitted, not null, when absent.
    assert_eq!(serde_json::to_value(&theme).unwrap(), json!({ "name": "X" }));
}

// ════════════════════════════════════════════════════════════════════
// Broadcast envelope
// ════════════════════════════════════════════════════════════════════

#[test]
fn broadcast_event_names() {
    let game = Broadcast::GameStart(GameStartPayload {
        dictation: json!({}),
        theme: Theme {
            name: "X".into(),
            icon: None,
        },
    });
    assert_eq!(game.event(), "game_start");
    assert_eq!(
        Broadcast::StateUpdate(StateUpdatePayload {
            state: RoomState::Lobby
        })
        .event(),
        "state_update"
    );
    assert_eq!(
        Broadcast::ScoreUpdate(ScoreUpdatePayload {
            player_name: "B".into(),
            score: 0
        })
        .event(),
        "score_update"
    );
    assert_eq!(
        Broadcast::PlayAgain(PlayAgainPayload {
            player_name: "B".into(),
            is_host: false
        })
        .event(),
        "play_again"
    );
}

#[test]
fn broadcast_parse_reverses_payload_json() {
    let originals = vec![
        Broadcast::GameStart(GameStartPayload {
            dictation: json!({ "text": "Bonjour" }),
            theme: Theme {
                name: "X".into(),
                icon: None,
            },
        }),
        Broadcast::StateUpdate(StateUpdatePayload {
            state: RoomState::Ready,
        }),
        Broadcast::ScoreUpdate(ScoreUpdatePayload {
            player_name: "Bob".into(),
            score: 55,
        }),
        Broadcast::ResultsUpdate(ResultRecord {
            player_name: "Bob".into(),
            score: 55,
            error_count: 2,
            error_types: BTreeSet::from(["accord".to_string()]),
        }),
        Broadcast::PlayAgain(PlayAgainPayload {
            player_name: "Bob".into(),
            is_host: false,
        }),
    ];

    for original in originals {
        let payload = original.payload_json().unwrap();
        let parsed = Broadcast::parse(original.event(), payload).unwrap();
        assert_eq!(parsed, original);
    }
}

#[test]
fn broadcast_parse_rejects_unknown_event() {
    let result = Broadcast::parse("host_migration", json!({}));
    assert!(result.is_err());
}

#[test]
fn broadcast_parse_rejects_wrong_shape() {
    // A score where the state should be.
    let result = Broadcast::parse("state_update", json!({ "score": 40 }));
    assert!(result.is_err());

    // A state string outside the enum.
    let result = Broadcast::parse("state_update", json!({ "state": "PAUSED" }));
    assert!(result.is_err());

    // Score above the u8 range.
    let result = Broadcast::parse("score_update", json!({ "playerName": "B", "score": 300 }));
    assert!(result.is_err());
}
