#![cfg(feature = "channel-local")]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end room flows over the in-process [`LocalBroker`]: two real
//! sessions sharing a topic, a full lobby-to-results round including a
//! presence blip, and the failure modes a broker can surface.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use dictation_rooms::{
    GameStartPayload, JoinParams, LocalBroker, ResultRecord, RoomError, RoomEvent, RoomSession,
    RoomState, SessionConfig, Theme,
};

const ROOM: &str = "ABCD";
const TOPIC: &str = "room:ABCD";

async fn join(broker: &LocalBroker, params: JoinParams) -> (RoomSession, tokio::sync::broadcast::Receiver<RoomEvent>) {
    RoomSession::join(broker.channel(), params, SessionConfig::new())
        .await
        .expect("join should succeed")
}

/// Poll until the session's roster reaches the expected size.
async fn await_roster_len(session: &RoomSession, len: usize) {
    for _ in 0..200 {
        if session.roster().await.len() == len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "roster never reached {len} players, got {:?}",
        session.roster().await
    );
}

/// Poll until the session observes the given phase.
async fn await_state(session: &RoomSession, state: RoomState) {
    for _ in 0..200 {
        if session.room_state().await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "session never reached {state:?}, still at {:?}",
        session.room_state().await
    );
}

fn result_for(name: &str, score: u8, error_count: u32) -> ResultRecord {
    ResultRecord {
        player_name: name.into(),
        score,
        error_count,
        error_types: BTreeSet::from(["accord".to_string()]),
    }
}

// ════════════════════════════════════════════════════════════════════
// Full round
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_round_with_presence_blip() {
    let broker = LocalBroker::new();

    let (mut alice, _alice_events) = join(&broker, JoinParams::new(ROOM, "Alice").as_host()).await;
    let (mut bob, mut bob_events) = join(&broker, JoinParams::new(ROOM, "Bob")).await;

    // Both sides converge on the same two-player roster, host first.
    await_roster_len(&alice, 2).await;
    await_roster_len(&bob, 2).await;
    let roster = bob.roster().await;
    assert_eq!(roster[0].name, "Alice");
    assert!(roster[0].is_host);
    assert_eq!(roster[1].name, "Bob");

    // Host drives generation; the guest mirrors the phase.
    alice
        .request_state_transition(RoomState::Generating)
        .await
        .unwrap();
    await_state(&bob, RoomState::Generating).await;

    // Host launches the round; both sides observe the identical content.
    let payload = GameStartPayload {
        dictation: json!({ "text": "Les feuilles mortes se ramassent à la pelle." }),
        theme: Theme {
            name: "Automne".into(),
            icon: Some("🍂".into()),
        },
    };
    alice.start_game(payload.clone()).unwrap();
    await_state(&bob, RoomState::Dictating).await;
    assert_eq!(alice.game_payload().await, Some(payload.clone()));
    assert_eq!(bob.game_payload().await, Some(payload.clone()));

    let started = loop {
        match bob_events.recv().await.unwrap() {
            RoomEvent::GameStarted { payload } => break payload,
            _ => continue,
        }
    };
    assert_eq!(started, payload);

    // Bob's connection blips. Alice's roster keeps both players throughout.
    broker.flap_presence(TOPIC, "Bob");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let roster = alice.roster().await;
    assert_eq!(roster.len(), 2);
    let bob_entry = roster.iter().find(|p| p.name == "Bob").unwrap();
    assert!(bob_entry.online, "Bob should be back online after the blip");

    // Bob reports progress; Alice sees the score on her roster.
    bob.report_progress(40).unwrap();
    for _ in 0..200 {
        let roster = alice.roster().await;
        if roster.iter().any(|p| p.name == "Bob" && p.score == 40) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let roster = alice.roster().await;
    let bob_entry = roster.iter().find(|p| p.name == "Bob").unwrap();
    assert_eq!(bob_entry.score, 40);

    // Both report results; each side aggregates exactly two records.
    alice.report_results(result_for("Alice", 90, 1)).unwrap();
    bob.report_results(result_for("Bob", 40, 6)).unwrap();
    for _ in 0..200 {
        if alice.results().await.len() == 2 && bob.results().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(alice.results().await, bob.results().await);
    assert_eq!(alice.results().await.len(), 2);

    bob.leave().await;
    alice.leave().await;
}

#[tokio::test]
async fn replaying_the_same_dictation_starts_a_new_round() {
    let broker = LocalBroker::new();

    let (mut alice, _alice_events) = join(&broker, JoinParams::new(ROOM, "Alice").as_host()).await;
    let (mut bob, _bob_events) = join(&broker, JoinParams::new(ROOM, "Bob")).await;
    await_roster_len(&alice, 2).await;

    let payload = GameStartPayload {
        dictation: json!({ "text": "Bonjour à tous." }),
        theme: Theme {
            name: "Révision".into(),
            icon: None,
        },
    };

    // Round one.
    alice.start_game(payload.clone()).unwrap();
    await_state(&alice, RoomState::Dictating).await;
    await_state(&bob, RoomState::Dictating).await;

    // Everyone votes to play again; the host brings the room back.
    alice.request_play_again().unwrap();
    bob.request_play_again().unwrap();
    for _ in 0..200 {
        if alice.play_again_votes().await.len() == 2 && bob.play_again_votes().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(alice.play_again_votes().await.len(), 2);
    alice
        .request_state_transition(RoomState::Lobby)
        .await
        .unwrap();
    await_state(&bob, RoomState::Lobby).await;

    // Round two reuses the identical content and must still start.
    alice.start_game(payload.clone()).unwrap();
    await_state(&alice, RoomState::Dictating).await;
    await_state(&bob, RoomState::Dictating).await;
    assert_eq!(bob.game_payload().await, Some(payload));
    // The new round begins with clean ledgers.
    assert!(alice.play_again_votes().await.is_empty());
    assert!(bob.results().await.is_empty());

    bob.leave().await;
    alice.leave().await;
}

#[tokio::test]
async fn score_survives_blip_after_retrack() {
    let broker = LocalBroker::new();

    let (mut alice, _alice_events) = join(&broker, JoinParams::new(ROOM, "Alice").as_host()).await;
    let (mut bob, _bob_events) = join(&broker, JoinParams::new(ROOM, "Bob")).await;
    await_roster_len(&alice, 2).await;

    // The re-tracked presence record carries the score, so the snapshot the
    // blip redelivers does not reset it.
    bob.report_progress(64).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.flap_presence(TOPIC, "Bob");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let roster = alice.roster().await;
    let bob_entry = roster.iter().find(|p| p.name == "Bob").unwrap();
    assert!(bob_entry.online);
    assert_eq!(bob_entry.score, 64);

    bob.leave().await;
    alice.leave().await;
}

// ════════════════════════════════════════════════════════════════════
// Guest cannot drive the phase machine
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn guest_transition_requests_change_nothing() {
    let broker = LocalBroker::new();

    let (mut alice, _alice_events) = join(&broker, JoinParams::new(ROOM, "Alice").as_host()).await;
    let (mut bob, _bob_events) = join(&broker, JoinParams::new(ROOM, "Bob")).await;
    await_roster_len(&alice, 2).await;

    bob.request_state_transition(RoomState::Generating)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(alice.room_state().await, RoomState::Lobby);
    assert_eq!(bob.room_state().await, RoomState::Lobby);

    bob.leave().await;
    alice.leave().await;
}

// ════════════════════════════════════════════════════════════════════
// Leave and broker failure modes
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn leaving_withdraws_presence_from_the_broker() {
    let broker = LocalBroker::new();

    let (mut alice, _alice_events) = join(&broker, JoinParams::new(ROOM, "Alice").as_host()).await;
    let (mut bob, _bob_events) = join(&broker, JoinParams::new(ROOM, "Bob")).await;
    await_roster_len(&alice, 2).await;

    bob.leave().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The broker no longer lists Bob; Alice retains him as offline.
    assert!(!broker.presence(TOPIC).contains_key("Bob"));
    let roster = alice.roster().await;
    assert_eq!(roster.len(), 2);
    let bob_entry = roster.iter().find(|p| p.name == "Bob").unwrap();
    assert!(!bob_entry.online);

    alice.leave().await;
}

#[tokio::test]
async fn unconfigured_broker_fails_the_join() {
    let broker = LocalBroker::unconfigured();
    let result = RoomSession::join(
        broker.channel(),
        JoinParams::new(ROOM, "Alice").as_host(),
        SessionConfig::new(),
    )
    .await;
    assert!(matches!(result, Err(RoomError::NotConfigured)));
}

#[tokio::test]
async fn unreachable_broker_fails_then_recovers() {
    let broker = LocalBroker::new();
    broker.set_reachable(false);

    let result = RoomSession::join(
        broker.channel(),
        JoinParams::new(ROOM, "Alice").as_host(),
        SessionConfig::new(),
    )
    .await;
    assert!(matches!(result, Err(RoomError::Connection(_))));

    // User-initiated retry once the broker is reachable again.
    broker.set_reachable(true);
    let (mut alice, _events) = join(&broker, JoinParams::new(ROOM, "Alice").as_host()).await;
    assert!(alice.is_connected());
    alice.leave().await;
}

#[tokio::test]
async fn closed_topic_surfaces_as_closed_event() {
    let broker = LocalBroker::new();
    let (mut alice, mut events) = join(&broker, JoinParams::new(ROOM, "Alice").as_host()).await;
    await_roster_len(&alice, 1).await;

    broker.close_topic(TOPIC);

    let closed = loop {
        match events.recv().await.unwrap() {
            RoomEvent::Closed { reason } => break reason,
            _ => continue,
        }
    };
    assert_eq!(closed, None);
    assert!(!alice.is_connected());
    // Last good snapshot survives for rendering.
    assert_eq!(alice.roster().await.len(), 1);

    alice.leave().await;
}
