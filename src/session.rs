//! Room session: roster reconciliation, phase state machine, score and
//! result ledgers.
//!
//! [`RoomSession`] is a thin handle that communicates with a background
//! channel loop task via an unbounded MPSC channel. Events are emitted on a
//! [`tokio::sync::broadcast`] channel returned from [`RoomSession::join`];
//! additional consumers attach via [`RoomSession::subscribe_events`].
//!
//! # Example
//!
//! ```rust,ignore
//! let channel = broker.channel().await;
//! let params = JoinParams::new("ABCD", "Alice").as_host();
//! let (session, mut events) = RoomSession::join(channel, params, SessionConfig::new()).await?;
//!
//! session.request_state_transition(RoomState::Generating).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         RoomEvent::RosterChanged { players } => { /* … */ }
//!         RoomEvent::Closed { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::channel::{Channel, ChannelEvent, PresenceSnapshot};
use crate::error::{Result, RoomError};
use crate::event::RoomEvent;
use crate::protocol::{
    clamp_score, room_topic, Broadcast, GameStartPayload, PlayAgainPayload, Player,
    PresenceRecord, ResultRecord, RoomState, ScoreUpdatePayload, StateUpdatePayload,
};

/// Default capacity of the event broadcast channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for a graceful leave.
const DEFAULT_LEAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Current wall-clock time as epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`RoomSession`].
///
/// All fields have sensible defaults.
///
/// ```
/// use dictation_rooms::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::new()
///     .with_event_channel_capacity(512)
///     .with_leave_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the event broadcast channel.
    ///
    /// Consumers that cannot keep up lag and skip events instead of blocking
    /// the channel loop. Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for a graceful [`leave`](RoomSession::leave).
    ///
    /// The channel loop is given this much time to unsubscribe and clear
    /// state; if the timeout expires the task is aborted and state is cleared
    /// by the handle. Defaults to **1 second**.
    pub leave_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            leave_timeout: DEFAULT_LEAVE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity of the event broadcast channel.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for a graceful leave.
    #[must_use]
    pub fn with_leave_timeout(mut self, timeout: Duration) -> Self {
        self.leave_timeout = timeout;
        self
    }
}

// ── JoinParams ──────────────────────────────────────────────────────

/// Parameters for joining (or creating) a room.
///
/// ```
/// use dictation_rooms::JoinParams;
///
/// let params = JoinParams::new("ABCD", "Alice").as_host();
/// assert!(params.is_host);
/// ```
#[derive(Debug, Clone)]
pub struct JoinParams {
    /// Short code identifying the room.
    pub room_code: String,
    /// Display name; the unique identity within the room.
    pub player_name: String,
    /// Whether this participant creates and drives the room.
    pub is_host: bool,
}

impl JoinParams {
    /// Join an existing room as a guest.
    pub fn new(room_code: impl Into<String>, player_name: impl Into<String>) -> Self {
        Self {
            room_code: room_code.into(),
            player_name: player_name.into(),
            is_host: false,
        }
    }

    /// Mark this participant as the room host.
    #[must_use]
    pub fn as_host(mut self) -> Self {
        self.is_host = true;
        self
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// Mutable room view owned by the channel loop and snapshotted by accessors.
#[derive(Debug, Default)]
struct RoomLedger {
    state: RoomState,
    roster: BTreeMap<String, Player>,
    results: BTreeMap<String, ResultRecord>,
    play_again: BTreeSet<String>,
    game: Option<GameStartPayload>,
}

impl RoomLedger {
    /// Roster ordered host first, then name ascending.
    fn ordered_roster(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self.roster.values().cloned().collect();
        players.sort_by(|a, b| b.is_host.cmp(&a.is_host).then_with(|| a.name.cmp(&b.name)));
        players
    }

    /// Result records ordered by player name.
    fn ordered_results(&self) -> Vec<ResultRecord> {
        self.results.values().cloned().collect()
    }

    fn clear(&mut self) {
        self.state = RoomState::Lobby;
        self.roster.clear();
        self.results.clear();
        self.play_again.clear();
        self.game = None;
    }
}

/// Internal shared state between the session handle and the channel loop.
struct SessionShared {
    connected: AtomicBool,
    ledger: Mutex<RoomLedger>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ledger: Mutex::new(RoomLedger::default()),
        }
    }
}

/// Commands from the session handle to the channel loop.
enum Command {
    Publish(Broadcast),
    Track(PresenceRecord),
}

// ── Session handle ──────────────────────────────────────────────────

/// Handle to a live room session.
///
/// Created via [`RoomSession::join`], which subscribes the channel, publishes
/// this client's presence, and spawns a background channel loop. All public
/// operations enqueue a command and return once it is queued; channel
/// failures surface as a [`RoomEvent::Closed`] event.
pub struct RoomSession {
    room_code: String,
    player_name: String,
    is_host: bool,
    /// Fixed at join; re-tracked presence records reuse it.
    online_at: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<SessionShared>,
    event_tx: broadcast::Sender<RoomEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    leave_timeout: Duration,
}

impl RoomSession {
    /// Join (or create) the room identified by `params.room_code`.
    ///
    /// Subscribes the channel to the room topic, publishes an initial
    /// presence record (score 0), then spawns the channel loop and returns
    /// the handle plus an event receiver. The first event is always
    /// [`RoomEvent::Joined`].
    ///
    /// # Errors
    ///
    /// [`RoomError::NotConfigured`] if the channel backend is not set up, or
    /// [`RoomError::Connection`] if subscribing fails. No session is created
    /// in either case; retry is user-initiated.
    pub async fn join(
        mut channel: impl Channel,
        params: JoinParams,
        config: SessionConfig,
    ) -> Result<(Self, broadcast::Receiver<RoomEvent>)> {
        let topic = room_topic(&params.room_code);
        channel.subscribe(&topic, &params.player_name).await?;

        let online_at = now_ms();
        channel
            .track(PresenceRecord::joining(online_at, params.is_host))
            .await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = broadcast::channel::<RoomEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let shared = Arc::new(SessionShared::new());

        let task = tokio::spawn(session_loop(
            channel,
            cmd_rx,
            event_tx.clone(),
            Arc::clone(&shared),
            shutdown_rx,
            params.room_code.clone(),
        ));

        let session = Self {
            room_code: params.room_code,
            player_name: params.player_name,
            is_host: params.is_host,
            online_at,
            cmd_tx,
            shared,
            event_tx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            leave_timeout: config.leave_timeout,
        };

        Ok((session, event_rx))
    }

    // ── Public API methods ──────────────────────────────────────────

    /// Ask the room to move to a new phase. Host-only.
    ///
    /// A call from a non-host, or along an edge the phase machine does not
    /// allow, is logged and silently ignored — a stale client must not
    /// desync the room by throwing. The transition is broadcast and applied
    /// optimistically to local state (the channel echoes the broadcast back
    /// anyway; the echo is absorbed idempotently).
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotJoined`] if the session already left the room.
    pub async fn request_state_transition(&self, new_state: RoomState) -> Result<()> {
        if !self.is_host {
            debug!(
                player = %self.player_name,
                ?new_state,
                "ignoring state transition request from non-host"
            );
            return Ok(());
        }
        let current = self.shared.ledger.lock().await.state;
        if current == new_state {
            return Ok(());
        }
        if !current.can_transition_to(new_state) {
            warn!(?current, ?new_state, "ignoring illegal phase transition");
            return Ok(());
        }
        self.send(Command::Publish(Broadcast::StateUpdate(
            StateUpdatePayload { state: new_state },
        )))
    }

    /// Launch the round, broadcasting the opaque exercise content to every
    /// participant. Host-only; silently ignored for guests.
    ///
    /// Drives the room to [`Dictating`](RoomState::Dictating) and resets the
    /// result and play-again ledgers for the new round.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotJoined`] if the session already left the room.
    pub fn start_game(&self, payload: GameStartPayload) -> Result<()> {
        if !self.is_host {
            debug!(player = %self.player_name, "ignoring start_game from non-host");
            return Ok(());
        }
        self.send(Command::Publish(Broadcast::GameStart(payload)))
    }

    /// Report this player's live progress. Any participant.
    ///
    /// The score is clamped to `[0, 100]` before it goes on the wire. The
    /// presence record is re-tracked with the new score so a reconnect
    /// redelivers the latest value rather than the join-time zero.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotJoined`] if the session already left the room.
    pub fn report_progress(&self, score: i32) -> Result<()> {
        let score = clamp_score(score);
        self.send(Command::Publish(Broadcast::ScoreUpdate(
            ScoreUpdatePayload {
                player_name: self.player_name.clone(),
                score,
            },
        )))?;
        self.send(Command::Track(PresenceRecord {
            online_at: self.online_at,
            is_host: self.is_host,
            score,
        }))
    }

    /// Report a final result for the round. Any participant; one record per
    /// player, keyed by `record.player_name`, last-write-wins.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotJoined`] if the session already left the room.
    pub fn report_results(&self, record: ResultRecord) -> Result<()> {
        self.send(Command::Publish(Broadcast::ResultsUpdate(record)))
    }

    /// Ask for another round. Any participant.
    ///
    /// Only records a vote; the host consumer decides whether to transition
    /// the room back to the lobby.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotJoined`] if the session already left the room.
    pub fn request_play_again(&self) -> Result<()> {
        self.send(Command::Publish(Broadcast::PlayAgain(PlayAgainPayload {
            player_name: self.player_name.clone(),
            is_host: self.is_host,
        })))
    }

    /// Leave the room: unsubscribe the channel, then clear the roster,
    /// results, and votes. Idempotent.
    ///
    /// The loop unsubscribes *before* clearing local state so no in-flight
    /// message can resurrect a cleared roster. If the loop does not exit
    /// within the configured timeout it is aborted and the handle clears
    /// state itself.
    pub async fn leave(&mut self) {
        debug!(room = %self.room_code, "leave requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.leave_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }

        self.shared.connected.store(false, Ordering::Release);
        // Harmless on the graceful path (the loop already cleared), required
        // on the abort path.
        self.shared.ledger.lock().await.clear();
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Code of the joined room.
    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    /// This client's identity within the room.
    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    /// Whether this client hosts the room.
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Returns `true` while the channel loop is believed to be running.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Attach an additional event consumer.
    ///
    /// The receiver observes events emitted after this call.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of the retained roster, ordered host first then name
    /// ascending.
    pub async fn roster(&self) -> Vec<Player> {
        self.shared.ledger.lock().await.ordered_roster()
    }

    /// Current room phase.
    pub async fn room_state(&self) -> RoomState {
        self.shared.ledger.lock().await.state
    }

    /// Aggregated results for the current round, ordered by player name.
    pub async fn results(&self) -> Vec<ResultRecord> {
        self.shared.ledger.lock().await.ordered_results()
    }

    /// Names of the players who asked for another round.
    pub async fn play_again_votes(&self) -> Vec<String> {
        self.shared
            .ledger
            .lock()
            .await
            .play_again
            .iter()
            .cloned()
            .collect()
    }

    /// The exercise content of the running round, if one was started.
    pub async fn game_payload(&self) -> Option<GameStartPayload> {
        self.shared.ledger.lock().await.game.clone()
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Queue a command to the channel loop.
    fn send(&self, cmd: Command) -> Result<()> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(RoomError::NotJoined);
        }
        self.cmd_tx.send(cmd).map_err(|_| RoomError::NotJoined)
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_code", &self.room_code)
            .field("player_name", &self.player_name)
            .field("is_host", &self.is_host)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        // `Drop` is synchronous so we cannot await a graceful leave. The only
        // safe action is to abort the spawned task, which drops the channel
        // loop future immediately. The `shutdown_tx` oneshot is intentionally
        // *not* sent here: it would trigger a graceful path that awaits
        // `channel.unsubscribe()`, but there is no executor context to drive
        // it inside `Drop`.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Channel loop ────────────────────────────────────────────────────

/// Background channel loop that multiplexes commands, shutdown, and incoming
/// channel events via `tokio::select!`.
///
/// Exits when:
/// - `leave()` is called (graceful: unsubscribe, clear, emit `Left`)
/// - The command channel closes (session handle dropped)
/// - The channel returns `None` (closed) or an error
/// - A publish or track fails (no retry; `Closed` is emitted)
async fn session_loop(
    mut channel: impl Channel,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: broadcast::Sender<RoomEvent>,
    shared: Arc<SessionShared>,
    mut shutdown_rx: oneshot::Receiver<()>,
    room_code: String,
) {
    debug!(room = %room_code, "session loop started");

    emit(&event_tx, RoomEvent::Joined { room_code });

    loop {
        tokio::select! {
            // Branch 1: outgoing command from the session handle
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Publish(msg)) => {
                        let payload = match msg.payload_json() {
                            Ok(payload) => payload,
                            Err(e) => {
                                // Serialization errors are programming bugs; don't kill the loop.
                                error!("failed to serialize broadcast payload: {e}");
                                continue;
                            }
                        };
                        debug!(event = msg.event(), "publishing broadcast");
                        if let Err(e) = channel.publish(msg.event(), payload).await {
                            error!("channel publish error: {e}");
                            close(&event_tx, &shared, Some(format!("publish error: {e}")));
                            break;
                        }
                        // Optimistic local apply; the self-echo re-applies
                        // idempotently without emitting duplicate events.
                        apply_broadcast(&shared, &event_tx, msg).await;
                    }
                    Some(Command::Track(record)) => {
                        if let Err(e) = channel.track(record).await {
                            error!("presence track error: {e}");
                            close(&event_tx, &shared, Some(format!("track error: {e}")));
                            break;
                        }
                    }
                    // Command channel closed — session handle dropped.
                    None => {
                        debug!("command channel closed, shutting down session loop");
                        let _ = channel.unsubscribe().await;
                        close(&event_tx, &shared, Some("session dropped".into()));
                        break;
                    }
                }
            }

            // Branch 2: graceful leave
            _ = &mut shutdown_rx => {
                debug!("leave signal received");
                // Unsubscribe before clearing so no in-flight message can
                // resurrect the cleared roster.
                if let Err(e) = channel.unsubscribe().await {
                    warn!("unsubscribe error during leave: {e}");
                }
                shared.ledger.lock().await.clear();
                shared.connected.store(false, Ordering::Release);
                emit(&event_tx, RoomEvent::Left);
                break;
            }

            // Branch 3: incoming channel event
            incoming = channel.recv() => {
                match incoming {
                    Some(Ok(ChannelEvent::PresenceSync(snapshot))) => {
                        reconcile_presence(&shared, &event_tx, snapshot).await;
                    }
                    Some(Ok(ChannelEvent::Broadcast { event, payload })) => {
                        match Broadcast::parse(&event, payload) {
                            Ok(msg) => apply_broadcast(&shared, &event_tx, msg).await,
                            // Malformed payloads are absorbed so one bad
                            // message cannot destabilize the room.
                            Err(e) => warn!(event = %event, "discarding malformed broadcast: {e}"),
                        }
                    }
                    Some(Err(e)) => {
                        error!("channel receive error: {e}");
                        close(&event_tx, &shared, Some(format!("receive error: {e}")));
                        break;
                    }
                    // Channel closed cleanly.
                    None => {
                        debug!("channel closed");
                        close(&event_tx, &shared, None);
                        break;
                    }
                }
            }
        }
    }

    debug!("session loop exited");
}

/// Reconcile the retained roster against a fresh presence snapshot.
///
/// The snapshot lists only the *currently connected* identities, so retained
/// entries absent from it are marked offline rather than evicted — the
/// roster never shrinks within a session. Per identity, the first presence
/// record is authoritative.
async fn reconcile_presence(
    shared: &SessionShared,
    event_tx: &broadcast::Sender<RoomEvent>,
    snapshot: PresenceSnapshot,
) {
    let mut ledger = shared.ledger.lock().await;

    for player in ledger.roster.values_mut() {
        player.online = false;
    }

    for (name, records) in &snapshot {
        let Some(record) = records.first() else {
            continue;
        };
        match ledger.roster.get_mut(name) {
            Some(entry) => {
                // Merge: host flag stays as first observed.
                entry.online = true;
                entry.score = record.score;
                entry.last_seen = record.online_at;
            }
            None => {
                ledger.roster.insert(
                    name.clone(),
                    Player {
                        name: name.clone(),
                        is_host: record.is_host,
                        online: true,
                        score: record.score,
                        last_seen: record.online_at,
                    },
                );
            }
        }
    }

    let players = ledger.ordered_roster();
    drop(ledger);
    emit(event_tx, RoomEvent::RosterChanged { players });
}

/// Apply a broadcast to the ledger, emitting events only for actual changes
/// so self-echoed broadcasts are absorbed without duplicates.
async fn apply_broadcast(
    shared: &SessionShared,
    event_tx: &broadcast::Sender<RoomEvent>,
    msg: Broadcast,
) {
    let mut ledger = shared.ledger.lock().await;
    match msg {
        Broadcast::StateUpdate(payload) => {
            if ledger.state != payload.state {
                ledger.state = payload.state;
                drop(ledger);
                emit(
                    event_tx,
                    RoomEvent::StateChanged {
                        state: payload.state,
                    },
                );
            }
        }
        Broadcast::GameStart(payload) => {
            // Only a redelivery of the round already running is an echo. A
            // later round may legitimately reuse identical content (play
            // again with the same dictation), so payload equality alone
            // does not make a duplicate.
            if ledger.state == RoomState::Dictating && ledger.game.as_ref() == Some(&payload) {
                return;
            }
            ledger.game = Some(payload.clone());
            let entered_dictating = ledger.state != RoomState::Dictating;
            ledger.state = RoomState::Dictating;
            // New round: previous results and votes no longer apply.
            ledger.results.clear();
            ledger.play_again.clear();
            drop(ledger);
            if entered_dictating {
                emit(
                    event_tx,
                    RoomEvent::StateChanged {
                        state: RoomState::Dictating,
                    },
                );
            }
            emit(event_tx, RoomEvent::GameStarted { payload });
        }
        Broadcast::ScoreUpdate(payload) => match ledger.roster.get_mut(&payload.player_name) {
            Some(entry) => {
                if entry.score != payload.score {
                    entry.score = payload.score;
                    drop(ledger);
                    emit(
                        event_tx,
                        RoomEvent::ScoreUpdated {
                            player_name: payload.player_name,
                            score: payload.score,
                        },
                    );
                }
            }
            None => {
                debug!(player = %payload.player_name, "score update for unknown player ignored");
            }
        },
        Broadcast::ResultsUpdate(record) => {
            let previous = ledger
                .results
                .insert(record.player_name.clone(), record.clone());
            if previous.as_ref() != Some(&record) {
                let results = ledger.ordered_results();
                drop(ledger);
                emit(event_tx, RoomEvent::ResultsUpdated { results });
            }
        }
        Broadcast::PlayAgain(payload) => {
            if ledger.play_again.insert(payload.player_name.clone()) {
                let votes = ledger.play_again.len();
                drop(ledger);
                emit(
                    event_tx,
                    RoomEvent::PlayAgainRequested {
                        player_name: payload.player_name,
                        is_host: payload.is_host,
                        votes,
                    },
                );
            }
        }
    }
}

/// Emit an event to every subscribed consumer. Having no consumers is fine;
/// they may attach later or have gone away.
fn emit(event_tx: &broadcast::Sender<RoomEvent>, event: RoomEvent) {
    let _ = event_tx.send(event);
}

/// Mark the session disconnected and emit a terminal [`RoomEvent::Closed`].
/// Local state is intentionally kept so consumers can render the last good
/// snapshot.
fn close(
    event_tx: &broadcast::Sender<RoomEvent>,
    shared: &SessionShared,
    reason: Option<String>,
) {
    shared.connected.store(false, Ordering::Release);
    emit(event_tx, RoomEvent::Closed { reason });
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
    use crate::protocol::Theme;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    // ── Mock channel ────────────────────────────────────────────────

    /// What a mock channel recorded going out.
    #[derive(Debug, Default)]
    struct Outgoing {
        published: Vec<(String, serde_json::Value)>,
        tracked: Vec<PresenceRecord>,
        subscribed: Vec<(String, String)>,
        unsubscribed: bool,
    }

    /// A mock channel that records outgoing traffic and replays scripted
    /// incoming events.
    struct MockChannel {
        incoming: VecDeque<Option<std::result::Result<ChannelEvent, RoomError>>>,
        outgoing: Arc<StdMutex<Outgoing>>,
        fail_subscribe: Option<fn() -> RoomError>,
    }

    impl MockChannel {
        fn new(
            incoming: Vec<Option<std::result::Result<ChannelEvent, RoomError>>>,
        ) -> (Self, Arc<StdMutex<Outgoing>>) {
            let outgoing = Arc::new(StdMutex::new(Outgoing::default()));
            let channel = Self {
                incoming: VecDeque::from(incoming),
                outgoing: Arc::clone(&outgoing),
                fail_subscribe: None,
            };
            (channel, outgoing)
        }

        fn failing_subscribe(err: fn() -> RoomError) -> Self {
            Self {
                incoming: VecDeque::new(),
                outgoing: Arc::new(StdMutex::new(Outgoing::default())),
                fail_subscribe: Some(err),
            }
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        async fn subscribe(
            &mut self,
            topic: &str,
            presence_key: &str,
        ) -> std::result::Result<(), RoomError> {
            if let Some(err) = self.fail_subscribe {
                return Err(err());
            }
            self.outgoing
                .lock()
                .unwrap()
                .subscribed
                .push((topic.into(), presence_key.into()));
            Ok(())
        }

        async fn track(&mut self, record: PresenceRecord) -> std::result::Result<(), RoomError> {
            self.outgoing.lock().unwrap().tracked.push(record);
            Ok(())
        }

        async fn publish(
            &mut self,
            event: &str,
            payload: serde_json::Value,
        ) -> std::result::Result<(), RoomError> {
            self.outgoing
                .lock()
                .unwrap()
                .published
                .push((event.into(), payload));
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<ChannelEvent, RoomError>> {
            if let Some(item) = self.incoming.pop_front() {
                // An explicit `None` entry scripts a clean channel close.
                item
            } else {
                // All scripted events delivered — hang forever so the loop
                // stays alive until leave is called.
                std::future::pending().await
            }
        }

        async fn unsubscribe(&mut self) -> std::result::Result<(), RoomError> {
            self.outgoing.lock().unwrap().unsubscribed = true;
            Ok(())
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn snapshot(entries: &[(&str, bool, u8)]) -> ChannelEvent {
        let mut map = PresenceSnapshot::new();
        for (name, is_host, score) in entries {
            map.insert(
                (*name).into(),
                vec![PresenceRecord {
                    online_at: 1_000,
                    is_host: *is_host,
                    score: *score,
                }],
            );
        }
        ChannelEvent::PresenceSync(map)
    }

    async fn join_host(
        incoming: Vec<Option<std::result::Result<ChannelEvent, RoomError>>>,
    ) -> (
        RoomSession,
        broadcast::Receiver<RoomEvent>,
        Arc<StdMutex<Outgoing>>,
    ) {
        let (channel, outgoing) = MockChannel::new(incoming);
        let params = JoinParams::new("ABCD", "Alice").as_host();
        let (session, events) = RoomSession::join(channel, params, SessionConfig::new())
            .await
            .unwrap();
        (session, events, outgoing)
    }

    async fn join_guest(
        incoming: Vec<Option<std::result::Result<ChannelEvent, RoomError>>>,
    ) -> (
        RoomSession,
        broadcast::Receiver<RoomEvent>,
        Arc<StdMutex<Outgoing>>,
    ) {
        let (channel, outgoing) = MockChannel::new(incoming);
        let params = JoinParams::new("ABCD", "Bob");
        let (session, events) = RoomSession::join(channel, params, SessionConfig::new())
            .await
            .unwrap();
        (session, events, outgoing)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // ── Join / leave ────────────────────────────────────────────────

    #[tokio::test]
    async fn join_subscribes_topic_and_tracks_presence() {
        let (mut session, mut events, outgoing) = join_host(vec![]).await;

        let first = events.recv().await.unwrap();
        assert!(matches!(first, RoomEvent::Joined { ref room_code } if room_code == "ABCD"));

        {
            let out = outgoing.lock().unwrap();
            assert_eq!(out.subscribed, vec![("room:ABCD".into(), "Alice".into())]);
            assert_eq!(out.tracked.len(), 1);
            assert!(out.tracked[0].is_host);
            assert_eq!(out.tracked[0].score, 0);
        }

        session.leave().await;
    }

    #[tokio::test]
    async fn join_surfaces_connection_error() {
        let channel = MockChannel::failing_subscribe(|| RoomError::Connection("refused".into()));
        let result =
            RoomSession::join(channel, JoinParams::new("ABCD", "Alice"), SessionConfig::new())
                .await;
        assert!(matches!(result, Err(RoomError::Connection(_))));
    }

    #[tokio::test]
    async fn join_surfaces_not_configured() {
        let channel = MockChannel::failing_subscribe(|| RoomError::NotConfigured);
        let result =
            RoomSession::join(channel, JoinParams::new("ABCD", "Alice"), SessionConfig::new())
                .await;
        assert!(matches!(result, Err(RoomError::NotConfigured)));
    }

    #[tokio::test]
    async fn leave_unsubscribes_then_clears_state() {
        let (mut session, mut events, outgoing) =
            join_host(vec![Some(Ok(snapshot(&[("Alice", true, 0)])))]).await;

        let _ = events.recv().await; // Joined
        let _ = events.recv().await; // RosterChanged
        assert_eq!(session.roster().await.len(), 1);

        session.leave().await;

        assert!(outgoing.lock().unwrap().unsubscribed);
        assert!(session.roster().await.is_empty());
        assert!(!session.is_connected());
        assert!(matches!(
            session.report_progress(10),
            Err(RoomError::NotJoined)
        ));
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let (mut session, _events, _outgoing) = join_host(vec![]).await;
        session.leave().await;
        session.leave().await; // should not panic or hang
        assert!(!session.is_connected());
    }

    // ── Presence reconciliation ─────────────────────────────────────

    #[tokio::test]
    async fn roster_never_shrinks_on_presence_drop() {
        let (mut session, _events, _outgoing) = join_host(vec![
            Some(Ok(snapshot(&[("Alice", true, 0), ("Bob", false, 0)]))),
            Some(Ok(snapshot(&[("Alice", true, 0)]))), // Bob blips out
            Some(Ok(snapshot(&[("Alice", true, 0), ("Bob", false, 0)]))),
        ])
        .await;
        settle().await;

        let roster = session.roster().await;
        assert_eq!(roster.len(), 2);
        let bob = roster.iter().find(|p| p.name == "Bob").unwrap();
        assert!(bob.online);

        session.leave().await;
    }

    #[tokio::test]
    async fn offline_flag_toggles_across_flap() {
        let (mut session, mut events, _outgoing) = join_host(vec![
            Some(Ok(snapshot(&[("Alice", true, 0), ("Bob", false, 0)]))),
            Some(Ok(snapshot(&[("Alice", true, 0)]))),
        ])
        .await;

        let _ = events.recv().await; // Joined
        let _ = events.recv().await; // RosterChanged (both online)
        let ev = events.recv().await.unwrap(); // RosterChanged (Bob offline)
        let RoomEvent::RosterChanged { players } = ev else {
            panic!("expected RosterChanged, got {ev:?}");
        };
        assert_eq!(players.len(), 2);
        let bob = players.iter().find(|p| p.name == "Bob").unwrap();
        assert!(!bob.online);

        session.leave().await;
    }

    #[tokio::test]
    async fn identical_snapshot_is_idempotent() {
        let snap = &[("Alice", true, 0), ("Bob", false, 7)];
        let (mut session, mut events, _outgoing) =
            join_host(vec![Some(Ok(snapshot(snap))), Some(Ok(snapshot(snap)))]).await;

        let _ = events.recv().await; // Joined
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        let (RoomEvent::RosterChanged { players: a }, RoomEvent::RosterChanged { players: b }) =
            (first, second)
        else {
            panic!("expected two RosterChanged events");
        };
        assert_eq!(a, b);

        session.leave().await;
    }

    #[tokio::test]
    async fn roster_orders_host_first_then_names() {
        let (mut session, _events, _outgoing) = join_host(vec![Some(Ok(snapshot(&[
            ("Zoe", false, 0),
            ("Alice", true, 0),
            ("Bob", false, 0),
        ])))])
        .await;
        settle().await;

        let names: Vec<String> = session
            .roster()
            .await
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Alice", "Bob", "Zoe"]);

        session.leave().await;
    }

    #[tokio::test]
    async fn host_flag_is_immutable_once_observed() {
        let (mut session, _events, _outgoing) = join_host(vec![
            Some(Ok(snapshot(&[("Bob", false, 0)]))),
            Some(Ok(snapshot(&[("Bob", true, 0)]))), // spoofed flip
        ])
        .await;
        settle().await;

        let roster = session.roster().await;
        assert!(!roster[0].is_host);

        session.leave().await;
    }

    #[tokio::test]
    async fn first_presence_record_wins() {
        let mut map = PresenceSnapshot::new();
        map.insert(
            "Bob".into(),
            vec![
                PresenceRecord {
                    online_at: 1,
                    is_host: false,
                    score: 42,
                },
                PresenceRecord {
                    online_at: 2,
                    is_host: true,
                    score: 99,
                },
            ],
        );
        let (mut session, _events, _outgoing) =
            join_host(vec![Some(Ok(ChannelEvent::PresenceSync(map)))]).await;
        settle().await;

        let roster = session.roster().await;
        assert_eq!(roster[0].score, 42);
        assert!(!roster[0].is_host);

        session.leave().await;
    }

    // ── Host exclusivity ────────────────────────────────────────────

    #[tokio::test]
    async fn non_host_state_transition_is_ignored() {
        let (mut session, _events, outgoing) = join_guest(vec![]).await;

        session
            .request_state_transition(RoomState::Generating)
            .await
            .unwrap();
        settle().await;

        assert!(outgoing.lock().unwrap().published.is_empty());
        assert_eq!(session.room_state().await, RoomState::Lobby);

        session.leave().await;
    }

    #[tokio::test]
    async fn non_host_start_game_is_ignored() {
        let (mut session, _events, outgoing) = join_guest(vec![]).await;

        session
            .start_game(GameStartPayload {
                dictation: json!({"text": "hi"}),
                theme: Theme {
                    name: "X".into(),
                    icon: None,
                },
            })
            .unwrap();
        settle().await;

        assert!(outgoing.lock().unwrap().published.is_empty());
        assert_eq!(session.room_state().await, RoomState::Lobby);

        session.leave().await;
    }

    #[tokio::test]
    async fn illegal_transition_is_ignored() {
        let (mut session, _events, outgoing) = join_host(vec![]).await;

        // Lobby -> Dictating is not an edge of the phase machine.
        session
            .request_state_transition(RoomState::Dictating)
            .await
            .unwrap();
        settle().await;

        assert!(outgoing.lock().unwrap().published.is_empty());
        assert_eq!(session.room_state().await, RoomState::Lobby);

        session.leave().await;
    }

    #[tokio::test]
    async fn host_transition_broadcasts_and_applies_optimistically() {
        let (mut session, _events, outgoing) = join_host(vec![]).await;

        session
            .request_state_transition(RoomState::Generating)
            .await
            .unwrap();
        settle().await;

        assert_eq!(session.room_state().await, RoomState::Generating);
        {
            let out = outgoing.lock().unwrap();
            assert_eq!(out.published.len(), 1);
            assert_eq!(out.published[0].0, "state_update");
            assert_eq!(out.published[0].1, json!({"state": "GENERATING"}));
        }

        session.leave().await;
    }

    // ── Score clamping ──────────────────────────────────────────────

    #[tokio::test]
    async fn scores_clamp_to_valid_range() {
        let (mut session, _events, outgoing) = join_guest(vec![]).await;

        session.report_progress(150).unwrap();
        session.report_progress(-5).unwrap();
        settle().await;

        {
            let out = outgoing.lock().unwrap();
            assert_eq!(out.published[0].1, json!({"playerName": "Bob", "score": 100}));
            assert_eq!(out.published[1].1, json!({"playerName": "Bob", "score": 0}));
            // Presence re-tracked with the clamped values.
            assert_eq!(out.tracked[1].score, 100);
            assert_eq!(out.tracked[2].score, 0);
        }

        session.leave().await;
    }

    // ── Broadcast application ───────────────────────────────────────

    #[tokio::test]
    async fn guest_mirrors_broadcast_state() {
        let (mut session, _events, _outgoing) = join_guest(vec![Some(Ok(
            ChannelEvent::Broadcast {
                event: "state_update".into(),
                payload: json!({"state": "GENERATING"}),
            },
        ))])
        .await;
        settle().await;

        assert_eq!(session.room_state().await, RoomState::Generating);

        session.leave().await;
    }

    #[tokio::test]
    async fn game_start_sets_dictating_and_resets_round_ledgers() {
        let (mut session, _events, _outgoing) = join_guest(vec![
            Some(Ok(ChannelEvent::Broadcast {
                event: "results_update".into(),
                payload: json!({"playerName": "Old", "score": 1, "errorCount": 0, "errorTypes": []}),
            })),
            Some(Ok(ChannelEvent::Broadcast {
                event: "game_start".into(),
                payload: json!({"dictation": {"text": "Bonjour"}, "theme": {"name": "X"}}),
            })),
        ])
        .await;
        settle().await;

        assert_eq!(session.room_state().await, RoomState::Dictating);
        assert!(session.results().await.is_empty());
        let payload = session.game_payload().await.unwrap();
        assert_eq!(payload.dictation, json!({"text": "Bonjour"}));

        session.leave().await;
    }

    #[tokio::test]
    async fn identical_payload_starts_a_new_round_after_lobby_return() {
        let game = || ChannelEvent::Broadcast {
            event: "game_start".into(),
            payload: json!({"dictation": {"text": "Bonjour"}, "theme": {"name": "X"}}),
        };
        let (mut session, mut events, _outgoing) = join_guest(vec![
            Some(Ok(game())),
            Some(Ok(ChannelEvent::Broadcast {
                event: "state_update".into(),
                payload: json!({"state": "LOBBY"}),
            })),
            // Play again with the very same dictation.
            Some(Ok(game())),
        ])
        .await;
        settle().await;

        assert_eq!(session.room_state().await, RoomState::Dictating);

        session.leave().await;
        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RoomEvent::GameStarted { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 2);
    }

    #[tokio::test]
    async fn malformed_broadcast_is_absorbed() {
        let (mut session, _events, _outgoing) = join_guest(vec![
            Some(Ok(ChannelEvent::Broadcast {
                event: "state_update".into(),
                payload: json!({"state": "NOT_A_STATE"}),
            })),
            Some(Ok(ChannelEvent::Broadcast {
                event: "no_such_event".into(),
                payload: json!({}),
            })),
            Some(Ok(ChannelEvent::Broadcast {
                event: "state_update".into(),
                payload: json!({"state": "GENERATING"}),
            })),
        ])
        .await;
        settle().await;

        // The two bad messages were dropped; the good one still applied.
        assert_eq!(session.room_state().await, RoomState::Generating);
        assert!(session.is_connected());

        session.leave().await;
    }

    #[tokio::test]
    async fn results_are_last_write_wins_per_player() {
        let record = |score: u8| {
            json!({"playerName": "Bob", "score": score, "errorCount": 2, "errorTypes": ["accord"]})
        };
        let (mut session, _events, _outgoing) = join_guest(vec![
            Some(Ok(ChannelEvent::Broadcast {
                event: "results_update".into(),
                payload: record(40),
            })),
            Some(Ok(ChannelEvent::Broadcast {
                event: "results_update".into(),
                payload: record(55),
            })),
        ])
        .await;
        settle().await;

        let results = session.results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 55);

        session.leave().await;
    }

    #[tokio::test]
    async fn play_again_votes_are_a_set() {
        let vote = json!({"playerName": "Bob", "isHost": false});
        let (mut session, _events, _outgoing) = join_guest(vec![
            Some(Ok(ChannelEvent::Broadcast {
                event: "play_again".into(),
                payload: vote.clone(),
            })),
            Some(Ok(ChannelEvent::Broadcast {
                event: "play_again".into(),
                payload: vote,
            })),
            Some(Ok(ChannelEvent::Broadcast {
                event: "play_again".into(),
                payload: json!({"playerName": "Alice", "isHost": true}),
            })),
        ])
        .await;
        settle().await;

        assert_eq!(session.play_again_votes().await, vec!["Alice", "Bob"]);

        session.leave().await;
    }

    #[tokio::test]
    async fn channel_error_emits_closed_and_keeps_state() {
        let (mut session, mut events, _outgoing) = join_guest(vec![
            Some(Ok(snapshot(&[("Alice", true, 0), ("Bob", false, 0)]))),
            Some(Err(RoomError::Connection("boom".into()))),
        ])
        .await;

        let _ = events.recv().await; // Joined
        let _ = events.recv().await; // RosterChanged
        let ev = events.recv().await.unwrap();
        let RoomEvent::Closed { reason } = ev else {
            panic!("expected Closed, got {ev:?}");
        };
        assert!(reason.unwrap().contains("boom"));

        // Last good state survives for rendering.
        assert_eq!(session.roster().await.len(), 2);
        assert!(!session.is_connected());

        session.leave().await;
    }

    #[tokio::test]
    async fn clean_channel_close_emits_closed_without_reason() {
        let (mut session, mut events, _outgoing) = join_guest(vec![None]).await;

        let _ = events.recv().await; // Joined
        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, RoomEvent::Closed { reason: None }));

        session.leave().await;
    }

    #[tokio::test]
    async fn multiple_event_subscribers_observe_the_same_events() {
        async fn next_play_again(rx: &mut broadcast::Receiver<RoomEvent>) -> RoomEvent {
            loop {
                let event = rx.recv().await.unwrap();
                if matches!(event, RoomEvent::PlayAgainRequested { .. }) {
                    return event;
                }
            }
        }

        let (mut session, mut primary, _outgoing) = join_guest(vec![]).await;
        let mut secondary = session.subscribe_events();

        session.request_play_again().unwrap();
        settle().await;

        let a = next_play_again(&mut primary).await;
        let b = next_play_again(&mut secondary).await;
        assert!(matches!(
            a,
            RoomEvent::PlayAgainRequested { ref player_name, .. } if player_name == "Bob"
        ));
        assert!(matches!(
            b,
            RoomEvent::PlayAgainRequested { ref player_name, .. } if player_name == "Bob"
        ));

        session.leave().await;
    }

    #[tokio::test]
    async fn debug_impl_for_session() {
        let (mut session, _events, _outgoing) = join_host(vec![]).await;
        let debug_str = format!("{session:?}");
        assert!(debug_str.contains("RoomSession"));
        assert!(debug_str.contains("ABCD"));
        session.leave().await;
    }
}
