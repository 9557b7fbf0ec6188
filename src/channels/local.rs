//! In-process presence+broadcast broker.
//!
//! [`LocalBroker`] fans broadcasts out to every subscriber of a topic
//! (including the sender) and pushes a fresh presence snapshot to all
//! subscribers whenever any participant's presence changes — the same
//! contract a hosted realtime backend provides, minus the network. It backs
//! the integration tests and lets several sessions coexist in one process.
//!
//! # Feature gate
//!
//! This module is only available when the `channel-local` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), dictation_rooms::RoomError> {
//! use dictation_rooms::{JoinParams, LocalBroker, RoomSession, SessionConfig};
//!
//! let broker = LocalBroker::new();
//! let (host, _events) = RoomSession::join(
//!     broker.channel(),
//!     JoinParams::new("ABCD", "Alice").as_host(),
//!     SessionConfig::new(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{Channel, ChannelEvent, PresenceSnapshot};
use crate::error::RoomError;
use crate::protocol::PresenceRecord;

// ── Broker ──────────────────────────────────────────────────────────

struct Topic {
    presence: PresenceSnapshot,
    subscribers: HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            presence: PresenceSnapshot::new(),
            subscribers: HashMap::new(),
        }
    }

    /// Push the current presence snapshot to every subscriber.
    fn sync(&self) {
        for tx in self.subscribers.values() {
            let _ = tx.send(ChannelEvent::PresenceSync(self.presence.clone()));
        }
    }
}

struct BrokerInner {
    configured: bool,
    reachable: bool,
    topics: HashMap<String, Topic>,
    next_id: u64,
}

/// An in-process presence+broadcast broker.
///
/// Cheap to clone; clones share the same topics. Each call to
/// [`channel`](LocalBroker::channel) yields an independent [`LocalChannel`]
/// for one participant.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<StdMutex<BrokerInner>>,
}

impl LocalBroker {
    /// Create a configured, reachable broker.
    pub fn new() -> Self {
        Self::with_flags(true, true)
    }

    /// Create a broker that rejects every subscription with
    /// [`RoomError::NotConfigured`] — the "cloud not set up" failure mode.
    pub fn unconfigured() -> Self {
        Self::with_flags(false, true)
    }

    fn with_flags(configured: bool, reachable: bool) -> Self {
        Self {
            inner: Arc::new(StdMutex::new(BrokerInner {
                configured,
                reachable,
                topics: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        // Broker mutations cannot leave the maps in a torn state, so a
        // poisoned lock is safe to recover.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a channel for one participant.
    pub fn channel(&self) -> LocalChannel {
        let mut inner = self.lock();
        inner.next_id += 1;
        LocalChannel {
            broker: Arc::clone(&self.inner),
            id: inner.next_id,
            subscription: None,
            rx: None,
        }
    }

    /// Make subsequent subscriptions fail with [`RoomError::Connection`]
    /// (or succeed again). Existing subscriptions are unaffected.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Simulate a transient connection blip for one identity: its presence
    /// drops out of the topic and immediately returns, producing two syncs,
    /// without the client's involvement. A no-op if the identity is not
    /// present.
    pub fn flap_presence(&self, topic: &str, name: &str) {
        let mut inner = self.lock();
        let Some(topic) = inner.topics.get_mut(topic) else {
            return;
        };
        let Some(records) = topic.presence.remove(name) else {
            return;
        };
        debug!(name, "flapping presence");
        topic.sync();
        topic.presence.insert(name.to_string(), records);
        topic.sync();
    }

    /// Close a topic: every subscriber's `recv` yields `None` (clean close)
    /// once its queue drains.
    pub fn close_topic(&self, topic: &str) {
        self.lock().topics.remove(topic);
    }

    /// Current presence snapshot of a topic (test assertions).
    pub fn presence(&self, topic: &str) -> PresenceSnapshot {
        self.lock()
            .topics
            .get(topic)
            .map(|t| t.presence.clone())
            .unwrap_or_default()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("LocalBroker")
            .field("configured", &inner.configured)
            .field("reachable", &inner.reachable)
            .field("topics", &inner.topics.len())
            .finish()
    }
}

// ── Channel ─────────────────────────────────────────────────────────

struct Subscription {
    topic: String,
    presence_key: String,
}

/// A [`Channel`] connected to a [`LocalBroker`].
///
/// `recv` is cancel-safe (it wraps an `mpsc::Receiver`). Dropping the
/// channel withdraws its presence and subscription, like a dying socket.
pub struct LocalChannel {
    broker: Arc<StdMutex<BrokerInner>>,
    id: u64,
    subscription: Option<Subscription>,
    rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl LocalChannel {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.broker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Detach from the broker: drop presence and the subscriber slot, then
    /// notify the remaining subscribers. Idempotent.
    fn detach(&mut self) {
        let Some(sub) = self.subscription.take() else {
            return;
        };
        let mut inner = self.lock();
        if let Some(topic) = inner.topics.get_mut(&sub.topic) {
            topic.subscribers.remove(&self.id);
            topic.presence.remove(&sub.presence_key);
            topic.sync();
        }
        drop(inner);
        self.rx = None;
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn subscribe(&mut self, topic: &str, presence_key: &str) -> Result<(), RoomError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            if !inner.configured {
                return Err(RoomError::NotConfigured);
            }
            if !inner.reachable {
                return Err(RoomError::Connection("broker unreachable".into()));
            }
            let entry = inner
                .topics
                .entry(topic.to_string())
                .or_insert_with(Topic::new);
            entry.subscribers.insert(self.id, tx.clone());
            // Deliver the current snapshot so a late joiner sees who is
            // already in the room.
            let _ = tx.send(ChannelEvent::PresenceSync(entry.presence.clone()));
        }
        self.subscription = Some(Subscription {
            topic: topic.to_string(),
            presence_key: presence_key.to_string(),
        });
        self.rx = Some(rx);
        Ok(())
    }

    async fn track(&mut self, record: PresenceRecord) -> Result<(), RoomError> {
        let Some(sub) = &self.subscription else {
            return Err(RoomError::Connection("not subscribed".into()));
        };
        let mut inner = self.lock();
        let Some(topic) = inner.topics.get_mut(&sub.topic) else {
            return Err(RoomError::Connection("topic closed".into()));
        };
        // Last-registered-overwrites: a duplicate connection under the same
        // name replaces the earlier record rather than merging devices.
        topic
            .presence
            .insert(sub.presence_key.clone(), vec![record]);
        topic.sync();
        Ok(())
    }

    async fn publish(&mut self, event: &str, payload: Value) -> Result<(), RoomError> {
        let Some(sub) = &self.subscription else {
            return Err(RoomError::Publish("not subscribed".into()));
        };
        let inner = self.lock();
        let Some(topic) = inner.topics.get(&sub.topic) else {
            return Err(RoomError::Publish("topic closed".into()));
        };
        // Fan out to every subscriber, the sender included (self-echo).
        for tx in topic.subscribers.values() {
            let _ = tx.send(ChannelEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ChannelEvent, RoomError>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await.map(Ok),
            // Not subscribed (or already unsubscribed): nothing will ever
            // arrive; pend so a select loop stays parked on other branches.
            None => std::future::pending().await,
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), RoomError> {
        self.detach();
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel")
            .field("id", &self.id)
            .field("subscribed", &self.subscription.is_some())
            .finish()
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

    fn record(score: u8) -> PresenceRecord {
        PresenceRecord {
            online_at: 1_000,
            is_host: false,
            score,
        }
    }

    async fn next_sync(channel: &mut LocalChannel) -> PresenceSnapshot {
        loop {
            match channel.recv().await.unwrap().unwrap() {
                ChannelEvent::PresenceSync(snapshot) => return snapshot,
                ChannelEvent::Broadcast { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_initial_snapshot() {
        let broker = LocalBroker::new();

        let mut a = broker.channel();
        a.subscribe("room:X", "Alice").await.unwrap();
        a.track(record(0)).await.unwrap();

        let mut b = broker.channel();
        b.subscribe("room:X", "Bob").await.unwrap();

        let snapshot = next_sync(&mut b).await;
        assert!(snapshot.contains_key("Alice"));
    }

    #[tokio::test]
    async fn publish_echoes_to_sender() {
        let broker = LocalBroker::new();
        let mut a = broker.channel();
        a.subscribe("room:X", "Alice").await.unwrap();

        a.publish("state_update", serde_json::json!({"state": "LOBBY"}))
            .await
            .unwrap();

        // Skip the initial presence sync.
        let _ = a.recv().await;
        let event = a.recv().await.unwrap().unwrap();
        let ChannelEvent::Broadcast { event, .. } = event else {
            panic!("expected broadcast, got {event:?}");
        };
        assert_eq!(event, "state_update");
    }

    #[tokio::test]
    async fn track_replaces_previous_record() {
        let broker = LocalBroker::new();
        let mut a = broker.channel();
        a.subscribe("room:X", "Alice").await.unwrap();
        a.track(record(0)).await.unwrap();
        a.track(record(40)).await.unwrap();

        let presence = broker.presence("room:X");
        assert_eq!(presence.get("Alice").unwrap(), &vec![record(40)]);
    }

    #[tokio::test]
    async fn duplicate_name_overwrites_earlier_registration() {
        let broker = LocalBroker::new();
        let mut a = broker.channel();
        a.subscribe("room:X", "Alice").await.unwrap();
        a.track(record(10)).await.unwrap();

        // A second device registers under the same name.
        let mut imposter = broker.channel();
        imposter.subscribe("room:X", "Alice").await.unwrap();
        imposter.track(record(99)).await.unwrap();

        let presence = broker.presence("room:X");
        assert_eq!(presence.get("Alice").unwrap(), &vec![record(99)]);
        assert_eq!(presence.len(), 1);
    }

    #[tokio::test]
    async fn flap_emits_drop_then_return() {
        let broker = LocalBroker::new();
        let mut a = broker.channel();
        a.subscribe("room:X", "Alice").await.unwrap();
        a.track(record(0)).await.unwrap();

        let mut observer = broker.channel();
        observer.subscribe("room:X", "Observer").await.unwrap();
        let _ = next_sync(&mut observer).await; // initial

        broker.flap_presence("room:X", "Alice");

        let during = next_sync(&mut observer).await;
        assert!(!during.contains_key("Alice"));
        let after = next_sync(&mut observer).await;
        assert!(after.contains_key("Alice"));
    }

    #[tokio::test]
    async fn unsubscribe_withdraws_presence() {
        let broker = LocalBroker::new();
        let mut a = broker.channel();
        a.subscribe("room:X", "Alice").await.unwrap();
        a.track(record(0)).await.unwrap();

        a.unsubscribe().await.unwrap();
        assert!(broker.presence("room:X").is_empty());

        // Idempotent.
        a.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn drop_withdraws_presence_like_a_dying_socket() {
        let broker = LocalBroker::new();
        let mut a = broker.channel();
        a.subscribe("room:X", "Alice").await.unwrap();
        a.track(record(0)).await.unwrap();

        drop(a);
        assert!(broker.presence("room:X").is_empty());
    }

    #[tokio::test]
    async fn unconfigured_broker_rejects_subscribe() {
        let broker = LocalBroker::unconfigured();
        let mut a = broker.channel();
        let result = a.subscribe("room:X", "Alice").await;
        assert!(matches!(result, Err(RoomError::NotConfigured)));
    }

    #[tokio::test]
    async fn unreachable_broker_rejects_subscribe() {
        let broker = LocalBroker::new();
        broker.set_reachable(false);
        let mut a = broker.channel();
        let result = a.subscribe("room:X", "Alice").await;
        assert!(matches!(result, Err(RoomError::Connection(_))));

        broker.set_reachable(true);
        assert!(a.subscribe("room:X", "Alice").await.is_ok());
    }

    #[tokio::test]
    async fn close_topic_closes_subscriber_channels() {
        let broker = LocalBroker::new();
        let mut a = broker.channel();
        a.subscribe("room:X", "Alice").await.unwrap();
        let _ = a.recv().await; // initial sync

        broker.close_topic("room:X");
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn track_without_subscribe_fails() {
        let broker = LocalBroker::new();
        let mut a = broker.channel();
        assert!(a.track(record(0)).await.is_err());
        assert!(a
            .publish("play_again", serde_json::json!({}))
            .await
            .is_err());
    }
}
