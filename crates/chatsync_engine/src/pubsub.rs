//! Pub/sub collaborator interface.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chatsync_model::{RowChange, TypingEvent, UserId};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Identifier of one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Creates a subscription id from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Row-change filter for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    /// Table to watch.
    pub table: String,
    /// Rows where this user is the sender or the recipient.
    pub user_id: UserId,
    /// Restrict to the conversation with this peer, if given.
    pub peer_id: Option<UserId>,
}

impl ChangeFilter {
    /// Filter for a one-to-one conversation.
    pub fn conversation(table: impl Into<String>, user_id: UserId, peer_id: UserId) -> Self {
        Self {
            table: table.into(),
            user_id,
            peer_id: Some(peer_id),
        }
    }

    /// Filter for the user's whole inbox.
    pub fn inbox(table: impl Into<String>, user_id: UserId) -> Self {
        Self {
            table: table.into(),
            user_id,
            peer_id: None,
        }
    }

    /// Returns true if the filter selects this row.
    pub fn matches(&self, row: &Value) -> bool {
        let sender = row.get("sender_id").and_then(Value::as_str);
        let recipient = row.get("recipient_id").and_then(Value::as_str);
        let (Some(sender), Some(recipient)) = (sender, recipient) else {
            return false;
        };

        match &self.peer_id {
            Some(peer) => {
                let a = self.user_id.as_str();
                let b = peer.as_str();
                (sender == a && recipient == b) || (sender == b && recipient == a)
            }
            None => sender == self.user_id.as_str() || recipient == self.user_id.as_str(),
        }
    }
}

/// Events a subscription delivers, in backend emission order.
///
/// Connection-status transitions arrive in-band on the same queue as row
/// changes so a consumer observes them in order. No ordering holds across
/// two independently-opened channels.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The backend acknowledged the subscription.
    Subscribed,
    /// The channel failed; the subscription is dead until reopened.
    ChannelError(String),
    /// A committed row change matching the filter.
    Change(RowChange),
}

/// The pub/sub collaborator.
///
/// Covers both durable row-change subscriptions and the transient
/// broadcast channels used for typing signals.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Opens a row-change subscription; events flow into `events`.
    async fn subscribe(
        &self,
        filter: ChangeFilter,
        events: mpsc::Sender<ChannelEvent>,
    ) -> SyncResult<SubscriptionId>;

    /// Releases a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> SyncResult<()>;

    /// Emits one ephemeral event on a broadcast channel.
    async fn broadcast(&self, channel: &str, event: TypingEvent) -> SyncResult<()>;

    /// Listens for broadcast events on a channel.
    async fn subscribe_broadcast(
        &self,
        channel: &str,
        events: mpsc::Sender<TypingEvent>,
    ) -> SyncResult<SubscriptionId>;
}

struct RowSub {
    id: SubscriptionId,
    filter: ChangeFilter,
    events: mpsc::Sender<ChannelEvent>,
}

struct BroadcastSub {
    id: SubscriptionId,
    channel: String,
    events: mpsc::Sender<TypingEvent>,
}

/// Scriptable in-memory pub/sub for tests.
///
/// Tests inject row changes and broadcasts, script subscribe failures for
/// the reconnect paths, and inspect live subscription counts for the
/// duplicate-delivery invariant.
pub struct MockPubSub {
    next_id: AtomicU64,
    row_subs: Mutex<Vec<RowSub>>,
    broadcast_subs: Mutex<Vec<BroadcastSub>>,
    sent_broadcasts: Mutex<Vec<(String, TypingEvent)>>,
    subscribe_failures: AtomicU32,
    auto_ack: AtomicBool,
}

impl MockPubSub {
    /// Creates a mock that acknowledges subscriptions immediately.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            row_subs: Mutex::new(Vec::new()),
            broadcast_subs: Mutex::new(Vec::new()),
            sent_broadcasts: Mutex::new(Vec::new()),
            subscribe_failures: AtomicU32::new(0),
            auto_ack: AtomicBool::new(true),
        }
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn set_subscribe_failures(&self, count: u32) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// Controls whether new subscriptions get an immediate `Subscribed` ack.
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.auto_ack.store(auto_ack, Ordering::SeqCst);
    }

    /// Number of live row-change subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.row_subs.lock().len()
    }

    /// Number of live broadcast subscriptions.
    pub fn active_broadcast_subscriptions(&self) -> usize {
        self.broadcast_subs.lock().len()
    }

    /// Broadcasts sent so far, in order.
    pub fn broadcasts(&self) -> Vec<(String, TypingEvent)> {
        self.sent_broadcasts.lock().clone()
    }

    /// Delivers a row change to every subscription whose filter matches.
    ///
    /// Returns how many subscriptions received it.
    pub async fn emit_change(&self, change: RowChange) -> usize {
        let targets: Vec<mpsc::Sender<ChannelEvent>> = {
            let subs = self.row_subs.lock();
            subs.iter()
                .filter(|sub| sub.filter.matches(&change.row))
                .map(|sub| sub.events.clone())
                .collect()
        };

        let mut delivered = 0;
        for events in targets {
            if events.send(ChannelEvent::Change(change.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Delivers a channel error to every live row subscription.
    pub async fn emit_error(&self, message: &str) {
        let targets: Vec<mpsc::Sender<ChannelEvent>> = {
            self.row_subs.lock().iter().map(|sub| sub.events.clone()).collect()
        };
        for events in targets {
            let _ = events
                .send(ChannelEvent::ChannelError(message.to_owned()))
                .await;
        }
    }

    /// Delivers a typing event to every subscriber of `channel`.
    pub async fn emit_broadcast(&self, channel: &str, event: TypingEvent) {
        let targets: Vec<mpsc::Sender<TypingEvent>> = {
            let subs = self.broadcast_subs.lock();
            subs.iter()
                .filter(|sub| sub.channel == channel)
                .map(|sub| sub.events.clone())
                .collect()
        };
        for events in targets {
            let _ = events.send(event.clone()).await;
        }
    }

    fn take_failure(&self) -> bool {
        self.subscribe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for MockPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MockPubSub {
    async fn subscribe(
        &self,
        filter: ChangeFilter,
        events: mpsc::Sender<ChannelEvent>,
    ) -> SyncResult<SubscriptionId> {
        if self.take_failure() {
            return Err(SyncError::SubscriptionFailed("scripted failure".into()));
        }
        let id = self.allocate_id();
        if self.auto_ack.load(Ordering::SeqCst) {
            let _ = events.send(ChannelEvent::Subscribed).await;
        }
        self.row_subs.lock().push(RowSub { id, filter, events });
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> SyncResult<()> {
        self.row_subs.lock().retain(|sub| sub.id != id);
        self.broadcast_subs.lock().retain(|sub| sub.id != id);
        Ok(())
    }

    async fn broadcast(&self, channel: &str, event: TypingEvent) -> SyncResult<()> {
        self.sent_broadcasts
            .lock()
            .push((channel.to_owned(), event.clone()));
        self.emit_broadcast(channel, event).await;
        Ok(())
    }

    async fn subscribe_broadcast(
        &self,
        channel: &str,
        events: mpsc::Sender<TypingEvent>,
    ) -> SyncResult<SubscriptionId> {
        if self.take_failure() {
            return Err(SyncError::SubscriptionFailed("scripted failure".into()));
        }
        let id = self.allocate_id();
        self.broadcast_subs.lock().push(BroadcastSub {
            id,
            channel: channel.to_owned(),
            events,
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_model::ChangeKind;
    use serde_json::json;

    fn row(sender: &str, recipient: &str) -> Value {
        json!({"sender_id": sender, "recipient_id": recipient})
    }

    #[test]
    fn conversation_filter_matches_both_directions() {
        let filter =
            ChangeFilter::conversation("messages", UserId::new("a"), UserId::new("b"));

        assert!(filter.matches(&row("a", "b")));
        assert!(filter.matches(&row("b", "a")));
        assert!(!filter.matches(&row("a", "c")));
        assert!(!filter.matches(&row("c", "b")));
        assert!(!filter.matches(&json!({"sender_id": "a"})));
    }

    #[test]
    fn inbox_filter_matches_any_peer() {
        let filter = ChangeFilter::inbox("messages", UserId::new("a"));

        assert!(filter.matches(&row("a", "x")));
        assert!(filter.matches(&row("y", "a")));
        assert!(!filter.matches(&row("x", "y")));
    }

    #[tokio::test]
    async fn mock_delivers_matching_changes_only() {
        let pubsub = MockPubSub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let filter = ChangeFilter::conversation("messages", UserId::new("a"), UserId::new("b"));
        pubsub.subscribe(filter, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(ChannelEvent::Subscribed));

        let delivered = pubsub.emit_change(RowChange::insert(row("a", "b"))).await;
        assert_eq!(delivered, 1);
        let delivered = pubsub.emit_change(RowChange::insert(row("a", "c"))).await;
        assert_eq!(delivered, 0);

        match rx.recv().await {
            Some(ChannelEvent::Change(change)) => assert_eq!(change.kind, ChangeKind::Insert),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_scripted_failures_run_out() {
        let pubsub = MockPubSub::new();
        pubsub.set_subscribe_failures(2);
        let filter = ChangeFilter::inbox("messages", UserId::new("a"));

        for _ in 0..2 {
            let (tx, _rx) = mpsc::channel(1);
            assert!(pubsub.subscribe(filter.clone(), tx).await.is_err());
        }

        let (tx, _rx) = mpsc::channel(1);
        assert!(pubsub.subscribe(filter, tx).await.is_ok());
        assert_eq!(pubsub.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn mock_broadcast_records_and_delivers() {
        let pubsub = MockPubSub::new();
        let (tx, mut rx) = mpsc::channel(8);
        pubsub.subscribe_broadcast("typing:a:b", tx).await.unwrap();

        let event = TypingEvent::new(UserId::new("b"), true);
        pubsub.broadcast("typing:a:b", event.clone()).await.unwrap();
        pubsub
            .broadcast("typing:x:y", TypingEvent::new(UserId::new("y"), true))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(event));
        assert!(rx.try_recv().is_err());
        assert_eq!(pubsub.broadcasts().len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscription() {
        let pubsub = MockPubSub::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = pubsub
            .subscribe(ChangeFilter::inbox("messages", UserId::new("a")), tx)
            .await
            .unwrap();
        assert_eq!(pubsub.active_subscriptions(), 1);

        pubsub.unsubscribe(id).await.unwrap();
        assert_eq!(pubsub.active_subscriptions(), 0);

        // Unknown ids are ignored.
        pubsub.unsubscribe(SubscriptionId::new(999)).await.unwrap();
    }
}
