//! End-to-end tests for the synchronization engine.
//!
//! Two engines share one in-memory store and one mock pub/sub, standing in
//! for two clients talking through the same backend. The tests replay the
//! backend's change notifications by emitting each stored row after the
//! write, the way the real channel would.

use chatsync_engine::{
    ChannelStatus, ChatSync, MemoryStore, MockPubSub, SessionNotice, SyncConfig, MESSAGES_TABLE,
};
use chatsync_model::{DeliveryStatus, RowChange, UserId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

struct Backend {
    store: Arc<MemoryStore>,
    pubsub: Arc<MockPubSub>,
}

impl Backend {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            store: Arc::new(MemoryStore::new()),
            pubsub: Arc::new(MockPubSub::new()),
        }
    }

    fn client(&self, name: &str) -> ChatSync<MemoryStore, MockPubSub> {
        ChatSync::new(
            UserId::new(name),
            Arc::clone(&self.store),
            Arc::clone(&self.pubsub),
            SyncConfig::default(),
        )
    }

    fn row(&self, index: usize) -> Value {
        self.store.rows(MESSAGES_TABLE)[index].clone()
    }

    /// Replays the current state of a stored row as an update notification.
    async fn notify_update(&self, index: usize) -> usize {
        self.pubsub
            .emit_change(RowChange::update(self.row(index)))
            .await
    }

    async fn notify_insert(&self, index: usize) -> usize {
        self.pubsub
            .emit_change(RowChange::insert(self.row(index)))
            .await
    }

    /// Waits for the expected number of live row subscriptions; session
    /// pumps register theirs asynchronously after `connect` returns.
    async fn wait_for_subscriptions(&self, expected: usize) {
        let pubsub = Arc::clone(&self.pubsub);
        wait_until(move || pubsub.active_subscriptions() == expected).await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn full_delivery_lifecycle_across_two_clients() {
    let backend = Backend::new();
    let alice = backend.client("alice");
    let bob = backend.client("bob");

    alice.connect(UserId::new("bob")).await.unwrap();
    bob.connect(UserId::new("alice")).await.unwrap();
    backend.wait_for_subscriptions(2).await;

    // Alice sends; the optimistic copy is visible immediately.
    let sent = alice.send_message("hello bob").await.unwrap();
    assert_eq!(sent.delivery_status, DeliveryStatus::Sent);
    assert_eq!(backend.store.rows(MESSAGES_TABLE).len(), 1);

    // The backend notifies both conversations of the insert. Bob's client
    // acknowledges receipt.
    assert_eq!(backend.notify_insert(0).await, 2);
    wait_until(|| {
        bob.messages()
            .unwrap()
            .first()
            .is_some_and(|m| m.delivery_status == DeliveryStatus::Delivered)
    })
    .await;
    assert_eq!(backend.row(0)["delivery_status"], "delivered");

    // The delivered update reaches Alice.
    backend.notify_update(0).await;
    wait_until(|| {
        alice
            .messages()
            .unwrap()
            .first()
            .is_some_and(|m| m.delivery_status == DeliveryStatus::Delivered)
    })
    .await;

    // Bob opens the conversation view; everything inbound becomes seen.
    bob.mark_all_seen().await.unwrap();
    assert_eq!(backend.row(0)["delivery_status"], "seen");

    backend.notify_update(0).await;
    wait_until(|| {
        alice
            .messages()
            .unwrap()
            .first()
            .is_some_and(|m| m.delivery_status == DeliveryStatus::Seen)
    })
    .await;
    assert!(alice.messages().unwrap()[0].viewed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn reopening_a_conversation_never_duplicates_processing() {
    let backend = Backend::new();
    let bob = backend.client("bob");

    bob.connect(UserId::new("alice")).await.unwrap();
    bob.connect(UserId::new("alice")).await.unwrap();

    let alice = backend.client("alice");
    alice.connect(UserId::new("bob")).await.unwrap();
    alice.send_message("once").await.unwrap();

    // One subscription per open conversation, despite the double connect.
    backend.wait_for_subscriptions(2).await;
    let delivered = backend.notify_insert(0).await;
    assert_eq!(delivered, 2);

    wait_until(|| !bob.messages().unwrap().is_empty()).await;
    assert_eq!(bob.messages().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn channel_recovers_after_a_transient_failure() {
    let backend = Backend::new();
    let bob = backend.client("bob");
    bob.connect(UserId::new("alice")).await.unwrap();
    backend.wait_for_subscriptions(1).await;

    let mut status = bob.status_changes().unwrap();
    assert!(status.borrow().is_connected());

    // The channel drops and the first resubscribe attempt fails too.
    backend.pubsub.set_subscribe_failures(1);
    backend.pubsub.emit_error("socket reset").await;

    timeout(Duration::from_secs(60), async {
        loop {
            status.changed().await.unwrap();
            if status.borrow().is_connected() {
                return;
            }
        }
    })
    .await
    .unwrap();

    // Live updates flow again after the recovery.
    let alice = backend.client("alice");
    alice.connect(UserId::new("bob")).await.unwrap();
    alice.send_message("back online").await.unwrap();
    backend.wait_for_subscriptions(2).await;
    backend.notify_insert(0).await;

    wait_until(|| !bob.messages().unwrap().is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn connectivity_loss_is_reported_to_the_user() {
    let backend = Backend::new();
    let bob = backend.client("bob");
    let mut notices = bob.notices().unwrap();

    bob.connect(UserId::new("alice")).await.unwrap();
    backend.wait_for_subscriptions(1).await;

    backend.pubsub.set_subscribe_failures(u32::MAX);
    backend.pubsub.emit_error("backend gone").await;

    let notice = timeout(Duration::from_secs(600), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(notice, SessionNotice::ConnectivityLost { .. }));
    assert_eq!(bob.connection_status(), ChannelStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_travels_and_expires() {
    let backend = Backend::new();
    let alice = backend.client("alice");
    let bob = backend.client("bob");
    alice.connect(UserId::new("bob")).await.unwrap();
    bob.connect(UserId::new("alice")).await.unwrap();

    let mut bob_sees = bob.peer_is_typing().unwrap();
    let mut alice_sees = alice.peer_is_typing().unwrap();

    alice.send_typing(true).await.unwrap();
    timeout(Duration::from_secs(1), bob_sees.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(*bob_sees.borrow());

    // The signal is directional; Alice's own indicator stays off.
    assert!(!*alice_sees.borrow());
    assert!(!alice_sees.has_changed().unwrap());

    // Alice stops typing without saying so; the flag expires on its own.
    sleep(Duration::from_millis(3500)).await;
    assert!(!*bob_sees.borrow());
}

#[tokio::test(start_paused = true)]
async fn offline_backlog_is_loaded_and_acknowledged() {
    let backend = Backend::new();

    // Alice messaged while Bob was offline.
    let alice = backend.client("alice");
    alice.connect(UserId::new("bob")).await.unwrap();
    alice.send_message("first").await.unwrap();
    alice.send_message("second").await.unwrap();
    alice.close().await;

    let bob = backend.client("bob");
    bob.connect(UserId::new("alice")).await.unwrap();

    let messages = bob.messages().unwrap();
    assert_eq!(messages.len(), 2);
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.contains(&"first") && contents.contains(&"second"));
    assert!(messages
        .iter()
        .all(|m| m.delivery_status == DeliveryStatus::Delivered));

    bob.mark_all_seen().await.unwrap();
    for row in backend.store.rows(MESSAGES_TABLE) {
        assert_eq!(row["delivery_status"], "seen");
        assert!(row["viewed_at"].is_number());
    }
}
