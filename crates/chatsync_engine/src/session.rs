//! Channel session lifecycle and reconnection.

use crate::config::RetryConfig;
use crate::pubsub::{ChangeFilter, ChannelEvent, PubSub, SubscriptionId};
use crate::store::MESSAGES_TABLE;
use chatsync_model::{RowChange, SessionKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Connection status of a channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Waiting for the backend to acknowledge the subscription.
    Connecting,
    /// The subscription is live.
    Connected,
    /// The channel is down; either a retry is pending or the session gave
    /// up and must be reopened.
    Disconnected,
}

impl ChannelStatus {
    /// Returns true if events are flowing.
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelStatus::Connected)
    }
}

/// User-visible notices emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// Reconnect attempts were exhausted; the session stays down until it
    /// is explicitly reopened.
    ConnectivityLost {
        /// How many attempts were made.
        attempts: u32,
    },
}

/// Events a session forwards to its consumer, in backend emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A row change from the backend.
    Change(RowChange),
    /// A user-visible notice.
    Notice(SessionNotice),
}

/// One logical subscription for a conversation or the global inbox.
///
/// The session keeps the subscription alive across transient channel
/// errors with exponential backoff, bounded by the retry budget. Closing
/// flips the active flag before anything else, so event dispatch stops
/// synchronously from the caller's perspective even while the underlying
/// unsubscribe is still in flight.
pub struct ChannelSession<P: PubSub> {
    pubsub: Arc<P>,
    active: Arc<AtomicBool>,
    status: Arc<watch::Sender<ChannelStatus>>,
    current_sub: Arc<Mutex<Option<SubscriptionId>>>,
    pump: JoinHandle<()>,
}

impl<P: PubSub + 'static> ChannelSession<P> {
    /// Opens a session and starts its event pump.
    ///
    /// Row changes and notices flow into `out`; status transitions are
    /// surfaced through [`ChannelSession::status`].
    pub fn open(
        pubsub: Arc<P>,
        key: SessionKey,
        out: mpsc::Sender<SessionEvent>,
        reconnect: RetryConfig,
        queue_capacity: usize,
    ) -> Self {
        let filter = match key.peer_id.clone() {
            Some(peer) => ChangeFilter::conversation(MESSAGES_TABLE, key.self_id.clone(), peer),
            None => ChangeFilter::inbox(MESSAGES_TABLE, key.self_id.clone()),
        };

        let active = Arc::new(AtomicBool::new(true));
        let (status_tx, _) = watch::channel(ChannelStatus::Connecting);
        let status = Arc::new(status_tx);
        let current_sub = Arc::new(Mutex::new(None));

        let pump = tokio::spawn(run_pump(
            Arc::clone(&pubsub),
            filter,
            key,
            out,
            reconnect,
            queue_capacity,
            Arc::clone(&active),
            Arc::clone(&status),
            Arc::clone(&current_sub),
        ));

        Self {
            pubsub,
            active,
            status,
            current_sub,
            pump,
        }
    }

    /// Watch channel over the connection status.
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// Closes the session.
    ///
    /// Dispatch stops before the first await point; the unsubscribe then
    /// completes in the background of the call.
    pub async fn close(self) {
        self.active.store(false, Ordering::SeqCst);
        self.status.send_replace(ChannelStatus::Disconnected);
        self.pump.abort();

        let sub = self.current_sub.lock().take();
        if let Some(id) = sub {
            let _ = self.pubsub.unsubscribe(id).await;
        }
    }
}

/// Subscribe, pump events, and reconnect with backoff on channel errors.
#[allow(clippy::too_many_arguments)]
async fn run_pump<P: PubSub>(
    pubsub: Arc<P>,
    filter: ChangeFilter,
    key: SessionKey,
    out: mpsc::Sender<SessionEvent>,
    reconnect: RetryConfig,
    queue_capacity: usize,
    active: Arc<AtomicBool>,
    status: Arc<watch::Sender<ChannelStatus>>,
    current_sub: Arc<Mutex<Option<SubscriptionId>>>,
) {
    let mut attempt: u32 = 0;

    'reconnect: loop {
        if !active.load(Ordering::SeqCst) {
            return;
        }
        status.send_replace(ChannelStatus::Connecting);

        let (events_tx, mut events_rx) = mpsc::channel(queue_capacity);
        let sub_id = match pubsub.subscribe(filter.clone(), events_tx).await {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(session = %key, %error, "channel subscribe failed");
                status.send_replace(ChannelStatus::Disconnected);
                if !backoff(&mut attempt, &reconnect, &key, &out, &active).await {
                    return;
                }
                continue 'reconnect;
            }
        };
        *current_sub.lock() = Some(sub_id);
        tracing::debug!(session = %key, sub = sub_id.raw(), "channel subscribed");

        while let Some(event) = events_rx.recv().await {
            if !active.load(Ordering::SeqCst) {
                let _ = pubsub.unsubscribe(sub_id).await;
                return;
            }
            match event {
                ChannelEvent::Subscribed => {
                    attempt = 0;
                    status.send_replace(ChannelStatus::Connected);
                }
                ChannelEvent::Change(change) => {
                    if out.send(SessionEvent::Change(change)).await.is_err() {
                        // Consumer went away; the session is dead weight.
                        let _ = pubsub.unsubscribe(sub_id).await;
                        return;
                    }
                }
                ChannelEvent::ChannelError(message) => {
                    tracing::warn!(session = %key, %message, "channel error");
                    status.send_replace(ChannelStatus::Disconnected);
                    let _ = pubsub.unsubscribe(sub_id).await;
                    *current_sub.lock() = None;
                    if !backoff(&mut attempt, &reconnect, &key, &out, &active).await {
                        return;
                    }
                    continue 'reconnect;
                }
            }
        }

        // The collaborator dropped its sender; treat it like a channel error.
        if !active.load(Ordering::SeqCst) {
            return;
        }
        status.send_replace(ChannelStatus::Disconnected);
        let _ = pubsub.unsubscribe(sub_id).await;
        *current_sub.lock() = None;
        if !backoff(&mut attempt, &reconnect, &key, &out, &active).await {
            return;
        }
    }
}

/// Waits out the backoff delay before the next reconnect attempt.
///
/// Returns false once the attempt budget is spent, after emitting the
/// user-visible connectivity notice.
async fn backoff(
    attempt: &mut u32,
    reconnect: &RetryConfig,
    key: &SessionKey,
    out: &mpsc::Sender<SessionEvent>,
    active: &AtomicBool,
) -> bool {
    *attempt += 1;
    if *attempt >= reconnect.max_attempts {
        tracing::error!(session = %key, attempts = *attempt, "channel reconnect attempts exhausted");
        let _ = out
            .send(SessionEvent::Notice(SessionNotice::ConnectivityLost {
                attempts: *attempt,
            }))
            .await;
        return false;
    }

    let delay = reconnect.delay_for_attempt(*attempt);
    tracing::debug!(session = %key, attempt = *attempt, ?delay, "scheduling channel reconnect");
    sleep(delay).await;
    active.load(Ordering::SeqCst)
}

/// Owns at most one live session per [`SessionKey`].
///
/// Opening a key that already has a session closes the old one first, so
/// duplicate subscriptions (and doubly-processed events) cannot occur.
pub struct SessionManager<P: PubSub> {
    pubsub: Arc<P>,
    reconnect: RetryConfig,
    queue_capacity: usize,
    sessions: Mutex<HashMap<SessionKey, ChannelSession<P>>>,
}

impl<P: PubSub + 'static> SessionManager<P> {
    /// Creates a manager over the given pub/sub collaborator.
    pub fn new(pubsub: Arc<P>, reconnect: RetryConfig, queue_capacity: usize) -> Self {
        Self {
            pubsub,
            reconnect,
            queue_capacity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the session for `key`, closing any previous one for the same
    /// key first.
    pub async fn open(
        &self,
        key: SessionKey,
        out: mpsc::Sender<SessionEvent>,
    ) -> watch::Receiver<ChannelStatus> {
        let previous = self.sessions.lock().remove(&key);
        if let Some(previous) = previous {
            previous.close().await;
        }

        let session = ChannelSession::open(
            Arc::clone(&self.pubsub),
            key.clone(),
            out,
            self.reconnect.clone(),
            self.queue_capacity,
        );
        let status = session.status();

        // A racing open for the same key may have slipped in; close the
        // loser so the invariant holds.
        let displaced = self.sessions.lock().insert(key, session);
        if let Some(displaced) = displaced {
            displaced.close().await;
        }
        status
    }

    /// Closes the session for `key`, if one is open.
    pub async fn close(&self, key: &SessionKey) {
        let session = self.sessions.lock().remove(key);
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Closes every open session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.lock();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close().await;
        }
    }

    /// Returns true if a session is open for `key`.
    pub fn is_open(&self, key: &SessionKey) -> bool {
        self.sessions.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MockPubSub;
    use chatsync_model::UserId;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn convo_key() -> SessionKey {
        SessionKey::conversation(UserId::new("bob"), UserId::new("alice"))
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts)
            .with_initial_delay(Duration::from_millis(10))
            .without_jitter()
    }

    fn manager(pubsub: &Arc<MockPubSub>, max_attempts: u32) -> SessionManager<MockPubSub> {
        SessionManager::new(Arc::clone(pubsub), fast_retry(max_attempts), 16)
    }

    fn row() -> serde_json::Value {
        json!({"sender_id": "alice", "recipient_id": "bob"})
    }

    async fn wait_for_status(
        status: &mut watch::Receiver<ChannelStatus>,
        wanted: ChannelStatus,
    ) {
        timeout(Duration::from_secs(5), async {
            loop {
                if *status.borrow() == wanted {
                    return;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn session_connects_and_forwards_changes() {
        let pubsub = Arc::new(MockPubSub::new());
        let manager = manager(&pubsub, 3);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let mut status = manager.open(convo_key(), out_tx).await;
        wait_for_status(&mut status, ChannelStatus::Connected).await;

        pubsub.emit_change(RowChange::insert(row())).await;

        match out_rx.recv().await {
            Some(SessionEvent::Change(change)) => assert_eq!(change.row, row()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_closes_previous_session() {
        let pubsub = Arc::new(MockPubSub::new());
        let manager = manager(&pubsub, 3);

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let mut status = manager.open(convo_key(), out_tx).await;
        wait_for_status(&mut status, ChannelStatus::Connected).await;

        let (out_tx2, mut out_rx2) = mpsc::channel(16);
        let mut status2 = manager.open(convo_key(), out_tx2).await;
        wait_for_status(&mut status2, ChannelStatus::Connected).await;

        // Only the new subscription is live.
        assert_eq!(pubsub.active_subscriptions(), 1);

        // A single insert reaches the new session exactly once.
        let delivered = pubsub.emit_change(RowChange::insert(row())).await;
        assert_eq!(delivered, 1);
        assert!(matches!(
            out_rx2.recv().await,
            Some(SessionEvent::Change(_))
        ));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_reconnects_and_resets_attempts() {
        let pubsub = Arc::new(MockPubSub::new());
        let manager = manager(&pubsub, 3);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let mut status = manager.open(convo_key(), out_tx).await;
        wait_for_status(&mut status, ChannelStatus::Connected).await;

        pubsub.emit_error("socket reset").await;
        wait_for_status(&mut status, ChannelStatus::Connected).await;

        // Still exactly one live subscription after the reconnect.
        assert_eq!(pubsub.active_subscriptions(), 1);

        // Events flow again.
        pubsub.emit_change(RowChange::insert(row())).await;
        assert!(matches!(
            out_rx.recv().await,
            Some(SessionEvent::Change(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_surface_a_notice() {
        let pubsub = Arc::new(MockPubSub::new());
        // Every subscribe fails, including the reconnect attempts.
        pubsub.set_subscribe_failures(u32::MAX);
        let manager = manager(&pubsub, 3);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let mut status = manager.open(convo_key(), out_tx).await;

        match timeout(Duration::from_secs(10), out_rx.recv()).await.unwrap() {
            Some(SessionEvent::Notice(SessionNotice::ConnectivityLost { attempts })) => {
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        wait_for_status(&mut status, ChannelStatus::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_dispatch_and_unsubscribes() {
        let pubsub = Arc::new(MockPubSub::new());
        let manager = manager(&pubsub, 3);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let mut status = manager.open(convo_key(), out_tx).await;
        wait_for_status(&mut status, ChannelStatus::Connected).await;

        manager.close(&convo_key()).await;
        assert!(!manager.is_open(&convo_key()));
        assert_eq!(pubsub.active_subscriptions(), 0);
        assert_eq!(*status.borrow(), ChannelStatus::Disconnected);

        // Nothing is dispatched after close.
        pubsub.emit_change(RowChange::insert(row())).await;
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn inbox_session_sees_every_peer() {
        let pubsub = Arc::new(MockPubSub::new());
        let manager = manager(&pubsub, 3);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let key = SessionKey::inbox(UserId::new("bob"));
        let mut status = manager.open(key, out_tx).await;
        wait_for_status(&mut status, ChannelStatus::Connected).await;

        pubsub
            .emit_change(RowChange::insert(
                json!({"sender_id": "carol", "recipient_id": "bob"}),
            ))
            .await;
        assert!(matches!(
            out_rx.recv().await,
            Some(SessionEvent::Change(_))
        ));
    }
}
