//! The synchronization facade.
//!
//! [`ChatSync`] is the single entry point a UI talks to. It owns one
//! conversation at a time and wires the channel session, the delivery log,
//! the typing monitor, and the request coordinator together; callers never
//! touch those pieces directly.

use crate::config::SyncConfig;
use crate::dedup::{RequestCoordinator, RequestOptions};
use crate::delivery::DeliveryLog;
use crate::error::{SyncError, SyncResult};
use crate::pubsub::{PubSub, SubscriptionId};
use crate::session::{ChannelStatus, SessionEvent, SessionManager, SessionNotice};
use crate::store::{MessageStore, Predicate, MESSAGES_TABLE};
use crate::typing::TypingMonitor;
use chatsync_model::{
    now_millis, typing_channel, DeliveryStatus, Message, MessageId, NewMessage, RequestKey,
    SessionKey, TypingEvent, UserId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// State for the currently open conversation.
struct Conversation {
    peer_id: UserId,
    key: SessionKey,
    log: Arc<DeliveryLog>,
    typing: Arc<TypingMonitor>,
    typing_sub: SubscriptionId,
    status: watch::Receiver<ChannelStatus>,
    consume: JoinHandle<()>,
    typing_pump: JoinHandle<()>,
}

/// Client-side synchronization engine for one user.
///
/// One conversation is active at a time; [`ChatSync::connect`] to a new
/// peer tears the previous one down first. All message traffic goes
/// through the shared [`RequestCoordinator`], so duplicate concurrent
/// fetches collapse and bursts are throttled.
pub struct ChatSync<S: MessageStore + 'static, P: PubSub + 'static> {
    self_id: UserId,
    store: Arc<S>,
    pubsub: Arc<P>,
    config: SyncConfig,
    coordinator: Arc<RequestCoordinator>,
    sessions: SessionManager<P>,
    conversation: Mutex<Option<Conversation>>,
    notice_tx: mpsc::Sender<SessionNotice>,
    notice_rx: Mutex<Option<mpsc::Receiver<SessionNotice>>>,
}

impl<S: MessageStore + 'static, P: PubSub + 'static> ChatSync<S, P> {
    /// Creates an engine for `self_id` over the given collaborators.
    pub fn new(self_id: UserId, store: Arc<S>, pubsub: Arc<P>, config: SyncConfig) -> Self {
        let coordinator = Arc::new(RequestCoordinator::from_config(&config));
        let sessions = SessionManager::new(
            Arc::clone(&pubsub),
            config.reconnect.clone(),
            config.event_queue_capacity,
        );
        let (notice_tx, notice_rx) = mpsc::channel(config.event_queue_capacity);
        Self {
            self_id,
            store,
            pubsub,
            config,
            coordinator,
            sessions,
            conversation: Mutex::new(None),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
        }
    }

    /// The local user.
    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// The peer of the open conversation, if any.
    pub fn peer_id(&self) -> Option<UserId> {
        self.conversation.lock().as_ref().map(|c| c.peer_id.clone())
    }

    /// Takes the stream of user-visible notices.
    ///
    /// Returns `None` after the first call; the engine produces notices
    /// for the lifetime of the value, across conversations.
    pub fn notices(&self) -> Option<mpsc::Receiver<SessionNotice>> {
        self.notice_rx.lock().take()
    }

    /// Opens the conversation with `peer`.
    ///
    /// Closes any previous conversation, subscribes to row changes and
    /// typing signals, then loads the existing history. A history fetch
    /// failure is returned but leaves the live subscription up; the caller
    /// may retry with [`ChatSync::refresh`].
    pub async fn connect(&self, peer: UserId) -> SyncResult<()> {
        self.close().await;

        let key = SessionKey::conversation(self.self_id.clone(), peer.clone());
        let log = Arc::new(DeliveryLog::new(self.self_id.clone(), peer.clone()));
        let typing = Arc::new(TypingMonitor::new(self.config.typing_expiry));

        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_capacity);
        let status = self.sessions.open(key.clone(), events_tx).await;
        let consume = tokio::spawn(consume_events(
            events_rx,
            Arc::clone(&log),
            Arc::clone(&self.store),
            peer.clone(),
            self.notice_tx.clone(),
        ));

        let channel = typing_channel(&self.self_id, &peer);
        let (typing_tx, mut typing_rx) = mpsc::channel(self.config.event_queue_capacity);
        let typing_sub = match self.pubsub.subscribe_broadcast(&channel, typing_tx).await {
            Ok(id) => id,
            Err(error) => {
                consume.abort();
                self.sessions.close(&key).await;
                return Err(error);
            }
        };
        let typing_pump = {
            let typing = Arc::clone(&typing);
            let peer = peer.clone();
            tokio::spawn(async move {
                while let Some(event) = typing_rx.recv().await {
                    if event.sender_id == peer {
                        typing.observe(&event);
                    }
                }
            })
        };

        *self.conversation.lock() = Some(Conversation {
            peer_id: peer,
            key,
            log,
            typing,
            typing_sub,
            status,
            consume,
            typing_pump,
        });

        self.refresh().await
    }

    /// Closes the open conversation, if any. Safe to call repeatedly.
    pub async fn close(&self) {
        let conversation = self.conversation.lock().take();
        let Some(conversation) = conversation else {
            return;
        };
        conversation.consume.abort();
        conversation.typing_pump.abort();
        if let Err(error) = self.pubsub.unsubscribe(conversation.typing_sub).await {
            tracing::warn!(%error, "typing unsubscribe failed");
        }
        self.sessions.close(&conversation.key).await;
    }

    /// Reloads the conversation history from the store.
    ///
    /// Issues one deduplicated select per message direction and merges the
    /// rows through the delivery log's monotonic guard, so a refresh can
    /// never regress local delivery state. Inbound backlog then gets its
    /// delivered acknowledgment.
    pub async fn refresh(&self) -> SyncResult<()> {
        let (peer, log) = self.open_log()?;

        let directions = [
            (self.self_id.clone(), peer.clone()),
            (peer.clone(), self.self_id.clone()),
        ];
        for (sender, recipient) in directions {
            let predicate = Predicate::new()
                .eq("sender_id", sender.as_str())
                .eq("recipient_id", recipient.as_str());
            let key = RequestKey::new(MESSAGES_TABLE, "select", &predicate.to_params());

            let store = Arc::clone(&self.store);
            let result = self
                .coordinator
                .deduplicate(
                    key,
                    move || {
                        let store = Arc::clone(&store);
                        let predicate = predicate.clone();
                        async move {
                            store
                                .select(MESSAGES_TABLE, &predicate)
                                .await
                                .map(Value::Array)
                        }
                    },
                    RequestOptions::from(&self.config),
                )
                .await?;

            let rows = result.as_array().cloned().unwrap_or_default();
            for row in &rows {
                if let Err(error) = log.apply_row(row) {
                    tracing::warn!(%error, "skipping undecodable history row");
                }
            }
        }

        log.mark_delivered(self.store.as_ref(), None).await;
        Ok(())
    }

    /// Sends a message to the open conversation's peer.
    ///
    /// The message appears locally in `Sent` state before the insert is
    /// issued. The insert never auto-retries; on failure the optimistic
    /// entry is discarded and the caller decides whether to resend.
    pub async fn send_message(&self, content: impl Into<String>) -> SyncResult<Message> {
        let (peer, log) = self.open_log()?;

        let message = NewMessage::new(self.self_id.clone(), peer, content)
            .into_message(MessageId::new(), now_millis());
        log.record_sent(message.clone());

        let row = message.to_row();
        let key = RequestKey::new(MESSAGES_TABLE, "insert", &row);
        let store = Arc::clone(&self.store);
        let result = self
            .coordinator
            .deduplicate(
                key,
                move || {
                    let store = Arc::clone(&store);
                    let row = row.clone();
                    async move { store.insert(MESSAGES_TABLE, row).await }
                },
                RequestOptions::no_retry(self.config.request_timeout),
            )
            .await;

        match result {
            Ok(stored) => {
                if let Err(error) = log.apply_row(&stored) {
                    tracing::warn!(%error, "stored row did not decode");
                }
                Ok(log.get(message.id).unwrap_or(message))
            }
            Err(error) => {
                log.discard(message.id);
                Err(SyncError::SendFailed(error.to_string()))
            }
        }
    }

    /// Marks every unseen inbound message as seen.
    ///
    /// Idempotent; a call with nothing unseen issues no store write.
    pub async fn mark_all_seen(&self) -> SyncResult<()> {
        let (_, log) = self.open_log()?;
        log.mark_all_seen(self.store.as_ref()).await;
        Ok(())
    }

    /// Broadcasts the local user's typing flag to the peer.
    pub async fn send_typing(&self, is_typing: bool) -> SyncResult<()> {
        let (peer, _) = self.open_log()?;
        let channel = typing_channel(&peer, &self.self_id);
        self.pubsub
            .broadcast(&channel, TypingEvent::new(self.self_id.clone(), is_typing))
            .await
    }

    /// Snapshot of the conversation, ordered by creation time.
    pub fn messages(&self) -> SyncResult<Vec<Message>> {
        Ok(self.open_log()?.1.messages())
    }

    /// Watch channel that ticks on every message-list change.
    pub fn message_changes(&self) -> SyncResult<watch::Receiver<u64>> {
        Ok(self.open_log()?.1.changes())
    }

    /// Watch channel over the peer's typing flag.
    pub fn peer_is_typing(&self) -> SyncResult<watch::Receiver<bool>> {
        let guard = self.conversation.lock();
        let conversation = guard.as_ref().ok_or(SyncError::NotConnected)?;
        Ok(conversation.typing.is_typing())
    }

    /// Current connection status, `Disconnected` when nothing is open.
    pub fn connection_status(&self) -> ChannelStatus {
        self.conversation
            .lock()
            .as_ref()
            .map(|c| *c.status.borrow())
            .unwrap_or(ChannelStatus::Disconnected)
    }

    /// Watch channel over the connection status.
    pub fn status_changes(&self) -> SyncResult<watch::Receiver<ChannelStatus>> {
        let guard = self.conversation.lock();
        let conversation = guard.as_ref().ok_or(SyncError::NotConnected)?;
        Ok(conversation.status.clone())
    }

    fn open_log(&self) -> SyncResult<(UserId, Arc<DeliveryLog>)> {
        let guard = self.conversation.lock();
        let conversation = guard.as_ref().ok_or(SyncError::NotConnected)?;
        Ok((conversation.peer_id.clone(), Arc::clone(&conversation.log)))
    }
}

/// Drains session events into the delivery log.
///
/// Inbound messages still in `Sent` state get their delivered
/// acknowledgment here, on receipt. Notices are forwarded to the engine's
/// notice stream.
async fn consume_events<S: MessageStore>(
    mut events: mpsc::Receiver<SessionEvent>,
    log: Arc<DeliveryLog>,
    store: Arc<S>,
    peer: UserId,
    notices: mpsc::Sender<SessionNotice>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Change(change) => match Message::from_row(&change.row) {
                Ok(incoming) => {
                    if let Err(error) = log.apply_row(&change.row) {
                        tracing::warn!(%error, "change row failed to apply");
                        continue;
                    }
                    if incoming.sender_id == peer
                        && incoming.delivery_status == DeliveryStatus::Sent
                    {
                        log.mark_delivered(store.as_ref(), Some(incoming.id)).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "dropping undecodable change row");
                }
            },
            SessionEvent::Notice(notice) => {
                if notices.send(notice).await.is_err() {
                    return;
                }
            }
        }
    }
}
