//! Delivery state machine for a conversation's messages.

use crate::store::{MessageStore, Predicate, MESSAGES_TABLE};
use chatsync_model::{
    now_millis, DeliveryStatus, Message, MessageId, RowChange, UserId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

/// Tracks the local view of one conversation and drives delivery-state
/// transitions, independent of how notifications arrive.
///
/// Transitions only ever move forward (`sent` → `delivered` → `seen`), so
/// replaying stale or out-of-order events is harmless. Store writes for
/// delivery acknowledgments are best-effort: a failure is logged and the
/// local state stands.
pub struct DeliveryLog {
    self_id: UserId,
    peer_id: UserId,
    messages: Mutex<Vec<Message>>,
    revision: watch::Sender<u64>,
}

impl DeliveryLog {
    /// Creates an empty log for the conversation between `self_id` and
    /// `peer_id`.
    pub fn new(self_id: UserId, peer_id: UserId) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            self_id,
            peer_id,
            messages: Mutex::new(Vec::new()),
            revision,
        }
    }

    /// Watch channel that ticks on every local state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Snapshot of the conversation, ordered by creation time.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = self.messages.lock().clone();
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.to_uuid().cmp(&b.id.to_uuid()))
        });
        messages
    }

    /// Looks up a message by id.
    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.messages.lock().iter().find(|m| m.id == id).cloned()
    }

    /// Records a just-submitted outgoing message in `Sent` state.
    pub fn record_sent(&self, message: Message) {
        self.messages.lock().push(message);
        self.bump();
    }

    /// Removes an optimistic message whose insert failed.
    pub fn discard(&self, id: MessageId) {
        self.messages.lock().retain(|m| m.id != id);
        self.bump();
    }

    /// Applies a remote row change, decoding at the boundary.
    pub fn apply_remote(&self, change: &RowChange) -> crate::error::SyncResult<()> {
        self.apply_row(&change.row)
    }

    /// Merges one raw row into the local view.
    ///
    /// Rows outside this conversation are ignored; the channel filter
    /// should already exclude them. Unknown rows are inserted, known rows
    /// merged through the monotonic guard.
    pub fn apply_row(&self, row: &Value) -> crate::error::SyncResult<()> {
        let incoming = Message::from_row(row)?;
        if !self.involves(&incoming) {
            return Ok(());
        }

        let changed = {
            let mut messages = self.messages.lock();
            match messages.iter_mut().find(|m| m.id == incoming.id) {
                Some(existing) => existing.merge_remote(&incoming),
                None => {
                    messages.push(incoming);
                    true
                }
            }
        };
        if changed {
            self.bump();
        }
        Ok(())
    }

    /// Marks inbound messages from the peer as `Delivered`.
    ///
    /// Applies to all unmarked messages, or to just one when `message_id`
    /// is given. Only `Sent` messages move; anything already `Delivered`
    /// or `Seen` stays put. The matching store patch is issued once and
    /// its failure is logged, never surfaced.
    pub async fn mark_delivered<S: MessageStore + ?Sized>(
        &self,
        store: &S,
        message_id: Option<MessageId>,
    ) {
        let advanced = {
            let mut messages = self.messages.lock();
            let mut advanced = 0u32;
            for message in messages.iter_mut().filter(|m| {
                m.sender_id == self.peer_id
                    && m.recipient_id == self.self_id
                    && m.delivery_status == DeliveryStatus::Sent
                    && message_id.is_none_or(|id| m.id == id)
            }) {
                message.delivery_status = DeliveryStatus::Delivered;
                advanced += 1;
            }
            advanced
        };
        if advanced == 0 {
            return;
        }
        self.bump();

        let mut predicate = Predicate::new()
            .eq("sender_id", self.peer_id.as_str())
            .eq("recipient_id", self.self_id.as_str())
            .eq("delivery_status", DeliveryStatus::Sent.as_str());
        if let Some(id) = message_id {
            predicate = predicate.eq("id", id.to_string());
        }
        let patch = json!({ "delivery_status": DeliveryStatus::Delivered.as_str() });

        if let Err(error) = store.update(MESSAGES_TABLE, &predicate, patch).await {
            tracing::warn!(%error, "delivery acknowledgment write failed");
        }
    }

    /// Marks every unseen message from the peer as `Seen` and stamps
    /// `viewed_at`.
    ///
    /// Idempotent: the local viewed-at guard gates the store write, so a
    /// second call with nothing left unseen issues zero writes. The store
    /// predicate carries the same `viewed_at IS NULL` guard for rows this
    /// client has not loaded yet.
    pub async fn mark_all_seen<S: MessageStore + ?Sized>(&self, store: &S) {
        let viewed_at = now_millis();
        let advanced = {
            let mut messages = self.messages.lock();
            let mut advanced = 0u32;
            for message in messages.iter_mut().filter(|m| {
                m.sender_id == self.peer_id
                    && m.recipient_id == self.self_id
                    && m.viewed_at.is_none()
            }) {
                message.delivery_status = DeliveryStatus::Seen;
                message.viewed_at = Some(viewed_at);
                advanced += 1;
            }
            advanced
        };
        if advanced == 0 {
            return;
        }
        self.bump();

        let predicate = Predicate::new()
            .eq("sender_id", self.peer_id.as_str())
            .eq("recipient_id", self.self_id.as_str())
            .is_null("viewed_at");
        let patch = json!({
            "delivery_status": DeliveryStatus::Seen.as_str(),
            "viewed_at": viewed_at,
        });

        if let Err(error) = store.update(MESSAGES_TABLE, &predicate, patch).await {
            tracing::warn!(%error, "seen acknowledgment write failed");
        }
    }

    fn involves(&self, message: &Message) -> bool {
        (message.sender_id == self.self_id && message.recipient_id == self.peer_id)
            || (message.sender_id == self.peer_id && message.recipient_id == self.self_id)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}
