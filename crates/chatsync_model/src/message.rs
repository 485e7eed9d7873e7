//! Message rows and the delivery lifecycle.

use crate::error::ModelError;
use crate::id::{MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Delivery lifecycle of a message.
///
/// The lifecycle is strictly forward: `Sent` → `Delivered` → `Seen`.
/// A transition that would move backwards is ignored wherever statuses
/// are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Submitted by the sender; no acknowledgment yet.
    Sent,
    /// Received by the recipient's client.
    Delivered,
    /// Viewed by the recipient.
    Seen,
}

impl DeliveryStatus {
    /// Returns the column value used in message rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Seen => "seen",
        }
    }

    /// Parses a column value.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "seen" => Some(DeliveryStatus::Seen),
            _ => None,
        }
    }

    /// Returns true if moving to `next` goes forward in the lifecycle.
    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        next > *self
    }
}

/// Returns the current unix time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A chat message as stored in the messages table.
///
/// Invariant: `viewed_at` is set if and only if the status is `Seen`, and
/// the status never regresses once advanced.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message identity.
    pub id: MessageId,
    /// Sender user id.
    pub sender_id: UserId,
    /// Recipient user id.
    pub recipient_id: UserId,
    /// Message body.
    pub content: String,
    /// Creation time, unix milliseconds.
    pub created_at: i64,
    /// Current delivery state.
    pub delivery_status: DeliveryStatus,
    /// When the recipient viewed the message, if they have.
    pub viewed_at: Option<i64>,
}

impl Message {
    /// Decodes a message from a raw collaborator row.
    ///
    /// Any missing or ill-typed column fails the whole decode rather than
    /// producing a partial message.
    pub fn from_row(row: &Value) -> Result<Self, ModelError> {
        let obj = row
            .as_object()
            .ok_or_else(|| ModelError::NotAnObject(type_name(row).to_owned()))?;

        let id_text = str_column(obj, "id")?;
        let id = MessageId::parse(id_text)
            .ok_or_else(|| ModelError::invalid_column("id", format!("not a uuid: {id_text}")))?;

        let status_text = str_column(obj, "delivery_status")?;
        let delivery_status = DeliveryStatus::parse(status_text).ok_or_else(|| {
            ModelError::invalid_column("delivery_status", format!("unknown status: {status_text}"))
        })?;

        Ok(Self {
            id,
            sender_id: UserId::new(str_column(obj, "sender_id")?),
            recipient_id: UserId::new(str_column(obj, "recipient_id")?),
            content: str_column(obj, "content")?.to_owned(),
            created_at: int_column(obj, "created_at")?,
            delivery_status,
            viewed_at: optional_int_column(obj, "viewed_at")?,
        })
    }

    /// Encodes the message as a collaborator row.
    pub fn to_row(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "sender_id": self.sender_id.as_str(),
            "recipient_id": self.recipient_id.as_str(),
            "content": self.content,
            "created_at": self.created_at,
            "delivery_status": self.delivery_status.as_str(),
            "viewed_at": self.viewed_at,
        })
    }

    /// Merges a newer version of the same row, keeping the status monotonic.
    ///
    /// Returns true if anything changed. A stale event that would move the
    /// status backwards leaves the message untouched.
    pub fn merge_remote(&mut self, newer: &Message) -> bool {
        let mut changed = false;
        if self.delivery_status.can_advance_to(newer.delivery_status) {
            self.delivery_status = newer.delivery_status;
            changed = true;
        }
        if self.delivery_status == DeliveryStatus::Seen
            && newer.viewed_at.is_some()
            && self.viewed_at != newer.viewed_at
        {
            self.viewed_at = newer.viewed_at;
            changed = true;
        }
        changed
    }
}

/// Payload for inserting a new message, before the optimistic copy exists.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Sender user id.
    pub sender_id: UserId,
    /// Recipient user id.
    pub recipient_id: UserId,
    /// Message body.
    pub content: String,
}

impl NewMessage {
    /// Creates a new-message payload.
    pub fn new(sender_id: UserId, recipient_id: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            recipient_id,
            content: content.into(),
        }
    }

    /// Materializes the optimistic local message in `Sent` state.
    pub fn into_message(self, id: MessageId, created_at: i64) -> Message {
        Message {
            id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            content: self.content,
            created_at,
            delivery_status: DeliveryStatus::Sent,
            viewed_at: None,
        }
    }

    /// Encodes the insert row for the persistence collaborator.
    pub fn to_row(&self, id: MessageId, created_at: i64) -> Value {
        json!({
            "id": id.to_string(),
            "sender_id": self.sender_id.as_str(),
            "recipient_id": self.recipient_id.as_str(),
            "content": self.content,
            "created_at": created_at,
            "delivery_status": DeliveryStatus::Sent.as_str(),
            "viewed_at": Value::Null,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn str_column<'a>(obj: &'a Map<String, Value>, column: &'static str) -> Result<&'a str, ModelError> {
    match obj.get(column) {
        None | Some(Value::Null) => Err(ModelError::MissingColumn(column)),
        Some(Value::String(text)) => Ok(text),
        Some(other) => Err(ModelError::invalid_column(
            column,
            format!("expected string, got {}", type_name(other)),
        )),
    }
}

fn int_column(obj: &Map<String, Value>, column: &'static str) -> Result<i64, ModelError> {
    match obj.get(column) {
        None | Some(Value::Null) => Err(ModelError::MissingColumn(column)),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ModelError::invalid_column(column, "not an i64")),
        Some(other) => Err(ModelError::invalid_column(
            column,
            format!("expected integer, got {}", type_name(other)),
        )),
    }
}

fn optional_int_column(
    obj: &Map<String, Value>,
    column: &'static str,
) -> Result<Option<i64>, ModelError> {
    match obj.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| ModelError::invalid_column(column, "not an i64")),
        Some(other) => Err(ModelError::invalid_column(
            column,
            format!("expected integer or null, got {}", type_name(other)),
        )),
    }
}
