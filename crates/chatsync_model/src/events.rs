//! Events delivered by the pub/sub collaborator.

use crate::id::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A row was created.
    Insert,
    /// An existing row was mutated.
    Update,
}

/// A committed row change on a watched table.
///
/// The row payload stays untyped here; decoding happens at the consumer
/// boundary so a malformed row is a reported error, not a partial object.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Whether the row was inserted or updated.
    pub kind: ChangeKind,
    /// Raw row payload.
    pub row: Value,
}

impl RowChange {
    /// Creates an insert change.
    pub fn insert(row: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            row,
        }
    }

    /// Creates an update change.
    pub fn update(row: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            row,
        }
    }
}

/// Ephemeral typing signal broadcast between two peers.
///
/// Typing signals are never persisted; a receiver treats a signal with no
/// refresh inside the expiry window as false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    /// Who is (or stopped) typing.
    pub sender_id: UserId,
    /// The typing flag.
    pub is_typing: bool,
}

impl TypingEvent {
    /// Creates a typing event.
    pub fn new(sender_id: UserId, is_typing: bool) -> Self {
        Self {
            sender_id,
            is_typing,
        }
    }
}
