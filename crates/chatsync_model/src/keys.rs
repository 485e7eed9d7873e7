//! Cache, session, and broadcast-channel key derivation.

use crate::id::UserId;
use serde_json::Value;
use std::fmt;

/// Cache key for deduplicated requests.
///
/// Derived purely from (table, operation, normalized parameters) so
/// unrelated conversations never collide and identical concurrent calls
/// always do. JSON objects serialize with sorted keys, which normalizes
/// parameter order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    /// Derives a key from a table, an operation name, and its parameters.
    pub fn new(table: &str, operation: &str, params: &Value) -> Self {
        Self(format!("{table}:{operation}:{params}"))
    }

    /// Returns the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one logical channel session.
///
/// At most one subscription may be live per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// The local user.
    pub self_id: UserId,
    /// Peer restriction; `None` watches the whole inbox.
    pub peer_id: Option<UserId>,
}

impl SessionKey {
    /// Session key for a one-to-one conversation.
    pub fn conversation(self_id: UserId, peer_id: UserId) -> Self {
        Self {
            self_id,
            peer_id: Some(peer_id),
        }
    }

    /// Session key for the global inbox.
    pub fn inbox(self_id: UserId) -> Self {
        Self {
            self_id,
            peer_id: None,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer_id {
            Some(peer) => write!(f, "messages:{}:{}", self.self_id, peer),
            None => write!(f, "messages:{}:all", self.self_id),
        }
    }
}

/// Broadcast channel name for typing signals addressed to `recipient`.
///
/// The sender broadcasts on `typing_channel(peer, self)`; the receiver
/// listens on `typing_channel(self, peer)`.
pub fn typing_channel(recipient: &UserId, sender: &UserId) -> String {
    format!("typing:{recipient}:{sender}")
}
