//! Error types for the synchronization engine.

use chatsync_model::ModelError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the synchronization engine.
///
/// The variants are `Clone` because the request coordinator fans a single
/// outcome out to every deduplicated or batched waiter. Collaborator
/// failures are therefore carried as rendered messages, never as foreign
/// error values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or channel failure reported by a collaborator.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A request exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Every retry attempt failed with a transient error.
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The final attempt's error.
        last: String,
    },

    /// The persistence collaborator rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// A collaborator row failed to decode.
    #[error("row decode failed: {0}")]
    Decode(#[from] ModelError),

    /// The pub/sub collaborator refused a subscription.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    /// A session or internal queue closed while an operation was waiting.
    #[error("channel closed")]
    ChannelClosed,

    /// A primary send failed; the caller must explicitly resend.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A conversation operation was invoked with no conversation open.
    #[error("no conversation open")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    ///
    /// Decode failures and primary-send failures are never retried;
    /// retrying a send risks a duplicate message.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout(_) => true,
            SyncError::Store(_) => true,
            SyncError::SubscriptionFailed(_) => true,
            _ => false,
        }
    }
}
