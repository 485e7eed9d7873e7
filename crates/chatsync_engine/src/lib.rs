//! # chatsync engine
//!
//! Client-side realtime synchronization engine for one-to-one chat.
//!
//! This crate provides:
//! - Delivery-state tracking (sent → delivered → seen)
//! - Typing presence with automatic expiry
//! - Channel sessions with bounded reconnection
//! - Request deduplication, rate limiting, and batching
//! - A single [`ChatSync`] facade the UI talks to
//!
//! ## Architecture
//!
//! The engine is a **local-first mirror** of the backend's message rows:
//! 1. Opening a conversation subscribes to row changes, then loads history
//! 2. Remote changes merge into the local view through a monotonic guard
//! 3. Local operations apply optimistically, then persist
//!
//! Backend collaborators are reached only through the [`MessageStore`] and
//! [`PubSub`] traits, so the engine carries no network code of its own.
//!
//! ## Key Invariants
//!
//! - Delivery state never moves backwards
//! - At most one live subscription per session key
//! - Acknowledgment writes are best-effort; local state stands on failure
//! - Primary sends never auto-retry

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dedup;
mod delivery;
mod error;
mod facade;
mod pubsub;
mod session;
mod store;
mod typing;

pub use config::{BatchConfig, RateLimitConfig, RetryConfig, SyncConfig};
pub use dedup::{RequestCoordinator, RequestOptions};
pub use delivery::DeliveryLog;
pub use error::{SyncError, SyncResult};
pub use facade::ChatSync;
pub use pubsub::{ChangeFilter, ChannelEvent, MockPubSub, PubSub, SubscriptionId};
pub use session::{ChannelSession, ChannelStatus, SessionEvent, SessionManager, SessionNotice};
pub use store::{Filter, MemoryStore, MessageStore, Predicate, MESSAGES_TABLE};
pub use typing::TypingMonitor;
