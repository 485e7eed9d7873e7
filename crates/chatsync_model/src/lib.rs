//! # chatsync model
//!
//! Shared data types for the chatsync synchronization engine.
//!
//! This crate provides:
//! - `Message` rows and the `DeliveryStatus` lifecycle
//! - Row decoding at the collaborator boundary
//! - Typing and row-change events
//! - Cache, session, and broadcast-channel key derivation
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod events;
mod id;
mod keys;
mod message;

pub use error::{ModelError, ModelResult};
pub use events::{ChangeKind, RowChange, TypingEvent};
pub use id::{MessageId, UserId};
pub use keys::{typing_channel, RequestKey, SessionKey};
pub use message::{now_millis, DeliveryStatus, Message, NewMessage};
