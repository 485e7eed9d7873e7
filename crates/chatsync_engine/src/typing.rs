//! Ephemeral typing-presence tracking.

use chatsync_model::TypingEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Tracks the peer's typing flag with automatic expiry.
///
/// A signal that is not refreshed within the expiry window reads as false,
/// so a peer that navigates away mid-type never leaves a stale indicator.
/// Rapid events restart the window (debounced) rather than stacking
/// timers.
pub struct TypingMonitor {
    state: Arc<watch::Sender<bool>>,
    generation: Arc<AtomicU64>,
    expiry: Duration,
}

impl TypingMonitor {
    /// Creates a monitor with the given expiry window.
    pub fn new(expiry: Duration) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            expiry,
        }
    }

    /// Watch channel over the typing flag.
    pub fn is_typing(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Current flag value.
    pub fn snapshot(&self) -> bool {
        *self.state.subscribe().borrow()
    }

    /// Applies an inbound typing event and re-arms the expiry timer.
    ///
    /// Each event advances a generation counter; the timer it spawns only
    /// clears the flag if no newer event superseded it.
    pub fn observe(&self, event: &TypingEvent) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(event.is_typing);

        if event.is_typing {
            let state = Arc::clone(&self.state);
            let latest = Arc::clone(&self.generation);
            let expiry = self.expiry;
            tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                if latest.load(Ordering::SeqCst) == generation {
                    state.send_replace(false);
                }
            });
        }
    }
}
