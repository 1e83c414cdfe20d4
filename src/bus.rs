// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! In-process event bus
//!
//! Carries events this process just published (or freshly revalidated), so
//! live subscriptions can merge them without a relay round-trip.

use nostr::Event;
use tokio::sync::broadcast;

const DEFAULT_CHANNEL_SIZE: usize = 1024;

/// In-process event bus
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_SIZE)
    }
}

impl EventBus {
    /// Create a new bus with a custom channel size.
    pub fn new(size: usize) -> Self {
        let (sender, ..) = broadcast::channel(size);
        Self { sender }
    }

    /// Emit an event to every listener.
    ///
    /// Lagging or absent listeners are not an error.
    #[inline]
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Get a new listener.
    ///
    /// Only events emitted after this call are received.
    #[inline]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}
