// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Relay
//!
//! One logical connection per relay URL. A relay owns its IO tasks and
//! broadcasts everything it receives as [`RelayNotification`]s; subscriptions
//! and publishes are built on top of that stream.

use std::fmt;
use std::time::Duration;

use nostr::{Event, EventId, Filter, RelayUrl, SubscriptionId};
use tokio::sync::broadcast;

pub mod constants;
mod error;
mod inner;
mod status;

pub use self::error::Error;
use self::inner::InnerRelay;
pub(crate) use self::inner::is_auth_required;
pub use self::status::RelayStatus;

/// Relay notification
#[derive(Debug, Clone)]
pub enum RelayNotification {
    /// Received an event matching a subscription
    Event {
        /// Subscription ID
        subscription_id: SubscriptionId,
        /// Event
        event: Box<Event>,
    },
    /// Stored events for a subscription are exhausted; what follows is live
    EndOfStoredEvents {
        /// Subscription ID
        subscription_id: SubscriptionId,
    },
    /// The relay closed a subscription
    Closed {
        /// Subscription ID
        subscription_id: SubscriptionId,
        /// Raw reason
        message: String,
    },
    /// Acknowledgement of a published event
    Ok {
        /// Event ID
        event_id: EventId,
        /// Whether the event was accepted
        accepted: bool,
        /// Raw message
        message: String,
    },
    /// Connection status changed
    Status {
        /// New status
        status: RelayStatus,
    },
}

/// Relay
#[derive(Clone)]
pub struct Relay {
    inner: InnerRelay,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.inner.url)
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for Relay {
    fn eq(&self, other: &Self) -> bool {
        self.inner.url == other.inner.url
    }
}

impl Eq for Relay {}

impl Relay {
    pub(crate) fn new(url: RelayUrl, state: crate::shared::SharedState) -> Self {
        Self {
            inner: InnerRelay::new(url, state),
        }
    }

    /// Get the relay URL.
    #[inline]
    pub fn url(&self) -> &RelayUrl {
        &self.inner.url
    }

    #[inline]
    pub(crate) fn state(&self) -> &crate::shared::SharedState {
        &self.inner.state
    }

    /// Get the current connection status.
    #[inline]
    pub fn status(&self) -> RelayStatus {
        self.inner.status()
    }

    /// Get a new notification listener.
    #[inline]
    pub fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        self.inner.notification_sender.subscribe()
    }

    /// Connect if not already connected.
    #[inline]
    pub async fn ensure_connected(&self, timeout: Duration) -> Result<(), Error> {
        self.inner.ensure_connected(timeout).await
    }

    /// Publish an event and wait for the acknowledgement.
    #[inline]
    pub async fn publish(&self, event: &Event, timeout: Duration) -> Result<(), Error> {
        self.inner.publish(event, timeout).await
    }

    /// Answer the last authentication challenge received from this relay.
    #[inline]
    pub async fn authenticate(&self) -> Result<(), Error> {
        self.inner.authenticate().await
    }

    /// Open a subscription.
    ///
    /// Events and the end-of-stored-events signal arrive as notifications;
    /// nothing is deduplicated or aggregated at this level.
    #[inline]
    pub fn subscribe(&self, id: SubscriptionId, filters: Vec<Filter>) -> Result<(), Error> {
        self.inner.subscribe(id, filters)
    }

    /// Close a subscription.
    #[inline]
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Error> {
        self.inner.unsubscribe(id)
    }

    /// Disconnect on purpose. The relay will not be retried.
    #[inline]
    pub fn disconnect(&self) {
        self.inner.disconnect()
    }
}
