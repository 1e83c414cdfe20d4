// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Relay transport
//!
//! The wire protocol is a given primitive: send a filter, receive events,
//! receive an end-of-stored-events signal, receive a close. Implementations
//! map these frames onto whatever framing the platform provides; this crate
//! never looks below them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, Stream};
use nostr::util::BoxedFuture;
use nostr::{Event, EventId, Filter, RelayUrl, SubscriptionId};

pub mod error;

pub use self::error::TransportError;

/// Frame sent to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Publish an event.
    Publish(Box<Event>),
    /// Answer an authentication challenge.
    Auth(Box<Event>),
    /// Open a subscription.
    Req {
        /// Subscription ID
        id: SubscriptionId,
        /// Filters
        filters: Vec<Filter>,
    },
    /// Close a subscription.
    Close(SubscriptionId),
}

/// Frame received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    /// An event matching a subscription.
    Event {
        /// Subscription ID
        subscription_id: SubscriptionId,
        /// Event
        event: Box<Event>,
    },
    /// End of stored events for a subscription.
    EndOfStoredEvents(SubscriptionId),
    /// The relay closed a subscription, with its raw reason string.
    Closed {
        /// Subscription ID
        subscription_id: SubscriptionId,
        /// Raw reason
        message: String,
    },
    /// Acknowledgement (or rejection) of a published event.
    Ok {
        /// Event ID
        event_id: EventId,
        /// Whether the event was accepted
        accepted: bool,
        /// Raw message (machine-readable prefix + human text)
        message: String,
    },
    /// Authentication challenge.
    Auth {
        /// Challenge string
        challenge: String,
    },
}

/// Transport sink half
pub type BoxSink = Box<dyn Sink<ClientFrame, Error = TransportError> + Send + Unpin>;
/// Transport stream half
pub type BoxStream = Box<dyn Stream<Item = Result<RelayFrame, TransportError>> + Send + Unpin>;

#[doc(hidden)]
pub trait IntoTransport {
    fn into_transport(self) -> Arc<dyn Transport>;
}

impl IntoTransport for Arc<dyn Transport> {
    fn into_transport(self) -> Arc<dyn Transport> {
        self
    }
}

impl<T> IntoTransport for T
where
    T: Transport + Sized + 'static,
{
    fn into_transport(self) -> Arc<dyn Transport> {
        Arc::new(self)
    }
}

impl<T> IntoTransport for Arc<T>
where
    T: Transport + 'static,
{
    fn into_transport(self) -> Arc<dyn Transport> {
        self
    }
}

/// Relay transport
pub trait Transport: fmt::Debug + Send + Sync {
    /// Establish a link to a relay.
    ///
    /// Must resolve within `timeout` or return an error.
    fn connect<'a>(
        &'a self,
        url: &'a RelayUrl,
        timeout: Duration,
    ) -> BoxedFuture<'a, Result<(BoxSink, BoxStream), TransportError>>;
}
