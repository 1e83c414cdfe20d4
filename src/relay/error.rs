// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

use nostr::event::builder;
use nostr::signer::SignerError;
use thiserror::Error;

use crate::shared::SharedStateError;
use crate::transport::TransportError;

/// [`Relay`](super::Relay) error
#[derive(Debug, Error)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Event builder error
    #[error(transparent)]
    EventBuilder(#[from] builder::Error),
    /// Signer error
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// Shared state error
    #[error(transparent)]
    SharedState(#[from] SharedStateError),
    /// No connection within the timeout; the relay is unreachable for this
    /// operation only and is retried on the next call.
    #[error("connection timeout")]
    ConnectTimeout,
    /// No `OK` acknowledgement within the per-relay publish timeout
    #[error("publish timeout")]
    PublishTimeout,
    /// The relay rejected the event
    #[error("event not published: {0}")]
    PublishRejected(String),
    /// Authentication round failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// No challenge was received from the relay
    #[error("no authentication challenge received")]
    NoChallenge,
    /// Relay not connected
    #[error("relay not connected")]
    NotConnected,
    /// The relay was disconnected on purpose and is never retried
    #[error("relay terminated")]
    Terminated,
    /// Generic timeout
    #[error("timeout")]
    Timeout,
    /// Message channel full or closed
    #[error("can't send message to the '{channel}' channel")]
    CantSendChannelMessage {
        /// Name of the channel
        channel: String,
    },
    /// Notification stream ended before an answer arrived
    #[error("premature exit")]
    PrematureExit,
}
