// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

use std::fmt;

use nostr::EventId;

use super::Output;
use crate::relay;
use crate::shared::SharedStateError;
use crate::store::StoreError;

/// Relay Pool error
#[derive(Debug)]
pub enum Error {
    /// Shared state error
    SharedState(SharedStateError),
    /// Relay error
    Relay(relay::Error),
    /// Store error
    Store(StoreError),
    /// No relays specified
    NoRelaysSpecified,
    /// The write quorum was not reached; every relay outcome is enclosed
    EventNotPublished(Output<EventId>),
    /// Relay not found
    RelayNotFound,
    /// Timeout
    Timeout,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedState(e) => write!(f, "{e}"),
            Self::Relay(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::NoRelaysSpecified => write!(f, "no relays specified"),
            Self::EventNotPublished(output) => write!(
                f,
                "event not published: write quorum not reached ({} accepted, {} failed)",
                output.success.len(),
                output.failed.len()
            ),
            Self::RelayNotFound => write!(f, "relay not found"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl From<SharedStateError> for Error {
    fn from(e: SharedStateError) -> Self {
        Self::SharedState(e)
    }
}

impl From<relay::Error> for Error {
    fn from(e: relay::Error) -> Self {
        Self::Relay(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
