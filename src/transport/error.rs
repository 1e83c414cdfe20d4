// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Transport error

use std::fmt;

/// Transport error
#[derive(Debug)]
pub enum TransportError {
    /// An error happened in the underlying transport backend.
    Backend(Box<dyn std::error::Error + Send + Sync>),
    /// The link was closed.
    Closed,
}

impl std::error::Error for TransportError {}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "transport link closed"),
        }
    }
}

impl TransportError {
    /// Create a new backend error
    ///
    /// Shorthand for `TransportError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}
