// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Relay constants

use std::time::Duration;

/// Default connection timeout
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for an `OK` acknowledgement after publishing an event
pub const WAIT_FOR_OK_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for a per-relay end-of-stored-events signal
pub const EOSE_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) const NOTIFICATION_CHANNEL_SIZE: usize = 4096;
pub(super) const FRAME_CHANNEL_SIZE: usize = 1024;
