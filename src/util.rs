// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

use nostr::nips::nip01::Coordinate;
use nostr::Event;

/// Coordinate of a replaceable or addressable event.
///
/// Returns `None` for regular events and for addressable events without an
/// identifier tag.
pub(crate) fn coordinate(event: &Event) -> Option<Coordinate> {
    if event.kind.is_replaceable() {
        Some(Coordinate::new(event.kind, event.pubkey))
    } else if event.kind.is_addressable() {
        let identifier: &str = event.tags.identifier()?;
        Some(Coordinate::new(event.kind, event.pubkey).identifier(identifier))
    } else {
        None
    }
}
