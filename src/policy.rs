// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Relay selection
//!
//! Picks target relays for writes and bulk reads from per-author declared
//! relay lists, with a fixed well-known relay set as the fallback when
//! nothing better is known.

use std::collections::{HashMap, HashSet};

use nostr::{Event, Kind, PublicKey, RelayUrl};

use crate::fetch::Fetcher;

/// Well-known large relays used as the ultimate fallback.
pub const BIG_RELAYS: [&str; 4] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// How many declared relays per mentioned user are targeted.
const RELAYS_PER_MENTION: usize = 4;
/// How many mentioned users contribute targets.
const MAX_MENTIONS: usize = 10;
/// How many of the author's own write relays are targeted.
const MAX_OWN_WRITE_RELAYS: usize = 10;
/// Fan-out width cap for bulk reads.
const MAX_READ_RELAYS: usize = 10;
/// Relays declared per author that contribute to bulk-read grouping.
const RELAYS_PER_AUTHOR: usize = 4;

/// The fixed well-known relay set.
pub fn big_relays() -> Vec<RelayUrl> {
    BIG_RELAYS
        .iter()
        .filter_map(|url| RelayUrl::parse(url).ok())
        .collect()
}

/// Kinds that are always also broadcast to the well-known relay set.
fn is_broadcast_kind(kind: Kind) -> bool {
    matches!(kind, Kind::Metadata | Kind::RelayList | Kind::ContactList)
}

/// Target relays for publishing an event.
///
/// Explicit caller-specified relays take precedence. Otherwise: the read
/// relays of the first mentioned users, the well-known set for broadcast
/// kinds, and the author's own write relays. The well-known set is the
/// fallback if nothing else yields a URL.
pub async fn write_targets(
    fetcher: &Fetcher,
    event: &Event,
    explicit: &[RelayUrl],
) -> Vec<RelayUrl> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }

    let mut targets: Vec<RelayUrl> = Vec::new();
    let mut seen: HashSet<RelayUrl> = HashSet::new();
    let mut push = |targets: &mut Vec<RelayUrl>, url: RelayUrl| {
        if seen.insert(url.clone()) {
            targets.push(url);
        }
    };

    // Mentioned users should see the event on relays they read from
    let mut mentions: Vec<PublicKey> = Vec::new();
    for public_key in event.tags.public_keys() {
        if !mentions.contains(public_key) {
            mentions.push(*public_key);
            if mentions.len() >= MAX_MENTIONS {
                break;
            }
        }
    }

    for public_key in mentions.into_iter() {
        if let Ok(Some(list)) = fetcher.relay_list(&public_key).await {
            for url in list.read.into_iter().take(RELAYS_PER_MENTION) {
                push(&mut targets, url);
            }
        }
    }

    if is_broadcast_kind(event.kind) {
        for url in big_relays().into_iter() {
            push(&mut targets, url);
        }
    }

    if let Ok(Some(list)) = fetcher.relay_list(&event.pubkey).await {
        for url in list.write.into_iter().take(MAX_OWN_WRITE_RELAYS) {
            push(&mut targets, url);
        }
    }

    if targets.is_empty() {
        targets = big_relays();
    }

    targets
}

/// Group many authors by the relays to read them from.
///
/// Each author contributes their first declared write relays; authors with no
/// known relay list are covered by the well-known set. When the result is too
/// wide, marginal relays are pruned greedily.
pub async fn read_targets(
    fetcher: &Fetcher,
    authors: &[PublicKey],
) -> HashMap<RelayUrl, Vec<PublicKey>> {
    let mut coverage: HashMap<RelayUrl, HashSet<PublicKey>> = HashMap::new();

    for author in authors.iter() {
        let urls: Vec<RelayUrl> = match fetcher.relay_list(author).await {
            Ok(Some(list)) if !list.write.is_empty() => {
                list.write.into_iter().take(RELAYS_PER_AUTHOR).collect()
            }
            _ => big_relays(),
        };

        for url in urls.into_iter() {
            coverage.entry(url).or_default().insert(*author);
        }
    }

    prune(&mut coverage);

    coverage
        .into_iter()
        .map(|(url, authors)| (url, authors.into_iter().collect()))
        .collect()
}

/// Greedy coverage pruning, not an optimal set cover.
///
/// A relay is dropped only when it covers few authors and every one of those
/// authors is already covered at least twice elsewhere.
fn prune(coverage: &mut HashMap<RelayUrl, HashSet<PublicKey>>) {
    if coverage.len() <= MAX_READ_RELAYS {
        return;
    }

    let mut counts: HashMap<PublicKey, usize> = HashMap::new();
    for authors in coverage.values() {
        for author in authors.iter() {
            *counts.entry(*author).or_default() += 1;
        }
    }

    // Narrowest coverage goes first
    let mut candidates: Vec<RelayUrl> = coverage.keys().cloned().collect();
    candidates.sort_by_key(|url| coverage[url].len());

    for url in candidates.into_iter() {
        if coverage.len() <= MAX_READ_RELAYS {
            break;
        }

        let authors = &coverage[&url];
        let marginal: bool = authors.len() < MAX_READ_RELAYS
            && authors
                .iter()
                .all(|author| counts.get(author).copied().unwrap_or(0) >= 3);

        if marginal {
            if let Some(removed) = coverage.remove(&url) {
                for author in removed.into_iter() {
                    if let Some(count) = counts.get_mut(&author) {
                        *count -= 1;
                    }
                }
            }
        }
    }
}
