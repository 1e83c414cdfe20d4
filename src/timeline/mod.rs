// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Timelines
//!
//! A timeline is one cached, ordered feed window keyed by its originating
//! relay set and filter. Subscribing serves the cached window immediately,
//! reconciles it with fresh relay results and then keeps it live; paging
//! backward extends it at the tail.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use nostr::hashes::sha256::Hash as Sha256Hash;
use nostr::hashes::Hash;
use nostr::util::JsonUtil;
use nostr::{Event, EventId, Filter, RelayUrl, Timestamp};

mod aggregator;
mod store;

pub use self::store::Timelines;
use crate::pool;
use crate::pool::Subscription;

/// Timeline error
#[derive(Debug)]
pub enum Error {
    /// Pool error
    Pool(pool::Error),
    /// No sub-requests specified
    NoSubRequests,
    /// No timeline exists for this key
    UnknownTimeline,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(e) => write!(f, "{e}"),
            Self::NoSubRequests => write!(f, "no sub-requests specified"),
            Self::UnknownTimeline => write!(f, "no timeline exists for this key"),
        }
    }
}

impl From<pool::Error> for Error {
    fn from(e: pool::Error) -> Self {
        Self::Pool(e)
    }
}

/// Reference to an event in a timeline: enough to sort and page without
/// keeping the body around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineRef {
    /// Event ID
    pub id: EventId,
    /// Event timestamp
    pub created_at: Timestamp,
}

impl TimelineRef {
    #[inline]
    pub(crate) fn of(event: &Event) -> Self {
        Self {
            id: event.id,
            created_at: event.created_at,
        }
    }
}

impl PartialOrd for TimelineRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimelineRef {
    /// Display order: descending by timestamp, ties ascending by id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Timeline key
///
/// Derived deterministically from the sorted relay URLs and the canonical
/// filter, so the same logical feed always maps to the same cached window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimelineKey(String);

impl fmt::Display for TimelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TimelineKey {
    pub(crate) fn from_request(urls: &[RelayUrl], filter: &Filter) -> Self {
        let mut urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        urls.sort_unstable();
        let preimage: String = format!("{}|{}", urls.join(","), filter.as_json());
        Self(Sha256Hash::hash(preimage.as_bytes()).to_string())
    }

    pub(crate) fn merged(keys: &[TimelineKey]) -> Self {
        let mut parts: Vec<&str> = keys.iter().map(|k| k.0.as_str()).collect();
        parts.sort_unstable();
        Self(Sha256Hash::hash(parts.join("|").as_bytes()).to_string())
    }
}

/// One constituent of a logical feed: a relay set and the filter to run on it.
#[derive(Debug, Clone)]
pub struct SubRequest {
    /// Relay URLs
    pub urls: Vec<RelayUrl>,
    /// Filter
    pub filter: Filter,
}

impl SubRequest {
    /// Create a new sub-request.
    #[inline]
    pub fn new(urls: Vec<RelayUrl>, filter: Filter) -> Self {
        Self { urls, filter }
    }
}

/// Feed callbacks.
///
/// Called from the timeline's driver tasks: implementations must not block.
pub trait TimelineHandler: Send + Sync {
    /// The merged feed changed. `eosed` upgrades to `true` once every
    /// constituent sub-timeline has reported end of stored events.
    fn on_events(&self, events: &[Event], eosed: bool);

    /// A live event was inserted into the feed. Never called twice for the
    /// same event id within this subscription's lifetime.
    fn on_new(&self, _event: &Event) {}

    /// A relay demands authentication but no signer is configured.
    fn on_auth_required(&self) {}

    /// A relay sub-subscription terminated, with the relay's raw reason.
    fn on_close(&self, _url: &RelayUrl, _reason: &str) {}
}

/// Handle to a live feed subscription.
///
/// Closing releases the relay subscriptions; the cached timeline windows
/// survive and seed the next subscription for the same key.
#[derive(Debug, Clone)]
pub struct TimelineHandle {
    key: TimelineKey,
    subscriptions: Vec<Subscription>,
    active: Arc<Mutex<HashSet<TimelineKey>>>,
}

impl TimelineHandle {
    /// Key of the merged logical feed, usable for paging backward.
    #[inline]
    pub fn key(&self) -> &TimelineKey {
        &self.key
    }

    /// Close every constituent subscription. Closing twice is a no-op.
    pub fn close(&self) {
        for subscription in self.subscriptions.iter() {
            subscription.close();
        }

        let mut active = self.active.lock().expect("poisoned active lock");
        active.remove(&self.key);
    }
}

pub(crate) fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(urls: &[&str], filter: &Filter) -> TimelineKey {
        let urls: Vec<RelayUrl> = urls.iter().map(|u| RelayUrl::parse(u).unwrap()).collect();
        TimelineKey::from_request(&urls, filter)
    }

    #[test]
    fn test_key_ignores_relay_order() {
        let filter = Filter::new().kind(nostr::Kind::TextNote).limit(10);
        let a = key(&["wss://relay.damus.io", "wss://nos.lol"], &filter);
        let b = key(&["wss://nos.lol", "wss://relay.damus.io"], &filter);
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_depends_on_filter() {
        let a = key(
            &["wss://relay.damus.io"],
            &Filter::new().kind(nostr::Kind::TextNote).limit(10),
        );
        let b = key(
            &["wss://relay.damus.io"],
            &Filter::new().kind(nostr::Kind::TextNote).limit(20),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_ref_ordering() {
        let newer = TimelineRef {
            id: EventId::all_zeros(),
            created_at: Timestamp::from_secs(100),
        };
        let older = TimelineRef {
            id: EventId::all_zeros(),
            created_at: Timestamp::from_secs(50),
        };
        // Newest first
        assert!(newer < older);

        let mut refs = vec![older, newer];
        refs.sort();
        assert_eq!(refs, vec![newer, older]);
    }
}
