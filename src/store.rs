// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Persistent store contract
//!
//! The core treats persistent storage as an external collaborator: a key/value
//! store for replaceable events with a tri-state read contract.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nostr::nips::nip01::Coordinate;
use nostr::util::BoxedFuture;
use nostr::{Event, Kind, PublicKey};
use thiserror::Error;
use tokio::sync::RwLock;

/// Store error
#[derive(Debug, Error)]
pub enum StoreError {
    /// An error happened in the underlying backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Create a new backend error
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// Replaceable-event lookup result.
///
/// Distinguishes a coordinate that was never resolved from one that is known
/// to have no event on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEntry {
    /// The store has no knowledge of this coordinate.
    Unknown,
    /// The coordinate was looked up before and no event exists.
    Absent,
    /// The newest known event for this coordinate.
    Present(Box<Event>),
}

impl StoreEntry {
    /// Get the stored event, if any.
    #[inline]
    pub fn into_event(self) -> Option<Event> {
        match self {
            Self::Present(event) => Some(*event),
            _ => None,
        }
    }
}

/// Persistent store for replaceable events.
///
/// Implementations MUST retain only the newest `created_at` per coordinate and
/// MUST drop (not propagate) entries that fail to decode.
pub trait EventStore: fmt::Debug + Send + Sync {
    /// Get the newest known replaceable event for a coordinate.
    fn get_replaceable_event<'a>(
        &'a self,
        public_key: &'a PublicKey,
        kind: Kind,
        identifier: Option<&'a str>,
    ) -> BoxedFuture<'a, Result<StoreEntry, StoreError>>;

    /// Store a replaceable event, keeping only the newest per coordinate.
    fn put_replaceable_event<'a>(
        &'a self,
        event: &'a Event,
    ) -> BoxedFuture<'a, Result<(), StoreError>>;

    /// Mark a coordinate as known-absent.
    fn put_null_replaceable_event<'a>(
        &'a self,
        public_key: &'a PublicKey,
        kind: Kind,
        identifier: Option<&'a str>,
    ) -> BoxedFuture<'a, Result<(), StoreError>>;

    /// Bulk lookup for one kind. The output is aligned to the input slice.
    fn get_many_replaceable_events<'a>(
        &'a self,
        public_keys: &'a [PublicKey],
        kind: Kind,
    ) -> BoxedFuture<'a, Result<Vec<StoreEntry>, StoreError>>;

    /// Every stored profile event. Used to warm up the in-memory caches at
    /// startup.
    fn profiles<'a>(&'a self) -> BoxedFuture<'a, Result<Vec<Event>, StoreError>>;
}

#[doc(hidden)]
pub trait IntoEventStore {
    fn into_event_store(self) -> Arc<dyn EventStore>;
}

impl IntoEventStore for Arc<dyn EventStore> {
    fn into_event_store(self) -> Arc<dyn EventStore> {
        self
    }
}

impl<T> IntoEventStore for T
where
    T: EventStore + Sized + 'static,
{
    fn into_event_store(self) -> Arc<dyn EventStore> {
        Arc::new(self)
    }
}

fn coordinate(public_key: &PublicKey, kind: Kind, identifier: Option<&str>) -> Coordinate {
    let coordinate: Coordinate = Coordinate::new(kind, *public_key);
    match identifier {
        Some(identifier) => coordinate.identifier(identifier),
        None => coordinate,
    }
}

/// In-memory store
///
/// Keeps everything in a hash map. Useful as a default and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<Coordinate, StoreEntry>>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryStore {
    fn get_replaceable_event<'a>(
        &'a self,
        public_key: &'a PublicKey,
        kind: Kind,
        identifier: Option<&'a str>,
    ) -> BoxedFuture<'a, Result<StoreEntry, StoreError>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries
                .get(&coordinate(public_key, kind, identifier))
                .cloned()
                .unwrap_or(StoreEntry::Unknown))
        })
    }

    fn put_replaceable_event<'a>(
        &'a self,
        event: &'a Event,
    ) -> BoxedFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let key: Coordinate =
                coordinate(&event.pubkey, event.kind, event.tags.identifier());
            let mut entries = self.entries.write().await;
            match entries.get(&key) {
                // Keep only the newest per coordinate
                Some(StoreEntry::Present(existing)) if existing.created_at >= event.created_at => {}
                _ => {
                    entries.insert(key, StoreEntry::Present(Box::new(event.clone())));
                }
            }
            Ok(())
        })
    }

    fn put_null_replaceable_event<'a>(
        &'a self,
        public_key: &'a PublicKey,
        kind: Kind,
        identifier: Option<&'a str>,
    ) -> BoxedFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let key: Coordinate = coordinate(public_key, kind, identifier);
            let mut entries = self.entries.write().await;
            // Never downgrade a present event to a negative entry
            if !matches!(entries.get(&key), Some(StoreEntry::Present(..))) {
                entries.insert(key, StoreEntry::Absent);
            }
            Ok(())
        })
    }

    fn get_many_replaceable_events<'a>(
        &'a self,
        public_keys: &'a [PublicKey],
        kind: Kind,
    ) -> BoxedFuture<'a, Result<Vec<StoreEntry>, StoreError>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(public_keys
                .iter()
                .map(|public_key| {
                    entries
                        .get(&coordinate(public_key, kind, None))
                        .cloned()
                        .unwrap_or(StoreEntry::Unknown)
                })
                .collect())
        })
    }

    fn profiles<'a>(&'a self) -> BoxedFuture<'a, Result<Vec<Event>, StoreError>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries
                .iter()
                .filter(|(key, ..)| key.kind == Kind::Metadata)
                .filter_map(|(.., entry)| match entry {
                    StoreEntry::Present(event) => Some((**event).clone()),
                    _ => None,
                })
                .collect())
        })
    }
}
