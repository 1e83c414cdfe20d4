// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! State shared between pool, timelines and fetchers

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use nostr::nips::nip01::Coordinate;
use nostr::{Event, EventId, NostrSigner, RelayUrl};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::bus::EventBus;
use crate::store::{EventStore, IntoEventStore, MemoryStore};
use crate::transport::Transport;

const EVENT_CACHE_SIZE: usize = 8192;
const REPLACEABLE_CACHE_SIZE: usize = 2048;
const REPLACEABLE_CACHE_TTL: Duration = Duration::from_secs(120);

/// Shared state error
#[derive(Debug, Error)]
pub enum SharedStateError {
    /// Signer not configured
    #[error("signer not configured")]
    SignerNotConfigured,
}

/// Relation: event id -> relays that delivered or acknowledged it.
///
/// Used to pick relay hints for re-fetching. Grows monotonically for the
/// session; not an ownership structure.
#[derive(Debug, Clone, Default)]
pub struct SeenOnMap {
    map: Arc<RwLock<HashMap<EventId, HashSet<RelayUrl>>>>,
}

impl SeenOnMap {
    /// Record that `url` has seen `id`.
    pub async fn mark(&self, id: EventId, url: RelayUrl) {
        let mut map = self.map.write().await;
        map.entry(id).or_default().insert(url);
    }

    /// Relays known to have the event.
    pub async fn relays(&self, id: &EventId) -> Vec<RelayUrl> {
        let map = self.map.read().await;
        map.get(id).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }
}

/// Bounded cache of full event bodies, keyed by id.
///
/// Timelines store references only; bodies are resolved through here.
#[derive(Debug, Clone)]
pub struct EventCache {
    cache: Arc<Mutex<LruCache<EventId, Event>>>,
}

impl Default for EventCache {
    fn default() -> Self {
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(EVENT_CACHE_SIZE).expect("non-zero cache size"),
            ))),
        }
    }
}

impl EventCache {
    /// Cache an event body. First delivery wins; events are immutable.
    pub async fn insert(&self, event: &Event) {
        let mut cache = self.cache.lock().await;
        if !cache.contains(&event.id) {
            cache.put(event.id, event.clone());
        }
    }

    /// Get an event body by id.
    pub async fn get(&self, id: &EventId) -> Option<Event> {
        let mut cache = self.cache.lock().await;
        cache.get(id).cloned()
    }
}

#[derive(Debug, Clone)]
struct ReplaceableSlot {
    /// `None` is a cached negative result.
    event: Option<Event>,
    fetched_at: Instant,
}

/// Bounded, time-expiring cache of the newest replaceable event per coordinate.
#[derive(Debug, Clone)]
pub struct ReplaceableCache {
    cache: Arc<Mutex<LruCache<Coordinate, ReplaceableSlot>>>,
    ttl: Duration,
}

impl Default for ReplaceableCache {
    fn default() -> Self {
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(REPLACEABLE_CACHE_SIZE).expect("non-zero cache size"),
            ))),
            ttl: REPLACEABLE_CACHE_TTL,
        }
    }
}

impl ReplaceableCache {
    /// Cached value for a coordinate.
    ///
    /// Returns `None` on miss or expiry, `Some(None)` for a cached negative
    /// result and `Some(Some(event))` for a cached event.
    pub async fn get(&self, coordinate: &Coordinate) -> Option<Option<Event>> {
        let mut cache = self.cache.lock().await;
        match cache.get(coordinate) {
            Some(slot) if slot.fetched_at.elapsed() < self.ttl => Some(slot.event.clone()),
            Some(..) => {
                cache.pop(coordinate);
                None
            }
            None => None,
        }
    }

    /// Cache a lookup result (including negative results).
    pub async fn insert(&self, coordinate: Coordinate, event: Option<Event>) {
        let mut cache = self.cache.lock().await;
        cache.put(
            coordinate,
            ReplaceableSlot {
                event,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Update the cache with an independently observed event, keeping only the
    /// newest per coordinate.
    pub async fn observe(&self, coordinate: Coordinate, event: &Event) {
        let mut cache = self.cache.lock().await;
        match cache.get(&coordinate) {
            Some(ReplaceableSlot {
                event: Some(existing),
                ..
            }) if existing.created_at >= event.created_at => {}
            _ => {
                cache.put(
                    coordinate,
                    ReplaceableSlot {
                        event: Some(event.clone()),
                        fetched_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Drop a cached entry (fresher version observed elsewhere).
    pub async fn invalidate(&self, coordinate: &Coordinate) {
        let mut cache = self.cache.lock().await;
        cache.pop(coordinate);
    }
}

/// State shared by every component of the core.
///
/// Constructed once and passed explicitly; there are no ambient singletons.
#[derive(Debug, Clone)]
pub struct SharedState {
    pub(crate) store: Arc<dyn EventStore>,
    pub(crate) transport: Arc<dyn Transport>,
    signer: Arc<RwLock<Option<Arc<dyn NostrSigner>>>>,
    pub(crate) bus: EventBus,
    pub(crate) seen: SeenOnMap,
    pub(crate) events: EventCache,
    pub(crate) replaceable: ReplaceableCache,
}

impl SharedState {
    /// Create a new shared state.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn EventStore>>,
        signer: Option<Arc<dyn NostrSigner>>,
    ) -> Self {
        Self {
            store: store.unwrap_or_else(|| MemoryStore::new().into_event_store()),
            transport,
            signer: Arc::new(RwLock::new(signer)),
            bus: EventBus::default(),
            seen: SeenOnMap::default(),
            events: EventCache::default(),
            replaceable: ReplaceableCache::default(),
        }
    }

    /// Get the persistent store.
    #[inline]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Get the in-process event bus.
    #[inline]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Get the seen-on map.
    #[inline]
    pub fn seen(&self) -> &SeenOnMap {
        &self.seen
    }

    /// Get the event cache.
    #[inline]
    pub fn events(&self) -> &EventCache {
        &self.events
    }

    /// Get the replaceable event cache.
    #[inline]
    pub fn replaceable(&self) -> &ReplaceableCache {
        &self.replaceable
    }

    /// Check if a signer is configured.
    pub async fn has_signer(&self) -> bool {
        let signer = self.signer.read().await;
        signer.is_some()
    }

    /// Get the configured signer.
    pub async fn signer(&self) -> Result<Arc<dyn NostrSigner>, SharedStateError> {
        let signer = self.signer.read().await;
        signer.clone().ok_or(SharedStateError::SignerNotConfigured)
    }

    /// Set the signer.
    pub async fn set_signer(&self, signer: Arc<dyn NostrSigner>) {
        let mut s = self.signer.write().await;
        *s = Some(signer);
    }

    /// Unset the signer.
    pub async fn unset_signer(&self) {
        let mut s = self.signer.write().await;
        *s = None;
    }
}
