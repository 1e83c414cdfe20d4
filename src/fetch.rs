// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Coalesced point lookups
//!
//! Many UI locations ask for the same event or the same profile at nearly the
//! same time. Lookups are collected over a short window and answered with one
//! relay round-trip per batch; misses are remembered so they aren't retried
//! on every render.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_utility::task;
use nostr::nips::nip01::Coordinate;
use nostr::nips::nip19::{FromBech32, Nip19Coordinate, Nip19Event, Nip19Profile};
use nostr::nips::nip65::{self, RelayMetadata};
use nostr::util::JsonUtil;
use nostr::{Event, EventId, Filter, Kind, Metadata, PublicKey, RelayUrl, Timestamp};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::policy;
use crate::pool::{self, Pool};
use crate::store::{StoreEntry, StoreError};
use crate::util;

/// How long id lookups are collected before one batched query goes out.
const ID_BATCH_WINDOW: Duration = Duration::from_millis(10);
/// How long replaceable lookups are collected before the per-author fan-out.
const REPLACEABLE_BATCH_WINDOW: Duration = Duration::from_millis(50);
/// Max authors per query in the big-relay bulk variant.
const BIG_RELAY_BATCH_SIZE: usize = 500;
/// Relays declared per author that are actually queried.
const RELAYS_PER_AUTHOR: usize = 4;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetch error
#[derive(Debug, Error)]
pub enum Error {
    /// Pool error
    #[error(transparent)]
    Pool(#[from] pool::Error),
    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Malformed id or pointer. Fails the call before any network access.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Read/write relay lists declared by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayList {
    /// Relays the user reads from
    pub read: Vec<RelayUrl>,
    /// Relays the user writes to
    pub write: Vec<RelayUrl>,
    /// Every relay in the declaration, in declaration order, markers ignored
    pub original: Vec<RelayUrl>,
}

enum Pointer {
    Event {
        id: EventId,
        relays: Vec<RelayUrl>,
    },
    Coordinate(Coordinate),
}

fn parse_pointer(s: &str) -> Result<Pointer, Error> {
    if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        let id: EventId =
            EventId::from_hex(s).map_err(|_| Error::InvalidIdentifier(s.to_string()))?;
        return Ok(Pointer::Event {
            id,
            relays: Vec::new(),
        });
    }

    if s.starts_with("note1") {
        let id: EventId =
            EventId::from_bech32(s).map_err(|_| Error::InvalidIdentifier(s.to_string()))?;
        return Ok(Pointer::Event {
            id,
            relays: Vec::new(),
        });
    }

    if s.starts_with("nevent1") {
        let pointer: Nip19Event =
            Nip19Event::from_bech32(s).map_err(|_| Error::InvalidIdentifier(s.to_string()))?;
        return Ok(Pointer::Event {
            id: pointer.event_id,
            relays: pointer.relays,
        });
    }

    if s.starts_with("naddr1") {
        let pointer: Nip19Coordinate = Nip19Coordinate::from_bech32(s)
            .map_err(|_| Error::InvalidIdentifier(s.to_string()))?;
        return Ok(Pointer::Coordinate(pointer.coordinate));
    }

    Err(Error::InvalidIdentifier(s.to_string()))
}

fn parse_profile_pointer(s: &str) -> Result<PublicKey, Error> {
    if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return PublicKey::from_hex(s).map_err(|_| Error::InvalidIdentifier(s.to_string()));
    }

    if s.starts_with("npub1") {
        return PublicKey::from_bech32(s).map_err(|_| Error::InvalidIdentifier(s.to_string()));
    }

    if s.starts_with("nprofile1") {
        let pointer: Nip19Profile =
            Nip19Profile::from_bech32(s).map_err(|_| Error::InvalidIdentifier(s.to_string()))?;
        return Ok(pointer.public_key);
    }

    Err(Error::InvalidIdentifier(s.to_string()))
}

// Malformed content is dropped, not propagated
fn decode_metadata(event: &Event) -> Option<Metadata> {
    Metadata::from_json(&event.content).ok()
}

/// Outcome of a network lookup for one coordinate.
///
/// `Missing` means at least one relay answered and none had the event: a
/// provable miss, safe to remember. `Unreachable` means no relay answered at
/// all, which proves nothing; the next lookup retries.
#[derive(Debug, Clone)]
enum Lookup {
    Found(Box<Event>),
    Missing,
    Unreachable,
}

#[derive(Debug, Default)]
struct PendingId {
    hints: HashSet<RelayUrl>,
    waiters: Vec<oneshot::Sender<Option<Event>>>,
}

/// Coalescing fetcher
#[derive(Debug, Clone)]
pub struct Fetcher {
    pool: Pool,
    pending_ids: Arc<Mutex<HashMap<EventId, PendingId>>>,
    pending_replaceable: Arc<Mutex<HashMap<Coordinate, Vec<oneshot::Sender<Lookup>>>>>,
}

impl Fetcher {
    /// Create a new fetcher on top of a pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            pending_ids: Arc::new(Mutex::new(HashMap::new())),
            pending_replaceable: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch a single event by hex id or bech32 pointer.
    ///
    /// `note1` and `nevent1` pointers resolve by id (relay hints are used when
    /// present); `naddr1` pointers resolve as replaceable lookups.
    pub async fn event(&self, identifier: &str) -> Result<Option<Event>, Error> {
        match parse_pointer(identifier)? {
            Pointer::Event { id, relays } => Ok(self.event_by_id(id, relays).await),
            Pointer::Coordinate(coordinate) => {
                let identifier: Option<&str> = (!coordinate.identifier.is_empty())
                    .then_some(coordinate.identifier.as_str());
                self.replaceable(&coordinate.public_key, coordinate.kind, identifier)
                    .await
            }
        }
    }

    /// Fetch an event by id, batched with concurrent callers.
    pub async fn event_by_id(&self, id: EventId, hints: Vec<RelayUrl>) -> Option<Event> {
        let state = self.pool.state();

        if let Some(event) = state.events().get(&id).await {
            return Some(event);
        }

        let (tx, rx) = oneshot::channel();

        // The first caller in a window schedules the flush for everyone
        let first: bool = {
            let mut pending = self.pending_ids.lock().await;
            let first: bool = pending.is_empty();
            let entry = pending.entry(id).or_default();
            entry.hints.extend(hints);
            entry.waiters.push(tx);
            first
        };

        if first {
            let this = self.clone();
            task::spawn(async move {
                tokio::time::sleep(ID_BATCH_WINDOW).await;
                this.flush_ids().await;
            });
        }

        rx.await.unwrap_or(None)
    }

    async fn flush_ids(&self) {
        let pending: HashMap<EventId, PendingId> = {
            let mut lock = self.pending_ids.lock().await;
            std::mem::take(&mut *lock)
        };

        if pending.is_empty() {
            return;
        }

        let state = self.pool.state();

        // Union of pointer hints, relays known to have each event, and the
        // big-relay fallback
        let mut urls: HashSet<RelayUrl> = policy::big_relays().into_iter().collect();
        for (id, entry) in pending.iter() {
            urls.extend(entry.hints.iter().cloned());
            urls.extend(state.seen().relays(id).await);
        }
        let urls: Vec<RelayUrl> = urls.into_iter().collect();

        let ids: Vec<EventId> = pending.keys().copied().collect();
        tracing::debug!(ids = ids.len(), relays = urls.len(), "Flushing batched id lookups.");

        let filter: Filter = Filter::new().ids(ids);
        let events: Vec<Event> = match self.pool.fetch_events(&urls, filter, FETCH_TIMEOUT).await {
            Ok(events) => events,
            Err(e) => {
                tracing::debug!(error = %e, "Batched id lookup failed.");
                Vec::new()
            }
        };

        let mut by_id: HashMap<EventId, Event> = HashMap::with_capacity(events.len());
        for event in events.into_iter() {
            by_id.insert(event.id, event);
        }

        for (id, entry) in pending.into_iter() {
            let found: Option<Event> = by_id.get(&id).cloned();
            for waiter in entry.waiters.into_iter() {
                let _ = waiter.send(found.clone());
            }
        }
    }

    /// Fetch the newest replaceable event for (author, kind[, identifier]).
    ///
    /// Answers from the in-memory cache or the persistent store when
    /// possible; otherwise joins the next batched network lookup. Misses are
    /// cached as negative results until they expire or are invalidated.
    pub async fn replaceable(
        &self,
        public_key: &PublicKey,
        kind: Kind,
        identifier: Option<&str>,
    ) -> Result<Option<Event>, Error> {
        let state = self.pool.state();

        let coordinate: Coordinate = match identifier {
            Some(identifier) => Coordinate::new(kind, *public_key).identifier(identifier),
            None => Coordinate::new(kind, *public_key),
        };

        // The cache answers both hits and remembered misses
        if let Some(cached) = state.replaceable().get(&coordinate).await {
            return Ok(cached);
        }

        match state
            .store()
            .get_replaceable_event(public_key, kind, identifier)
            .await?
        {
            StoreEntry::Present(event) => {
                state
                    .replaceable()
                    .insert(coordinate, Some((*event).clone()))
                    .await;
                return Ok(Some(*event));
            }
            StoreEntry::Absent => {
                state.replaceable().insert(coordinate, None).await;
                return Ok(None);
            }
            StoreEntry::Unknown => {}
        }

        match self.replaceable_from_network(coordinate.clone()).await {
            Lookup::Found(event) => {
                state.store().put_replaceable_event(&event).await?;
                state
                    .replaceable()
                    .insert(coordinate, Some((*event).clone()))
                    .await;
                Ok(Some(*event))
            }
            Lookup::Missing => {
                state
                    .store()
                    .put_null_replaceable_event(public_key, kind, identifier)
                    .await?;
                state.replaceable().insert(coordinate, None).await;
                Ok(None)
            }
            // No relay answered: remember nothing, the next lookup retries
            Lookup::Unreachable => Ok(None),
        }
    }

    /// Drop the cached entry for a coordinate.
    ///
    /// Used when a fresher version was observed independently, e.g. an event
    /// this process just published.
    pub async fn invalidate(&self, coordinate: &Coordinate) {
        self.pool.state().replaceable().invalidate(coordinate).await;
    }

    async fn replaceable_from_network(&self, coordinate: Coordinate) -> Lookup {
        let (tx, rx) = oneshot::channel();

        let first: bool = {
            let mut pending = self.pending_replaceable.lock().await;
            let first: bool = pending.is_empty();
            pending.entry(coordinate).or_default().push(tx);
            first
        };

        if first {
            let this = self.clone();
            task::spawn(async move {
                tokio::time::sleep(REPLACEABLE_BATCH_WINDOW).await;
                this.flush_replaceable().await;
            });
        }

        rx.await.unwrap_or(Lookup::Unreachable)
    }

    async fn flush_replaceable(&self) {
        let pending: HashMap<Coordinate, Vec<oneshot::Sender<Lookup>>> = {
            let mut lock = self.pending_replaceable.lock().await;
            std::mem::take(&mut *lock)
        };

        if pending.is_empty() {
            return;
        }

        // One fan-out query per author per window
        let mut by_author: HashMap<PublicKey, Vec<Coordinate>> = HashMap::new();
        for coordinate in pending.keys() {
            by_author
                .entry(coordinate.public_key)
                .or_default()
                .push(coordinate.clone());
        }

        tracing::debug!(
            coordinates = pending.len(),
            authors = by_author.len(),
            "Flushing batched replaceable lookups."
        );

        let (tx, mut rx) = mpsc::channel::<(PublicKey, Vec<Event>, bool)>(by_author.len());
        for (author, coordinates) in by_author.into_iter() {
            let this = self.clone();
            let tx = tx.clone();
            task::spawn(async move {
                let (events, answered) = this.query_author(author, coordinates).await;
                let _ = tx.send((author, events, answered)).await;
            });
        }
        drop(tx);

        // Newest per coordinate wins. An author whose query reached no relay
        // at all gets Unreachable instead of a provable miss.
        let mut newest: HashMap<Coordinate, Event> = HashMap::new();
        let mut answered_authors: HashSet<PublicKey> = HashSet::new();
        while let Some((author, events, answered)) = rx.recv().await {
            if answered {
                answered_authors.insert(author);
            }
            for event in events.into_iter() {
                if let Some(coordinate) = util::coordinate(&event) {
                    match newest.get(&coordinate) {
                        Some(existing) if existing.created_at >= event.created_at => {}
                        _ => {
                            newest.insert(coordinate, event);
                        }
                    }
                }
            }
        }

        for (coordinate, waiters) in pending.into_iter() {
            let outcome: Lookup = match newest.get(&coordinate) {
                Some(event) => Lookup::Found(Box::new(event.clone())),
                None if answered_authors.contains(&coordinate.public_key) => Lookup::Missing,
                None => Lookup::Unreachable,
            };
            for waiter in waiters.into_iter() {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Query one author's coordinates from their declared write relays plus
    /// the big-relay fallback.
    ///
    /// The flag reports whether any relay actually served a query.
    async fn query_author(
        &self,
        author: PublicKey,
        coordinates: Vec<Coordinate>,
    ) -> (Vec<Event>, bool) {
        let mut urls: Vec<RelayUrl> = self.local_write_relays(&author).await;
        for url in policy::big_relays().into_iter() {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        // Plain replaceable kinds and addressable kinds need different
        // filters: a `d` constraint would wrongly exclude the former
        let plain_kinds: HashSet<Kind> = coordinates
            .iter()
            .filter(|c| c.identifier.is_empty())
            .map(|c| c.kind)
            .collect();
        let addressable: Vec<&Coordinate> = coordinates
            .iter()
            .filter(|c| !c.identifier.is_empty())
            .collect();

        let mut events: Vec<Event> = Vec::new();
        let mut answered: bool = false;

        if !plain_kinds.is_empty() {
            let filter: Filter = Filter::new().author(author).kinds(plain_kinds);
            match self.pool.query(&urls, filter, FETCH_TIMEOUT).await {
                Ok(output) => {
                    answered |= !output.success.is_empty();
                    events.extend(output.val);
                }
                Err(e) => tracing::debug!(author = %author, error = %e, "Replaceable lookup failed."),
            }
        }

        if !addressable.is_empty() {
            let kinds: HashSet<Kind> = addressable.iter().map(|c| c.kind).collect();
            let identifiers: HashSet<String> =
                addressable.iter().map(|c| c.identifier.clone()).collect();
            let filter: Filter = Filter::new()
                .author(author)
                .kinds(kinds)
                .identifiers(identifiers);
            match self.pool.query(&urls, filter, FETCH_TIMEOUT).await {
                Ok(output) => {
                    answered |= !output.success.is_empty();
                    events.extend(output.val);
                }
                Err(e) => tracing::debug!(author = %author, error = %e, "Addressable lookup failed."),
            }
        }

        (events, answered)
    }

    /// Write relays an author has declared, looked up locally only.
    ///
    /// Never goes to the network: this feeds relay targeting inside the
    /// batch flush itself.
    async fn local_write_relays(&self, public_key: &PublicKey) -> Vec<RelayUrl> {
        let state = self.pool.state();
        let coordinate: Coordinate = Coordinate::new(Kind::RelayList, *public_key);

        let event: Option<Event> = match state.replaceable().get(&coordinate).await {
            Some(cached) => cached,
            None => state
                .store()
                .get_replaceable_event(public_key, Kind::RelayList, None)
                .await
                .ok()
                .and_then(StoreEntry::into_event),
        };

        match event {
            Some(event) => nip65::extract_relay_list(&event)
                .filter(|(_, metadata)| {
                    matches!(metadata, None | Some(RelayMetadata::Write))
                })
                .map(|(url, _)| url.clone())
                .take(RELAYS_PER_AUTHOR)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Bulk lookup of one replaceable kind for many authors, from the
    /// big relays. The output is aligned to the input slice.
    pub async fn many_replaceable(
        &self,
        public_keys: &[PublicKey],
        kind: Kind,
    ) -> Result<Vec<Option<Event>>, Error> {
        let state = self.pool.state();

        let entries: Vec<StoreEntry> = state
            .store()
            .get_many_replaceable_events(public_keys, kind)
            .await?;

        let mut out: Vec<Option<Event>> = Vec::with_capacity(public_keys.len());
        let mut unknown: Vec<usize> = Vec::new();

        for (i, entry) in entries.into_iter().enumerate() {
            match entry {
                StoreEntry::Present(event) => out.push(Some(*event)),
                StoreEntry::Absent => out.push(None),
                StoreEntry::Unknown => {
                    out.push(None);
                    unknown.push(i);
                }
            }
        }

        if unknown.is_empty() {
            return Ok(out);
        }

        let missing: Vec<PublicKey> = unknown.iter().map(|i| public_keys[*i]).collect();
        let urls: Vec<RelayUrl> = policy::big_relays();

        let mut fetched: HashMap<PublicKey, Event> = HashMap::new();
        let mut unanswered: HashSet<PublicKey> = HashSet::new();
        for chunk in missing.chunks(BIG_RELAY_BATCH_SIZE) {
            let filter: Filter = Filter::new().authors(chunk.iter().copied()).kind(kind);
            match self.pool.query(&urls, filter, FETCH_TIMEOUT).await {
                Ok(output) => {
                    if output.success.is_empty() {
                        unanswered.extend(chunk.iter().copied());
                    }
                    for event in output.val.into_iter() {
                        if event.kind != kind {
                            continue;
                        }
                        match fetched.get(&event.pubkey) {
                            Some(existing) if existing.created_at >= event.created_at => {}
                            _ => {
                                fetched.insert(event.pubkey, event);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Bulk replaceable lookup failed.");
                    unanswered.extend(chunk.iter().copied());
                }
            }
        }

        for i in unknown.into_iter() {
            let public_key: PublicKey = public_keys[i];
            let coordinate: Coordinate = Coordinate::new(kind, public_key);
            match fetched.get(&public_key) {
                Some(event) => {
                    state.store().put_replaceable_event(event).await?;
                    state
                        .replaceable()
                        .insert(coordinate, Some(event.clone()))
                        .await;
                    out[i] = Some(event.clone());
                }
                // A chunk that reached no relay proves nothing: the
                // coordinate stays unknown and is retried next time
                None if unanswered.contains(&public_key) => {}
                None => {
                    state
                        .store()
                        .put_null_replaceable_event(&public_key, kind, None)
                        .await?;
                    state.replaceable().insert(coordinate, None).await;
                }
            }
        }

        Ok(out)
    }

    /// Fetch a profile by hex public key or bech32 pointer.
    ///
    /// `npub1` and `nprofile1` pointers resolve to the public key.
    pub async fn profile(&self, identifier: &str) -> Result<Option<Metadata>, Error> {
        let public_key: PublicKey = parse_profile_pointer(identifier)?;
        self.metadata(&public_key).await
    }

    /// Fetch a user's profile metadata.
    ///
    /// Stale-while-revalidate: a locally known profile answers immediately
    /// while a background refresh checks the relays; the refresh overwrites
    /// the caches and notifies bus listeners only if it finds something
    /// strictly newer.
    pub async fn metadata(&self, public_key: &PublicKey) -> Result<Option<Metadata>, Error> {
        let state = self.pool.state();
        let coordinate: Coordinate = Coordinate::new(Kind::Metadata, *public_key);

        let local: Option<Event> = match state.replaceable().get(&coordinate).await {
            Some(cached) => cached,
            None => state
                .store()
                .get_replaceable_event(public_key, Kind::Metadata, None)
                .await?
                .into_event(),
        };

        if let Some(event) = local {
            let this = self.clone();
            let public_key: PublicKey = *public_key;
            task::spawn(async move { this.revalidate_profile(public_key).await });

            return Ok(decode_metadata(&event));
        }

        match self.replaceable(public_key, Kind::Metadata, None).await? {
            Some(event) => Ok(decode_metadata(&event)),
            None => Ok(None),
        }
    }

    /// Best effort: failures are swallowed, the caller was already answered.
    async fn revalidate_profile(&self, public_key: PublicKey) {
        let state = self.pool.state();
        let coordinate: Coordinate = Coordinate::new(Kind::Metadata, public_key);

        let current: Option<Timestamp> = match state.replaceable().get(&coordinate).await {
            Some(Some(event)) => Some(event.created_at),
            _ => match state
                .store()
                .get_replaceable_event(&public_key, Kind::Metadata, None)
                .await
            {
                Ok(entry) => entry.into_event().map(|e| e.created_at),
                Err(..) => None,
            },
        };

        if let Lookup::Found(event) = self.replaceable_from_network(coordinate.clone()).await {
            if current.map_or(true, |t| event.created_at > t) {
                if let Err(e) = state.store().put_replaceable_event(&event).await {
                    tracing::debug!(error = %e, "Profile revalidation store write failed.");
                }
                state.replaceable().observe(coordinate, &event).await;
                state.bus().emit(*event);
            }
        }
    }

    /// Fetch a user's declared relay list.
    pub async fn relay_list(&self, public_key: &PublicKey) -> Result<Option<RelayList>, Error> {
        match self.replaceable(public_key, Kind::RelayList, None).await? {
            Some(event) => {
                let mut list: RelayList = RelayList::default();
                for (url, metadata) in nip65::extract_relay_list(&event) {
                    list.original.push(url.clone());
                    match metadata {
                        Some(RelayMetadata::Read) => list.read.push(url.clone()),
                        Some(RelayMetadata::Write) => list.write.push(url.clone()),
                        None => {
                            list.read.push(url.clone());
                            list.write.push(url.clone());
                        }
                    }
                }
                Ok(Some(list))
            }
            None => Ok(None),
        }
    }
}
