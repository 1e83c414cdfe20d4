// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_utility::task;
use nostr::{Event, EventId, Filter, RelayUrl, Timestamp};
use tokio::sync::{mpsc, RwLock};

use super::{sort_events, Error, SubRequest, TimelineKey, TimelineRef};
use crate::fetch::Fetcher;
use crate::pool::{Pool, Subscription, SubscriptionHandler};

/// Limit used when the filter doesn't carry one.
pub(super) const DEFAULT_LIMIT: usize = 100;

const LOAD_MORE_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNAL_CHANNEL_SIZE: usize = 1024;

/// One cached feed window.
#[derive(Debug)]
pub(super) struct Timeline {
    urls: Vec<RelayUrl>,
    filter: Filter,
    limit: usize,
    /// Always sorted newest first, ties ascending by id, no duplicate ids.
    refs: Vec<TimelineRef>,
}

/// Where a single sub-timeline reports to.
pub(super) trait TimelineSink: Send + Sync {
    fn on_events(&self, events: &[Event], eosed: bool);
    fn on_new(&self, event: &Event);
    fn on_auth_required(&self);
    fn on_close(&self, url: &RelayUrl, reason: &str);
}

enum Signal {
    Event(Box<Event>),
    Eose,
}

/// Bridges a pool subscription into a timeline driver task.
struct ForwardHandler {
    tx: mpsc::Sender<Signal>,
    sink: Arc<dyn TimelineSink>,
}

impl SubscriptionHandler for ForwardHandler {
    fn on_event(&self, event: &Event) {
        let _ = self.tx.try_send(Signal::Event(Box::new(event.clone())));
    }

    fn on_eose(&self) {
        let _ = self.tx.try_send(Signal::Eose);
    }

    fn on_auth_required(&self) {
        self.sink.on_auth_required();
    }

    fn on_close(&self, url: &RelayUrl, reason: &str) {
        self.sink.on_close(url, reason);
    }
}

/// Timelines
///
/// Process-wide registry of cached feed windows, one per (relay set, filter)
/// key. Windows are never destroyed; closing a subscription only releases the
/// network side.
#[derive(Debug, Clone)]
pub struct Timelines {
    pool: Pool,
    fetcher: Fetcher,
    timelines: Arc<RwLock<HashMap<TimelineKey, Timeline>>>,
    pub(super) merged: Arc<StdMutex<HashMap<TimelineKey, Vec<SubRequest>>>>,
    pub(super) active: Arc<StdMutex<HashSet<TimelineKey>>>,
}

impl Timelines {
    /// Create a new empty timeline registry.
    pub fn new(pool: Pool, fetcher: Fetcher) -> Self {
        Self {
            pool,
            fetcher,
            timelines: Arc::new(RwLock::new(HashMap::new())),
            merged: Arc::new(StdMutex::new(HashMap::new())),
            active: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Get the relay pool.
    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Subscribe one sub-timeline: serve the cached window, reconcile with
    /// fresh relay results, then keep it live.
    pub(super) async fn subscribe_single(
        &self,
        urls: Vec<RelayUrl>,
        filter: Filter,
        sink: Arc<dyn TimelineSink>,
    ) -> Result<(TimelineKey, Subscription), Error> {
        let key: TimelineKey = TimelineKey::from_request(&urls, &filter);
        let limit: usize = filter.limit.unwrap_or(DEFAULT_LIMIT);

        // Snapshot the cached window, creating the timeline if needed
        let (cached_refs, newest): (Vec<TimelineRef>, Option<Timestamp>) = {
            let mut timelines = self.timelines.write().await;
            let timeline = timelines.entry(key.clone()).or_insert_with(|| Timeline {
                urls: urls.clone(),
                filter: filter.clone(),
                limit,
                refs: Vec::new(),
            });
            let refs: Vec<TimelineRef> = timeline.refs.iter().take(limit).copied().collect();
            let newest: Option<Timestamp> = timeline.refs.first().map(|r| r.created_at);
            (refs, newest)
        };

        let cached: Vec<Event> = self.resolve(&cached_refs).await;
        if !cached.is_empty() {
            sink.on_events(&cached, false);
        }

        // Don't re-download what's already cached
        let mut net_filter: Filter = filter;
        if let Some(newest) = newest {
            net_filter = net_filter.since(Timestamp::from_secs(newest.as_secs() + 1));
        }

        let (tx, rx) = mpsc::channel::<Signal>(SIGNAL_CHANNEL_SIZE);

        let subscription: Subscription = self
            .pool
            .subscribe(
                &urls,
                vec![net_filter],
                ForwardHandler {
                    tx,
                    sink: sink.clone(),
                },
            )
            .await?;

        let this = self.clone();
        let driver_key = key.clone();
        task::spawn(async move { this.drive(driver_key, limit, rx, sink).await });

        Ok((key, subscription))
    }

    /// Driver loop for one sub-timeline. Ends when the pool subscription is
    /// closed (the forwarding handler is dropped, closing the channel).
    async fn drive(
        self,
        key: TimelineKey,
        limit: usize,
        mut rx: mpsc::Receiver<Signal>,
        sink: Arc<dyn TimelineSink>,
    ) {
        let mut buffer: Vec<Event> = Vec::new();
        let mut eosed: bool = false;

        while let Some(signal) = rx.recv().await {
            match signal {
                Signal::Event(event) if !eosed => {
                    buffer.push(*event);
                    sort_events(&mut buffer);
                    buffer.truncate(limit);

                    let merged: Vec<Event> = self.merge_with_cached(&key, &buffer, limit).await;
                    sink.on_events(&merged, false);
                }
                Signal::Event(event) => {
                    if self.insert_live(&key, &event).await {
                        sink.on_new(&event);
                    }
                }
                Signal::Eose => {
                    eosed = true;
                    self.finalize(&key, &buffer, limit).await;
                    buffer = Vec::new();

                    let events: Vec<Event> = self.serve_cached(&key, limit).await;
                    sink.on_events(&events, true);
                }
            }
        }
    }

    /// Resolve references through the event cache. References whose body fell
    /// out of the cache are silently dropped.
    async fn resolve(&self, refs: &[TimelineRef]) -> Vec<Event> {
        let mut events: Vec<Event> = Vec::with_capacity(refs.len());
        for r in refs.iter() {
            if let Some(event) = self.pool.state().events().get(&r.id).await {
                events.push(event);
            }
        }
        events
    }

    /// Resolve references through the event cache, refetching evicted bodies
    /// by id. Relays known to have each event serve as hints.
    async fn resolve_or_fetch(&self, refs: &[TimelineRef]) -> Vec<Event> {
        let state = self.pool.state();
        let mut events: Vec<Event> = Vec::with_capacity(refs.len());
        for r in refs.iter() {
            if let Some(event) = state.events().get(&r.id).await {
                events.push(event);
                continue;
            }
            let hints: Vec<RelayUrl> = state.seen().relays(&r.id).await;
            if let Some(event) = self.fetcher.event_by_id(r.id, hints).await {
                events.push(event);
            }
        }
        events
    }

    async fn serve_cached(&self, key: &TimelineKey, limit: usize) -> Vec<Event> {
        let refs: Vec<TimelineRef> = {
            let timelines = self.timelines.read().await;
            timelines
                .get(key)
                .map(|t| t.refs.iter().take(limit).copied().collect())
                .unwrap_or_default()
        };
        self.resolve(&refs).await
    }

    async fn merge_with_cached(
        &self,
        key: &TimelineKey,
        buffer: &[Event],
        limit: usize,
    ) -> Vec<Event> {
        let mut merged: Vec<Event> = buffer.to_vec();
        let mut seen: HashSet<EventId> = merged.iter().map(|e| e.id).collect();

        for event in self.serve_cached(key, limit).await.into_iter() {
            if seen.insert(event.id) {
                merged.push(event);
            }
        }

        sort_events(&mut merged);
        merged.truncate(limit);
        merged
    }

    /// Reconcile the fresh end-of-stored-events batch with the cached window.
    async fn finalize(&self, key: &TimelineKey, buffer: &[Event], limit: usize) {
        let fresh: Vec<TimelineRef> = buffer.iter().map(TimelineRef::of).collect();

        let mut timelines = self.timelines.write().await;
        let timeline = match timelines.get_mut(key) {
            Some(timeline) => timeline,
            None => return,
        };

        if timeline.refs.is_empty() {
            timeline.refs = fresh;
        } else if fresh.len() >= limit {
            // A limit-sized fresh batch means the relays had at least a full
            // window of events newer than the cache: the old references are
            // treated as stale and replaced outright.
            timeline.refs = fresh;
        } else if !fresh.is_empty() {
            // New before old, never duplicating
            let existing: HashSet<EventId> = timeline.refs.iter().map(|r| r.id).collect();
            let mut merged: Vec<TimelineRef> = fresh
                .into_iter()
                .filter(|r| !existing.contains(&r.id))
                .collect();
            merged.extend(timeline.refs.iter().copied());
            merged.sort_unstable();
            timeline.refs = merged;
        }
    }

    /// Insert a live event at its sorted position. Returns whether the
    /// timeline changed.
    async fn insert_live(&self, key: &TimelineKey, event: &Event) -> bool {
        let r: TimelineRef = TimelineRef::of(event);

        let mut timelines = self.timelines.write().await;
        let timeline = match timelines.get_mut(key) {
            Some(timeline) => timeline,
            None => return false,
        };

        match timeline.refs.binary_search(&r) {
            // Exact (created_at, id) match: already present
            Ok(..) => false,
            Err(pos) if pos == timeline.refs.len() && !timeline.refs.is_empty() => {
                // Older than everything cached: the window is not extended
                // backward once it's full
                if timeline.refs.len() < timeline.limit {
                    timeline.refs.push(r);
                    true
                } else {
                    false
                }
            }
            Err(pos) => {
                timeline.refs.insert(pos, r);
                true
            }
        }
    }

    /// Page backward: serve references strictly older than `until` from the
    /// cache (refetching evicted bodies by id), then fetch the remainder from
    /// the relays.
    pub(super) async fn load_more_single(
        &self,
        key: &TimelineKey,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<Event>, Error> {
        let (urls, filter, older): (Vec<RelayUrl>, Filter, Vec<TimelineRef>) = {
            let timelines = self.timelines.read().await;
            let timeline = timelines.get(key).ok_or(Error::UnknownTimeline)?;
            let older: Vec<TimelineRef> = timeline
                .refs
                .iter()
                .filter(|r| r.created_at < until)
                .take(limit)
                .copied()
                .collect();
            (timeline.urls.clone(), timeline.filter.clone(), older)
        };

        // The cursor advances past every cached reference, so an evicted body
        // that stayed unresolved would be skipped forever. Refetch it by id.
        let mut events: Vec<Event> = self.resolve_or_fetch(&older).await;
        if events.len() >= limit {
            events.truncate(limit);
            return Ok(events);
        }

        // Advance the cursor past the last cached result
        let next_until: Timestamp = match older.last() {
            Some(last) => Timestamp::from_secs(last.created_at.as_secs().saturating_sub(1)),
            None => Timestamp::from_secs(until.as_secs().saturating_sub(1)),
        };

        let remainder: usize = limit - events.len();
        let net_filter: Filter = filter.until(next_until).limit(remainder);

        let fetched: Vec<Event> = self
            .pool
            .fetch_events(&urls, net_filter, LOAD_MORE_TIMEOUT)
            .await?;

        // Append at the tail, skipping anything not strictly older than the
        // existing tail: a concurrent load may have appended already
        {
            let mut timelines = self.timelines.write().await;
            if let Some(timeline) = timelines.get_mut(key) {
                for event in fetched.iter() {
                    match timeline.refs.last() {
                        Some(tail) if event.created_at >= tail.created_at => continue,
                        _ => timeline.refs.push(TimelineRef::of(event)),
                    }
                }
            }
        }

        let mut seen: HashSet<EventId> = events.iter().map(|e| e.id).collect();
        for event in fetched.into_iter() {
            if seen.insert(event.id) {
                events.push(event);
            }
        }

        sort_events(&mut events);
        events.truncate(limit);

        Ok(events)
    }
}
