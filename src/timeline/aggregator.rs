// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use nostr::{Event, EventId, RelayUrl, Timestamp};

use super::store::TimelineSink;
use super::{
    sort_events, Error, SubRequest, TimelineHandle, TimelineHandler, TimelineKey, Timelines,
};
use crate::pool::Subscription;

/// Shared accounting for one logical feed built from several sub-timelines.
struct AggregatorState {
    handler: Arc<dyn TimelineHandler>,
    merged: StdMutex<HashMap<EventId, Event>>,
    eosed: AtomicUsize,
    total: usize,
    limit: usize,
    seen_new: StdMutex<HashSet<EventId>>,
}

/// Per-sub-timeline view into the shared aggregator state.
struct AggregatorSink {
    state: Arc<AggregatorState>,
    counted: AtomicBool,
}

impl TimelineSink for AggregatorSink {
    fn on_events(&self, events: &[Event], eosed: bool) {
        let state: &AggregatorState = &self.state;

        let added: bool = {
            let mut merged = state.merged.lock().expect("poisoned merged lock");
            let mut added = false;
            for event in events.iter() {
                if !merged.contains_key(&event.id) {
                    merged.insert(event.id, event.clone());
                    added = true;
                }
            }
            added
        };

        // Each sub-timeline counts toward the quorum at most once
        let eosed_count: usize = if eosed && !self.counted.swap(true, Ordering::SeqCst) {
            state.eosed.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            state.eosed.load(Ordering::SeqCst)
        };

        // A majority of sub-timelines unlocks partial results; the `eosed`
        // flag upgrades once every one of them has reported in. An empty
        // increment does not trigger a re-sort.
        let quorum: usize = state.total / 2;
        if eosed_count >= quorum && (added || eosed) {
            let mut feed: Vec<Event> = {
                let merged = state.merged.lock().expect("poisoned merged lock");
                merged.values().cloned().collect()
            };
            sort_events(&mut feed);
            feed.truncate(state.limit);

            state.handler.on_events(&feed, eosed_count >= state.total);
        }
    }

    fn on_new(&self, event: &Event) {
        let is_new: bool = {
            let mut seen = self.state.seen_new.lock().expect("poisoned seen lock");
            seen.insert(event.id)
        };

        if is_new {
            self.state.handler.on_new(event);
        }
    }

    fn on_auth_required(&self) {
        self.state.handler.on_auth_required();
    }

    fn on_close(&self, url: &RelayUrl, reason: &str) {
        self.state.handler.on_close(url, reason);
    }
}

impl Timelines {
    /// Subscribe a logical feed built from several relay-set/filter
    /// sub-requests.
    ///
    /// Each sub-request drives its own cached timeline; events are merged by
    /// id across all of them and truncated to `limit` on every batch that
    /// added something new.
    pub async fn subscribe<H>(
        &self,
        sub_requests: Vec<SubRequest>,
        limit: usize,
        handler: H,
    ) -> Result<TimelineHandle, Error>
    where
        H: TimelineHandler + 'static,
    {
        if sub_requests.is_empty() {
            return Err(Error::NoSubRequests);
        }

        let keys: Vec<TimelineKey> = sub_requests
            .iter()
            .map(|r| TimelineKey::from_request(&r.urls, &r.filter))
            .collect();
        let merged_key: TimelineKey = TimelineKey::merged(&keys);

        {
            let mut active = self.active.lock().expect("poisoned active lock");
            if !active.insert(merged_key.clone()) {
                // Not prevented, only surfaced: the caller may well want two
                // views over the same feed
                tracing::warn!(key = %merged_key, "Duplicate concurrent timeline subscription.");
            }
        }

        // Remember the constituents for backward paging against the merged key
        {
            let mut merged = self.merged.lock().expect("poisoned merged lock");
            merged.insert(merged_key.clone(), sub_requests.clone());
        }

        let state: Arc<AggregatorState> = Arc::new(AggregatorState {
            handler: Arc::new(handler),
            merged: StdMutex::new(HashMap::new()),
            eosed: AtomicUsize::new(0),
            total: sub_requests.len(),
            limit,
            seen_new: StdMutex::new(HashSet::new()),
        });

        let mut subscriptions: Vec<Subscription> = Vec::with_capacity(sub_requests.len());
        for request in sub_requests.into_iter() {
            let sink = Arc::new(AggregatorSink {
                state: state.clone(),
                counted: AtomicBool::new(false),
            });
            let (.., subscription) = self
                .subscribe_single(request.urls, request.filter, sink)
                .await?;
            subscriptions.push(subscription);
        }

        Ok(TimelineHandle {
            key: merged_key,
            subscriptions,
            active: self.active.clone(),
        })
    }

    /// Page a merged feed backward: fan out to every constituent
    /// sub-timeline, merge by id, sort and truncate.
    ///
    /// Never returns an event with `created_at >= until`.
    pub async fn load_more(
        &self,
        key: &TimelineKey,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<Event>, Error> {
        let sub_requests: Vec<SubRequest> = {
            let merged = self.merged.lock().expect("poisoned merged lock");
            merged.get(key).cloned()
        }
        .ok_or(Error::UnknownTimeline)?;

        let mut seen: HashSet<EventId> = HashSet::new();
        let mut events: Vec<Event> = Vec::new();

        for request in sub_requests.into_iter() {
            let sub_key: TimelineKey = TimelineKey::from_request(&request.urls, &request.filter);
            match self.load_more_single(&sub_key, until, limit).await {
                Ok(page) => {
                    for event in page.into_iter() {
                        if seen.insert(event.id) {
                            events.push(event);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(key = %sub_key, error = %e, "Load more failed for sub-timeline.");
                }
            }
        }

        sort_events(&mut events);
        events.truncate(limit);

        Ok(events)
    }
}
