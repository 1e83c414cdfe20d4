// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Relay Pool
//!
//! Owns one [`Relay`] per URL and runs multi-relay operations on top of them:
//! quorum publishing, fan-out subscriptions and one-shot queries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_utility::{task, time};
use nostr::{Event, EventId, Filter, RelayUrl, SubscriptionId};
use tokio::sync::mpsc;
use tokio::sync::RwLock;

mod error;
mod output;
mod subscription;

pub use self::error::Error;
pub use self::output::Output;
pub use self::subscription::{Subscription, SubscriptionHandler};
use crate::relay::constants::{DEFAULT_CONNECTION_TIMEOUT, WAIT_FOR_OK_TIMEOUT};
use crate::relay::{is_auth_required, Relay, RelayNotification};
use crate::shared::SharedState;
use crate::util;

/// Relay Pool
#[derive(Debug, Clone)]
pub struct Pool {
    state: SharedState,
    relays: Arc<RwLock<HashMap<RelayUrl, Relay>>>,
}

impl Pool {
    /// Create a new empty pool.
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            relays: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the shared state.
    #[inline]
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Get a relay by URL.
    pub async fn relay(&self, url: &RelayUrl) -> Result<Relay, Error> {
        let relays = self.relays.read().await;
        relays.get(url).cloned().ok_or(Error::RelayNotFound)
    }

    /// Get the relay for a URL, creating it if it doesn't exist yet.
    ///
    /// The relay is NOT connected here.
    pub async fn get_or_add_relay(&self, url: RelayUrl) -> Relay {
        // Optimistic read first: the common case is an existing relay
        {
            let relays = self.relays.read().await;
            if let Some(relay) = relays.get(&url) {
                return relay.clone();
            }
        }

        let mut relays = self.relays.write().await;
        relays
            .entry(url.clone())
            .or_insert_with(|| Relay::new(url, self.state.clone()))
            .clone()
    }

    /// Disconnect and remove a relay.
    pub async fn remove_relay(&self, url: &RelayUrl) {
        let mut relays = self.relays.write().await;
        if let Some(relay) = relays.remove(url) {
            relay.disconnect();
        }
    }

    /// URLs of all known relays.
    pub async fn relay_urls(&self) -> Vec<RelayUrl> {
        let relays = self.relays.read().await;
        relays.keys().cloned().collect()
    }

    /// Connect to a set of relays, creating missing ones.
    ///
    /// Connections are attempted in parallel; a failure on one relay never
    /// blocks the others.
    pub async fn ensure_connected(&self, urls: &[RelayUrl], timeout: Duration) -> Output<()> {
        let mut output: Output<()> = Output::new(());

        let (tx, mut rx) = mpsc::channel(urls.len().max(1));
        for url in urls.iter() {
            let relay: Relay = self.get_or_add_relay(url.clone()).await;
            let tx = tx.clone();
            task::spawn(async move {
                let res = relay.ensure_connected(timeout).await;
                let _ = tx.send((relay.url().clone(), res)).await;
            });
        }
        drop(tx);

        while let Some((url, res)) = rx.recv().await {
            match res {
                Ok(()) => {
                    output.success.insert(url);
                }
                Err(e) => {
                    output.failed.insert(url, e.to_string());
                }
            }
        }

        output
    }

    /// Publish an event to a set of relays.
    ///
    /// Returns as soon as a third of the relays (rounded up) have accepted the
    /// event; the remaining acknowledgements are collected in the background.
    /// If the quorum turns out to be unreachable, the whole publish fails.
    pub async fn publish(&self, event: &Event, urls: &[RelayUrl]) -> Result<Output<EventId>, Error> {
        if urls.is_empty() {
            return Err(Error::NoRelaysSpecified);
        }

        let total: usize = urls.len();
        let quorum: usize = total.div_ceil(3);

        let (tx, mut rx) = mpsc::channel(total);
        for url in urls.iter() {
            let relay: Relay = self.get_or_add_relay(url.clone()).await;
            let event: Event = event.clone();
            let tx = tx.clone();
            task::spawn(async move {
                let res = async {
                    relay.ensure_connected(DEFAULT_CONNECTION_TIMEOUT).await?;
                    relay.publish(&event, WAIT_FOR_OK_TIMEOUT).await
                }
                .await;
                let _ = tx.send((relay.url().clone(), res)).await;
            });
        }
        drop(tx);

        let mut output: Output<EventId> = Output::new(event.id);

        while let Some((url, res)) = rx.recv().await {
            match res {
                Ok(()) => {
                    output.success.insert(url);
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "Event not published.");
                    output.failed.insert(url, e.to_string());
                }
            }

            if output.success.len() >= quorum {
                // Drain the stragglers off the caller's critical path
                task::spawn(async move {
                    while let Some((url, res)) = rx.recv().await {
                        if let Err(e) = res {
                            tracing::debug!(url = %url, error = %e, "Event not published.");
                        }
                    }
                });

                self.commit_local(event).await?;

                return Ok(output);
            }
        }

        tracing::warn!(
            id = %event.id,
            failed = output.failed.len(),
            "Write quorum not reached."
        );

        Err(Error::EventNotPublished(output))
    }

    /// Make a confirmed event visible to the rest of the process.
    async fn commit_local(&self, event: &Event) -> Result<(), Error> {
        if let Some(coordinate) = util::coordinate(event) {
            self.state.store.put_replaceable_event(event).await?;
            self.state.replaceable.observe(coordinate, event).await;
        }

        self.state.events.insert(event).await;
        self.state.bus.emit(event.clone());

        Ok(())
    }

    /// Open a subscription on a set of relays.
    pub async fn subscribe<H>(
        &self,
        urls: &[RelayUrl],
        filters: Vec<Filter>,
        handler: H,
    ) -> Result<Subscription, Error>
    where
        H: SubscriptionHandler + 'static,
    {
        if urls.is_empty() {
            return Err(Error::NoRelaysSpecified);
        }

        let mut relays: Vec<Relay> = Vec::with_capacity(urls.len());
        for url in urls.iter() {
            relays.push(self.get_or_add_relay(url.clone()).await);
        }

        Ok(Subscription::start(
            relays,
            filters,
            self.state.bus.clone(),
            Arc::new(handler),
        ))
    }

    /// Fetch stored events from a set of relays, in a single shot.
    ///
    /// Duplicates are dropped and the result is sorted newest first, ties
    /// broken by ascending event id. Unreachable relays are skipped; use
    /// [`Pool::query`] when the per-relay outcomes matter.
    pub async fn fetch_events(
        &self,
        urls: &[RelayUrl],
        filter: Filter,
        timeout: Duration,
    ) -> Result<Vec<Event>, Error> {
        Ok(self.query(urls, filter, timeout).await?.val)
    }

    /// Fetch stored events from a set of relays, reporting which relays
    /// actually answered.
    ///
    /// A relay ends up in `success` only if it served the query; connection
    /// and subscribe failures land in `failed` with the reason. An empty
    /// `success` set means the result proves nothing about the network.
    pub async fn query(
        &self,
        urls: &[RelayUrl],
        filter: Filter,
        timeout: Duration,
    ) -> Result<Output<Vec<Event>>, Error> {
        if urls.is_empty() {
            return Err(Error::NoRelaysSpecified);
        }

        let (tx, mut rx) = mpsc::channel(urls.len());
        for url in urls.iter() {
            let relay: Relay = self.get_or_add_relay(url.clone()).await;
            let filter: Filter = filter.clone();
            let tx = tx.clone();
            task::spawn(async move {
                let res = fetch_from_relay(&relay, filter, timeout).await;
                let _ = tx.send((relay.url().clone(), res)).await;
            });
        }
        drop(tx);

        let mut seen: HashSet<EventId> = HashSet::new();
        let mut output: Output<Vec<Event>> = Output::new(Vec::new());

        while let Some((url, res)) = rx.recv().await {
            match res {
                Ok(events) => {
                    for event in events.into_iter() {
                        if seen.insert(event.id) {
                            output.val.push(event);
                        }
                    }
                    output.success.insert(url);
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "Skipping relay for fetch.");
                    output.failed.insert(url, e.to_string());
                }
            }
        }

        output
            .val
            .sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(output)
    }
}

async fn fetch_from_relay(
    relay: &Relay,
    filter: Filter,
    timeout: Duration,
) -> Result<Vec<Event>, crate::relay::Error> {
    let mut events: Vec<Event> = Vec::new();

    relay.ensure_connected(DEFAULT_CONNECTION_TIMEOUT).await?;

    let id: SubscriptionId = SubscriptionId::generate();
    let mut notifications = relay.notifications();

    relay.subscribe(id.clone(), vec![filter.clone()])?;

    let _ = time::timeout(Some(timeout), async {
        while let Ok(notification) = notifications.recv().await {
            match notification {
                RelayNotification::Event {
                    subscription_id,
                    event,
                } if subscription_id == id => {
                    events.push(*event);
                }
                RelayNotification::EndOfStoredEvents { subscription_id }
                    if subscription_id == id =>
                {
                    break;
                }
                RelayNotification::Closed {
                    subscription_id,
                    message,
                } if subscription_id == id => {
                    if is_auth_required(&message)
                        && relay.state().has_signer().await
                        && relay.authenticate().await.is_ok()
                        && relay.subscribe(id.clone(), vec![filter.clone()]).is_ok()
                    {
                        continue;
                    }
                    break;
                }
                RelayNotification::Status { status } if !status.is_connected() => break,
                _ => {}
            }
        }
    })
    .await;

    let _ = relay.unsubscribe(id);

    Ok(events)
}
