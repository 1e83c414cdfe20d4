// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Client
//!
//! Thin facade wiring the pool, the timelines and the fetcher around one
//! shared state. Constructed once at process start and passed around
//! explicitly; there are no ambient singletons.

use std::sync::Arc;
use std::time::Duration;

use nostr::nips::nip01::Coordinate;
use nostr::signer::{IntoNostrSigner, NostrSigner};
use nostr::{Event, EventBuilder, EventId, Kind, Metadata, PublicKey, RelayUrl, Timestamp};
use thiserror::Error;

use crate::fetch::{self, Fetcher, RelayList};
use crate::pool::{self, Output, Pool};
use crate::relay::constants::DEFAULT_CONNECTION_TIMEOUT;
use crate::shared::{SharedState, SharedStateError};
use crate::store::{EventStore, IntoEventStore, StoreError};
use crate::timeline::{self, SubRequest, TimelineHandle, TimelineHandler, TimelineKey, Timelines};
use crate::transport::{IntoTransport, Transport};
use crate::{policy, relay};

/// Client error
#[derive(Debug, Error)]
pub enum Error {
    /// Relay error
    #[error(transparent)]
    Relay(#[from] relay::Error),
    /// Pool error
    #[error(transparent)]
    Pool(#[from] pool::Error),
    /// Timeline error
    #[error(transparent)]
    Timeline(#[from] timeline::Error),
    /// Fetch error
    #[error(transparent)]
    Fetch(#[from] fetch::Error),
    /// Shared state error
    #[error(transparent)]
    SharedState(#[from] SharedStateError),
    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Event builder error
    #[error(transparent)]
    EventBuilder(#[from] nostr::event::builder::Error),
    /// Signer error
    #[error(transparent)]
    Signer(#[from] nostr::signer::SignerError),
}

/// Client builder
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn EventStore>>,
    signer: Option<Arc<dyn NostrSigner>>,
}

impl ClientBuilder {
    /// Create a new builder on top of a transport.
    pub fn new<T>(transport: T) -> Self
    where
        T: IntoTransport,
    {
        Self {
            transport: transport.into_transport(),
            store: None,
            signer: None,
        }
    }

    /// Set the persistent store (defaults to an in-memory one).
    pub fn store<S>(mut self, store: S) -> Self
    where
        S: IntoEventStore,
    {
        self.store = Some(store.into_event_store());
        self
    }

    /// Set the signer.
    pub fn signer<S>(mut self, signer: S) -> Self
    where
        S: IntoNostrSigner,
    {
        self.signer = Some(signer.into_nostr_signer());
        self
    }

    /// Build the client.
    pub fn build(self) -> Client {
        let state: SharedState = SharedState::new(self.transport, self.store, self.signer);
        let pool: Pool = Pool::new(state.clone());
        let fetcher: Fetcher = Fetcher::new(pool.clone());
        let timelines: Timelines = Timelines::new(pool.clone(), fetcher.clone());

        Client {
            state,
            pool,
            timelines,
            fetcher,
        }
    }
}

/// Client
#[derive(Debug, Clone)]
pub struct Client {
    state: SharedState,
    pool: Pool,
    timelines: Timelines,
    fetcher: Fetcher,
}

impl Client {
    /// Create a new client builder.
    #[inline]
    pub fn builder<T>(transport: T) -> ClientBuilder
    where
        T: IntoTransport,
    {
        ClientBuilder::new(transport)
    }

    /// Get the shared state.
    #[inline]
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Get the relay pool.
    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Get the timelines registry.
    #[inline]
    pub fn timelines(&self) -> &Timelines {
        &self.timelines
    }

    /// Get the coalescing fetcher.
    #[inline]
    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Set the signer.
    pub async fn set_signer<S>(&self, signer: S)
    where
        S: IntoNostrSigner,
    {
        self.state.set_signer(signer.into_nostr_signer()).await;
    }

    /// Unset the signer.
    pub async fn unset_signer(&self) {
        self.state.unset_signer().await;
    }

    /// Add a relay to the pool and try to connect to it.
    pub async fn add_relay(&self, url: RelayUrl) -> Result<(), Error> {
        let relay = self.pool.get_or_add_relay(url).await;
        relay.ensure_connected(DEFAULT_CONNECTION_TIMEOUT).await?;
        Ok(())
    }

    /// Disconnect and remove a relay.
    pub async fn remove_relay(&self, url: &RelayUrl) {
        self.pool.remove_relay(url).await;
    }

    /// Publish an event to relays chosen by the selection policy.
    pub async fn publish(&self, event: &Event) -> Result<Output<EventId>, Error> {
        self.publish_to(event, &[]).await
    }

    /// Publish an event.
    ///
    /// Explicit relays take precedence; with none given, targets come from
    /// the selection policy (mentions' read relays, broadcast rules, the
    /// author's write relays).
    pub async fn publish_to(
        &self,
        event: &Event,
        urls: &[RelayUrl],
    ) -> Result<Output<EventId>, Error> {
        let targets: Vec<RelayUrl> = policy::write_targets(&self.fetcher, event, urls).await;
        let output: Output<EventId> = self.pool.publish(event, &targets).await?;

        // A fresher version of a replaceable coordinate now exists
        if let Some(coordinate) = crate::util::coordinate(event) {
            self.fetcher.invalidate(&coordinate).await;
            self.state.replaceable().observe(coordinate, event).await;
        }

        Ok(output)
    }

    /// Sign an event with the configured signer and publish it.
    pub async fn send_event_builder(&self, builder: EventBuilder) -> Result<Output<EventId>, Error> {
        let signer: Arc<dyn NostrSigner> = self.state.signer().await?;
        let event: Event = builder.sign(&signer).await?;
        self.publish(&event).await
    }

    /// Subscribe a logical feed built from several relay-set/filter
    /// sub-requests.
    pub async fn subscribe_timeline<H>(
        &self,
        sub_requests: Vec<SubRequest>,
        limit: usize,
        handler: H,
    ) -> Result<TimelineHandle, Error>
    where
        H: TimelineHandler + 'static,
    {
        Ok(self.timelines.subscribe(sub_requests, limit, handler).await?)
    }

    /// Page a feed backward from `until`.
    pub async fn load_more_timeline(
        &self,
        key: &TimelineKey,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<Event>, Error> {
        Ok(self.timelines.load_more(key, until, limit).await?)
    }

    /// Fetch a single event by hex id or bech32 pointer.
    pub async fn fetch_event(&self, identifier: &str) -> Result<Option<Event>, Error> {
        Ok(self.fetcher.event(identifier).await?)
    }

    /// Fetch a profile by hex public key or bech32 pointer,
    /// stale-while-revalidate.
    pub async fn fetch_profile(&self, identifier: &str) -> Result<Option<Metadata>, Error> {
        Ok(self.fetcher.profile(identifier).await?)
    }

    /// Fetch a user's profile metadata, stale-while-revalidate.
    pub async fn fetch_metadata(&self, public_key: &PublicKey) -> Result<Option<Metadata>, Error> {
        Ok(self.fetcher.metadata(public_key).await?)
    }

    /// Fetch a user's declared relay list.
    pub async fn fetch_relay_list(
        &self,
        public_key: &PublicKey,
    ) -> Result<Option<RelayList>, Error> {
        Ok(self.fetcher.relay_list(public_key).await?)
    }

    /// Fetch the newest replaceable event for a coordinate.
    pub async fn fetch_replaceable(
        &self,
        coordinate: &Coordinate,
    ) -> Result<Option<Event>, Error> {
        let identifier: Option<&str> =
            (!coordinate.identifier.is_empty()).then_some(coordinate.identifier.as_str());
        Ok(self
            .fetcher
            .replaceable(&coordinate.public_key, coordinate.kind, identifier)
            .await?)
    }

    /// Bulk lookup of one replaceable kind for many authors.
    pub async fn fetch_many_replaceable(
        &self,
        public_keys: &[PublicKey],
        kind: Kind,
    ) -> Result<Vec<Option<Event>>, Error> {
        Ok(self.fetcher.many_replaceable(public_keys, kind).await?)
    }

    /// Connect to a set of relays, creating missing ones.
    pub async fn connect_relays(&self, urls: &[RelayUrl], timeout: Duration) -> Output<()> {
        self.pool.ensure_connected(urls, timeout).await
    }

    /// Seed the in-memory caches from every profile in the persistent store.
    ///
    /// Run once at startup: profile lookups for known users then answer
    /// without touching the store or the network.
    pub async fn warm_up(&self) -> Result<(), Error> {
        let profiles: Vec<Event> = self.state.store().profiles().await?;
        let count: usize = profiles.len();

        for event in profiles.into_iter() {
            if let Some(coordinate) = crate::util::coordinate(&event) {
                self.state.replaceable().observe(coordinate, &event).await;
            }
            self.state.events().insert(&event).await;
        }

        tracing::debug!(profiles = count, "Warmed up caches from the store.");

        Ok(())
    }
}
