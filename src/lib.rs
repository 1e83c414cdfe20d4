// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Relay aggregation and timeline synchronization core for nostr clients.
//!
//! Fans logical queries out to many relays, merges and deduplicates the
//! result streams into consistent feeds, pages them backward, keeps them
//! live, and coalesces point lookups, while relays may be slow, flaky or
//! demand authentication mid-stream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod bus;
pub mod client;
pub mod fetch;
pub mod policy;
pub mod pool;
pub mod prelude;
pub mod relay;
pub mod shared;
pub mod store;
pub mod timeline;
pub mod transport;

mod util;

pub use self::bus::EventBus;
pub use self::client::{Client, ClientBuilder};
pub use self::fetch::{Fetcher, RelayList};
pub use self::pool::{Output, Pool, Subscription, SubscriptionHandler};
pub use self::relay::{Relay, RelayNotification, RelayStatus};
pub use self::shared::SharedState;
pub use self::store::{EventStore, MemoryStore, StoreEntry, StoreError};
pub use self::timeline::{
    SubRequest, TimelineHandle, TimelineHandler, TimelineKey, TimelineRef, Timelines,
};
pub use self::transport::{Transport, TransportError};
