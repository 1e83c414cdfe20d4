// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

mod common;

use std::sync::Arc;
use std::time::Duration;

use nostr::nips::nip19::ToBech32;
use nostr::nips::nip65::RelayMetadata;
use nostr::{Event, EventBuilder, Keys, Kind, Metadata, Timestamp};
use nostr_timeline::{Client, EventStore, MemoryStore, StoreEntry};

use crate::common::{text_note, url, MockTransport, ScriptedRelay};

fn profile_event(keys: &Keys, name: &str, created_at: u64) -> Event {
    EventBuilder::metadata(&Metadata::new().name(name))
        .custom_created_at(Timestamp::from_secs(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

#[tokio::test]
async fn test_event_by_id_uses_hints() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();
    let event = text_note(&keys, "target", 100);

    // The event lives on a relay outside the well-known set
    let hint = url("wss://hint.example.com");
    let relay = transport.add(&hint, ScriptedRelay::with_stored(vec![event.clone()]));

    let client = Client::builder(transport).build();

    let found = client
        .fetcher()
        .event_by_id(event.id, vec![hint])
        .await
        .unwrap();
    assert_eq!(found.id, event.id);

    // A second lookup is answered from the cache
    let reqs = relay.req_count();
    let again = client.fetch_event(&event.id.to_hex()).await.unwrap();
    assert_eq!(again.unwrap().id, event.id);
    assert_eq!(relay.req_count(), reqs);
}

#[tokio::test]
async fn test_fetch_event_rejects_malformed_identifier() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::builder(transport).build();

    assert!(client.fetch_event("not-an-id").await.is_err());
    assert!(client.fetch_event("note1invalid").await.is_err());
    assert!(client.fetch_profile("npub1invalid").await.is_err());
}

#[tokio::test]
async fn test_replaceable_newest_wins() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();
    let old = profile_event(&keys, "old", 100);
    let new = profile_event(&keys, "new", 200);

    // Different relays hold different versions
    transport.add(
        &url("wss://relay.damus.io"),
        ScriptedRelay::with_stored(vec![old]),
    );
    transport.add(
        &url("wss://nos.lol"),
        ScriptedRelay::with_stored(vec![new.clone()]),
    );

    let client = Client::builder(transport).build();

    let event = client
        .fetcher()
        .replaceable(&keys.public_key(), Kind::Metadata, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.id, new.id);
}

#[tokio::test]
async fn test_negative_lookup_is_cached() {
    let transport = Arc::new(MockTransport::new());
    let relay = transport.add(&url("wss://relay.damus.io"), ScriptedRelay::new());

    let client = Client::builder(transport).build();
    let public_key = Keys::generate().public_key();

    let res = client
        .fetcher()
        .replaceable(&public_key, Kind::Metadata, None)
        .await
        .unwrap();
    assert!(res.is_none());

    // The miss is remembered: no second round-trip
    let reqs = relay.req_count();
    let res = client
        .fetcher()
        .replaceable(&public_key, Kind::Metadata, None)
        .await
        .unwrap();
    assert!(res.is_none());
    assert_eq!(relay.req_count(), reqs);

    // And persisted
    let entry = client
        .state()
        .store()
        .get_replaceable_event(&public_key, Kind::Metadata, None)
        .await
        .unwrap();
    assert_eq!(entry, StoreEntry::Absent);
}

#[tokio::test]
async fn test_relay_outage_does_not_persist_a_miss() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();
    let profile = profile_event(&keys, "alice", 100);

    // No relays registered: every connection is refused
    let client = Client::builder(transport.clone()).build();

    let res = client
        .fetcher()
        .replaceable(&keys.public_key(), Kind::Metadata, None)
        .await
        .unwrap();
    assert!(res.is_none());

    // A query that reached no relay proves nothing: the coordinate stays
    // unknown instead of becoming a remembered miss
    let entry = client
        .state()
        .store()
        .get_replaceable_event(&keys.public_key(), Kind::Metadata, None)
        .await
        .unwrap();
    assert_eq!(entry, StoreEntry::Unknown);

    // The relay comes back: the next lookup finds the profile
    transport.add(
        &url("wss://relay.damus.io"),
        ScriptedRelay::with_stored(vec![profile.clone()]),
    );

    let found = client
        .fetcher()
        .replaceable(&keys.public_key(), Kind::Metadata, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, profile.id);
}

#[tokio::test]
async fn test_profile_stale_while_revalidate() {
    let transport = Arc::new(MockTransport::new());
    let store = MemoryStore::new();
    let keys = Keys::generate();
    let old = profile_event(&keys, "old", 100);
    let new = profile_event(&keys, "new", 200);

    store.put_replaceable_event(&old).await.unwrap();
    transport.add(
        &url("wss://relay.damus.io"),
        ScriptedRelay::with_stored(vec![new.clone()]),
    );

    let client = Client::builder(transport).store(store.clone()).build();
    let mut bus = client.state().bus().subscribe();

    // The stale local version answers immediately
    let profile = client
        .fetch_profile(&keys.public_key().to_hex())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.name.as_deref(), Some("old"));

    // The background refresh finds the newer version and announces it
    let refreshed = tokio::time::timeout(Duration::from_secs(5), bus.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.id, new.id);

    let entry = store
        .get_replaceable_event(&keys.public_key(), Kind::Metadata, None)
        .await
        .unwrap();
    assert_eq!(entry.into_event().unwrap().id, new.id);

    // Subsequent reads see the refresh, through the bech32 form too
    let npub = keys.public_key().to_bech32().unwrap();
    let profile = client.fetch_profile(&npub).await.unwrap().unwrap();
    assert_eq!(profile.name.as_deref(), Some("new"));
}

#[tokio::test]
async fn test_relay_list_parsing() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();

    let read = url("wss://read.example.com");
    let write = url("wss://write.example.com");
    let both = url("wss://both.example.com");

    let event = EventBuilder::relay_list([
        (read.clone(), Some(RelayMetadata::Read)),
        (write.clone(), Some(RelayMetadata::Write)),
        (both.clone(), None),
    ])
    .sign_with_keys(&keys)
    .unwrap();

    transport.add(
        &url("wss://relay.damus.io"),
        ScriptedRelay::with_stored(vec![event]),
    );

    let client = Client::builder(transport).build();

    let list = client
        .fetch_relay_list(&keys.public_key())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(list.read.len(), 2);
    assert!(list.read.contains(&read));
    assert!(list.read.contains(&both));

    assert_eq!(list.write.len(), 2);
    assert!(list.write.contains(&write));
    assert!(list.write.contains(&both));

    assert_eq!(list.original, vec![read, write, both]);
}

#[tokio::test]
async fn test_many_replaceable_aligned_output() {
    let transport = Arc::new(MockTransport::new());
    let store = MemoryStore::new();

    let on_relay = Keys::generate();
    let nowhere = Keys::generate();
    let in_store = Keys::generate();

    let remote = profile_event(&on_relay, "remote", 100);
    let local = profile_event(&in_store, "local", 100);

    store.put_replaceable_event(&local).await.unwrap();
    transport.add(
        &url("wss://relay.damus.io"),
        ScriptedRelay::with_stored(vec![remote.clone()]),
    );

    let client = Client::builder(transport).store(store).build();

    let out = client
        .fetch_many_replaceable(
            &[
                on_relay.public_key(),
                nowhere.public_key(),
                in_store.public_key(),
            ],
            Kind::Metadata,
        )
        .await
        .unwrap();

    assert_eq!(out.len(), 3);
    assert_eq!(out[0].as_ref().unwrap().id, remote.id);
    assert!(out[1].is_none());
    assert_eq!(out[2].as_ref().unwrap().id, local.id);
}
