// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr::{Event, EventId, Filter, Keys, Kind, RelayUrl, Timestamp};
use nostr_timeline::{Client, SubRequest, TimelineHandler};

use crate::common::{text_note, url, wait_for, MockTransport, ScriptedRelay};

#[derive(Default)]
struct FeedInner {
    batches: Mutex<Vec<(Vec<EventId>, bool)>>,
    live: Mutex<Vec<EventId>>,
    closes: Mutex<Vec<(RelayUrl, String)>>,
}

#[derive(Clone, Default)]
struct FeedCollector {
    inner: Arc<FeedInner>,
}

impl FeedCollector {
    /// Feed of the last batch flagged as complete.
    fn final_feed(&self) -> Option<Vec<EventId>> {
        self.inner
            .batches
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(.., eosed)| *eosed)
            .map(|(ids, ..)| ids.clone())
    }

    fn live_ids(&self) -> Vec<EventId> {
        self.inner.live.lock().unwrap().clone()
    }

    fn closes(&self) -> Vec<(RelayUrl, String)> {
        self.inner.closes.lock().unwrap().clone()
    }
}

impl TimelineHandler for FeedCollector {
    fn on_events(&self, events: &[Event], eosed: bool) {
        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
        self.inner.batches.lock().unwrap().push((ids, eosed));
    }

    fn on_new(&self, event: &Event) {
        self.inner.live.lock().unwrap().push(event.id);
    }

    fn on_close(&self, url: &RelayUrl, reason: &str) {
        self.inner
            .closes
            .lock()
            .unwrap()
            .push((url.clone(), reason.to_string()));
    }
}

#[tokio::test]
async fn test_merged_feed_dedup_and_order() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();
    let e1 = text_note(&keys, "one", 100);
    let e2 = text_note(&keys, "two", 90);
    let e3 = text_note(&keys, "three", 80);

    let url_a = url("wss://a.example.com");
    let url_b = url("wss://b.example.com");
    transport.add(
        &url_a,
        ScriptedRelay::with_stored(vec![e1.clone(), e2.clone()]),
    );
    transport.add(
        &url_b,
        ScriptedRelay::with_stored(vec![e2.clone(), e3.clone()]),
    );

    let client = Client::builder(transport).build();
    let collector = FeedCollector::default();

    let handle = client
        .subscribe_timeline(
            vec![SubRequest::new(
                vec![url_a, url_b],
                Filter::new().kind(Kind::TextNote),
            )],
            10,
            collector.clone(),
        )
        .await
        .unwrap();

    wait_for(|| collector.final_feed().is_some(), Duration::from_secs(5)).await;

    // Merged, deduplicated, newest first
    assert_eq!(collector.final_feed().unwrap(), vec![e1.id, e2.id, e3.id]);

    // No batch ever contained a duplicate
    for (ids, ..) in collector.inner.batches.lock().unwrap().iter() {
        let unique: std::collections::HashSet<EventId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }

    handle.close();
}

#[tokio::test]
async fn test_live_insert_respects_capacity() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();
    let e1 = text_note(&keys, "one", 100);
    let e2 = text_note(&keys, "two", 90);
    let e4 = text_note(&keys, "fresh", 110);
    let e5 = text_note(&keys, "ancient", 50);

    let url_a = url("wss://a.example.com");
    let relay = transport.add(
        &url_a,
        ScriptedRelay::with_stored(vec![e1.clone(), e2.clone()]),
    );

    let client = Client::builder(transport).build();
    let collector = FeedCollector::default();

    let handle = client
        .subscribe_timeline(
            vec![SubRequest::new(
                vec![url_a],
                Filter::new().kind(Kind::TextNote).limit(2),
            )],
            2,
            collector.clone(),
        )
        .await
        .unwrap();

    wait_for(|| collector.final_feed().is_some(), Duration::from_secs(5)).await;
    assert_eq!(collector.final_feed().unwrap(), vec![e1.id, e2.id]);

    // A newer live event lands at the front of the window
    relay.emit_live(&e4);
    wait_for(
        || collector.live_ids().contains(&e4.id),
        Duration::from_secs(5),
    )
    .await;

    // Repeated delivery of the same live event is not reported again
    relay.emit_live(&e4);
    // Older than everything cached while the window is full: dropped
    relay.emit_live(&e5);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(collector.live_ids(), vec![e4.id]);

    handle.close();
}

#[tokio::test]
async fn test_load_more_pages_backward() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();
    let e1 = text_note(&keys, "one", 100);
    let e2 = text_note(&keys, "two", 90);
    let e3 = text_note(&keys, "three", 80);
    let e4 = text_note(&keys, "four", 70);
    let e5 = text_note(&keys, "five", 60);

    let url_a = url("wss://a.example.com");
    transport.add(
        &url_a,
        ScriptedRelay::with_stored(vec![
            e1.clone(),
            e2.clone(),
            e3.clone(),
            e4.clone(),
            e5.clone(),
        ]),
    );

    let client = Client::builder(transport).build();
    let collector = FeedCollector::default();

    let handle = client
        .subscribe_timeline(
            vec![SubRequest::new(
                vec![url_a],
                Filter::new().kind(Kind::TextNote).limit(2),
            )],
            2,
            collector.clone(),
        )
        .await
        .unwrap();

    wait_for(|| collector.final_feed().is_some(), Duration::from_secs(5)).await;
    assert_eq!(collector.final_feed().unwrap(), vec![e1.id, e2.id]);

    // Page strictly older than the oldest displayed event
    let page = client
        .load_more_timeline(handle.key(), Timestamp::from_secs(90), 2)
        .await
        .unwrap();

    let ids: Vec<EventId> = page.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![e3.id, e4.id]);
    for event in page.iter() {
        assert!(event.created_at < Timestamp::from_secs(90));
    }

    // The next page continues from there
    let page = client
        .load_more_timeline(handle.key(), Timestamp::from_secs(70), 2)
        .await
        .unwrap();
    let ids: Vec<EventId> = page.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![e5.id]);

    handle.close();
}

#[tokio::test]
async fn test_load_more_survives_close() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::builder(transport).build();

    let key = {
        let collector = FeedCollector::default();
        let url_a = url("wss://a.example.com");
        let handle = client
            .subscribe_timeline(
                vec![SubRequest::new(
                    vec![url_a],
                    Filter::new().kind(Kind::TextNote),
                )],
                10,
                collector,
            )
            .await
            .unwrap();
        handle.close();
        handle.key().clone()
    };

    // Closing does not forget the constituents: paging still works
    assert!(client
        .load_more_timeline(&key, Timestamp::from_secs(100), 10)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_feed_reports_relay_close() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();

    let url_a = url("wss://private.example.com");
    transport.add(
        &url_a,
        ScriptedRelay::auth_required(vec![text_note(&keys, "members only", 100)]),
    );

    let client = Client::builder(transport).build();
    let collector = FeedCollector::default();

    let handle = client
        .subscribe_timeline(
            vec![SubRequest::new(
                vec![url_a.clone()],
                Filter::new().kind(Kind::TextNote),
            )],
            10,
            collector.clone(),
        )
        .await
        .unwrap();

    // No signer: the relay-initiated close reaches the feed handler with the
    // relay's raw reason
    wait_for(|| !collector.closes().is_empty(), Duration::from_secs(5)).await;

    let closes = collector.closes();
    assert_eq!(closes[0].0, url_a);
    assert!(closes[0].1.starts_with("auth-required"));

    handle.close();
}

#[tokio::test]
async fn test_load_more_refetches_evicted_bodies() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();
    let e1 = text_note(&keys, "one", 100);
    let e2 = text_note(&keys, "two", 90);
    let e3 = text_note(&keys, "three", 80);

    let url_a = url("wss://a.example.com");
    transport.add(
        &url_a,
        ScriptedRelay::with_stored(vec![e1.clone(), e2.clone(), e3.clone()]),
    );

    let client = Client::builder(transport).build();
    let collector = FeedCollector::default();

    let handle = client
        .subscribe_timeline(
            vec![SubRequest::new(
                vec![url_a],
                Filter::new().kind(Kind::TextNote).limit(3),
            )],
            3,
            collector.clone(),
        )
        .await
        .unwrap();
    wait_for(|| collector.final_feed().is_some(), Duration::from_secs(5)).await;
    handle.close();

    // Push the page bodies out of the bounded event cache
    for i in 0..8300u64 {
        let filler = text_note(&keys, &format!("filler {i}"), 1000);
        client.state().events().insert(&filler).await;
    }
    assert!(client.state().events().get(&e2.id).await.is_none());

    // The cached references survive eviction; the bodies come back by id
    // from the relays that delivered them
    let page = client
        .load_more_timeline(handle.key(), Timestamp::from_secs(95), 2)
        .await
        .unwrap();

    let ids: Vec<EventId> = page.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![e2.id, e3.id]);
}

#[tokio::test]
async fn test_resubscribe_serves_cached_window_first() {
    let transport = Arc::new(MockTransport::new());
    let keys = Keys::generate();
    let e1 = text_note(&keys, "one", 100);
    let e2 = text_note(&keys, "two", 90);

    let url_a = url("wss://a.example.com");
    let relay = transport.add(
        &url_a,
        ScriptedRelay::with_stored(vec![e1.clone(), e2.clone()]),
    );

    let client = Client::builder(transport).build();

    let request = SubRequest::new(vec![url_a], Filter::new().kind(Kind::TextNote).limit(10));

    let first = FeedCollector::default();
    let handle = client
        .subscribe_timeline(vec![request.clone()], 10, first.clone())
        .await
        .unwrap();
    wait_for(|| first.final_feed().is_some(), Duration::from_secs(5)).await;
    handle.close();

    let reqs_before = relay.req_count();

    // The second subscription starts from the cached window and only asks
    // the relay for strictly newer events
    let second = FeedCollector::default();
    let handle = client
        .subscribe_timeline(vec![request], 10, second.clone())
        .await
        .unwrap();

    wait_for(|| second.final_feed().is_some(), Duration::from_secs(5)).await;
    assert_eq!(second.final_feed().unwrap(), vec![e1.id, e2.id]);

    // The cached batch arrived before the relays answered
    let batches = second.inner.batches.lock().unwrap();
    assert_eq!(batches[0], (vec![e1.id, e2.id], false));
    drop(batches);

    assert_eq!(relay.req_count(), reqs_before + 1);

    handle.close();
}
