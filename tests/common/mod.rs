// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Scripted in-memory transport for tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, Stream};
use nostr::filter::MatchEventOptions;
use nostr::util::BoxedFuture;
use nostr::{Event, EventBuilder, Filter, Keys, RelayUrl, SubscriptionId, Timestamp};
use nostr_timeline::transport::{BoxSink, BoxStream, ClientFrame, RelayFrame};
use nostr_timeline::{Transport, TransportError};
use tokio::sync::mpsc;

/// How a scripted relay answers publishes.
#[derive(Debug, Clone)]
pub enum PublishMode {
    Accept,
    Reject(&'static str),
}

/// One scripted relay: serves stored events, acknowledges publishes, and can
/// demand authentication first.
pub struct ScriptedRelay {
    stored: Mutex<Vec<Event>>,
    publish: PublishMode,
    require_auth: bool,
    authed: Mutex<bool>,
    subs: Mutex<Vec<(SubscriptionId, Vec<Filter>, mpsc::UnboundedSender<RelayFrame>)>>,
    reqs: AtomicUsize,
}

impl ScriptedRelay {
    pub fn new() -> Self {
        Self::with_stored(Vec::new())
    }

    pub fn with_stored(stored: Vec<Event>) -> Self {
        Self {
            stored: Mutex::new(stored),
            publish: PublishMode::Accept,
            require_auth: false,
            authed: Mutex::new(false),
            subs: Mutex::new(Vec::new()),
            reqs: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(reason: &'static str) -> Self {
        Self {
            publish: PublishMode::Reject(reason),
            ..Self::new()
        }
    }

    pub fn auth_required(stored: Vec<Event>) -> Self {
        Self {
            require_auth: true,
            ..Self::with_stored(stored)
        }
    }

    /// Number of REQ frames received.
    pub fn req_count(&self) -> usize {
        self.reqs.load(Ordering::SeqCst)
    }

    /// Deliver a live event on every open subscription whose filters match.
    pub fn emit_live(&self, event: &Event) {
        let subs = self.subs.lock().unwrap();
        for (id, filters, out) in subs.iter() {
            if filters
                .iter()
                .any(|f| f.match_event(event, MatchEventOptions::new()))
            {
                let _ = out.send(RelayFrame::Event {
                    subscription_id: id.clone(),
                    event: Box::new(event.clone()),
                });
            }
        }
    }

    fn handle(&self, frame: ClientFrame, out: &mpsc::UnboundedSender<RelayFrame>) {
        match frame {
            ClientFrame::Req { id, filters } => {
                self.reqs.fetch_add(1, Ordering::SeqCst);

                if self.require_auth && !*self.authed.lock().unwrap() {
                    let _ = out.send(RelayFrame::Auth {
                        challenge: String::from("mock-challenge"),
                    });
                    let _ = out.send(RelayFrame::Closed {
                        subscription_id: id,
                        message: String::from("auth-required: log in first"),
                    });
                    return;
                }

                let stored = self.stored.lock().unwrap();
                for event in stored.iter() {
                    if filters
                        .iter()
                        .any(|f| f.match_event(event, MatchEventOptions::new()))
                    {
                        let _ = out.send(RelayFrame::Event {
                            subscription_id: id.clone(),
                            event: Box::new(event.clone()),
                        });
                    }
                }
                let _ = out.send(RelayFrame::EndOfStoredEvents(id.clone()));

                let mut subs = self.subs.lock().unwrap();
                subs.push((id, filters, out.clone()));
            }
            ClientFrame::Publish(event) => {
                if self.require_auth && !*self.authed.lock().unwrap() {
                    let _ = out.send(RelayFrame::Auth {
                        challenge: String::from("mock-challenge"),
                    });
                    let _ = out.send(RelayFrame::Ok {
                        event_id: event.id,
                        accepted: false,
                        message: String::from("auth-required: log in first"),
                    });
                    return;
                }

                match self.publish {
                    PublishMode::Accept => {
                        self.stored.lock().unwrap().push(*event.clone());
                        let _ = out.send(RelayFrame::Ok {
                            event_id: event.id,
                            accepted: true,
                            message: String::new(),
                        });
                    }
                    PublishMode::Reject(reason) => {
                        let _ = out.send(RelayFrame::Ok {
                            event_id: event.id,
                            accepted: false,
                            message: reason.to_string(),
                        });
                    }
                }
            }
            ClientFrame::Auth(event) => {
                *self.authed.lock().unwrap() = true;
                let _ = out.send(RelayFrame::Ok {
                    event_id: event.id,
                    accepted: true,
                    message: String::new(),
                });
            }
            ClientFrame::Close(id) => {
                let mut subs = self.subs.lock().unwrap();
                subs.retain(|(sub_id, ..)| sub_id != &id);
            }
        }
    }
}

struct MockSink {
    relay: Arc<ScriptedRelay>,
    out: mpsc::UnboundedSender<RelayFrame>,
}

impl Sink<ClientFrame> for MockSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: ClientFrame) -> Result<(), Self::Error> {
        self.relay.handle(item, &self.out);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<RelayFrame>,
}

impl Stream for MockStream {
    type Item = Result<RelayFrame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|opt| opt.map(Ok))
    }
}

/// In-memory transport: every known URL maps to a scripted relay, every
/// unknown URL refuses the connection.
#[derive(Default)]
pub struct MockTransport {
    relays: Mutex<HashMap<RelayUrl, Arc<ScriptedRelay>>>,
    unreachable: Mutex<HashSet<RelayUrl>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: &RelayUrl, relay: ScriptedRelay) -> Arc<ScriptedRelay> {
        let relay = Arc::new(relay);
        self.relays
            .lock()
            .unwrap()
            .insert(url.clone(), relay.clone());
        relay
    }

    pub fn add_unreachable(&self, url: &RelayUrl) {
        self.unreachable.lock().unwrap().insert(url.clone());
    }
}

impl Transport for MockTransport {
    fn connect<'a>(
        &'a self,
        url: &'a RelayUrl,
        _timeout: Duration,
    ) -> BoxedFuture<'a, Result<(BoxSink, BoxStream), TransportError>> {
        Box::pin(async move {
            let relay: Arc<ScriptedRelay> = {
                let relays = self.relays.lock().unwrap();
                relays.get(url).cloned()
            }
            .ok_or_else(|| {
                TransportError::backend(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("no route to {url}"),
                ))
            })?;

            if self.unreachable.lock().unwrap().contains(url) {
                return Err(TransportError::backend(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("{url} is down"),
                )));
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel::<RelayFrame>();

            let sink: BoxSink = Box::new(MockSink {
                relay,
                out: out_tx,
            });
            let stream: BoxStream = Box::new(MockStream { rx: out_rx });

            Ok((sink, stream))
        })
    }
}

/// Opt-in test logging, driven by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn url(s: &str) -> RelayUrl {
    RelayUrl::parse(s).unwrap()
}

/// Signed text note with a fixed timestamp.
pub fn text_note(keys: &Keys, content: &str, created_at: u64) -> Event {
    EventBuilder::text_note(content)
        .custom_created_at(Timestamp::from_secs(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_for<F>(check: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
