// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! Multi-relay subscription
//!
//! One logical query fanned out to many relays: every relay receives the same
//! filters, duplicate events are dropped on arrival, and the per-relay
//! end-of-stored-events signals are folded into a single one.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_utility::task;
use nostr::filter::MatchEventOptions;
use nostr::{Event, EventId, Filter, RelayUrl, SubscriptionId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::bus::EventBus;
use crate::relay::constants::{DEFAULT_CONNECTION_TIMEOUT, EOSE_TIMEOUT};
use crate::relay::{is_auth_required, Relay, RelayNotification};

/// Subscription callbacks.
///
/// Called from the subscription's IO tasks: implementations must not block.
pub trait SubscriptionHandler: Send + Sync {
    /// A new event arrived. Never called twice for the same event id, no
    /// matter how many relays deliver it.
    fn on_event(&self, event: &Event);

    /// Every relay has either reported end of stored events, failed to
    /// connect, or run out of time. Fired at most once.
    fn on_eose(&self) {}

    /// A relay demands authentication but no signer is configured.
    fn on_auth_required(&self) {}

    /// A relay sub-subscription terminated, with the relay's raw reason.
    fn on_close(&self, _url: &RelayUrl, _reason: &str) {}

    /// Every relay sub-subscription has terminated. Fired at most once,
    /// carrying every relay's reason.
    fn on_all_close(&self, _reasons: &[(RelayUrl, String)]) {}
}

/// Multi-relay subscription
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    relays: Vec<Relay>,
    handler: Arc<RwLock<Option<Arc<dyn SubscriptionHandler>>>>,
    seen: Arc<Mutex<HashSet<EventId>>>,
    total: usize,
    done: Arc<AtomicUsize>,
    eose_fired: Arc<AtomicBool>,
    close_reasons: Arc<Mutex<Vec<(RelayUrl, String)>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("relays", &self.relays.len())
            .field("eosed", &self.is_eosed())
            .finish()
    }
}

impl Subscription {
    pub(super) fn start(
        relays: Vec<Relay>,
        filters: Vec<Filter>,
        bus: EventBus,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);

        let subscription = Self {
            id: SubscriptionId::generate(),
            total: relays.len(),
            relays,
            handler: Arc::new(RwLock::new(Some(handler))),
            seen: Arc::new(Mutex::new(HashSet::new())),
            done: Arc::new(AtomicUsize::new(0)),
            eose_fired: Arc::new(AtomicBool::new(false)),
            close_reasons: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(closed_tx),
        };

        for relay in subscription.relays.iter() {
            let this = subscription.clone();
            let relay = relay.clone();
            let filters = filters.clone();
            let closed_rx = closed_rx.clone();
            task::spawn(async move { this.relay_task(relay, filters, closed_rx).await });
        }

        // Events published locally by this process flow through the in-process
        // bus, without a relay round-trip. Same id-set, first delivery wins.
        let this = subscription.clone();
        let closed_rx = closed_rx.clone();
        task::spawn(async move { this.bus_task(bus, filters, closed_rx).await });

        subscription
    }

    async fn bus_task(self, bus: EventBus, filters: Vec<Filter>, mut closed: watch::Receiver<bool>) {
        let mut events = bus.subscribe();

        loop {
            tokio::select! {
                res = events.recv() => match res {
                    Ok(event) => {
                        if filters
                            .iter()
                            .any(|f| f.match_event(&event, MatchEventOptions::new()))
                        {
                            self.handle_event(event);
                        }
                    }
                    Err(RecvError::Lagged(..)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = closed.changed() => break,
            }
        }
    }

    /// Get the subscription ID.
    #[inline]
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Check if the single end-of-stored-events signal has fired.
    #[inline]
    pub fn is_eosed(&self) -> bool {
        self.eose_fired.load(Ordering::SeqCst)
    }

    fn handler(&self) -> Option<Arc<dyn SubscriptionHandler>> {
        let handler = self.handler.read().expect("poisoned handler lock");
        handler.clone()
    }

    /// A relay is finished loading stored events, for whatever reason.
    fn mark_done(&self) {
        let done: usize = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        if done >= self.total && !self.eose_fired.swap(true, Ordering::SeqCst) {
            if let Some(handler) = self.handler() {
                handler.on_eose();
            }
        }
    }

    /// A relay sub-subscription terminated, with the relay's raw reason.
    ///
    /// The last termination also fires the single all-close signal, carrying
    /// every relay's reason.
    fn mark_closed(&self, url: &RelayUrl, reason: String) {
        let all: Option<Vec<(RelayUrl, String)>> = {
            let mut reasons = self.close_reasons.lock().expect("poisoned reasons lock");
            reasons.push((url.clone(), reason.clone()));
            (reasons.len() >= self.total).then(|| reasons.clone())
        };

        if let Some(handler) = self.handler() {
            handler.on_close(url, &reason);

            if let Some(reasons) = all {
                handler.on_all_close(&reasons);
            }
        }
    }

    fn handle_event(&self, event: Event) {
        let is_new: bool = {
            let mut seen = self.seen.lock().expect("poisoned seen lock");
            seen.insert(event.id)
        };

        if is_new {
            if let Some(handler) = self.handler() {
                handler.on_event(&event);
            }
        }
    }

    async fn relay_task(
        self,
        relay: Relay,
        filters: Vec<Filter>,
        mut closed: watch::Receiver<bool>,
    ) {
        // A relay that can't be reached still counts toward the single
        // end-of-stored-events signal.
        if let Err(e) = relay.ensure_connected(DEFAULT_CONNECTION_TIMEOUT).await {
            tracing::debug!(url = %relay.url(), error = %e, "Skipping relay for subscription.");
            self.mark_done();
            self.mark_closed(relay.url(), e.to_string());
            return;
        }

        let mut notifications = relay.notifications();

        if let Err(e) = relay.subscribe(self.id.clone(), filters.clone()) {
            self.mark_done();
            self.mark_closed(relay.url(), e.to_string());
            return;
        }

        let mut deadline: Instant = Instant::now() + EOSE_TIMEOUT;
        let mut eosed: bool = false;

        let reason: String = loop {
            let notification = tokio::select! {
                res = notifications.recv() => match res {
                    Ok(notification) => notification,
                    Err(RecvError::Lagged(..)) => continue,
                    Err(RecvError::Closed) => break String::from("notification channel closed"),
                },
                _ = closed.changed() => break String::from("closed by caller"),
                _ = tokio::time::sleep_until(deadline), if !eosed => {
                    // Never reported end of stored events in time: it counts
                    // toward the single signal, but live events keep flowing.
                    tracing::debug!(url = %relay.url(), id = %self.id, "End of stored events timed out.");
                    eosed = true;
                    self.mark_done();
                    continue;
                }
            };

            match notification {
                RelayNotification::Event {
                    subscription_id,
                    event,
                } if subscription_id == self.id => {
                    self.handle_event(*event);
                }
                RelayNotification::EndOfStoredEvents { subscription_id }
                    if subscription_id == self.id =>
                {
                    if !eosed {
                        eosed = true;
                        self.mark_done();
                    }
                }
                RelayNotification::Closed {
                    subscription_id,
                    message,
                } if subscription_id == self.id => {
                    if is_auth_required(&message) {
                        if relay.state().has_signer().await {
                            match relay.authenticate().await {
                                Ok(()) => {
                                    if relay.subscribe(self.id.clone(), filters.clone()).is_ok() {
                                        // Stored events are replayed after auth
                                        deadline = Instant::now() + EOSE_TIMEOUT;
                                        continue;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(url = %relay.url(), error = %e, "Authentication failed.");
                                }
                            }
                        } else if let Some(handler) = self.handler() {
                            handler.on_auth_required();
                        }
                    }

                    if !eosed {
                        self.mark_done();
                    }
                    break message;
                }
                RelayNotification::Status { status } if !status.is_connected() => {
                    if !eosed {
                        self.mark_done();
                    }
                    break String::from("disconnected");
                }
                _ => {}
            }
        };

        self.mark_closed(relay.url(), reason);
    }

    /// Close the subscription.
    ///
    /// No callback fires after this returns. Closing twice is a no-op.
    pub fn close(&self) {
        let already_closed: bool = {
            let mut handler = self.handler.write().expect("poisoned handler lock");
            handler.take().is_none()
        };

        if already_closed {
            return;
        }

        let _ = self.closed.send(true);

        for relay in self.relays.iter() {
            let _ = relay.unsubscribe(self.id.clone());
        }
    }
}
