// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

use std::sync::Arc;
use std::time::Duration;

use async_utility::{task, time};
use futures_util::{SinkExt, StreamExt};
use nostr::message::MachineReadablePrefix;
use nostr::{Event, EventBuilder, EventId, Filter, RelayUrl, SubscriptionId};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{broadcast, Mutex};

use super::constants::{FRAME_CHANNEL_SIZE, NOTIFICATION_CHANNEL_SIZE, WAIT_FOR_OK_TIMEOUT};
use super::status::AtomicRelayStatus;
use super::{Error, RelayNotification, RelayStatus};
use crate::shared::SharedState;
use crate::transport::{BoxSink, BoxStream, ClientFrame, RelayFrame};
use crate::util;

// Fields that require an `Arc` live here, so that cloning the relay costs a
// single atomic operation.
#[derive(Debug)]
struct AtomicPrivateData {
    status: AtomicRelayStatus,
    sink: std::sync::RwLock<Option<Sender<ClientFrame>>>,
    challenge: std::sync::RwLock<Option<String>>,
    connect_guard: Mutex<()>,
}

#[derive(Debug, Clone)]
pub(crate) struct InnerRelay {
    pub(super) url: RelayUrl,
    pub(super) state: SharedState,
    atomic: Arc<AtomicPrivateData>,
    pub(super) notification_sender: broadcast::Sender<RelayNotification>,
}

impl InnerRelay {
    pub(super) fn new(url: RelayUrl, state: SharedState) -> Self {
        let (notification_sender, ..) =
            broadcast::channel::<RelayNotification>(NOTIFICATION_CHANNEL_SIZE);

        Self {
            url,
            state,
            atomic: Arc::new(AtomicPrivateData {
                status: AtomicRelayStatus::default(),
                sink: std::sync::RwLock::new(None),
                challenge: std::sync::RwLock::new(None),
                connect_guard: Mutex::new(()),
            }),
            notification_sender,
        }
    }

    #[inline]
    pub(super) fn status(&self) -> RelayStatus {
        self.atomic.status.load()
    }

    fn set_status(&self, status: RelayStatus) {
        self.atomic.status.set(status);

        match status {
            RelayStatus::Initialized => {}
            RelayStatus::Connecting => tracing::debug!("Connecting to '{}'", self.url),
            RelayStatus::Connected => tracing::info!("Connected to '{}'", self.url),
            RelayStatus::Disconnected => tracing::info!("Disconnected from '{}'", self.url),
            RelayStatus::Terminated => {
                tracing::debug!("Completely disconnected from '{}'", self.url)
            }
        }

        self.send_notification(RelayNotification::Status { status });
    }

    #[inline]
    fn send_notification(&self, notification: RelayNotification) {
        let _ = self.notification_sender.send(notification);
    }

    /// Connect if not already connected.
    ///
    /// A failure marks the relay unreachable for this operation only: the next
    /// call starts a fresh attempt. A terminated relay is never reconnected.
    pub(super) async fn ensure_connected(&self, timeout: Duration) -> Result<(), Error> {
        if self.status().is_terminated() {
            return Err(Error::Terminated);
        }

        if self.status().is_connected() {
            return Ok(());
        }

        // Serialize concurrent connection attempts
        let _guard = self.atomic.connect_guard.lock().await;

        match self.status() {
            RelayStatus::Terminated => return Err(Error::Terminated),
            status if status.is_connected() => return Ok(()),
            _ => {}
        }

        self.set_status(RelayStatus::Connecting);

        let res = time::timeout(Some(timeout), self.state.transport.connect(&self.url, timeout))
            .await;

        let (ws_tx, ws_rx) = match res {
            Some(Ok(halves)) => halves,
            Some(Err(e)) => {
                self.set_status(RelayStatus::Disconnected);
                tracing::debug!(url = %self.url, error = %e, "Connection failed.");
                return Err(Error::Transport(e));
            }
            None => {
                self.set_status(RelayStatus::Disconnected);
                return Err(Error::ConnectTimeout);
            }
        };

        let (tx, rx) = mpsc::channel::<ClientFrame>(FRAME_CHANNEL_SIZE);

        {
            let mut sink = self.atomic.sink.write().expect("poisoned sink lock");
            *sink = Some(tx);
        }

        self.set_status(RelayStatus::Connected);

        let relay = self.clone();
        task::spawn(async move { relay.writer_task(ws_tx, rx).await });

        let relay = self.clone();
        task::spawn(async move { relay.reader_task(ws_rx).await });

        Ok(())
    }

    async fn writer_task(self, mut ws_tx: BoxSink, mut rx: Receiver<ClientFrame>) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_tx.send(frame).await {
                tracing::debug!(url = %self.url, error = %e, "Relay sender exited with error.");
                break;
            }
        }
        let _ = ws_tx.close().await;
        tracing::trace!(url = %self.url, "Relay sender exited.");
    }

    async fn reader_task(self, mut ws_rx: BoxStream) {
        while let Some(res) = ws_rx.next().await {
            match res {
                Ok(frame) => self.handle_relay_frame(frame).await,
                Err(e) => {
                    tracing::debug!(url = %self.url, error = %e, "Relay receiver exited with error.");
                    break;
                }
            }
        }

        // Drop the frame sender so the writer task exits too
        {
            let mut sink = self.atomic.sink.write().expect("poisoned sink lock");
            *sink = None;
        }

        // Don't override an on-purpose termination
        if !self.status().is_terminated() {
            self.set_status(RelayStatus::Disconnected);
        }
    }

    async fn handle_relay_frame(&self, frame: RelayFrame) {
        match frame {
            RelayFrame::Event {
                subscription_id,
                event,
            } => {
                self.state.seen.mark(event.id, self.url.clone()).await;
                self.state.events.insert(&event).await;

                if let Some(coordinate) = util::coordinate(&event) {
                    self.state.replaceable.observe(coordinate, &event).await;
                }

                self.send_notification(RelayNotification::Event {
                    subscription_id,
                    event,
                });
            }
            RelayFrame::EndOfStoredEvents(subscription_id) => {
                self.send_notification(RelayNotification::EndOfStoredEvents { subscription_id });
            }
            RelayFrame::Closed {
                subscription_id,
                message,
            } => {
                tracing::debug!(url = %self.url, id = %subscription_id, reason = %message, "Subscription closed by relay.");
                self.send_notification(RelayNotification::Closed {
                    subscription_id,
                    message,
                });
            }
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => {
                if accepted {
                    self.state.seen.mark(event_id, self.url.clone()).await;
                }
                self.send_notification(RelayNotification::Ok {
                    event_id,
                    accepted,
                    message,
                });
            }
            RelayFrame::Auth { challenge } => {
                tracing::debug!(url = %self.url, "Received auth challenge.");
                let mut c = self.atomic.challenge.write().expect("poisoned challenge lock");
                *c = Some(challenge);
            }
        }
    }

    pub(super) fn send(&self, frame: ClientFrame) -> Result<(), Error> {
        let sink = self.atomic.sink.read().expect("poisoned sink lock");
        match sink.as_ref() {
            Some(tx) => tx.try_send(frame).map_err(|_| Error::CantSendChannelMessage {
                channel: String::from("frames"),
            }),
            None => Err(Error::NotConnected),
        }
    }

    async fn wait_for_ok(
        &self,
        notifications: &mut broadcast::Receiver<RelayNotification>,
        id: &EventId,
        timeout: Duration,
    ) -> Result<(bool, String), Error> {
        time::timeout(Some(timeout), async {
            while let Ok(notification) = notifications.recv().await {
                match notification {
                    RelayNotification::Ok {
                        event_id,
                        accepted,
                        message,
                    } => {
                        if &event_id == id {
                            return Ok((accepted, message));
                        }
                    }
                    RelayNotification::Status { status } => {
                        if !status.is_connected() {
                            return Err(Error::NotConnected);
                        }
                    }
                    _ => (),
                }
            }

            Err(Error::PrematureExit)
        })
        .await
        .ok_or(Error::Timeout)?
    }

    /// Publish an event and wait for the acknowledgement.
    ///
    /// On an `auth-required` rejection, and only if a signer is available,
    /// performs one authentication round and retries exactly once.
    pub(super) async fn publish(&self, event: &Event, timeout: Duration) -> Result<(), Error> {
        let (accepted, message) = self.publish_once(event, timeout).await?;

        if accepted {
            return Ok(());
        }

        if is_auth_required(&message) && self.state.has_signer().await {
            self.authenticate().await?;

            let (accepted, message) = self.publish_once(event, timeout).await?;
            if accepted {
                return Ok(());
            }
            return Err(Error::PublishRejected(message));
        }

        Err(Error::PublishRejected(message))
    }

    async fn publish_once(
        &self,
        event: &Event,
        timeout: Duration,
    ) -> Result<(bool, String), Error> {
        let mut notifications = self.notification_sender.subscribe();

        self.send(ClientFrame::Publish(Box::new(event.clone())))?;

        self.wait_for_ok(&mut notifications, &event.id, timeout)
            .await
            .map_err(|e| match e {
                Error::Timeout => Error::PublishTimeout,
                e => e,
            })
    }

    /// Answer the last authentication challenge received from this relay.
    pub(super) async fn authenticate(&self) -> Result<(), Error> {
        let challenge: String = self
            .atomic
            .challenge
            .read()
            .expect("poisoned challenge lock")
            .clone()
            .ok_or(Error::NoChallenge)?;

        let signer = self.state.signer().await?;

        let event: Event = EventBuilder::auth(challenge, self.url.clone())
            .sign(&signer)
            .await?;

        let mut notifications = self.notification_sender.subscribe();

        self.send(ClientFrame::Auth(Box::new(event.clone())))?;

        let (accepted, message) = self
            .wait_for_ok(&mut notifications, &event.id, WAIT_FOR_OK_TIMEOUT)
            .await?;

        if accepted {
            tracing::info!(url = %self.url, "Authenticated to relay.");
            Ok(())
        } else {
            Err(Error::AuthenticationFailed(message))
        }
    }

    #[inline]
    pub(super) fn subscribe(&self, id: SubscriptionId, filters: Vec<Filter>) -> Result<(), Error> {
        self.send(ClientFrame::Req { id, filters })
    }

    #[inline]
    pub(super) fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Error> {
        self.send(ClientFrame::Close(id))
    }

    pub(super) fn disconnect(&self) {
        self.set_status(RelayStatus::Terminated);
        let mut sink = self.atomic.sink.write().expect("poisoned sink lock");
        *sink = None;
    }
}

/// Check if a rejection or close reason carries the `auth-required` prefix.
pub(crate) fn is_auth_required(message: &str) -> bool {
    matches!(
        MachineReadablePrefix::parse(message),
        Some(MachineReadablePrefix::AuthRequired)
    )
}
