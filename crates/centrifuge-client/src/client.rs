//! Public entry point: [`Client`] and its event stream [`Events`].
//!
//! All connection and subscription state lives in one [`Shared`] value behind
//! a mutex. Every transition and the event describing it happen under that
//! lock, so the event stream observes transitions in the order they happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{endpoint_url, run_session};
use crate::protocol::{
    Command, ConnectRequest, HistoryRequest, Push, Reply, SubscribeRecovery, SubscribeResult,
    connecting_code, disconnect_code, error_code, unsubscribed_code,
};
use crate::subscription::{SubState, Subscription};
use crate::types::{
    ClientConfig, ConnectionState, Event, HistoryOptions, HistoryResult, Publication,
    StreamPosition, SubscriptionConfig, SubscriptionEvent, SubscriptionState,
};
use crate::{Error, protocol};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) enum Pending {
    /// publish / history: the caller awaits the raw reply.
    Request(oneshot::Sender<Reply>),
    /// Handled on the session task; the subscription moves to subscribed or back.
    Subscribe { channel: String, deadline: Instant },
    /// Reply is only logged.
    Unsubscribe,
}

pub(crate) struct SessionHandle {
    pub(crate) outbound: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct ServerSubState {
    recoverable: bool,
    position: Option<StreamPosition>,
}

pub(crate) struct Shared {
    pub(crate) state: ConnectionState,
    pub(crate) client_id: Option<String>,
    /// Bumped on every connect, disconnect, and close. A session only mutates
    /// state while its generation is current.
    pub(crate) generation: u64,
    pub(crate) session: Option<SessionHandle>,
    pub(crate) pending: HashMap<u32, Pending>,
    pub(crate) subs: HashMap<String, SubState>,
    pub(crate) server_subs: HashMap<String, ServerSubState>,
    pub(crate) closing: bool,
}

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    shared: Mutex<Shared>,
    events: mpsc::UnboundedSender<Event>,
    /// Cancelled once by `close()`; in-flight requests and `Client::closed`
    /// waiters observe it.
    pub(crate) closed: CancellationToken,
    next_id: AtomicU32,
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn emit(&self, event: Event) {
        // The receiver may be gone when the application stopped listening.
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_sub(&self, channel: &str, event: SubscriptionEvent) {
        self.emit(Event::Subscription {
            channel: channel.to_string(),
            event,
        });
    }

    pub(crate) fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn connect_command(&self, shared: &Shared) -> Command {
        let subs = shared
            .server_subs
            .iter()
            .map(|(channel, sub)| {
                let recovery = match (&sub.position, sub.recoverable) {
                    (Some(sp), true) => SubscribeRecovery {
                        recover: true,
                        offset: sp.offset,
                        epoch: sp.epoch.clone(),
                    },
                    _ => SubscribeRecovery::default(),
                };
                (channel.clone(), recovery)
            })
            .collect();
        Command {
            id: self.next_id(),
            connect: Some(ConnectRequest {
                token: self.config.token.clone(),
                name: self.config.name.clone(),
                version: self.config.version.clone(),
                subs,
            }),
            ..Default::default()
        }
    }

    /// Queue a request command and register its reply slot. Fails with
    /// `NotConnected` unless the connection is up.
    pub(crate) fn register_request(
        &self,
        shared: &mut Shared,
        mut command: Command,
    ) -> Result<(u32, oneshot::Receiver<Reply>), Error> {
        if shared.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let session = shared.session.as_ref().ok_or(Error::NotConnected)?;
        let id = self.next_id();
        command.id = id;
        session
            .outbound
            .send(command)
            .map_err(|_| Error::Transport("session writer closed".to_string()))?;
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(id, Pending::Request(tx));
        Ok((id, rx))
    }

    /// Wait for the reply to request `id`, the deadline, or client close.
    pub(crate) async fn await_reply(
        &self,
        id: u32,
        rx: oneshot::Receiver<Reply>,
        deadline: Instant,
    ) -> Result<Reply, Error> {
        tokio::select! {
            reply = rx => reply.map_err(|_| {
                if self.closed.is_cancelled() {
                    Error::Closed
                } else {
                    Error::Transport("connection closed before reply".to_string())
                }
            }),
            _ = tokio::time::sleep_until(deadline) => {
                self.lock().pending.remove(&id);
                Err(Error::Timeout)
            }
            _ = self.closed.cancelled() => Err(Error::Closed),
        }
    }

    /// Transition to disconnected: drop the session, fail pending requests,
    /// and unsubscribe every subscription before announcing the disconnect.
    pub(crate) fn move_to_disconnected(
        &self,
        shared: &mut Shared,
        code: u32,
        reason: &str,
        unsub_code: u32,
        unsub_reason: &str,
    ) {
        shared.session = None;
        shared.pending.clear();

        let mut channels: Vec<String> = shared
            .subs
            .iter()
            .filter(|(_, sub)| sub.state != SubscriptionState::Unsubscribed)
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        for channel in channels {
            if let Some(sub) = shared.subs.get_mut(&channel) {
                sub.state = SubscriptionState::Unsubscribed;
                sub.subscribe_id = None;
            }
            self.emit_sub(
                &channel,
                SubscriptionEvent::Unsubscribed {
                    code: unsub_code,
                    reason: unsub_reason.to_string(),
                },
            );
        }

        shared.state = ConnectionState::Disconnected;
        shared.client_id = None;
        tracing::info!(code, reason, "disconnected");
        self.emit(Event::Disconnected {
            code,
            reason: reason.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Callbacks from the session task
    // -----------------------------------------------------------------------

    /// Returns `false` if the session is stale and must shut down.
    pub(crate) fn on_connected(&self, generation: u64, result: protocol::ConnectResult) -> bool {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != ConnectionState::Connecting {
            return false;
        }
        shared.state = ConnectionState::Connected;
        shared.client_id = Some(result.client.clone());
        tracing::info!(client_id = %result.client, version = %result.version, "connected");
        self.emit(Event::Connected {
            client_id: result.client,
        });

        let mut subs: Vec<(String, SubscribeResult)> = result.subs.into_iter().collect();
        subs.sort_by(|a, b| a.0.cmp(&b.0));
        for (channel, sub) in subs {
            self.on_server_subscribed(&mut shared, channel, sub);
        }
        true
    }

    /// The session ended on its own (handshake failure, transport loss,
    /// heartbeat timeout, server disconnect).
    pub(crate) fn session_lost(
        &self,
        generation: u64,
        code: u32,
        reason: &str,
        error: Option<Error>,
    ) {
        let mut shared = self.lock();
        if shared.generation != generation
            || !matches!(
                shared.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            return;
        }
        if let Some(error) = error {
            tracing::warn!(%error, "connection error");
            self.emit(Event::Error { error });
        }
        self.move_to_disconnected(
            &mut shared,
            code,
            reason,
            unsubscribed_code::CONNECTION_LOST,
            "connection lost",
        );
    }

    /// Dispatch one decoded server message. Returns a disconnect
    /// `(code, reason)` when the server asked the client to go away.
    pub(crate) fn handle_reply(&self, generation: u64, reply: Reply) -> Option<(u32, String)> {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != ConnectionState::Connected {
            return None;
        }
        if reply.id > 0 {
            self.resolve_pending(&mut shared, reply);
            return None;
        }
        match reply.push {
            Some(push) => self.handle_push(&mut shared, push),
            None => None,
        }
    }

    fn resolve_pending(&self, shared: &mut Shared, reply: Reply) {
        let id = reply.id;
        match shared.pending.remove(&id) {
            Some(Pending::Request(tx)) => {
                // The caller may have timed out and dropped the receiver.
                let _ = tx.send(reply);
            }
            Some(Pending::Subscribe { channel, .. }) => {
                self.on_subscribe_reply(shared, &channel, id, reply);
            }
            Some(Pending::Unsubscribe) => {
                if let Some(err) = reply.error {
                    tracing::debug!(code = err.code, message = %err.message, "unsubscribe rejected");
                }
            }
            None => {
                tracing::debug!(id, "reply for unknown or expired request");
            }
        }
    }

    fn handle_push(&self, shared: &mut Shared, push: Push) -> Option<(u32, String)> {
        if let Some(disconnect) = push.disconnect {
            return Some((disconnect.code, disconnect.reason));
        }
        if let Some(message) = push.message {
            self.emit(Event::Message {
                data: protocol::data_bytes(&message.data),
            });
            return None;
        }
        if shared.subs.contains_key(&push.channel) {
            self.handle_subscription_push(shared, push);
        } else {
            self.handle_server_push(shared, push);
        }
        None
    }

    fn on_server_subscribed(&self, shared: &mut Shared, channel: String, result: SubscribeResult) {
        let position = result.recoverable.then(|| StreamPosition {
            offset: result.offset,
            epoch: result.epoch.clone(),
        });
        shared.server_subs.insert(
            channel.clone(),
            ServerSubState {
                recoverable: result.recoverable,
                position,
            },
        );
        self.emit(Event::ServerSubscribed {
            channel: channel.clone(),
            was_recovering: result.was_recovering,
            recovered: result.recovered,
        });
        for publication in result.publications {
            self.emit(Event::ServerPublication {
                channel: channel.clone(),
                publication: publication.into(),
            });
        }
    }

    fn handle_server_push(&self, shared: &mut Shared, push: Push) {
        let channel = push.channel;
        if let Some(result) = push.subscribe {
            self.on_server_subscribed(shared, channel, result);
        } else if let Some(publication) = push.publication {
            if let Some(sub) = shared.server_subs.get_mut(&channel)
                && let Some(sp) = sub.position.as_mut()
                && publication.offset > 0
            {
                if publication.offset > sp.offset + 1 {
                    tracing::warn!(
                        %channel,
                        expected = sp.offset + 1,
                        got = publication.offset,
                        "gap in server-side subscription stream"
                    );
                }
                sp.offset = publication.offset;
            }
            self.emit(Event::ServerPublication {
                channel,
                publication: publication.into(),
            });
        } else if let Some(join) = push.join {
            self.emit(Event::ServerJoin {
                channel,
                info: join.info.into(),
            });
        } else if let Some(leave) = push.leave {
            self.emit(Event::ServerLeave {
                channel,
                info: leave.info.into(),
            });
        } else if push.unsubscribe.is_some() {
            shared.server_subs.remove(&channel);
            self.emit(Event::ServerUnsubscribed { channel });
        } else {
            tracing::debug!(%channel, "ignoring empty push");
        }
    }

    /// Fail subscribe requests whose reply did not arrive in time.
    pub(crate) fn expire_pending(&self, generation: u64) {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != ConnectionState::Connected {
            return;
        }
        let now = Instant::now();
        let expired: Vec<u32> = shared
            .pending
            .iter()
            .filter_map(|(id, pending)| match pending {
                Pending::Subscribe { deadline, .. } if *deadline <= now => Some(*id),
                _ => None,
            })
            .collect();
        for id in expired {
            if let Some(Pending::Subscribe { channel, .. }) = shared.pending.remove(&id) {
                self.fail_subscribe(
                    &mut shared,
                    &channel,
                    id,
                    Error::Timeout,
                    unsubscribed_code::SUBSCRIBE_TIMEOUT,
                    "subscribe timeout",
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// Ordered stream of [`Event`]s emitted by a [`Client`] and its subscriptions.
pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    /// Receive the next event. Returns `None` once every client handle and
    /// the session task are gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an already queued event without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Handle to a real-time connection. Cheap to clone; all clones share state.
///
/// Connection progress is reported on the [`Events`] stream returned by
/// [`Client::new`]. Methods that spawn the session task must be called from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> (Client, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                client_id: None,
                generation: 0,
                session: None,
                pending: HashMap::new(),
                subs: HashMap::new(),
                server_subs: HashMap::new(),
                closing: false,
            }),
            events: tx,
            closed: CancellationToken::new(),
            next_id: AtomicU32::new(1),
        });
        (Client { inner }, Events { rx })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Client ID assigned by the server for the current session.
    pub fn client_id(&self) -> Option<String> {
        self.inner.lock().client_id.clone()
    }

    /// Start connecting. Returns once the attempt is under way; the outcome is
    /// reported as `Connected` or `Error` + `Disconnected` on the event stream.
    ///
    /// Fails immediately for a malformed endpoint, a closed client, or while a
    /// disconnect is in progress. A no-op when already connecting or connected.
    pub fn connect(&self) -> Result<(), Error> {
        endpoint_url(&self.inner.config.endpoint)?;

        let mut shared = self.inner.lock();
        match shared.state {
            ConnectionState::Closed => return Err(Error::Closed),
            ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnecting => {
                return Err(Error::InvalidState("disconnect in progress".to_string()));
            }
            ConnectionState::Disconnected => {}
        }

        shared.generation += 1;
        let generation = shared.generation;
        let connect = self.inner.connect_command(&shared);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.inner.closed.child_token();

        shared.state = ConnectionState::Connecting;
        tracing::info!(endpoint = %self.inner.config.endpoint, "connecting");
        self.inner.emit(Event::Connecting {
            code: connecting_code::CONNECT_CALLED,
            reason: "connect called".to_string(),
        });
        let mut server_channels: Vec<String> = shared.server_subs.keys().cloned().collect();
        server_channels.sort();
        for channel in server_channels {
            self.inner.emit(Event::ServerSubscribing { channel });
        }

        let task = tokio::spawn(run_session(
            self.inner.clone(),
            generation,
            self.inner.config.endpoint.clone(),
            connect,
            outbound_rx,
            cancel.clone(),
        ));
        shared.session = Some(SessionHandle {
            outbound: outbound_tx,
            cancel,
            task: Some(task),
        });
        Ok(())
    }

    /// Gracefully tear down the current session. Emits exactly one
    /// `Disconnected`; every subscription ends up unsubscribed.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let task = {
            let mut shared = self.inner.lock();
            match shared.state {
                ConnectionState::Closed => return Err(Error::Closed),
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Connected => {}
            }
            shared.state = ConnectionState::Disconnecting;
            shared.generation += 1;
            shared.session.as_mut().and_then(|session| {
                session.cancel.cancel();
                session.task.take()
            })
        };

        if let Some(task) = task
            && tokio::time::timeout(self.inner.config.timing.close_timeout, task)
                .await
                .is_err()
        {
            tracing::warn!("session task did not stop in time");
        }

        let mut shared = self.inner.lock();
        // close() may have taken over while we were waiting.
        if shared.state == ConnectionState::Disconnecting {
            self.inner.move_to_disconnected(
                &mut shared,
                disconnect_code::DISCONNECT_CALLED,
                "disconnect called",
                unsubscribed_code::UNSUBSCRIBE_CALLED,
                "disconnect called",
            );
        }
        Ok(())
    }

    /// Disconnect if needed and release all resources. Safe to call any number
    /// of times from any number of tasks; the release happens exactly once.
    pub async fn close(&self) {
        let task = {
            let mut shared = self.inner.lock();
            if shared.closing {
                return;
            }
            shared.closing = true;
            shared.generation += 1;
            let task = shared.session.as_mut().and_then(|session| {
                session.cancel.cancel();
                session.task.take()
            });
            if shared.state != ConnectionState::Disconnected {
                self.inner.move_to_disconnected(
                    &mut shared,
                    disconnect_code::CLIENT_CLOSED,
                    "client closed",
                    unsubscribed_code::CLIENT_CLOSED,
                    "client closed",
                );
            }
            shared.state = ConnectionState::Closed;
            shared.pending.clear();
            self.inner.emit(Event::Closed);
            task
        };

        self.inner.closed.cancel();
        if let Some(task) = task
            && tokio::time::timeout(self.inner.config.timing.close_timeout, task)
                .await
                .is_err()
        {
            tracing::warn!("session task did not stop in time");
        }
        tracing::info!("client closed");
    }

    /// Wait until the client is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Register a subscription to `channel`. It starts unsubscribed; call
    /// [`Subscription::subscribe`] once connected.
    pub fn new_subscription(
        &self,
        channel: &str,
        config: SubscriptionConfig,
    ) -> Result<Subscription, Error> {
        let mut shared = self.inner.lock();
        if shared.state == ConnectionState::Closed {
            return Err(Error::Closed);
        }
        if shared.subs.contains_key(channel) {
            return Err(Error::DuplicateSubscription(channel.to_string()));
        }
        shared.subs.insert(channel.to_string(), SubState::new(config));
        Ok(Subscription::new(channel.to_string(), self.inner.clone()))
    }

    pub fn get_subscription(&self, channel: &str) -> Option<Subscription> {
        let shared = self.inner.lock();
        shared
            .subs
            .contains_key(channel)
            .then(|| Subscription::new(channel.to_string(), self.inner.clone()))
    }

    /// Unsubscribe and forget the subscription. Other handles to it become
    /// invalid.
    pub fn remove_subscription(&self, subscription: &Subscription) -> Result<(), Error> {
        subscription.unsubscribe()?;
        self.inner.lock().subs.remove(subscription.channel());
        Ok(())
    }

    /// Fetch one page of channel history using the default request timeout.
    pub async fn history(
        &self,
        channel: &str,
        options: HistoryOptions,
    ) -> Result<HistoryResult, Error> {
        let deadline = Instant::now() + self.inner.config.timing.request_timeout;
        self.history_with_deadline(channel, options, deadline).await
    }

    /// Fetch one page of channel history, failing with `Timeout` at `deadline`.
    pub async fn history_with_deadline(
        &self,
        channel: &str,
        options: HistoryOptions,
        deadline: Instant,
    ) -> Result<HistoryResult, Error> {
        let command = Command {
            history: Some(HistoryRequest {
                channel: channel.to_string(),
                limit: options.limit,
                since: options.since.map(Into::into),
                reverse: options.reverse,
            }),
            ..Default::default()
        };
        let (id, rx) = {
            let mut shared = self.inner.lock();
            self.inner.register_request(&mut shared, command)?
        };
        let reply = self.inner.await_reply(id, rx, deadline).await?;

        if let Some(err) = reply.error {
            return Err(
                if err.code == error_code::UNKNOWN_CHANNEL || err.code == error_code::NOT_AVAILABLE
                {
                    Error::Channel {
                        channel: channel.to_string(),
                        code: err.code,
                        message: err.message,
                    }
                } else {
                    Error::Server {
                        code: err.code,
                        message: err.message,
                    }
                },
            );
        }
        let result = reply.history.unwrap_or_default();
        Ok(HistoryResult {
            publications: result
                .publications
                .into_iter()
                .map(Publication::from)
                .collect(),
            epoch: result.epoch,
            offset: result.offset,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
