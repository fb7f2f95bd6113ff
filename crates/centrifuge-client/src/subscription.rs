//! Client-side channel subscriptions.

use std::sync::Arc;

use tokio::time::Instant;

use crate::Error;
use crate::client::{Inner, Pending, Shared};
use crate::protocol::{
    Command, Push, PublishRequest, Reply, SubscribeRequest, UnsubscribeRequest, WirePublication,
    error_code, subscribing_code, unsubscribed_code,
};
use crate::types::{
    ConnectionState, PublishResult, StreamPosition, SubscriptionConfig, SubscriptionEvent,
    SubscriptionState,
};

pub(crate) struct SubState {
    pub(crate) config: SubscriptionConfig,
    pub(crate) state: SubscriptionState,
    /// Last known position; kept across disconnects for recovery.
    pub(crate) position: Option<StreamPosition>,
    /// Command id of the in-flight subscribe request.
    pub(crate) subscribe_id: Option<u32>,
}

impl SubState {
    pub(crate) fn new(config: SubscriptionConfig) -> Self {
        Self {
            config,
            state: SubscriptionState::Unsubscribed,
            position: None,
            subscribe_id: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum OffsetCheck {
    Deliver,
    Duplicate,
    Gap { expected: u64 },
}

fn check_offset(position: Option<&StreamPosition>, offset: u64) -> OffsetCheck {
    let Some(sp) = position else {
        return OffsetCheck::Deliver;
    };
    if offset == 0 {
        return OffsetCheck::Deliver;
    }
    if offset <= sp.offset {
        OffsetCheck::Duplicate
    } else if offset == sp.offset + 1 {
        OffsetCheck::Deliver
    } else {
        OffsetCheck::Gap {
            expected: sp.offset + 1,
        }
    }
}

fn removed() -> Error {
    Error::InvalidState("subscription removed".to_string())
}

// ---------------------------------------------------------------------------
// State transitions (called with the client lock held)
// ---------------------------------------------------------------------------

impl Inner {
    /// Send a subscribe command and move the subscription to subscribing.
    pub(crate) fn send_subscribe(
        &self,
        shared: &mut Shared,
        channel: &str,
        code: u32,
        reason: &str,
    ) -> Result<(), Error> {
        let Shared {
            subs,
            session,
            pending,
            ..
        } = shared;
        let sub = subs.get_mut(channel).ok_or_else(removed)?;
        let session = session.as_ref().ok_or(Error::NotConnected)?;

        let recover = sub.config.recoverable && sub.position.is_some();
        let (offset, epoch) = match (&sub.position, recover) {
            (Some(sp), true) => (sp.offset, sp.epoch.clone()),
            _ => (0, String::new()),
        };
        let id = self.next_id();
        let command = Command {
            id,
            subscribe: Some(SubscribeRequest {
                channel: channel.to_string(),
                recoverable: sub.config.recoverable,
                join_leave: sub.config.join_leave,
                recover,
                offset,
                epoch,
            }),
            ..Default::default()
        };
        session
            .outbound
            .send(command)
            .map_err(|_| Error::Transport("session writer closed".to_string()))?;

        pending.insert(
            id,
            Pending::Subscribe {
                channel: channel.to_string(),
                deadline: Instant::now() + self.config.timing.request_timeout,
            },
        );
        sub.state = SubscriptionState::Subscribing;
        sub.subscribe_id = Some(id);
        tracing::debug!(channel, recover, "subscribing");
        self.emit_sub(
            channel,
            SubscriptionEvent::Subscribing {
                code,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    /// Queue an unsubscribe command for `channel`. The reply is only logged.
    pub(crate) fn send_unsubscribe(&self, shared: &mut Shared, channel: &str) {
        let Some(session) = shared.session.as_ref() else {
            return;
        };
        let id = self.next_id();
        let command = Command {
            id,
            unsubscribe: Some(UnsubscribeRequest {
                channel: channel.to_string(),
            }),
            ..Default::default()
        };
        if session.outbound.send(command).is_ok() {
            shared.pending.insert(id, Pending::Unsubscribe);
        } else {
            tracing::debug!(channel, "session gone, unsubscribe not sent");
        }
    }

    /// Fail the in-flight subscribe `id` on `channel`, if it is still current.
    pub(crate) fn fail_subscribe(
        &self,
        shared: &mut Shared,
        channel: &str,
        id: u32,
        error: Error,
        code: u32,
        reason: &str,
    ) {
        let Some(sub) = shared.subs.get_mut(channel) else {
            return;
        };
        if sub.state != SubscriptionState::Subscribing || sub.subscribe_id != Some(id) {
            return;
        }
        sub.state = SubscriptionState::Unsubscribed;
        sub.subscribe_id = None;
        tracing::warn!(channel, %error, "subscribe failed");
        self.emit_sub(channel, SubscriptionEvent::Error { error });
        self.emit_sub(
            channel,
            SubscriptionEvent::Unsubscribed {
                code,
                reason: reason.to_string(),
            },
        );
    }

    pub(crate) fn on_subscribe_reply(
        &self,
        shared: &mut Shared,
        channel: &str,
        id: u32,
        reply: Reply,
    ) {
        if let Some(err) = reply.error {
            if err.code == error_code::UNRECOVERABLE_POSITION
                && let Some(sub) = shared.subs.get_mut(channel)
            {
                sub.position = None;
            }
            let reason = err.message.clone();
            let error = Error::Channel {
                channel: channel.to_string(),
                code: err.code,
                message: err.message,
            };
            self.fail_subscribe(
                shared,
                channel,
                id,
                error,
                unsubscribed_code::SUBSCRIBE_FAILED,
                &reason,
            );
            return;
        }

        let Some(sub) = shared.subs.get_mut(channel) else {
            return;
        };
        if sub.state != SubscriptionState::Subscribing || sub.subscribe_id != Some(id) {
            tracing::debug!(channel, id, "stale subscribe reply");
            return;
        }
        let result = reply.subscribe.unwrap_or_default();
        if let Some(previous) = &sub.position
            && result.recoverable
            && previous.epoch != result.epoch
        {
            tracing::warn!(
                channel,
                old_epoch = %previous.epoch,
                new_epoch = %result.epoch,
                "stream epoch changed"
            );
        }

        sub.state = SubscriptionState::Subscribed;
        sub.subscribe_id = None;
        sub.position = (sub.config.recoverable && result.recoverable).then(|| StreamPosition {
            offset: result.offset,
            epoch: result.epoch.clone(),
        });
        tracing::info!(
            channel,
            was_recovering = result.was_recovering,
            recovered = result.recovered,
            "subscribed"
        );
        self.emit_sub(
            channel,
            SubscriptionEvent::Subscribed {
                was_recovering: result.was_recovering,
                recovered: result.recovered,
                position: sub.position.clone(),
            },
        );
        for publication in result.publications {
            self.emit_sub(channel, SubscriptionEvent::Publication(publication.into()));
        }
    }

    pub(crate) fn handle_subscription_push(&self, shared: &mut Shared, push: Push) {
        let channel = push.channel;
        let Some(sub) = shared.subs.get_mut(&channel) else {
            return;
        };

        if let Some(unsubscribe) = push.unsubscribe {
            if sub.state != SubscriptionState::Unsubscribed {
                sub.state = SubscriptionState::Unsubscribed;
                sub.subscribe_id = None;
                tracing::info!(%channel, code = unsubscribe.code, "unsubscribed by server");
                self.emit_sub(
                    &channel,
                    SubscriptionEvent::Unsubscribed {
                        code: unsubscribe.code,
                        reason: unsubscribe.reason,
                    },
                );
            }
            return;
        }
        if sub.state != SubscriptionState::Subscribed {
            tracing::debug!(%channel, state = %sub.state, "dropping push for inactive subscription");
            return;
        }

        if let Some(publication) = push.publication {
            self.on_publication(shared, &channel, publication);
        } else if let Some(join) = push.join {
            self.emit_sub(&channel, SubscriptionEvent::Join(join.info.into()));
        } else if let Some(leave) = push.leave {
            self.emit_sub(&channel, SubscriptionEvent::Leave(leave.info.into()));
        }
    }

    fn on_publication(&self, shared: &mut Shared, channel: &str, publication: WirePublication) {
        let Some(sub) = shared.subs.get_mut(channel) else {
            return;
        };
        match check_offset(sub.position.as_ref(), publication.offset) {
            OffsetCheck::Deliver => {
                if let Some(sp) = sub.position.as_mut()
                    && publication.offset > 0
                {
                    sp.offset = publication.offset;
                }
                self.emit_sub(channel, SubscriptionEvent::Publication(publication.into()));
            }
            OffsetCheck::Duplicate => {
                tracing::debug!(channel, offset = publication.offset, "dropping duplicate publication");
            }
            OffsetCheck::Gap { expected } => {
                tracing::warn!(
                    channel,
                    expected,
                    got = publication.offset,
                    "publication gap, recovering"
                );
                // The server still holds the subscription; leave before recovering.
                self.send_unsubscribe(shared, channel);
                if let Err(e) =
                    self.send_subscribe(shared, channel, subscribing_code::RECOVERING, "recovering")
                {
                    tracing::warn!(channel, "failed to start recovery: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to a client-side subscription. Cheap to clone.
///
/// Obtained from [`Client::new_subscription`](crate::Client::new_subscription);
/// events for it arrive on the client's event stream as
/// [`Event::Subscription`](crate::Event::Subscription).
#[derive(Clone)]
pub struct Subscription {
    channel: String,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(channel: String, inner: Arc<Inner>) -> Self {
        Self { channel, inner }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner
            .lock()
            .subs
            .get(&self.channel)
            .map_or(SubscriptionState::Unsubscribed, |sub| sub.state)
    }

    /// Last known stream position (recoverable subscriptions only).
    pub fn stream_position(&self) -> Option<StreamPosition> {
        self.inner
            .lock()
            .subs
            .get(&self.channel)
            .and_then(|sub| sub.position.clone())
    }

    /// Ask the server to subscribe. The outcome is reported on the event
    /// stream. Requires a connected client; a no-op when already subscribing
    /// or subscribed.
    pub fn subscribe(&self) -> Result<(), Error> {
        let mut shared = self.inner.lock();
        let state = shared
            .subs
            .get(&self.channel)
            .map(|sub| sub.state)
            .ok_or_else(removed)?;
        if state != SubscriptionState::Unsubscribed {
            return Ok(());
        }
        match shared.state {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(Error::Closed),
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot subscribe while {other}"
                )));
            }
        }
        self.inner.send_subscribe(
            &mut shared,
            &self.channel,
            subscribing_code::SUBSCRIBE_CALLED,
            "subscribe called",
        )
    }

    /// Leave the channel. Idempotent.
    pub fn unsubscribe(&self) -> Result<(), Error> {
        let mut shared = self.inner.lock();
        let sub = shared.subs.get_mut(&self.channel).ok_or_else(removed)?;
        if sub.state == SubscriptionState::Unsubscribed {
            return Ok(());
        }
        sub.state = SubscriptionState::Unsubscribed;
        sub.subscribe_id = None;

        if shared.state == ConnectionState::Connected {
            self.inner.send_unsubscribe(&mut shared, &self.channel);
        }
        tracing::info!(channel = %self.channel, "unsubscribed");
        self.inner.emit_sub(
            &self.channel,
            SubscriptionEvent::Unsubscribed {
                code: unsubscribed_code::UNSUBSCRIBE_CALLED,
                reason: "unsubscribe called".to_string(),
            },
        );
        Ok(())
    }

    /// Publish a JSON payload to the channel using the default request timeout.
    pub async fn publish(&self, data: &[u8]) -> Result<PublishResult, Error> {
        let deadline = Instant::now() + self.inner.config.timing.request_timeout;
        self.publish_with_deadline(data, deadline).await
    }

    /// Publish a JSON payload, failing with `Timeout` at `deadline`.
    ///
    /// Fails with `NotSubscribed` without touching the connection unless the
    /// subscription is subscribed.
    pub async fn publish_with_deadline(
        &self,
        data: &[u8],
        deadline: Instant,
    ) -> Result<PublishResult, Error> {
        let (id, rx) = {
            let mut shared = self.inner.lock();
            let subscribed = shared
                .subs
                .get(&self.channel)
                .is_some_and(|sub| sub.state == SubscriptionState::Subscribed);
            if !subscribed {
                return Err(Error::NotSubscribed(self.channel.clone()));
            }
            let data: serde_json::Value = serde_json::from_slice(data)
                .map_err(|e| Error::Decode(format!("publish payload is not JSON: {e}")))?;
            let command = Command {
                publish: Some(PublishRequest {
                    channel: self.channel.clone(),
                    data,
                }),
                ..Default::default()
            };
            self.inner.register_request(&mut shared, command)?
        };

        let reply = self.inner.await_reply(id, rx, deadline).await?;
        if let Some(err) = reply.error {
            return Err(Error::Channel {
                channel: self.channel.clone(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(PublishResult {
            offset: reply.publish.map_or(0, |p| p.offset),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
