use centrifuge_client::{Event, Events, Publication, SubscriptionEvent};
use tracing::{debug, info, warn};

use crate::chat::ChatMessage;

/// Logs client events. Chat payloads that fail to decode are counted and
/// skipped.
#[derive(Debug, Default)]
pub struct EventRenderer {
    decode_errors: u64,
}

impl EventRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    /// Render events until the client is closed or the stream ends.
    pub async fn run(mut self, mut events: Events) -> Self {
        while let Some(event) = events.next().await {
            let closed = matches!(event, Event::Closed);
            self.render(event);
            if closed {
                break;
            }
        }
        self
    }

    pub fn render(&mut self, event: Event) {
        match event {
            Event::Connecting { code, reason } => info!("Connecting - {code} ({reason})"),
            Event::Connected { client_id } => info!("Connected with ID {client_id}"),
            Event::Disconnected { code, reason } => info!("Disconnected: {code} ({reason})"),
            Event::Error { error } => warn!("Error: {error}"),
            Event::Message { data } => {
                info!("Message from server: {}", String::from_utf8_lossy(&data));
            }
            Event::ServerSubscribing { channel } => {
                info!("Subscribing to server-side channel {channel}");
            }
            Event::ServerSubscribed {
                channel,
                was_recovering,
                recovered,
            } => info!(
                "Subscribed to server-side channel {channel}: (was recovering: {was_recovering}, recovered: {recovered})"
            ),
            Event::ServerUnsubscribed { channel } => {
                info!("Unsubscribed from server-side channel {channel}");
            }
            Event::ServerPublication {
                channel,
                publication,
            } => info!(
                "Publication from server-side channel {channel}: {} (offset {})",
                String::from_utf8_lossy(&publication.data),
                publication.offset
            ),
            Event::ServerJoin { channel, info } => info!(
                "Join to server-side channel {channel}: {} ({})",
                info.user, info.client
            ),
            Event::ServerLeave { channel, info } => info!(
                "Leave from server-side channel {channel}: {} ({})",
                info.user, info.client
            ),
            Event::Subscription { channel, event } => self.render_subscription(&channel, event),
            Event::Closed => info!("Client closed"),
        }
    }

    fn render_subscription(&mut self, channel: &str, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Subscribing { code, reason } => {
                info!("Subscribing on channel {channel} - {code} ({reason})");
            }
            SubscriptionEvent::Subscribed {
                was_recovering,
                recovered,
                ..
            } => info!(
                "Subscribed on channel {channel}, (was recovering: {was_recovering}, recovered: {recovered})"
            ),
            SubscriptionEvent::Unsubscribed { code, reason } => {
                info!("Unsubscribed from channel {channel} - {code} ({reason})");
            }
            SubscriptionEvent::Error { error } => warn!("Subscription error {channel}: {error}"),
            SubscriptionEvent::Publication(publication) => {
                match describe_publication(channel, &publication) {
                    Some(line) => info!("{line}"),
                    None => {
                        self.decode_errors += 1;
                        debug!(
                            channel,
                            offset = publication.offset,
                            decode_errors = self.decode_errors,
                            "dropping publication that is not a chat message"
                        );
                    }
                }
            }
            SubscriptionEvent::Join(info) => info!(
                "Someone joined {channel}: user id {}, client id {}",
                info.user, info.client
            ),
            SubscriptionEvent::Leave(info) => info!(
                "Someone left {channel}: user id {}, client id {}",
                info.user, info.client
            ),
        }
    }
}

/// The log line for a chat publication, or `None` if the payload is not a
/// chat message.
pub fn describe_publication(channel: &str, publication: &Publication) -> Option<String> {
    let msg = ChatMessage::decode(&publication.data).ok()?;
    Some(format!(
        "Someone says via channel {channel}: process: {}, status: {}, (offset {})",
        msg.process, msg.status, publication.offset
    ))
}
