//! Public types for the centrifuge-client crate.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::Error;
use crate::protocol::{WireClientInfo, WirePublication, WireStreamPosition, data_bytes};

/// Lifecycle state of a [`Client`](crate::Client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal: no further operations are valid.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a [`Subscription`](crate::Subscription).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Subscribed => "subscribed",
        };
        f.write_str(s)
    }
}

/// Position in a channel's history: `offset` is only meaningful within `epoch`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamPosition {
    pub offset: u64,
    pub epoch: String,
}

impl From<StreamPosition> for WireStreamPosition {
    fn from(sp: StreamPosition) -> Self {
        Self {
            offset: sp.offset,
            epoch: sp.epoch,
        }
    }
}

/// Identity of the connection that published, joined, or left.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientInfo {
    pub client: String,
    pub user: String,
}

impl From<WireClientInfo> for ClientInfo {
    fn from(info: WireClientInfo) -> Self {
        Self {
            client: info.client,
            user: info.user,
        }
    }
}

/// A publication received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Position in the channel stream; 0 when the channel keeps no history.
    pub offset: u64,
    /// Raw payload bytes.
    pub data: Vec<u8>,
    /// Publisher, when the server attaches it.
    pub info: Option<ClientInfo>,
    pub tags: HashMap<String, String>,
}

impl From<WirePublication> for Publication {
    fn from(p: WirePublication) -> Self {
        Self {
            offset: p.offset,
            data: data_bytes(&p.data),
            info: p.info.map(ClientInfo::from),
            tags: p.tags,
        }
    }
}

/// Options for a history query.
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// Maximum number of publications to return (0 returns only the stream top).
    pub limit: u32,
    /// Anchor: return publications after (or, when `reverse`, before) this position.
    pub since: Option<StreamPosition>,
    pub reverse: bool,
}

/// One page of channel history.
#[derive(Debug, Clone, Default)]
pub struct HistoryResult {
    pub publications: Vec<Publication>,
    pub epoch: String,
    /// Current top offset of the stream.
    pub offset: u64,
}

/// Acknowledgement of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishResult {
    /// Offset assigned by the server; 0 when the channel keeps no history.
    pub offset: u64,
}

/// Per-subscription options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionConfig {
    /// Track the stream position and ask the server to replay missed publications.
    pub recoverable: bool,
    /// Receive join/leave events for the channel.
    pub join_leave: bool,
}

/// Tunable timeouts.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// WebSocket handshake plus protocol connect.
    pub connect_timeout: Duration,
    /// Default deadline for publish, history, and subscribe replies.
    pub request_timeout: Duration,
    /// Extra time allowed past the server ping interval before the
    /// connection is considered dead.
    pub ping_margin: Duration,
    /// How long `disconnect`/`close` wait for the session task to finish.
    pub close_timeout: Duration,
    /// How often pending subscribe requests are checked for expiry.
    pub sweep_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            ping_margin: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration for [`Client::new`](crate::Client::new).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8000/connection/websocket`.
    pub endpoint: String,
    /// Connection token (see [`issue_token`](crate::issue_token)).
    pub token: String,
    /// Client name reported to the server.
    pub name: Option<String>,
    /// Client version reported to the server.
    pub version: Option<String>,
    pub timing: TimingConfig,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            name: None,
            version: None,
            timing: TimingConfig::default(),
        }
    }
}

/// Events emitted on the client's event stream, in the order the underlying
/// state transitions happened.
#[derive(Debug)]
pub enum Event {
    Connecting { code: u32, reason: String },
    Connected { client_id: String },
    Disconnected { code: u32, reason: String },
    /// An error occurred. Does not change state by itself; a following
    /// `Disconnected` does.
    Error { error: Error },
    /// Asynchronous message from the server, independent of any channel.
    Message { data: Vec<u8> },
    ServerSubscribing { channel: String },
    ServerSubscribed {
        channel: String,
        was_recovering: bool,
        recovered: bool,
    },
    ServerPublication {
        channel: String,
        publication: Publication,
    },
    ServerUnsubscribed { channel: String },
    ServerJoin { channel: String, info: ClientInfo },
    ServerLeave { channel: String, info: ClientInfo },
    /// An event of a client-side subscription.
    Subscription {
        channel: String,
        event: SubscriptionEvent,
    },
    /// The client was closed; no further events follow.
    Closed,
}

/// Events of a single client-side subscription.
#[derive(Debug)]
pub enum SubscriptionEvent {
    Subscribing { code: u32, reason: String },
    Subscribed {
        was_recovering: bool,
        recovered: bool,
        position: Option<StreamPosition>,
    },
    Unsubscribed { code: u32, reason: String },
    Error { error: Error },
    Publication(Publication),
    Join(ClientInfo),
    Leave(ClientInfo),
}
