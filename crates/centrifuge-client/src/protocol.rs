//! Centrifugo JSON wire protocol types, codes, and frame encode/decode.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Error;

// ---------------------------------------------------------------------------
// Server error codes
// ---------------------------------------------------------------------------

pub mod error_code {
    pub const INTERNAL: u32 = 100;
    pub const UNAUTHORIZED: u32 = 101;
    pub const UNKNOWN_CHANNEL: u32 = 102;
    pub const PERMISSION_DENIED: u32 = 103;
    pub const METHOD_NOT_FOUND: u32 = 104;
    pub const ALREADY_SUBSCRIBED: u32 = 105;
    pub const LIMIT_EXCEEDED: u32 = 106;
    pub const BAD_REQUEST: u32 = 107;
    pub const NOT_AVAILABLE: u32 = 108;
    pub const TOKEN_EXPIRED: u32 = 109;
    pub const EXPIRED: u32 = 110;
    pub const TOO_MANY_REQUESTS: u32 = 111;
    pub const UNRECOVERABLE_POSITION: u32 = 112;
}

// ---------------------------------------------------------------------------
// Client-side event codes
// ---------------------------------------------------------------------------

pub mod connecting_code {
    pub const CONNECT_CALLED: u32 = 0;
}

pub mod disconnect_code {
    pub const DISCONNECT_CALLED: u32 = 0;
    pub const UNAUTHORIZED: u32 = 1;
    pub const BAD_PROTOCOL: u32 = 2;
    pub const TRANSPORT_CLOSED: u32 = 3;
    pub const NO_PING: u32 = 4;
    pub const CONNECT_FAILED: u32 = 5;
    pub const CLIENT_CLOSED: u32 = 6;
}

pub mod subscribing_code {
    pub const SUBSCRIBE_CALLED: u32 = 0;
    pub const RECOVERING: u32 = 1;
}

pub mod unsubscribed_code {
    pub const UNSUBSCRIBE_CALLED: u32 = 0;
    pub const CONNECTION_LOST: u32 = 1;
    pub const SUBSCRIBE_FAILED: u32 = 2;
    pub const SUBSCRIBE_TIMEOUT: u32 = 3;
    pub const CLIENT_CLOSED: u32 = 4;
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

// ---------------------------------------------------------------------------
// Commands (client → server)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Command {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectRequest {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Recovery positions for server-side subscriptions seen on a previous session.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeRecovery>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SubscribeRecovery {
    #[serde(skip_serializing_if = "is_false")]
    pub recover: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub epoch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SubscribeRequest {
    pub channel: String,
    #[serde(skip_serializing_if = "is_false")]
    pub recoverable: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub join_leave: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub recover: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub epoch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PublishRequest {
    pub channel: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HistoryRequest {
    pub channel: String,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<WireStreamPosition>,
    #[serde(skip_serializing_if = "is_false")]
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WireStreamPosition {
    pub offset: u64,
    pub epoch: String,
}

// ---------------------------------------------------------------------------
// Replies and pushes (server → client)
// ---------------------------------------------------------------------------

/// One server message. `id > 0` marks a reply to a command; `push` marks an
/// asynchronous push; a message with neither is a ping.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Reply {
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<Push>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryResult>,
}

fn is_zero_u32(n: &u32) -> bool {
    *n == 0
}

impl Reply {
    pub fn is_ping(&self) -> bool {
        self.id == 0 && self.push.is_none() && self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectResult {
    pub client: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeResult>,
    /// Server ping interval in seconds; 0 disables heartbeat checks.
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub ping: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub pong: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SubscribeResult {
    #[serde(skip_serializing_if = "is_false")]
    pub recoverable: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: u64,
    #[serde(skip_serializing_if = "is_false")]
    pub was_recovering: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub recovered: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<WirePublication>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PublishResult {
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HistoryResult {
    pub publications: Vec<WirePublication>,
    pub epoch: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WirePublication {
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: u64,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<WireClientInfo>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WireClientInfo {
    pub client: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Push {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(rename = "pub", skip_serializing_if = "Option::is_none")]
    pub publication: Option<WirePublication>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinLeave>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave: Option<JoinLeave>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribePush>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePush>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<DisconnectPush>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JoinLeave {
    pub info: WireClientInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UnsubscribePush {
    pub code: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MessagePush {
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DisconnectPush {
    pub code: u32,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_command(cmd: &Command) -> Result<String, Error> {
    Ok(serde_json::to_string(cmd)?)
}

/// The pong frame sent in response to a server ping.
pub const PONG: &str = "{}";

/// Decode one text frame. The server may batch several messages in one frame,
/// separated by newlines; each line is decoded independently so one bad line
/// does not discard the rest.
pub fn decode_frame(text: &str) -> Vec<Result<Reply, Error>> {
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Reply>(line)
                .map_err(|e| Error::Decode(format!("reply decode error: {e}")))
        })
        .collect()
}

/// Payload bytes for a JSON value carried on the wire.
pub fn data_bytes(data: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(data).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_subscribe_first_time_has_no_position() {
        let cmd = Command {
            id: 2,
            subscribe: Some(SubscribeRequest {
                channel: "parser-3".to_string(),
                recoverable: true,
                join_leave: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let json: serde_json::Value =
            serde_json::from_str(&encode_command(&cmd).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 2,
                "subscribe": {"channel": "parser-3", "recoverable": true, "join_leave": true}
            })
        );
    }

    #[test]
    fn encode_subscribe_with_recovery_position() {
        let cmd = Command {
            id: 7,
            subscribe: Some(SubscribeRequest {
                channel: "ch".to_string(),
                recoverable: true,
                recover: true,
                offset: 41,
                epoch: "xyz".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let json: serde_json::Value =
            serde_json::from_str(&encode_command(&cmd).unwrap()).unwrap();
        let sub = &json["subscribe"];
        assert_eq!(sub["recover"], true);
        assert_eq!(sub["offset"], 41);
        assert_eq!(sub["epoch"], "xyz");
        assert!(sub.get("join_leave").is_none());
    }

    #[test]
    fn encode_history_request() {
        let cmd = Command {
            id: 3,
            history: Some(HistoryRequest {
                channel: "ch".to_string(),
                limit: 10,
                since: Some(WireStreamPosition {
                    offset: 5,
                    epoch: "e1".to_string(),
                }),
                reverse: true,
            }),
            ..Default::default()
        };
        let json: serde_json::Value =
            serde_json::from_str(&encode_command(&cmd).unwrap()).unwrap();
        assert_eq!(
            json["history"],
            serde_json::json!({
                "channel": "ch",
                "limit": 10,
                "since": {"offset": 5, "epoch": "e1"},
                "reverse": true
            })
        );
    }

    #[test]
    fn decode_connect_reply() {
        let frames = decode_frame(
            r#"{"id":1,"connect":{"client":"c-1","version":"5.0.0","ping":25,"pong":true}}"#,
        );
        assert_eq!(frames.len(), 1);
        let reply = frames.into_iter().next().unwrap().unwrap();
        assert_eq!(reply.id, 1);
        let connect = reply.connect.unwrap();
        assert_eq!(connect.client, "c-1");
        assert_eq!(connect.ping, 25);
        assert!(connect.pong);
    }

    #[test]
    fn decode_error_reply() {
        let reply = decode_frame(r#"{"id":4,"error":{"code":108,"message":"not available"}}"#)
            .into_iter()
            .next()
            .unwrap()
            .unwrap();
        assert!(!reply.is_ping());
        let err = reply.error.unwrap();
        assert_eq!(err.code, error_code::NOT_AVAILABLE);
        assert_eq!(err.message, "not available");
    }

    #[test]
    fn decode_publication_push() {
        let reply = decode_frame(
            r#"{"push":{"channel":"parser-3","pub":{"offset":12,"data":{"process":"p","status":"ok"},"info":{"client":"c-9","user":"user-9"}}}}"#,
        )
        .into_iter()
        .next()
        .unwrap()
        .unwrap();
        let push = reply.push.unwrap();
        assert_eq!(push.channel, "parser-3");
        let publication = push.publication.unwrap();
        assert_eq!(publication.offset, 12);
        assert_eq!(publication.info.unwrap().user, "user-9");
        assert_eq!(
            publication.data,
            serde_json::json!({"process": "p", "status": "ok"})
        );
    }

    #[test]
    fn decode_batched_frame_keeps_good_lines() {
        let text = "{\"id\":1,\"publish\":{}}\nnot json\n{}\n";
        let results = decode_frame(text);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Decode(_))));
        assert!(results[2].as_ref().unwrap().is_ping());
    }

    #[test]
    fn ping_is_empty_object() {
        let reply = decode_frame(PONG).into_iter().next().unwrap().unwrap();
        assert!(reply.is_ping());
    }

    #[test]
    fn data_bytes_serializes_value() {
        let bytes = data_bytes(&serde_json::json!({"a": 1}));
        assert_eq!(bytes, br#"{"a":1}"#.to_vec());
    }
}
