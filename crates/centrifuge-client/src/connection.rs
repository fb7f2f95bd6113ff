//! Session task: WebSocket handshake, protocol connect, and the read/write loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::client::Inner;
use crate::protocol::{
    Command, ConnectResult, PONG, decode_frame, disconnect_code, encode_command, error_code,
};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsRead = futures_util::stream::SplitStream<WsStream>;
pub(crate) type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Endpoint validation
// ---------------------------------------------------------------------------

/// Parse the endpoint and require a WebSocket scheme.
pub(crate) fn endpoint_url(endpoint: &str) -> Result<url::Url, Error> {
    let url = url::Url::parse(endpoint)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::InvalidEndpoint(format!(
            "unsupported scheme {other:?} in {endpoint}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn connect_and_split(url: &str) -> Result<(WsWrite, WsRead), Error> {
    let (ws, _resp) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws.split())
}

async fn send_command(ws_write: &mut WsWrite, cmd: &Command) -> Result<(), Error> {
    let text = encode_command(cmd)?;
    ws_write.send(tungstenite::Message::Text(text.into())).await?;
    Ok(())
}

async fn wait_for_connect_reply(ws_read: &mut WsRead, id: u32) -> Result<ConnectResult, Error> {
    while let Some(frame) = ws_read.next().await {
        let frame = frame?;
        let tungstenite::Message::Text(text) = frame else {
            continue;
        };
        for reply in decode_frame(text.as_str()) {
            let reply = reply?;
            if reply.id != id {
                tracing::debug!(id = reply.id, "Ignoring message before connect reply");
                continue;
            }
            if let Some(err) = reply.error {
                return Err(Error::Server {
                    code: err.code,
                    message: err.message,
                });
            }
            return reply
                .connect
                .ok_or_else(|| Error::Decode("connect reply without result".to_string()));
        }
    }
    Err(Error::Transport(
        "connection closed before connect reply".to_string(),
    ))
}

async fn handshake(
    url: &str,
    connect: &Command,
) -> Result<(WsWrite, WsRead, ConnectResult), Error> {
    let (mut ws_write, mut ws_read) = connect_and_split(url).await?;
    send_command(&mut ws_write, connect).await?;
    let result = wait_for_connect_reply(&mut ws_read, connect.id).await?;
    Ok((ws_write, ws_read, result))
}

/// Disconnect code and reason for a failed handshake.
fn handshake_disconnect(err: &Error) -> (u32, &'static str) {
    match err {
        Error::Server { code, .. }
            if *code == error_code::UNAUTHORIZED || *code == error_code::TOKEN_EXPIRED =>
        {
            (disconnect_code::UNAUTHORIZED, "unauthorized")
        }
        Error::Decode(_) => (disconnect_code::BAD_PROTOCOL, "bad protocol"),
        Error::Timeout => (disconnect_code::CONNECT_FAILED, "connect timeout"),
        _ => (disconnect_code::CONNECT_FAILED, "connect failed"),
    }
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

enum LoopAction {
    Continue,
    Pong,
    Disconnect { code: u32, reason: String },
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Drive one connection from handshake to teardown.
///
/// The task only touches client state through `Inner` with its `generation`;
/// once `disconnect`/`close` bump the generation every callback is a no-op
/// and `cancel` stops the loop.
pub(crate) async fn run_session(
    inner: Arc<Inner>,
    generation: u64,
    url: String,
    connect: Command,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let timing = inner.config.timing.clone();

    let handshake_result = tokio::select! {
        result = tokio::time::timeout(timing.connect_timeout, handshake(&url, &connect)) => {
            match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            }
        }
        _ = cancel.cancelled() => {
            tracing::debug!("Connect cancelled");
            return;
        }
    };

    let (mut ws_write, mut ws_read, result) = match handshake_result {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!("Connect failed: {e}");
            let (code, reason) = handshake_disconnect(&e);
            inner.session_lost(generation, code, reason, Some(e));
            return;
        }
    };

    let send_pong = result.pong;
    let idle_timeout = (result.ping > 0)
        .then(|| Duration::from_secs(u64::from(result.ping)) + timing.ping_margin);
    if !inner.on_connected(generation, result) {
        let _ = ws_write.send(tungstenite::Message::Close(None)).await;
        return;
    }

    let mut idle_deadline = idle_timeout.map(|t| Instant::now() + t);
    let mut sweep = tokio::time::interval(timing.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (code, reason, error) = loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if let Some(t) = idle_timeout {
                            idle_deadline = Some(Instant::now() + t);
                        }
                        match handle_frame(&inner, generation, text.as_str()) {
                            LoopAction::Continue => {}
                            LoopAction::Pong if send_pong => {
                                let pong = tungstenite::Message::Text(PONG.to_string().into());
                                if let Err(e) = ws_write.send(pong).await {
                                    tracing::warn!("Failed to send pong: {e}");
                                    break (disconnect_code::TRANSPORT_CLOSED, "transport closed".to_string(), Some(e.into()));
                                }
                            }
                            LoopAction::Pong => {}
                            LoopAction::Disconnect { code, reason } => {
                                tracing::info!(code, %reason, "Server disconnect");
                                break (code, reason, None);
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        tracing::info!(?frame, "WebSocket closed by server");
                        let (code, reason) = frame.map_or_else(
                            || (disconnect_code::TRANSPORT_CLOSED, "transport closed".to_string()),
                            |f| (u32::from(u16::from(f.code)), f.reason.as_str().to_string()),
                        );
                        break (code, reason, None);
                    }
                    Some(Ok(_)) => {
                        // Ignore binary, ping, pong frames
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        break (disconnect_code::TRANSPORT_CLOSED, "transport closed".to_string(), Some(e.into()));
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break (disconnect_code::TRANSPORT_CLOSED, "transport closed".to_string(), None);
                    }
                }
            }

            cmd = outbound.recv() => {
                let Some(cmd) = cmd else {
                    // Session handle dropped: the client moved on.
                    let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                    return;
                };
                if let Err(e) = send_command(&mut ws_write, &cmd).await {
                    tracing::warn!("Failed to send command: {e}");
                    break (disconnect_code::TRANSPORT_CLOSED, "transport closed".to_string(), Some(e));
                }
            }

            _ = sleep_until_deadline(idle_deadline) => {
                tracing::warn!("Heartbeat timeout");
                break (disconnect_code::NO_PING, "no ping".to_string(), None);
            }

            _ = sweep.tick() => {
                inner.expire_pending(generation);
            }

            _ = cancel.cancelled() => {
                tracing::debug!("Session cancelled");
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                return;
            }
        }
    };

    let _ = ws_write.close().await;
    inner.session_lost(generation, code, &reason, error);
}

fn handle_frame(inner: &Inner, generation: u64, text: &str) -> LoopAction {
    let mut action = LoopAction::Continue;
    for reply in decode_frame(text) {
        match reply {
            Ok(reply) if reply.is_ping() => {
                tracing::trace!("Ping received");
                action = LoopAction::Pong;
            }
            Ok(reply) => {
                if let Some((code, reason)) = inner.handle_reply(generation, reply) {
                    return LoopAction::Disconnect { code, reason };
                }
            }
            Err(e) => {
                tracing::warn!("Failed to decode message: {e}");
            }
        }
    }
    action
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_accepts_websocket_schemes() {
        assert!(endpoint_url("ws://localhost:8000/connection/websocket").is_ok());
        assert!(endpoint_url("wss://chat.example.com/connection/websocket").is_ok());
    }

    #[test]
    fn endpoint_url_rejects_other_schemes() {
        let err = endpoint_url("https://chat.example.com/").unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint(_)));
        assert!(matches!(endpoint_url("::"), Err(Error::Url(_))));
    }

    #[test]
    fn handshake_disconnect_codes() {
        let unauthorized = Error::Server {
            code: error_code::UNAUTHORIZED,
            message: "invalid token".to_string(),
        };
        assert_eq!(
            handshake_disconnect(&unauthorized).0,
            disconnect_code::UNAUTHORIZED
        );
        let expired = Error::Server {
            code: error_code::TOKEN_EXPIRED,
            message: "token expired".to_string(),
        };
        assert_eq!(
            handshake_disconnect(&expired).0,
            disconnect_code::UNAUTHORIZED
        );
        assert_eq!(
            handshake_disconnect(&Error::Decode("bad".to_string())).0,
            disconnect_code::BAD_PROTOCOL
        );
        assert_eq!(
            handshake_disconnect(&Error::Transport("refused".to_string())).0,
            disconnect_code::CONNECT_FAILED
        );
        assert_eq!(
            handshake_disconnect(&Error::Timeout).1,
            "connect timeout"
        );
    }

    #[tokio::test]
    async fn sleep_until_none_never_fires() {
        let fired = tokio::time::timeout(Duration::from_millis(20), sleep_until_deadline(None))
            .await
            .is_ok();
        assert!(!fired);
    }
}
