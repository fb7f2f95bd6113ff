use std::time::Duration;

use centrifuge_client::protocol::{
    Command, decode_frame, disconnect_code, error_code, unsubscribed_code,
};
use centrifuge_client::{
    Client, ClientConfig, ConnectionState, Error, Event, Events, HistoryOptions, HistoryPager,
    SubscriptionConfig, SubscriptionEvent, SubscriptionState, TimingConfig,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct MockCentrifugo {
    listener: TcpListener,
    port: u16,
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

struct ConnectOptions {
    ping: u32,
    pong: bool,
    subs: serde_json::Value,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            ping: 25,
            pong: true,
            subs: serde_json::json!({}),
        }
    }
}

impl MockCentrifugo {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    fn endpoint(&self) -> String {
        format!("ws://127.0.0.1:{}/connection/websocket", self.port)
    }

    /// Accept one TCP connection and return the raw WebSocket (no handshake).
    async fn accept_raw(&self) -> Result<WsStream, Box<dyn std::error::Error>> {
        let (tcp, _) = self.listener.accept().await?;
        let ws = tokio_tungstenite::accept_async(tcp).await?;
        Ok(ws)
    }

    /// Accept one connection, read the connect command, and reply with `client_id`.
    async fn accept_and_connect(
        &self,
        client_id: &str,
    ) -> Result<(WsStream, Command), Box<dyn std::error::Error>> {
        self.accept_and_connect_with_opts(client_id, ConnectOptions::default())
            .await
    }

    async fn accept_and_connect_with_opts(
        &self,
        client_id: &str,
        opts: ConnectOptions,
    ) -> Result<(WsStream, Command), Box<dyn std::error::Error>> {
        let mut ws = self.accept_raw().await?;
        let cmd = read_command(&mut ws).await?;
        assert!(cmd.connect.is_some(), "first command must be connect");
        send_json(
            &mut ws,
            serde_json::json!({
                "id": cmd.id,
                "connect": {
                    "client": client_id,
                    "version": "test",
                    "ping": opts.ping,
                    "pong": opts.pong,
                    "subs": opts.subs,
                }
            }),
        )
        .await?;
        Ok((ws, cmd))
    }
}

async fn read_command(ws: &mut WsStream) -> Result<Command, Box<dyn std::error::Error>> {
    loop {
        let frame = ws.next().await.ok_or("WebSocket closed unexpectedly")??;
        if let tungstenite::Message::Text(text) = frame {
            return Ok(serde_json::from_str(text.as_str())?);
        }
    }
}

async fn send_json(
    ws: &mut WsStream,
    value: serde_json::Value,
) -> Result<(), Box<dyn std::error::Error>> {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await?;
    Ok(())
}

/// Answer a subscribe command with a successful reply at `offset`.
async fn accept_subscribe(
    ws: &mut WsStream,
    offset: u64,
) -> Result<Command, Box<dyn std::error::Error>> {
    let cmd = read_command(ws).await?;
    assert!(cmd.subscribe.is_some(), "expected subscribe, got {cmd:?}");
    send_json(
        ws,
        serde_json::json!({
            "id": cmd.id,
            "subscribe": {"recoverable": true, "epoch": "epoch-1", "offset": offset}
        }),
    )
    .await?;
    Ok(cmd)
}

async fn send_publication(
    ws: &mut WsStream,
    channel: &str,
    offset: u64,
    data: serde_json::Value,
) -> Result<(), Box<dyn std::error::Error>> {
    send_json(
        ws,
        serde_json::json!({
            "push": {
                "channel": channel,
                "pub": {"offset": offset, "data": data, "info": {"client": "c-9", "user": "user-9"}}
            }
        }),
    )
    .await
}

fn test_timing() -> TimingConfig {
    TimingConfig {
        connect_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        ping_margin: Duration::from_secs(5),
        close_timeout: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(50),
    }
}

fn test_client(server: &MockCentrifugo) -> (Client, Events) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
    let mut config = ClientConfig::new(server.endpoint(), "test-token");
    config.name = Some("integration".to_string());
    config.timing = test_timing();
    Client::new(config)
}

async fn next_event(events: &mut Events) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

/// Skip events until a subscription event arrives.
async fn next_sub_event(events: &mut Events) -> (String, SubscriptionEvent) {
    loop {
        if let Event::Subscription { channel, event } = next_event(events).await {
            return (channel, event);
        }
    }
}

fn recoverable() -> SubscriptionConfig {
    SubscriptionConfig {
        recoverable: true,
        join_leave: true,
    }
}

async fn connected(events: &mut Events) -> String {
    assert!(matches!(
        next_event(events).await,
        Event::Connecting { .. }
    ));
    match next_event(events).await {
        Event::Connected { client_id } => client_id,
        other => panic!("expected Connected, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test 1: connect, subscribe, receive publications in order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_subscribe_and_receive_publications() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    let server_task = tokio::spawn(async move {
        let (mut ws, connect) = server.accept_and_connect("c-1").await.unwrap();
        let connect = connect.connect.unwrap();
        assert_eq!(connect.token, "test-token");
        assert_eq!(connect.name.as_deref(), Some("integration"));

        let sub = accept_subscribe(&mut ws, 0).await.unwrap();
        let request = sub.subscribe.unwrap();
        assert_eq!(request.channel, "parser-3");
        assert!(request.recoverable);
        assert!(request.join_leave);
        assert!(!request.recover);

        // Three publications batched into one frame.
        let batch = (1..=3)
            .map(|i| {
                serde_json::json!({
                    "push": {"channel": "parser-3", "pub": {"offset": i, "data": {"process": "p", "status": i.to_string()}}}
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n");
        ws.send(tungstenite::Message::Text(batch.into()))
            .await
            .unwrap();
        ws
    });

    client.connect().unwrap();
    assert_eq!(connected(&mut events).await, "c-1");
    assert_eq!(client.client_id().as_deref(), Some("c-1"));

    let sub = client.new_subscription("parser-3", recoverable()).unwrap();
    sub.subscribe().unwrap();

    let (channel, event) = next_sub_event(&mut events).await;
    assert_eq!(channel, "parser-3");
    assert!(matches!(event, SubscriptionEvent::Subscribing { .. }));
    let (_, event) = next_sub_event(&mut events).await;
    assert!(matches!(event, SubscriptionEvent::Subscribed { .. }));

    for expected in 1..=3u64 {
        match next_sub_event(&mut events).await {
            (_, SubscriptionEvent::Publication(p)) => {
                assert_eq!(p.offset, expected);
                let data: serde_json::Value = serde_json::from_slice(&p.data).unwrap();
                assert_eq!(data["status"], expected.to_string());
            }
            other => panic!("expected Publication, got {other:?}"),
        }
    }
    assert_eq!(sub.stream_position().map(|sp| sp.offset), Some(3));

    let _ws = server_task.await.unwrap();
    client.close().await;
}

// ---------------------------------------------------------------------------
// Test 2: publish is acknowledged with an offset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_is_acknowledged() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    tokio::spawn(async move {
        let (mut ws, _) = server.accept_and_connect("c-1").await.unwrap();
        accept_subscribe(&mut ws, 41).await.unwrap();
        let cmd = read_command(&mut ws).await.unwrap();
        let publish = cmd.publish.unwrap();
        assert_eq!(publish.channel, "ch");
        assert_eq!(publish.data, serde_json::json!({"process": "build", "status": "ok"}));
        send_json(&mut ws, serde_json::json!({"id": cmd.id, "publish": {"offset": 42}}))
            .await
            .unwrap();
        // Hold the connection open until the client goes away.
        while ws.next().await.is_some() {}
    });

    client.connect().unwrap();
    connected(&mut events).await;
    let sub = client.new_subscription("ch", recoverable()).unwrap();
    sub.subscribe().unwrap();
    loop {
        if let (_, SubscriptionEvent::Subscribed { .. }) = next_sub_event(&mut events).await {
            break;
        }
    }

    let ack = sub
        .publish(br#"{"process":"build","status":"ok"}"#)
        .await
        .unwrap();
    assert_eq!(ack.offset, 42);
    client.close().await;
}

// ---------------------------------------------------------------------------
// Test 3: history pagination over the wire and unavailable history
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_pages_over_the_wire() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    tokio::spawn(async move {
        let (mut ws, _) = server.accept_and_connect("c-1").await.unwrap();
        loop {
            let Ok(cmd) = read_command(&mut ws).await else {
                return;
            };
            let history = cmd.history.unwrap();
            if history.channel == "no-history" {
                send_json(
                    &mut ws,
                    serde_json::json!({"id": cmd.id, "error": {"code": error_code::NOT_AVAILABLE, "message": "not available"}}),
                )
                .await
                .unwrap();
                continue;
            }
            // Stream of offsets 1..=5.
            let start = history.since.map_or(1, |sp| sp.offset + 1);
            let pubs: Vec<serde_json::Value> = (start..=5)
                .take(history.limit as usize)
                .map(|offset| serde_json::json!({"offset": offset, "data": offset}))
                .collect();
            send_json(
                &mut ws,
                serde_json::json!({"id": cmd.id, "history": {"publications": pubs, "epoch": "e", "offset": 5}}),
            )
            .await
            .unwrap();
        }
    });

    client.connect().unwrap();
    connected(&mut events).await;

    let mut pager = HistoryPager::new("parser-3", 3);
    let first = pager.next_page(&client).await.unwrap();
    assert_eq!(
        first.publications.iter().map(|p| p.offset).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    let second = pager.next_page(&client).await.unwrap();
    assert_eq!(
        second.publications.iter().map(|p| p.offset).collect::<Vec<_>>(),
        vec![4, 5]
    );
    assert!(second.end_reached);
    assert!(pager.is_reverse());

    let err = client
        .history(
            "no-history",
            HistoryOptions {
                limit: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Channel { ref channel, code: error_code::NOT_AVAILABLE, .. } if channel == "no-history"
    ));
    client.close().await;
}

// ---------------------------------------------------------------------------
// Test 4: server disconnect push tears the session down
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_disconnect_push() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    tokio::spawn(async move {
        let (mut ws, _) = server.accept_and_connect("c-1").await.unwrap();
        accept_subscribe(&mut ws, 0).await.unwrap();
        send_json(
            &mut ws,
            serde_json::json!({"push": {"disconnect": {"code": 3001, "reason": "shutdown"}}}),
        )
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    });

    client.connect().unwrap();
    connected(&mut events).await;
    let sub = client.new_subscription("ch", recoverable()).unwrap();
    sub.subscribe().unwrap();

    loop {
        match next_event(&mut events).await {
            Event::Subscription {
                event: SubscriptionEvent::Unsubscribed { code, .. },
                ..
            } => {
                assert_eq!(code, unsubscribed_code::CONNECTION_LOST);
            }
            Event::Disconnected { code, reason } => {
                assert_eq!(code, 3001);
                assert_eq!(reason, "shutdown");
                break;
            }
            _ => {}
        }
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
}

// ---------------------------------------------------------------------------
// Test 5: rejected token
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unauthorized_connect() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    tokio::spawn(async move {
        let mut ws = server.accept_raw().await.unwrap();
        let cmd = read_command(&mut ws).await.unwrap();
        send_json(
            &mut ws,
            serde_json::json!({"id": cmd.id, "error": {"code": error_code::UNAUTHORIZED, "message": "unauthorized"}}),
        )
        .await
        .unwrap();
    });

    client.connect().unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connecting { .. }));
    match next_event(&mut events).await {
        Event::Error { error } => assert!(matches!(error, Error::Server { code: 101, .. })),
        other => panic!("expected Error, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Disconnected { code, .. } => assert_eq!(code, disconnect_code::UNAUTHORIZED),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test 6: connection refused
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_refused() {
    // Bind and drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = ClientConfig::new(format!("ws://127.0.0.1:{port}/"), "t");
    config.timing = test_timing();
    let (client, mut events) = Client::new(config);

    client.connect().unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connecting { .. }));
    match next_event(&mut events).await {
        Event::Error { error } => assert!(error.is_transport(), "got {error:?}"),
        other => panic!("expected Error, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Disconnected { code, .. } => assert_eq!(code, disconnect_code::CONNECT_FAILED),
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Test 7: heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    let server_task = tokio::spawn(async move {
        let (mut ws, _) = server.accept_and_connect("c-1").await.unwrap();
        ws.send(tungstenite::Message::Text("{}".to_string().into())).await.unwrap();
        loop {
            let frame = ws.next().await.unwrap().unwrap();
            if let tungstenite::Message::Text(text) = frame {
                let replies = decode_frame(text.as_str());
                return replies.len() == 1 && replies[0].as_ref().is_ok_and(|r| r.is_ping());
            }
        }
    });

    client.connect().unwrap();
    connected(&mut events).await;
    assert!(server_task.await.unwrap(), "expected pong");
    client.close().await;
}

#[tokio::test]
async fn missing_ping_disconnects() {
    let server = MockCentrifugo::start().await.unwrap();
    let mut config = ClientConfig::new(server.endpoint(), "t");
    config.timing = TimingConfig {
        ping_margin: Duration::from_millis(200),
        ..test_timing()
    };
    let (client, mut events) = Client::new(config);

    tokio::spawn(async move {
        let (mut ws, _) = server
            .accept_and_connect_with_opts(
                "c-1",
                ConnectOptions {
                    ping: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Stay silent.
        while ws.next().await.is_some() {}
    });

    client.connect().unwrap();
    connected(&mut events).await;
    match next_event(&mut events).await {
        Event::Disconnected { code, .. } => assert_eq!(code, disconnect_code::NO_PING),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test 8: server-side subscriptions from the connect reply
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_side_subscriptions() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    tokio::spawn(async move {
        let (mut ws, _) = server
            .accept_and_connect_with_opts(
                "c-1",
                ConnectOptions {
                    subs: serde_json::json!({
                        "#user-4": {"recoverable": true, "epoch": "e", "offset": 2}
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        send_publication(&mut ws, "#user-4", 3, serde_json::json!({"n": 3}))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    client.connect().unwrap();
    connected(&mut events).await;
    match next_event(&mut events).await {
        Event::ServerSubscribed { channel, .. } => assert_eq!(channel, "#user-4"),
        other => panic!("expected ServerSubscribed, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::ServerPublication {
            channel,
            publication,
        } => {
            assert_eq!(channel, "#user-4");
            assert_eq!(publication.offset, 3);
            assert_eq!(publication.info.unwrap().user, "user-9");
        }
        other => panic!("expected ServerPublication, got {other:?}"),
    }
    client.close().await;
}

// ---------------------------------------------------------------------------
// Test 9: resubscribe after reconnect recovers from the stored position
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resubscribe_recovers_from_position() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut ws, _) = server.accept_and_connect("c-1").await.unwrap();
        accept_subscribe(&mut ws, 7).await.unwrap();
        while ws.next().await.is_some() {}

        let (mut ws, _) = server.accept_and_connect("c-2").await.unwrap();
        let cmd = read_command(&mut ws).await.unwrap();
        let _ = tx.send(cmd.subscribe.unwrap());
        while ws.next().await.is_some() {}
    });

    client.connect().unwrap();
    connected(&mut events).await;
    let sub = client.new_subscription("ch", recoverable()).unwrap();
    sub.subscribe().unwrap();
    loop {
        if let (_, SubscriptionEvent::Subscribed { position, .. }) =
            next_sub_event(&mut events).await
        {
            assert_eq!(position.map(|sp| sp.offset), Some(7));
            break;
        }
    }

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.connect().unwrap();
    loop {
        if let Event::Connected { client_id } = next_event(&mut events).await {
            assert_eq!(client_id, "c-2");
            break;
        }
    }
    sub.subscribe().unwrap();

    let request = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(request.recover);
    assert_eq!(request.offset, 7);
    assert_eq!(request.epoch, "epoch-1");
    client.close().await;
}

// ---------------------------------------------------------------------------
// Test 10: close
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_while_connected() {
    let server = MockCentrifugo::start().await.unwrap();
    let (client, mut events) = test_client(&server);

    let server_task = tokio::spawn(async move {
        let (mut ws, _) = server.accept_and_connect("c-1").await.unwrap();
        // The client sends a close frame or drops the socket.
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    });

    client.connect().unwrap();
    connected(&mut events).await;

    let waiter = client.clone();
    let closed = tokio::spawn(async move { waiter.closed().await });

    tokio::join!(client.close(), client.close());

    match next_event(&mut events).await {
        Event::Disconnected { code, .. } => assert_eq!(code, disconnect_code::CLIENT_CLOSED),
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, Event::Closed));
    assert_eq!(client.state(), ConnectionState::Closed);
    tokio::time::timeout(Duration::from_secs(5), closed)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(client.connect(), Err(Error::Closed)));
}
