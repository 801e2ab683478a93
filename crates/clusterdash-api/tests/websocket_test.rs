#![allow(clippy::unwrap_used)]
// Integration tests for `SubscriptionChannel` against an in-process WebSocket server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_async, accept_hdr_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use clusterdash_api::{AuthToken, ChannelState, ControlMessage, ReconnectConfig, SubscriptionChannel, TokenStore};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ─────────────────────────────────────────────────────────

async fn listen() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/websocket/workload")).unwrap();
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

/// Next text frame from the client, parsed as JSON.
async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_retries: None,
    }
}

fn tokens_with(token: &str) -> TokenStore {
    let tokens = TokenStore::in_memory();
    tokens.set(AuthToken::new(token, None)).unwrap();
    tokens
}

/// Accept one upgrade and return the socket with its `Authorization` header.
async fn accept_with_auth(listener: &TcpListener) -> (WebSocketStream<TcpStream>, Option<String>) {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let seen = Arc::new(Mutex::new(None::<String>));
    let sink = Arc::clone(&seen);
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *sink.lock().unwrap() = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(resp)
    };
    let ws = accept_hdr_async(stream, callback).await.unwrap();
    let auth = seen.lock().unwrap().clone();
    (ws, auth)
}

async fn wait_for_state(channel: &SubscriptionChannel, want: ChannelState) {
    let mut rx = channel.subscribe_state();
    timeout(WAIT, rx.wait_for(|s| *s == want)).await.unwrap().unwrap();
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_is_sent_first_with_bearer_header() {
    let (listener, url) = listen().await;

    let handshake = ControlMessage::new("subscribe").with_field("resource", "workloads");
    let (channel, _frames) = SubscriptionChannel::open(
        url,
        handshake.clone(),
        fast_reconnect(),
        tokens_with("abc"),
        &CancellationToken::new(),
    );

    let (mut ws, auth) = accept_with_auth(&listener).await;
    let first = next_json(&mut ws).await;
    assert_eq!(first["op"], "subscribe");
    assert_eq!(first["resource"], "workloads");
    let msg_id = first["msg_id"].as_str().unwrap();
    assert!(!msg_id.is_empty());
    assert_ne!(msg_id, handshake.msg_id, "each open carries a fresh msg_id");
    assert_eq!(auth.as_deref(), Some("Bearer abc"));

    channel.close();
}

#[tokio::test]
async fn test_reconnect_uses_the_renewed_token() {
    let (listener, url) = listen().await;
    let tokens = tokens_with("old");

    let (channel, _frames) = SubscriptionChannel::open(
        url,
        ControlMessage::new("subscribe"),
        fast_reconnect(),
        tokens.clone(),
        &CancellationToken::new(),
    );

    let (mut first, auth) = accept_with_auth(&listener).await;
    assert_eq!(auth.as_deref(), Some("Bearer old"));
    let _handshake = next_json(&mut first).await;

    tokens.set(AuthToken::new("new", None)).unwrap();
    first.close(None).await.unwrap();
    drop(first);

    let (mut second, auth) = accept_with_auth(&listener).await;
    assert_eq!(auth.as_deref(), Some("Bearer new"));
    assert_eq!(next_json(&mut second).await["op"], "subscribe");

    channel.close();
}

#[tokio::test]
async fn test_frames_are_forwarded_in_order() {
    let (listener, url) = listen().await;

    let (channel, mut frames) = SubscriptionChannel::open(
        url,
        ControlMessage::new("subscribe"),
        fast_reconnect(),
        TokenStore::in_memory(),
        &CancellationToken::new(),
    );

    let mut ws = accept(&listener).await;
    let _handshake = next_json(&mut ws).await;

    ws.send(Message::text(r#"{"new_workloads":[{"id":"w1"}]}"#)).await.unwrap();
    ws.send(Message::text(r#"{"deleted_workloads":["w1"]}"#)).await.unwrap();
    ws.send(Message::text("tail")).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(timeout(WAIT, frames.recv()).await.unwrap().unwrap());
    }
    assert_eq!(
        received,
        vec![
            r#"{"new_workloads":[{"id":"w1"}]}"#.to_owned(),
            r#"{"deleted_workloads":["w1"]}"#.to_owned(),
            "tail".to_owned(),
        ]
    );
    assert_eq!(channel.state(), ChannelState::Open);
}

#[tokio::test]
async fn test_binary_frames_are_decoded_as_utf8() {
    let (listener, url) = listen().await;

    let (channel, mut frames) = SubscriptionChannel::open(
        url,
        ControlMessage::new("subscribe"),
        fast_reconnect(),
        TokenStore::in_memory(),
        &CancellationToken::new(),
    );

    let mut ws = accept(&listener).await;
    let _handshake = next_json(&mut ws).await;

    ws.send(Message::binary("{\"node\":\"wörker-ü\"}".as_bytes().to_vec())).await.unwrap();
    ws.send(Message::binary(vec![0xff, 0xfe, 0xfd])).await.unwrap();
    ws.send(Message::binary(b"after".to_vec())).await.unwrap();

    let first = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(first, "{\"node\":\"wörker-ü\"}");
    // The invalid frame is dropped without closing the socket.
    let second = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(second, "after");
    assert_eq!(channel.state(), ChannelState::Open);
}

#[tokio::test]
async fn test_control_messages_follow_the_handshake() {
    let (listener, url) = listen().await;

    let (channel, _frames) = SubscriptionChannel::open(
        url,
        ControlMessage::new("subscribe"),
        fast_reconnect(),
        TokenStore::in_memory(),
        &CancellationToken::new(),
    );
    // Queued before the socket opens; delivered after the handshake.
    channel.send(ControlMessage::new("get_workloads")).unwrap();

    let mut ws = accept(&listener).await;
    assert_eq!(next_json(&mut ws).await["op"], "subscribe");
    assert_eq!(next_json(&mut ws).await["op"], "get_workloads");
}

#[tokio::test]
async fn test_reconnects_and_replays_handshake() {
    let (listener, url) = listen().await;

    let (channel, _frames) = SubscriptionChannel::open(
        url,
        ControlMessage::new("subscribe"),
        fast_reconnect(),
        TokenStore::in_memory(),
        &CancellationToken::new(),
    );

    let mut first = accept(&listener).await;
    let first_id = next_json(&mut first).await["msg_id"].clone();
    first.close(None).await.unwrap();
    drop(first);

    let mut second = accept(&listener).await;
    let replay = next_json(&mut second).await;
    assert_eq!(replay["op"], "subscribe");
    assert_ne!(replay["msg_id"], first_id);

    wait_for_state(&channel, ChannelState::Open).await;
}

#[tokio::test]
async fn test_close_sends_close_frame_once() {
    let (listener, url) = listen().await;

    let (channel, mut frames) = SubscriptionChannel::open(
        url,
        ControlMessage::new("subscribe"),
        fast_reconnect(),
        TokenStore::in_memory(),
        &CancellationToken::new(),
    );

    let mut ws = accept(&listener).await;
    let _handshake = next_json(&mut ws).await;
    wait_for_state(&channel, ChannelState::Open).await;

    assert!(channel.close());
    assert!(!channel.close());

    let msg = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(msg, Message::Close(_)), "expected close frame, got {msg:?}");

    wait_for_state(&channel, ChannelState::Closed).await;
    // The task is gone, so the frame stream ends.
    assert!(timeout(WAIT, frames.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_parent_cancellation_closes_channel() {
    let (listener, url) = listen().await;
    let parent = CancellationToken::new();

    let (channel, _frames) = SubscriptionChannel::open(
        url,
        ControlMessage::new("subscribe"),
        fast_reconnect(),
        TokenStore::in_memory(),
        &parent,
    );

    let mut ws = accept(&listener).await;
    let _handshake = next_json(&mut ws).await;

    parent.cancel();
    wait_for_state(&channel, ChannelState::Closed).await;
    assert!(channel.is_closed());
}
