//! WebSocket subscription channel with auto-reconnect.
//!
//! One background task owns at most one socket at a time. Every time the
//! socket opens, the task sends the subscribe handshake (with a fresh
//! `msg_id`) before anything else, then forwards inbound frames as UTF-8
//! text through an ordered [`mpsc`] channel. Outbound control messages
//! queued with [`SubscriptionChannel::send`] are written while the socket
//! is open.
//!
//! # Example
//!
//! ```rust,ignore
//! use clusterdash_api::websocket::{ControlMessage, ReconnectConfig, SubscriptionChannel};
//! use tokio_util::sync::CancellationToken;
//!
//! let url = url::Url::parse("wss://cluster.example.com/websocket/workload")?;
//! let handshake = ControlMessage::new("subscribe");
//! let (channel, mut frames) =
//!     SubscriptionChannel::open(url, handshake, ReconnectConfig::default(), tokens, &CancellationToken::new());
//!
//! while let Some(frame) = frames.recv().await {
//!     println!("{frame}");
//! }
//!
//! channel.close();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::TokenStore;
use crate::error::Error;

// ── Frame channel capacity ───────────────────────────────────────────

const FRAME_CHANNEL_CAPACITY: usize = 1024;

// ── ControlMessage ───────────────────────────────────────────────────

/// An outbound control frame: `{op, msg_id, ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub op: String,
    pub msg_id: String,

    /// Operation-specific fields (`container`, `follow`, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ControlMessage {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            msg_id: uuid::Uuid::new_v4().to_string(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Same operation and fields under a new `msg_id`.
    pub fn refreshed(&self) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::decode(e, self.op.clone()))
    }
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum consecutive failed attempts before giving up.
    /// `None` retries forever; `Some(0)` never reconnects.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── ChannelState ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Closed,
    Connecting,
    Open,
}

// ── SubscriptionChannel ──────────────────────────────────────────────

/// Handle to a running subscription channel.
///
/// Dropping the handle closes the channel.
#[derive(Debug)]
pub struct SubscriptionChannel {
    outbound: mpsc::UnboundedSender<ControlMessage>,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SubscriptionChannel {
    /// Spawn the channel task and return immediately.
    ///
    /// The first connection attempt happens asynchronously. Frames arrive
    /// on the returned receiver in the order the server sent them.
    /// Every upgrade request carries the token stored in `tokens` at the
    /// time of that attempt, so reconnects pick up a renewed token.
    /// Cancelling `parent` closes the channel too.
    pub fn open(
        url: Url,
        handshake: ControlMessage,
        reconnect: ReconnectConfig,
        tokens: TokenStore,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<String>) {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Closed);
        let cancel = parent.child_token();

        let session = Session {
            url,
            handshake,
            tokens,
            frames: frame_tx,
            outbound: outbound_rx,
            state: state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(channel_loop(session, reconnect));

        let channel = Self {
            outbound: outbound_tx,
            state: state_rx,
            cancel,
            closed: AtomicBool::new(false),
        };
        (channel, frame_rx)
    }

    /// Queue a control message. Written as soon as the socket is open.
    pub fn send(&self, message: ControlMessage) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.outbound.send(message).map_err(|_| Error::ChannelClosed)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Tear the channel down. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!("closing subscription channel");
        self.cancel.cancel();
        true
    }
}

impl Drop for SubscriptionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

struct Session {
    url: Url,
    handshake: ControlMessage,
    tokens: TokenStore,
    frames: mpsc::Sender<String>,
    outbound: mpsc::UnboundedReceiver<ControlMessage>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
}

/// How a single connection ended.
enum Disconnect {
    /// Closed by us, or the frame consumer went away. Do not reconnect.
    Shutdown,
    /// The peer closed the socket or the stream ended.
    Remote,
}

/// Main loop: connect → read → on drop, backoff → reconnect.
async fn channel_loop(mut session: Session, reconnect: ReconnectConfig) {
    let mut attempt: u32 = 0;

    loop {
        let result = connect_and_read(&mut session, &mut attempt).await;
        session.state.send_replace(ChannelState::Closed);

        let delay = match result {
            Ok(Disconnect::Shutdown) => break,
            Ok(Disconnect::Remote) => {
                tracing::info!(url = %session.url, "WebSocket disconnected, reconnecting");
                reconnect.initial_delay
            }
            Err(e) => {
                tracing::warn!(url = %session.url, error = %e, attempt, "WebSocket error");
                calculate_backoff(attempt, &reconnect)
            }
        };

        if let Some(max) = reconnect.max_retries {
            if attempt >= max {
                tracing::error!(
                    url = %session.url,
                    max_retries = max,
                    "WebSocket reconnection limit reached, giving up"
                );
                break;
            }
        }

        tracing::debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "Waiting before reconnect"
        );
        tokio::select! {
            biased;
            () = session.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
    }

    tracing::debug!(url = %session.url, "WebSocket loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one connection, handshake, and pump frames until it drops.
async fn connect_and_read(session: &mut Session, attempt: &mut u32) -> Result<Disconnect, Error> {
    if session.cancel.is_cancelled() {
        return Ok(Disconnect::Shutdown);
    }
    session.state.send_replace(ChannelState::Connecting);
    tracing::info!(url = %session.url, "Connecting to WebSocket");

    let uri: tungstenite::http::Uri = session
        .url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    if let Some(bearer) = session.tokens.bearer() {
        request = request.with_header("Authorization", bearer);
    }

    let connect = tokio_tungstenite::connect_async(request);
    let (ws_stream, _response) = tokio::select! {
        biased;
        () = session.cancel.cancelled() => return Ok(Disconnect::Shutdown),
        result = connect => result.map_err(|e| Error::WebSocketConnect(e.to_string()))?,
    };

    let (mut write, mut read) = ws_stream.split();

    let handshake = session.handshake.refreshed();
    write
        .send(Message::text(handshake.encode()?))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    session.state.send_replace(ChannelState::Open);
    *attempt = 0;
    tracing::info!(url = %session.url, op = %handshake.op, msg_id = %handshake.msg_id, "WebSocket open");

    loop {
        tokio::select! {
            biased;
            () = session.cancel.cancelled() => {
                // Best effort: the peer may already be gone.
                let _ = write.send(Message::Close(None)).await;
                return Ok(Disconnect::Shutdown);
            }
            outbound = session.outbound.recv() => {
                let Some(message) = outbound else {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Disconnect::Shutdown);
                };
                tracing::debug!(op = %message.op, msg_id = %message.msg_id, "sending control message");
                write
                    .send(Message::text(message.encode()?))
                    .await
                    .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => text.to_owned(),
                        Err(e) => {
                            tracing::warn!(error = %e, len = bytes.len(), "Dropping binary frame that is not UTF-8");
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite handles pong replies automatically
                        tracing::trace!("WebSocket ping");
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                        } else {
                            tracing::info!("WebSocket close frame received (no payload)");
                        }
                        return Ok(Disconnect::Remote);
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocketConnect(e.to_string()));
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        return Ok(Disconnect::Remote);
                    }
                    Some(Ok(_)) => continue,
                };

                tracing::trace!(len = text.len(), "WebSocket frame");
                if session.frames.send(text).await.is_err() {
                    tracing::debug!("frame consumer dropped, shutting down channel");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Disconnect::Shutdown);
                }
            }
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple clients.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
