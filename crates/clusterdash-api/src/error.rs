use thiserror::Error;

/// Top-level error type for the `clusterdash-api` crate.
///
/// Every failure a request or a channel can produce is one of these
/// variants, returned as a value and never panicked past the transport
/// boundary. `clusterdash-core` decides what each one means for a hook.
#[derive(Debug, Error)]
pub enum Error {
    // ── Request lifecycle ───────────────────────────────────────────
    /// The attempt's deadline lapsed before a response arrived.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The owner of the attempt cancelled it (hook teardown).
    #[error("Request cancelled")]
    Cancelled,

    /// Transport-level failure before any response (DNS, refused, reset).
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    // ── HTTP status ─────────────────────────────────────────────────
    /// The server answered 401. Terminal for the current polling cycle.
    #[error("Unauthorized (HTTP 401)")]
    Unauthorized,

    /// Any other non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// Body or frame could not be decoded, with the raw payload for debugging.
    #[error("Decode error: {message}")]
    Decode { message: String, body: String },

    // ── Configuration ───────────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Token file could not be read or written.
    #[error("Token store error: {0}")]
    TokenStore(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed by the peer.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The channel has been torn down; nothing more can be sent on it.
    #[error("Channel closed")]
    ChannelClosed,
}

impl Error {
    /// Classify a non-2xx status. 401 is always [`Error::Unauthorized`].
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Self::Unauthorized;
        }
        let reason = status.canonical_reason().unwrap_or("");
        let preview = body.trim();
        let message = if preview.is_empty() {
            reason.to_owned()
        } else {
            let end = preview
                .char_indices()
                .nth(200)
                .map_or(preview.len(), |(i, _)| i);
            format!("{reason} {}", &preview[..end]).trim().to_owned()
        };
        Self::Http {
            status: status.as_u16(),
            message,
        }
    }

    /// Build a decode error, keeping the offending payload.
    pub fn decode(message: impl std::fmt::Display, body: impl Into<String>) -> Self {
        Self::Decode {
            message: message.to_string(),
            body: body.into(),
        }
    }

    /// Returns `true` for a 401 response.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// Returns `true` if the failure happened before any response and the
    /// next scheduled attempt may well succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Network(_) | Self::WebSocketConnect(_)
        )
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(401),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
