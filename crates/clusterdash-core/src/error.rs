// ── Core error types ──
//
// User-facing errors from clusterdash-core. Hooks keep the raw transport
// error in their state for inspection; these are what operations return.
// The `From<clusterdash_api::Error>` impl translates transport-layer
// errors into domain-appropriate variants.

use std::sync::Arc;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Session ──────────────────────────────────────────────────────
    #[error("Not authenticated -- log in first")]
    NotAuthenticated,

    #[error("{resource} has been shut down")]
    ResourceClosed { resource: String },

    // ── Fetch / channel failures ─────────────────────────────────────
    #[error("Failed to fetch {resource}: {source}")]
    Fetch {
        resource: String,
        #[source]
        source: Arc<clusterdash_api::Error>,
    },

    #[error("Request rejected by server: {message}")]
    Rejected {
        message: String,
        description: Option<String>,
    },

    #[error("Cannot reach cluster: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Wrap a hook's stored error for a caller.
    pub fn fetch(resource: impl Into<String>, source: Arc<clusterdash_api::Error>) -> Self {
        Self::Fetch {
            resource: resource.into(),
            source,
        }
    }

    /// Returns `true` when logging in again would resolve the error.
    pub fn needs_login(&self) -> bool {
        match self {
            Self::NotAuthenticated => true,
            Self::Fetch { source, .. } => source.is_unauthorized(),
            _ => false,
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<clusterdash_api::Error> for CoreError {
    fn from(err: clusterdash_api::Error) -> Self {
        use clusterdash_api::Error as Api;

        match err {
            Api::Unauthorized => CoreError::NotAuthenticated,
            Api::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            Api::Cancelled => CoreError::Cancelled,
            Api::Network(e) => CoreError::ConnectionFailed {
                reason: e.to_string(),
            },
            Api::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                reason: format!("WebSocket connection failed: {reason}"),
            },
            Api::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            Api::ChannelClosed => CoreError::ConnectionFailed {
                reason: "channel closed".into(),
            },
            Api::Http { status, message } => CoreError::Api {
                message,
                status: Some(status),
            },
            Api::Decode { message, body: _ } => CoreError::Api {
                message: format!("Malformed response: {message}"),
                status: None,
            },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Tls(msg) => CoreError::Config {
                message: format!("TLS error: {msg}"),
            },
            Api::TokenStore(msg) => CoreError::Config {
                message: format!("Token store: {msg}"),
            },
        }
    }
}
