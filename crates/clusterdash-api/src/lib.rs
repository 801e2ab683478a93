// clusterdash-api: transport layer for the cluster dashboard backend.
//
// Everything here is entity-agnostic. Requests come back as raw
// responses, WebSocket frames come back as UTF-8 text; interpreting
// either is the job of `clusterdash-core`.

pub mod auth;
pub mod error;
pub mod executor;
pub mod paths;
pub mod transport;
pub mod websocket;

pub use auth::{AuthToken, TokenStore};
pub use error::Error;
pub use executor::{
    DEFAULT_TIMEOUT, FetchAttempt, FetchOptions, FetchResponse, RequestExecutor, read_success,
};
pub use paths::{Endpoints, join_paths};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{ChannelState, ControlMessage, ReconnectConfig, SubscriptionChannel};
