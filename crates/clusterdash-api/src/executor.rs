// Request Executor
//
// Wraps a single HTTP request with a deadline, a cancellation token, and
// bearer-token injection. The deadline covers the whole exchange, body
// included. Status codes are not inspected here and bodies are not
// parsed; callers decide what a response means.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};
use url::Url;

use crate::auth::TokenStore;
use crate::error::Error;
use crate::transport::TransportConfig;

/// Default per-attempt deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shape of a single request: method, headers, body, deadline.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    /// Attach `Authorization: Bearer <token>` when a token is stored.
    pub authorize: bool,
    /// Append a random `randNumber` query parameter to defeat caches.
    pub cache_bust: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
            authorize: true,
            cache_bust: false,
        }
    }
}

impl FetchOptions {
    pub fn get(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// POST with a JSON-encoded body.
    pub fn post_json(body: &impl Serialize, timeout: Duration) -> Result<Self, Error> {
        let encoded = serde_json::to_vec(body)
            .map_err(|e| Error::decode(format!("failed to encode request body: {e}"), ""))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            method: Method::POST,
            headers,
            body: Some(Bytes::from(encoded)),
            timeout,
            ..Self::default()
        })
    }

    pub fn with_cache_bust(mut self, enabled: bool) -> Self {
        self.cache_bust = enabled;
        self
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// One in-flight request: target, deadline, and its own cancellation handle.
///
/// Created per invocation of [`RequestExecutor::execute`] and never shared.
/// The token is a child of the caller's token, so tearing down the caller
/// cancels the attempt while cancelling the attempt touches nothing else.
#[derive(Debug)]
pub struct FetchAttempt {
    pub url: Url,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

impl FetchAttempt {
    pub fn new(url: Url, timeout: Duration, parent: &CancellationToken) -> Self {
        let started_at = Instant::now();
        Self {
            url,
            deadline: started_at + timeout,
            cancel: parent.child_token(),
            started_at,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Issues deadline-bound, cancellable, authorized requests.
///
/// Cheaply cloneable; clones share the HTTP connection pool and token store.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    http: reqwest::Client,
    tokens: TokenStore,
}

impl RequestExecutor {
    pub fn new(http: reqwest::Client, tokens: TokenStore) -> Self {
        Self { http, tokens }
    }

    pub fn from_transport(transport: &TransportConfig, tokens: TokenStore) -> Result<Self, Error> {
        Ok(Self::new(transport.build_client()?, tokens))
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Issue one request and wait for its response headers.
    ///
    /// Fails with [`Error::Timeout`] if the deadline lapses first,
    /// [`Error::Cancelled`] if `cancel` fires first, and
    /// [`Error::Network`] if the transport rejects the request. Any status,
    /// including 401, comes back as `Ok`. The returned response keeps the
    /// same deadline and token for reading its body.
    pub async fn execute(
        &self,
        url: Url,
        options: FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, Error> {
        let attempt = FetchAttempt::new(url, options.timeout, cancel);
        // Released on every exit path, including when this future is dropped.
        let release = attempt.cancel.clone().drop_guard();
        let timeout_ms = options.timeout_ms();

        let request = self.build_request(&attempt, options);
        debug!(url = %attempt.url, timeout_ms, "issuing request");

        let result = tokio::select! {
            biased;
            () = attempt.cancel.cancelled() => {
                trace!(url = %attempt.url, "request cancelled");
                Err(Error::Cancelled)
            }
            () = tokio::time::sleep_until(attempt.deadline) => {
                warn!(url = %attempt.url, timeout_ms, "request timed out");
                Err(Error::Timeout { timeout_ms })
            }
            result = request.send() => result.map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout { timeout_ms }
                } else {
                    warn!(url = %attempt.url, error = %e, "request failed before a response");
                    Error::Network(e)
                }
            }),
        };
        let inner = result?;

        trace!(
            url = %attempt.url,
            status = inner.status().as_u16(),
            elapsed_ms = u64::try_from(attempt.elapsed().as_millis()).unwrap_or(u64::MAX),
            "response received"
        );
        Ok(FetchResponse {
            inner,
            attempt,
            timeout_ms,
            _release: release,
        })
    }

    fn build_request(&self, attempt: &FetchAttempt, options: FetchOptions) -> reqwest::RequestBuilder {
        let mut url = attempt.url.clone();
        if options.cache_bust {
            let nonce = uuid::Uuid::new_v4().as_u128() % 1_000_000_000;
            url.query_pairs_mut()
                .append_pair("randNumber", &nonce.to_string());
        }

        let mut builder = self.http.request(options.method, url).headers(options.headers);
        if options.authorize {
            if let Some(bearer) = self.tokens.bearer() {
                builder = builder.header(AUTHORIZATION, bearer);
            }
        }
        if let Some(body) = options.body {
            builder = builder.body(body);
        }
        builder
    }
}

/// A response whose headers have arrived.
///
/// Still bound to its [`FetchAttempt`]: the body is read under the same
/// deadline and cancellation token, and dropping the response releases
/// the attempt.
#[derive(Debug)]
pub struct FetchResponse {
    inner: Response,
    attempt: FetchAttempt,
    timeout_ms: u64,
    _release: DropGuard,
}

impl FetchResponse {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn url(&self) -> &Url {
        &self.attempt.url
    }

    /// Read the whole body before the attempt's deadline.
    pub async fn bytes(self) -> Result<Bytes, Error> {
        let Self {
            inner,
            attempt,
            timeout_ms,
            _release,
        } = self;

        tokio::select! {
            biased;
            () = attempt.cancel.cancelled() => {
                trace!(url = %attempt.url, "body read cancelled");
                Err(Error::Cancelled)
            }
            () = tokio::time::sleep_until(attempt.deadline) => {
                warn!(url = %attempt.url, timeout_ms, "response body timed out");
                Err(Error::Timeout { timeout_ms })
            }
            result = inner.bytes() => result.map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout { timeout_ms }
                } else {
                    Error::Network(e)
                }
            }),
        }
    }
}

/// Check the status of a response and read its body.
///
/// 401 becomes [`Error::Unauthorized`]; any other non-2xx status becomes
/// [`Error::Http`] with a preview of the body. Timeouts and cancellation
/// while reading the body are reported as such.
pub async fn read_success(resp: FetchResponse) -> Result<Bytes, Error> {
    let status = resp.status();
    if status.is_success() {
        return resp.bytes().await;
    }

    let body = match resp.bytes().await {
        Ok(body) => body,
        Err(e @ (Error::Cancelled | Error::Timeout { .. })) => return Err(e),
        Err(_) => Bytes::new(),
    };
    Err(Error::from_status(status, &String::from_utf8_lossy(&body)))
}
