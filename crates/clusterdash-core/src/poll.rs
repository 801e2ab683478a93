// ── Polling resource hook ──
//
// Each `Resource<T>` is backed by exactly one task that owns the
// resource's state. The task gates on the shared `AuthState`, fetches
// once on start (and on every re-authentication), then re-fetches on a
// timer. Fetches run one at a time inside that task, so scheduled ticks
// and manual refreshes can never overlap.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use clusterdash_api::{Error, FetchOptions, RequestExecutor, read_success};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{AuthState, AuthStatus};
use crate::error::CoreError;
use crate::notice::Notifier;

// ── Sources ──────────────────────────────────────────────────────────

/// Something a hook can fetch: one HTTP endpoint, or a scripted stand-in.
pub trait ResourceSource: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    /// Fetch and decode one value. Must return [`Error::Cancelled`] promptly
    /// once `cancel` fires.
    fn fetch(&self, cancel: &CancellationToken) -> impl Future<Output = Result<Self::Output, Error>> + Send;
}

/// Decoder turning a successful response body into a value.
pub type Decoder<T> = fn(&Bytes) -> Result<T, Error>;

/// `GET <url>` through the executor, decoded with a plain function.
pub struct HttpSource<T> {
    executor: RequestExecutor,
    url: Url,
    timeout: Duration,
    cache_bust: bool,
    decode: Decoder<T>,
    _output: PhantomData<fn() -> T>,
}

impl<T> HttpSource<T> {
    pub fn new(executor: RequestExecutor, url: Url, timeout: Duration, decode: Decoder<T>) -> Self {
        Self {
            executor,
            url,
            timeout,
            cache_bust: false,
            decode,
            _output: PhantomData,
        }
    }

    pub fn with_cache_bust(mut self, enabled: bool) -> Self {
        self.cache_bust = enabled;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl<T: Send + Sync + 'static> ResourceSource for HttpSource<T> {
    type Output = T;

    async fn fetch(&self, cancel: &CancellationToken) -> Result<T, Error> {
        let options = FetchOptions::get(self.timeout).with_cache_bust(self.cache_bust);
        let resp = self.executor.execute(self.url.clone(), options, cancel).await?;
        let body = read_success(resp).await?;
        (self.decode)(&body)
    }
}

/// Decode a JSON body.
pub fn decode_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::decode(e, String::from_utf8_lossy(body)))
}

// ── Options ──────────────────────────────────────────────────────────

/// How often a hook re-fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Fixed(Duration),
    /// `pending` until the first successful fetch, `settled` afterwards.
    Adaptive { pending: Duration, settled: Duration },
}

impl Schedule {
    pub fn period(&self, has_data: bool) -> Duration {
        match *self {
            Self::Fixed(period) => period,
            Self::Adaptive { pending, settled } => {
                if has_data {
                    settled
                } else {
                    pending
                }
            }
        }
    }
}

/// Decides whether a failed fetch is retried on the next tick. Consulted
/// only for errors that are neither transient nor a 401.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct PollOptions {
    pub schedule: Schedule,
    pub retry: Option<RetryPredicate>,
}

impl PollOptions {
    pub fn every(period: Duration) -> Self {
        Self {
            schedule: Schedule::Fixed(period),
            retry: None,
        }
    }

    pub fn with_schedule(schedule: Schedule) -> Self {
        Self {
            schedule,
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.retry = Some(Arc::new(retry));
        self
    }

    fn should_retry(&self, error: &Error) -> bool {
        if error.is_transient() {
            return true;
        }
        self.retry.as_ref().is_none_or(|retry| retry(error))
    }
}

impl fmt::Debug for PollOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollOptions")
            .field("schedule", &self.schedule)
            .field("retry", &self.retry.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

// ── State ────────────────────────────────────────────────────────────

/// What a hook currently knows.
///
/// `data` is the most recent successfully decoded value; a failed fetch
/// only replaces `error`.
pub struct ResourceState<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<Arc<Error>>,
    pub is_loading: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> Clone for ResourceState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_loading: self.is_loading,
            updated_at: self.updated_at,
        }
    }
}

impl<T> Default for ResourceState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            updated_at: None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ResourceState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceState")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_loading", &self.is_loading)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

// ── Handle ───────────────────────────────────────────────────────────

type RefreshReply<T> = oneshot::Sender<Result<Arc<T>, CoreError>>;

const REFRESH_QUEUE_SIZE: usize = 16;

/// Shared by every handle; shuts the task down when the last one goes away.
struct Shared<T> {
    name: String,
    cancel: CancellationToken,
    _guard: DropGuard,
    state: watch::Receiver<ResourceState<T>>,
    refresh_tx: mpsc::Sender<RefreshReply<T>>,
}

/// Handle to a polled resource. Cheaply cloneable; the background task
/// stops once every clone has been dropped or [`shutdown`](Self::shutdown)
/// is called.
pub struct Resource<T> {
    shared: Arc<Shared<T>>,
    state: watch::Receiver<ResourceState<T>>,
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            state: self.state.clone(),
        }
    }
}

/// A handle that does not keep the task alive.
pub struct WeakResource<T>(Weak<Shared<T>>);

impl<T> WeakResource<T> {
    pub fn upgrade(&self) -> Option<Resource<T>> {
        let shared = self.0.upgrade()?;
        if shared.cancel.is_cancelled() {
            return None;
        }
        Some(Resource {
            state: shared.state.clone(),
            shared,
        })
    }
}

impl<T: Send + Sync + 'static> Resource<T> {
    /// Spawn the polling task for `source`.
    pub fn spawn<S>(
        name: impl Into<String>,
        source: S,
        auth: AuthState,
        options: PollOptions,
        notifier: Notifier,
        parent: &CancellationToken,
    ) -> Self
    where
        S: ResourceSource<Output = T>,
    {
        let name = name.into();
        let cancel = parent.child_token();
        let (state_tx, state_rx) = watch::channel(ResourceState::default());
        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE_SIZE);

        let poller = Poller {
            name: name.clone(),
            source,
            auth,
            options,
            notifier,
            state: state_tx,
            refresh_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(poller.run());

        Self {
            shared: Arc::new(Shared {
                name,
                cancel: cancel.clone(),
                _guard: cancel.drop_guard(),
                state: state_rx.clone(),
                refresh_tx,
            }),
            state: state_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Snapshot of `{data, error, is_loading}`.
    pub fn state(&self) -> ResourceState<T> {
        self.state.borrow().clone()
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.state.borrow().data.clone()
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.state.borrow().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    /// Fetch out of band, folding the result into the state exactly as a
    /// scheduled tick would. Queued behind a fetch already in flight.
    pub async fn refresh(&self) -> Result<Arc<T>, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .refresh_tx
            .send(reply_tx)
            .await
            .map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| self.closed())?
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> Result<ResourceState<T>, CoreError> {
        self.state.changed().await.map_err(|_| self.closed())?;
        Ok(self.state.borrow_and_update().clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState<T>> {
        self.state.clone()
    }

    pub fn downgrade(&self) -> WeakResource<T> {
        WeakResource(Arc::downgrade(&self.shared))
    }

    /// Stop polling now, even if other handles are still alive.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn closed(&self) -> CoreError {
        CoreError::ResourceClosed {
            resource: self.shared.name.clone(),
        }
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.shared.name)
            .field("shut_down", &self.shared.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ── Background task ──────────────────────────────────────────────────

struct Poller<S: ResourceSource> {
    name: String,
    source: S,
    auth: AuthState,
    options: PollOptions,
    notifier: Notifier,
    state: watch::Sender<ResourceState<S::Output>>,
    refresh_rx: mpsc::Receiver<RefreshReply<S::Output>>,
    cancel: CancellationToken,
}

/// How a fetch ended, from the loop's point of view.
enum Outcome {
    Fetched,
    /// Failed; retry on the next tick.
    Failed,
    /// Failed and the retry predicate declined; wait for a manual refresh.
    Suspended,
    /// 401: the session is gone.
    Deauthenticated,
    Cancelled,
}

enum Gate {
    Open,
    Shutdown,
}

impl<S: ResourceSource> Poller<S> {
    async fn run(mut self) {
        debug!(resource = %self.name, "polling task started");
        let mut auth_rx = self.auth.subscribe();

        'session: loop {
            if let Gate::Shutdown = self.wait_for_auth(&mut auth_rx).await {
                break;
            }

            let (_, outcome) = self.fetch().await;
            let mut suspended = match outcome {
                Outcome::Cancelled => break,
                Outcome::Deauthenticated => continue 'session,
                Outcome::Suspended => true,
                Outcome::Fetched | Outcome::Failed => false,
            };

            let mut period = self.current_period();
            let mut ticker = new_ticker(period);

            loop {
                let outcome = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break 'session,
                    changed = auth_rx.changed() => {
                        if changed.is_err() {
                            break 'session;
                        }
                        if *auth_rx.borrow_and_update() == AuthStatus::Unauthenticated {
                            debug!(resource = %self.name, "session ended, polling paused");
                            continue 'session;
                        }
                        continue;
                    }
                    request = self.refresh_rx.recv() => {
                        let Some(reply) = request else { break 'session };
                        let (result, outcome) = self.fetch().await;
                        if let Err(e) = &result {
                            if !matches!(outcome, Outcome::Cancelled) {
                                self.notifier.error(format!("Failed to refresh {}", self.name), e.to_string());
                            }
                        }
                        let _ = reply.send(result.map_err(|e| CoreError::fetch(&self.name, e)));
                        outcome
                    }
                    _ = ticker.tick(), if !suspended => self.fetch().await.1,
                };

                match outcome {
                    Outcome::Cancelled => break 'session,
                    Outcome::Deauthenticated => continue 'session,
                    Outcome::Suspended => {
                        info!(resource = %self.name, "retry declined, polling suspended until refresh");
                        suspended = true;
                    }
                    Outcome::Fetched | Outcome::Failed => suspended = false,
                }

                let next = self.current_period();
                if next != period {
                    debug!(resource = %self.name, period_ms = u64::try_from(next.as_millis()).unwrap_or(u64::MAX), "poll period changed");
                    period = next;
                    ticker = new_ticker(period);
                }
            }
        }

        debug!(resource = %self.name, "polling task stopped");
    }

    /// Block while unauthenticated. Manual refreshes are answered with
    /// `NotAuthenticated` without touching the network.
    async fn wait_for_auth(&mut self, auth_rx: &mut watch::Receiver<AuthStatus>) -> Gate {
        loop {
            if *auth_rx.borrow_and_update() == AuthStatus::Authenticated {
                return Gate::Open;
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Gate::Shutdown,
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        return Gate::Shutdown;
                    }
                }
                request = self.refresh_rx.recv() => {
                    let Some(reply) = request else { return Gate::Shutdown };
                    let _ = reply.send(Err(CoreError::NotAuthenticated));
                }
            }
        }
    }

    /// One fetch, folded into the state.
    async fn fetch(&mut self) -> (Result<Arc<S::Output>, Arc<Error>>, Outcome) {
        self.state.send_modify(|s| s.is_loading = true);
        let result = self.source.fetch(&self.cancel).await;

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                self.state.send_modify(|s| {
                    s.data = Some(Arc::clone(&value));
                    s.error = None;
                    s.is_loading = false;
                    s.updated_at = Some(Utc::now());
                });
                debug!(resource = %self.name, "fetched");
                (Ok(value), Outcome::Fetched)
            }
            Err(Error::Cancelled) => {
                self.state.send_modify(|s| s.is_loading = false);
                (Err(Arc::new(Error::Cancelled)), Outcome::Cancelled)
            }
            Err(e) => {
                let outcome = if e.is_unauthorized() {
                    self.auth.deauthenticate(&format!("{} returned 401", self.name));
                    Outcome::Deauthenticated
                } else if self.options.should_retry(&e) {
                    Outcome::Failed
                } else {
                    Outcome::Suspended
                };
                warn!(resource = %self.name, error = %e, "fetch failed");

                let e = Arc::new(e);
                self.state.send_modify(|s| {
                    s.error = Some(Arc::clone(&e));
                    s.is_loading = false;
                });
                (Err(e), outcome)
            }
        }
    }

    fn current_period(&self) -> Duration {
        self.options
            .schedule
            .period(self.state.borrow().data.is_some())
    }
}

/// Ticks every `period`, first tick one period from now. A tick missed
/// while a fetch was running is skipped rather than replayed.
fn new_ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_schedule_switches_on_data() {
        let schedule = Schedule::Adaptive {
            pending: Duration::from_millis(250),
            settled: Duration::from_secs(30),
        };
        assert_eq!(schedule.period(false), Duration::from_millis(250));
        assert_eq!(schedule.period(true), Duration::from_secs(30));
        assert_eq!(Schedule::Fixed(Duration::from_secs(5)).period(false), Duration::from_secs(5));
    }

    #[test]
    fn transient_errors_always_retry() {
        let options = PollOptions::every(Duration::from_secs(1)).with_retry(|_| false);
        assert!(options.should_retry(&Error::Timeout { timeout_ms: 1 }));
        assert!(!options.should_retry(&Error::Http {
            status: 500,
            message: String::new(),
        }));

        let default = PollOptions::every(Duration::from_secs(1));
        assert!(default.should_retry(&Error::decode("bad", "{")));
    }

    #[test]
    fn only_client_errors_declined() {
        let options = PollOptions::every(Duration::from_secs(1))
            .with_retry(|e| !matches!(e.status(), Some(400..=499)));
        assert!(!options.should_retry(&Error::Http {
            status: 404,
            message: String::new(),
        }));
        assert!(options.should_retry(&Error::Http {
            status: 502,
            message: String::new(),
        }));
    }
}
