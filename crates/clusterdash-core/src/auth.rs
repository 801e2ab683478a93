// ── Auth-gated fetch policy ──
//
// One shared cell holds the session's authentication status. Hooks read
// it before every poll or subscribe attempt; the only writes are the
// 401 cascade and the external login/logout transitions, all of which go
// through `AuthState::transition`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clusterdash_api::{Error, RequestExecutor, auth as api_auth};
use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::notice::Notifier;

/// Fraction of the remaining token lifetime to wait before renewing.
const RENEW_AT_FRACTION: f64 = 0.9;

/// Delay before retrying a renewal that failed for a transient reason.
const RENEW_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AuthStatus {
    Authenticated,
    Unauthenticated,
}

/// Process-wide authentication status. Cheaply cloneable; clones share
/// the same cell.
#[derive(Debug, Clone)]
pub struct AuthState {
    tx: Arc<watch::Sender<AuthStatus>>,
    notifier: Option<Notifier>,
}

impl AuthState {
    pub fn new(initial: AuthStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            notifier: None,
        }
    }

    /// Raise a "Logged Out" notice whenever a 401 deauthenticates the session.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn status(&self) -> AuthStatus {
        *self.tx.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == AuthStatus::Authenticated
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.tx.subscribe()
    }

    /// External `Unauthenticated → Authenticated` transition after a
    /// successful login. Returns `true` if the status changed.
    pub fn login(&self) -> bool {
        self.transition(AuthStatus::Authenticated)
    }

    /// External transition for an explicit logout. No notice is raised.
    pub fn logout(&self) -> bool {
        self.transition(AuthStatus::Unauthenticated)
    }

    /// Feed a fetch outcome through the policy. A 401 deauthenticates the
    /// whole session; returns `true` if that happened now.
    pub fn observe<T>(&self, result: &Result<T, Error>) -> bool {
        match result {
            Err(e) if e.is_unauthorized() => self.deauthenticate("the server rejected the session token"),
            _ => false,
        }
    }

    /// The 401 cascade. Returns `true` if the session was authenticated.
    pub fn deauthenticate(&self, reason: &str) -> bool {
        let changed = self.transition(AuthStatus::Unauthenticated);
        if changed {
            warn!(reason, "session deauthenticated");
            if let Some(notifier) = &self.notifier {
                notifier.error("Logged Out", format!("You have been logged out: {reason}."));
            }
        }
        changed
    }

    /// Wait until the session is authenticated. Returns `false` if
    /// `cancel` fires first.
    pub async fn authenticated(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            res = rx.wait_for(|s| *s == AuthStatus::Authenticated) => res.is_ok(),
        }
    }

    fn transition(&self, to: AuthStatus) -> bool {
        let changed = self.tx.send_if_modified(|status| {
            if *status == to {
                false
            } else {
                *status = to;
                true
            }
        });
        if changed {
            debug!(status = %to, "auth status changed");
        }
        changed
    }
}

// ── Token renewal ────────────────────────────────────────────────────

/// Keep the bearer token fresh while the session is authenticated.
///
/// Renews at 90% of the token's remaining lifetime. A 401 from the
/// renewal endpoint deauthenticates the session like any other 401.
/// Tokens without an expiry are never renewed.
pub async fn renewal_task(
    auth: AuthState,
    executor: RequestExecutor,
    url: Url,
    cancel: CancellationToken,
) {
    let mut status_rx = auth.subscribe();

    loop {
        if !auth.authenticated(&cancel).await {
            break;
        }
        status_rx.borrow_and_update();

        let wait = executor
            .tokens()
            .get()
            .and_then(|t| t.remaining(Utc::now()))
            .map(|remaining| renewal_delay(remaining.to_std().unwrap_or(Duration::ZERO)));

        let Some(wait) = wait else {
            debug!("token has no expiry, renewal idle until the session changes");
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                res = status_rx.changed() => if res.is_err() { break },
            }
            continue;
        };

        debug!(wait_secs = wait.as_secs(), "token renewal scheduled");
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            res = status_rx.changed() => {
                if res.is_err() { break }
                continue;
            }
            () = tokio::time::sleep(wait) => {}
        }

        let result = api_auth::renew(&executor, url.clone(), &cancel).await;
        if auth.observe(&result) {
            continue;
        }
        match result {
            Ok(token) => info!(expire = ?token.expire, "session token renewed"),
            Err(Error::Cancelled) => break,
            Err(e) => {
                warn!(error = %e, "token renewal failed, will retry");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(RENEW_RETRY_DELAY) => {}
                }
            }
        }
    }

    debug!("token renewal task exiting");
}

fn renewal_delay(remaining: Duration) -> Duration {
    remaining.mul_f64(RENEW_AT_FRACTION)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notice::NoticeLevel;

    #[test]
    fn unauthorized_result_deauthenticates_once() {
        let notifier = Notifier::new();
        let mut notices = notifier.subscribe();
        let auth = AuthState::new(AuthStatus::Authenticated).with_notifier(notifier);

        let failed: Result<(), Error> = Err(Error::Unauthorized);
        assert!(auth.observe(&failed));
        assert!(!auth.is_authenticated());
        // Already unauthenticated: no second transition, no second notice.
        assert!(!auth.observe(&failed));

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.title, "Logged Out");
        assert!(notices.try_recv().is_err());
    }

    #[test]
    fn other_failures_leave_the_session_alone() {
        let auth = AuthState::new(AuthStatus::Authenticated);
        let timeout: Result<(), Error> = Err(Error::Timeout { timeout_ms: 10 });
        let server: Result<(), Error> = Err(Error::Http {
            status: 500,
            message: String::new(),
        });
        assert!(!auth.observe(&timeout));
        assert!(!auth.observe(&server));
        assert!(!auth.observe(&Ok::<_, Error>(())));
        assert!(auth.is_authenticated());
    }

    #[test]
    fn clones_share_one_cell() {
        let auth = AuthState::new(AuthStatus::Unauthenticated);
        let reader = auth.clone();
        let rx = reader.subscribe();

        assert!(auth.login());
        assert!(!auth.login());
        assert!(reader.is_authenticated());
        assert_eq!(*rx.borrow(), AuthStatus::Authenticated);

        assert!(reader.logout());
        assert_eq!(auth.status(), AuthStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn authenticated_waits_for_login() {
        let auth = AuthState::new(AuthStatus::Unauthenticated);
        let cancel = CancellationToken::new();

        let waiter = {
            let auth = auth.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { auth.authenticated(&cancel).await })
        };
        tokio::task::yield_now().await;
        auth.login();
        assert!(waiter.await.unwrap());

        auth.logout();
        cancel.cancel();
        assert!(!auth.authenticated(&cancel).await);
    }

    #[test]
    fn renewal_happens_at_ninety_percent() {
        assert_eq!(renewal_delay(Duration::from_secs(100)), Duration::from_secs(90));
        assert_eq!(renewal_delay(Duration::ZERO), Duration::ZERO);
    }
}
