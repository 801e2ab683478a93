// Bearer-token storage and the login / token-renewal calls.
//
// The token lives in memory and, optionally, in a small JSON file so it
// survives restarts. Every executor request reads it to build the
// `Authorization: Bearer <token>` header.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::Error;
use crate::executor::{FetchOptions, RequestExecutor, read_success};

/// Deadline for login and renewal requests.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// A bearer token and, when the server reported one, its expiry.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: SecretString,
    pub expire: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>, expire: Option<DateTime<Utc>>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expire,
        }
    }

    /// Time left before expiry, `None` if the server gave no expiry.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expire.map(|e| e - now)
    }
}

/// On-disk shape of a stored token.
#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    #[serde(default)]
    expire: Option<DateTime<Utc>>,
}

/// Process-wide token storage shared by every executor clone.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    current: Arc<RwLock<Option<AuthToken>>>,
    path: Option<Arc<PathBuf>>,
}

impl TokenStore {
    /// A store that forgets the token when the process exits.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A store backed by `path`. An existing file is loaded immediately;
    /// a missing one simply means "no token yet".
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let loaded = load_token_file(&path)?;
        if loaded.is_some() {
            debug!(path = %path.display(), "loaded stored token");
        }
        Ok(Self {
            current: Arc::new(RwLock::new(loaded)),
            path: Some(Arc::new(path)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    pub fn get(&self) -> Option<AuthToken> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// `Authorization` header value, if a token is stored.
    pub fn bearer(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| format!("Bearer {}", t.token.expose_secret()))
    }

    pub fn set(&self, token: AuthToken) -> Result<(), Error> {
        if let Some(path) = &self.path {
            write_token_file(path, &token)?;
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), Error> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
        if let Some(path) = &self.path {
            match std::fs::remove_file(path.as_path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::TokenStore(format!("{}: {e}", path.display()))),
            }
        }
        Ok(())
    }
}

fn load_token_file(path: &Path) -> Result<Option<AuthToken>, Error> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::TokenStore(format!("{}: {e}", path.display()))),
    };
    let stored: StoredToken = serde_json::from_str(&raw)
        .map_err(|e| Error::TokenStore(format!("{}: {e}", path.display())))?;
    Ok(Some(AuthToken::new(stored.token, stored.expire)))
}

fn write_token_file(path: &Path, token: &AuthToken) -> Result<(), Error> {
    let stored = StoredToken {
        token: token.token.expose_secret().to_owned(),
        expire: token.expire,
    };
    let encoded = serde_json::to_string(&stored)
        .map_err(|e| Error::TokenStore(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::TokenStore(format!("{}: {e}", parent.display())))?;
    }
    std::fs::write(path, encoded).map_err(|e| Error::TokenStore(format!("{}: {e}", path.display())))
}

// ── Login / renewal ──────────────────────────────────────────────────

/// Expiry as sent by the server: RFC 3339 text or Unix milliseconds.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expiry {
    Millis(i64),
    Text(String),
}

impl Expiry {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            Self::Text(text) => text
                .parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .or_else(|| {
                    DateTime::parse_from_rfc3339(text)
                        .ok()
                        .map(|d| d.with_timezone(&Utc))
                }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expire: Option<Expiry>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RenewRequest<'a> {
    token: &'a str,
}

/// `POST <url> {username, password}`; on success the returned token is
/// stored in the executor's [`TokenStore`].
pub async fn login(
    executor: &RequestExecutor,
    url: Url,
    username: &str,
    password: &SecretString,
    cancel: &CancellationToken,
) -> Result<AuthToken, Error> {
    let body = LoginRequest {
        username,
        password: password.expose_secret(),
    };
    let mut options = FetchOptions::post_json(&body, AUTH_TIMEOUT)?;
    options.authorize = false;

    let token = request_token(executor, url, options, cancel).await?;
    info!(username, "logged in");
    Ok(token)
}

/// `POST <url> {token}` with the current bearer token; the renewed token
/// replaces the stored one.
pub async fn renew(
    executor: &RequestExecutor,
    url: Url,
    cancel: &CancellationToken,
) -> Result<AuthToken, Error> {
    let current = executor.tokens().get().ok_or(Error::Unauthorized)?;
    let body = RenewRequest {
        token: current.token.expose_secret(),
    };
    let options = FetchOptions::post_json(&body, AUTH_TIMEOUT)?;

    let token = request_token(executor, url, options, cancel).await?;
    debug!(expire = ?token.expire, "token renewed");
    Ok(token)
}

async fn request_token(
    executor: &RequestExecutor,
    url: Url,
    options: FetchOptions,
    cancel: &CancellationToken,
) -> Result<AuthToken, Error> {
    let resp = executor.execute(url, options, cancel).await?;
    let body = read_success(resp).await?;
    let parsed: TokenResponse = serde_json::from_slice(&body)
        .map_err(|e| Error::decode(e, String::from_utf8_lossy(&body)))?;

    let token = AuthToken::new(parsed.token, parsed.expire.as_ref().and_then(Expiry::to_datetime));
    executor.tokens().set(token.clone())?;
    Ok(token)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bearer_reflects_stored_token() {
        let store = TokenStore::in_memory();
        assert!(store.bearer().is_none());

        store.set(AuthToken::new("abc", None)).unwrap();
        assert_eq!(store.bearer().as_deref(), Some("Bearer abc"));

        store.clear().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn persistent_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("token.json");

        let store = TokenStore::persistent(&path).unwrap();
        assert!(store.is_empty());
        let expire = Utc.timestamp_millis_opt(1_900_000_000_000).single();
        store.set(AuthToken::new("persisted", expire)).unwrap();

        let reopened = TokenStore::persistent(&path).unwrap();
        let token = reopened.get().unwrap();
        assert_eq!(token.token.expose_secret(), "persisted");
        assert_eq!(token.expire, expire);

        reopened.clear().unwrap();
        assert!(!path.exists());
        // Clearing twice is fine.
        reopened.clear().unwrap();
    }

    #[test]
    fn corrupt_token_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(TokenStore::persistent(&path), Err(Error::TokenStore(_))));
    }

    #[test]
    fn expiry_accepts_millis_and_rfc3339() {
        let millis = Expiry::Millis(1_700_000_000_000).to_datetime().unwrap();
        assert_eq!(millis.timestamp(), 1_700_000_000);

        let text = Expiry::Text("2026-01-01T00:00:00Z".into()).to_datetime().unwrap();
        assert_eq!(text.timestamp(), 1_767_225_600);

        let numeric_text = Expiry::Text("1700000000000".into()).to_datetime().unwrap();
        assert_eq!(numeric_text, millis);

        assert!(Expiry::Text("soon".into()).to_datetime().is_none());
    }
}
