// ── User-visible notifications ──
//
// Surfaced failures are broadcast as short-lived notices. Renderers
// subscribe, show them, and drop them once `is_expired` says so.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::Display;
use tokio::sync::broadcast;
use uuid::Uuid;

const NOTICE_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

impl NoticeLevel {
    /// How long a notice of this level stays on screen.
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::Info => Duration::from_secs(5),
            Self::Warning => Duration::from_secs(10),
            Self::Error => Duration::from_secs(15),
        }
    }
}

/// A dismissible, auto-expiring notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub id: Uuid,
    pub level: NoticeLevel,
    pub title: String,
    pub body: String,
    pub raised_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            title: title.into(),
            body: body.into(),
            raised_at: Utc::now(),
            ttl: level.default_ttl(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.raised_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Broadcasts notices to every subscribed renderer. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Arc<Notice>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CHANNEL_SIZE);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Notice>> {
        self.tx.subscribe()
    }

    pub fn raise(&self, notice: Notice) -> Arc<Notice> {
        let notice = Arc::new(notice);
        tracing::debug!(level = %notice.level, title = %notice.title, "notice raised");
        // No subscribers is fine; nobody is rendering right now.
        let _ = self.tx.send(Arc::clone(&notice));
        notice
    }

    pub fn info(&self, title: impl Into<String>, body: impl Into<String>) -> Arc<Notice> {
        self.raise(Notice::new(NoticeLevel::Info, title, body))
    }

    pub fn warning(&self, title: impl Into<String>, body: impl Into<String>) -> Arc<Notice> {
        self.raise(Notice::new(NoticeLevel::Warning, title, body))
    }

    pub fn error(&self, title: impl Into<String>, body: impl Into<String>) -> Arc<Notice> {
        self.raise(Notice::new(NoticeLevel::Error, title, body))
    }
}
