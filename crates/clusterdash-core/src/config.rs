// ── Runtime client configuration ──
//
// These types describe *how* to talk to a cluster dashboard backend.
// They never touch disk; the CLI builds a `ClientConfig` (usually via
// clusterdash-config) and hands it to `Dashboard::new`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clusterdash_api::{ReconnectConfig, TlsMode};
use url::Url;

use crate::poll::Schedule;
use crate::resources::PolledResource;

/// Default number of log chunks a `LogTail` keeps.
pub const DEFAULT_LOG_HISTORY: usize = 1000;

/// Configuration for one dashboard backend.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server origin (e.g., `https://cluster.example.com`).
    pub server: Url,
    /// Deployment prefix when served behind a reverse proxy.
    pub base_path: String,
    pub tls: TlsMode,
    /// Deadline for every polled request, overriding the catalog default.
    pub timeout: Option<Duration>,
    /// Per-resource schedule overrides.
    pub intervals: HashMap<PolledResource, Schedule>,
    pub reconnect: ReconnectConfig,
    pub log_history: usize,
    /// Append `randNumber` to every polled request.
    pub cache_bust: bool,
    /// Where the bearer token is persisted. `None` keeps it in memory.
    pub token_file: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(server: Url) -> Self {
        Self {
            server,
            base_path: "/".into(),
            tls: TlsMode::default(),
            timeout: None,
            intervals: HashMap::new(),
            reconnect: ReconnectConfig::default(),
            log_history: DEFAULT_LOG_HISTORY,
            cache_bust: false,
            token_file: None,
        }
    }

    /// Effective schedule for a resource: override, else catalog default.
    pub fn schedule(&self, resource: PolledResource) -> Schedule {
        self.intervals
            .get(&resource)
            .copied()
            .unwrap_or_else(|| resource.default_schedule())
    }

    pub fn timeout(&self, resource: PolledResource) -> Duration {
        self.timeout.unwrap_or_else(|| resource.default_timeout())
    }
}
