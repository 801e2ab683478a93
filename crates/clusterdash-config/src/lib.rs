//! Configuration for the clusterdash CLI.
//!
//! A TOML file plus `CLUSTERDASH_*` environment variables, validated and
//! translated to `clusterdash_core::ClientConfig`. The CLI layers its
//! global flags on top of the result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use clusterdash_core::{ClientConfig, PolledResource, ReconnectConfig, Schedule, TlsMode};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Dashboard origin (e.g., "https://cluster.example.com").
    pub server: String,

    /// Deployment prefix when served behind a reverse proxy.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Accept self-signed certificates.
    #[serde(default)]
    pub insecure: bool,

    /// Path to a custom CA certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// Request deadline in seconds, applied to every polled resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub cache_bust: bool,

    #[serde(default = "default_log_history")]
    pub log_history: usize,

    /// Token file. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,

    /// Poll interval overrides in seconds, keyed by resource name.
    #[serde(default)]
    pub intervals: BTreeMap<String, f64>,

    #[serde(default)]
    pub reconnect: Reconnect,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            base_path: default_base_path(),
            insecure: false,
            ca_cert: None,
            timeout: None,
            cache_bust: false,
            log_history: default_log_history(),
            token_file: None,
            intervals: BTreeMap::new(),
            reconnect: Reconnect::default(),
        }
    }
}

/// WebSocket reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reconnect {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Give up after this many consecutive failures. Unset retries forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Default for Reconnect {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: None,
        }
    }
}

fn default_server() -> String {
    "http://localhost:8000".into()
}
fn default_base_path() -> String {
    "/".into()
}
fn default_log_history() -> usize {
    clusterdash_core::config::DEFAULT_LOG_HISTORY
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "clusterdash", "clusterdash")
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("clusterdash");
    p
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || dirs_fallback().join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Where the bearer token lives unless `token_file` says otherwise.
pub fn default_token_path() -> PathBuf {
    project_dirs().map_or_else(
        || dirs_fallback().join("token.json"),
        |dirs| dirs.data_dir().join("token.json"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

/// Defaults, then the TOML file at `path`, then the environment.
///
/// Nested keys use a double underscore:
/// `CLUSTERDASH_RECONNECT__MAX_RETRIES=5`.
fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("CLUSTERDASH_").split("__"))
}

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = figment(path).extract()?;
    Ok(config)
}

/// Render a config the way it would be written to disk.
pub fn to_toml(config: &Config) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}

// ── Translation ─────────────────────────────────────────────────────

/// Validate a `Config` and build the runtime `ClientConfig`.
pub fn to_client_config(config: &Config) -> Result<ClientConfig, ConfigError> {
    let server: Url = config
        .server
        .parse()
        .map_err(|_| ConfigError::validation("server", format!("invalid URL: {}", config.server)))?;
    if !matches!(server.scheme(), "http" | "https") {
        return Err(ConfigError::validation(
            "server",
            format!("expected an http or https URL, got '{}'", server.scheme()),
        ));
    }

    let tls = if config.insecure {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = config.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };

    let timeout = match config.timeout {
        Some(0) => return Err(ConfigError::validation("timeout", "must be at least 1 second")),
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };

    if config.log_history == 0 {
        return Err(ConfigError::validation("log_history", "must be at least 1"));
    }

    let mut client = ClientConfig::new(server);
    client.base_path = normalize_base_path(&config.base_path);
    client.tls = tls;
    client.timeout = timeout;
    client.cache_bust = config.cache_bust;
    client.log_history = config.log_history;
    client.token_file = Some(config.token_file.clone().unwrap_or_else(default_token_path));
    client.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(config.reconnect.initial_delay_ms),
        max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
        max_retries: config.reconnect.max_retries,
    };

    for (name, secs) in &config.intervals {
        let field = format!("intervals.{name}");
        let resource = PolledResource::from_str(name)
            .map_err(|_| ConfigError::validation(&field, "unknown resource"))?;
        let period = Duration::try_from_secs_f64(*secs)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ConfigError::validation(&field, "must be a positive number of seconds"))?;
        client.intervals.insert(resource, Schedule::Fixed(period));
    }

    Ok(client)
}

/// `"dash"`, `"/dash"`, and `"/dash/"` all mean the same prefix.
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".into()
    } else {
        format!("/{trimmed}/")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server, "http://localhost:8000");
        assert_eq!(config.base_path, "/");
        assert_eq!(config.log_history, 1000);
        assert_eq!(config.reconnect, Reconnect::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
            server = "https://cluster.example.com"
            base_path = "dash"
            timeout = 4
            cache_bust = true

            [intervals]
            kernels = 2.5
            cluster-age = 60

            [reconnect]
            max_retries = 3
            "#,
        );
        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.timeout, Some(4));
        assert_eq!(config.reconnect.max_retries, Some(3));
        assert_eq!(config.reconnect.initial_delay_ms, 1_000);

        let client = to_client_config(&config).unwrap();
        assert_eq!(client.server.as_str(), "https://cluster.example.com/");
        assert_eq!(client.base_path, "/dash/");
        assert_eq!(client.tls, TlsMode::System);
        assert!(client.cache_bust);
        assert_eq!(client.timeout(PolledResource::Nodes), Duration::from_secs(4));
        assert_eq!(
            client.schedule(PolledResource::Kernels),
            Schedule::Fixed(Duration::from_millis(2_500))
        );
        assert_eq!(
            client.schedule(PolledResource::ClusterAge),
            Schedule::Fixed(Duration::from_secs(60))
        );
        assert_eq!(client.reconnect.max_retries, Some(3));
    }

    #[test]
    fn insecure_wins_over_custom_ca() {
        let config = Config {
            insecure: true,
            ca_cert: Some(PathBuf::from("/etc/ca.pem")),
            ..Config::default()
        };
        assert_eq!(to_client_config(&config).unwrap().tls, TlsMode::DangerAcceptInvalid);

        let config = Config {
            ca_cert: Some(PathBuf::from("/etc/ca.pem")),
            ..Config::default()
        };
        assert_eq!(
            to_client_config(&config).unwrap().tls,
            TlsMode::CustomCa(PathBuf::from("/etc/ca.pem"))
        );
    }

    #[test]
    fn unknown_interval_is_rejected() {
        let mut config = Config::default();
        config.intervals.insert("gpus".into(), 5.0);
        let err = to_client_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "intervals.gpus"));

        let mut config = Config::default();
        config.intervals.insert("nodes".into(), 0.0);
        assert!(to_client_config(&config).is_err());
    }

    #[test]
    fn bad_server_is_rejected() {
        let config = Config {
            server: "ftp://cluster".into(),
            ..Config::default()
        };
        assert!(matches!(
            to_client_config(&config),
            Err(ConfigError::Validation { ref field, .. }) if field == "server"
        ));
    }

    #[test]
    fn explicit_token_file_is_kept() {
        let config = Config {
            token_file: Some(PathBuf::from("/tmp/token.json")),
            ..Config::default()
        };
        let client = to_client_config(&config).unwrap();
        assert_eq!(client.token_file, Some(PathBuf::from("/tmp/token.json")));
    }

    #[test]
    fn base_path_is_normalized() {
        assert_eq!(normalize_base_path(""), "/");
        assert_eq!(normalize_base_path("/"), "/");
        assert_eq!(normalize_base_path("dash"), "/dash/");
        assert_eq!(normalize_base_path("/dash/"), "/dash/");
    }

    #[test]
    fn rendered_toml_loads_back() {
        let mut config = Config::default();
        config.intervals.insert("nodes".into(), 30.0);
        let file = write_config(&to_toml(&config).unwrap());
        assert_eq!(load_config_from(file.path()).unwrap(), config);
    }
}
