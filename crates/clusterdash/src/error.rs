//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use clusterdash_config::ConfigError;
use clusterdash_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the cluster dashboard: {reason}")]
    #[diagnostic(
        code(clusterdash::connection_failed),
        help(
            "Check that the dashboard backend is running and reachable.\n\
             Override the address with --server or CLUSTERDASH_SERVER."
        )
    )]
    ConnectionFailed { reason: String },

    #[error("Request timed out after {timeout_ms}ms")]
    #[diagnostic(
        code(clusterdash::timeout),
        help("Increase the deadline with --timeout or check backend responsiveness.")
    )]
    Timeout { timeout_ms: u64 },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Not logged in")]
    #[diagnostic(
        code(clusterdash::not_logged_in),
        help("Run: clusterdash login --username <name>")
    )]
    NotLoggedIn,

    #[error("Login failed: {message}")]
    #[diagnostic(code(clusterdash::auth_failed), help("Check the username and password."))]
    AuthFailed { message: String },

    // ── Server responses ─────────────────────────────────────────────
    #[error("Server rejected the request: {message}")]
    #[diagnostic(code(clusterdash::rejected))]
    Rejected {
        message: String,
        #[help]
        description: Option<String>,
    },

    #[error("Failed to fetch {resource}: {reason}")]
    #[diagnostic(code(clusterdash::fetch_failed))]
    FetchFailed { resource: String, reason: String },

    #[error("API error: {message}")]
    #[diagnostic(code(clusterdash::api_error))]
    Api { message: String },

    // ── Validation / configuration ───────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(clusterdash::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(
        code(clusterdash::config),
        help("Inspect the effective configuration with: clusterdash config show")
    )]
    Config(ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(clusterdash::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render YAML: {0}")]
    #[diagnostic(code(clusterdash::yaml))]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::NotLoggedIn | Self::AuthFailed { .. } => exit_code::AUTH,
            Self::Validation { .. } | Self::Config(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            other => CliError::Config(other),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotAuthenticated => CliError::NotLoggedIn,

            CoreError::Fetch { resource, source } => {
                if source.is_unauthorized() {
                    CliError::NotLoggedIn
                } else if source.is_transient() {
                    CliError::ConnectionFailed {
                        reason: source.to_string(),
                    }
                } else {
                    CliError::FetchFailed {
                        resource,
                        reason: source.to_string(),
                    }
                }
            }

            CoreError::Rejected {
                message,
                description,
            } => CliError::Rejected {
                message,
                description,
            },

            CoreError::ConnectionFailed { reason } => CliError::ConnectionFailed { reason },

            CoreError::Timeout { timeout_ms } => CliError::Timeout { timeout_ms },

            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },

            other @ (CoreError::ResourceClosed { .. } | CoreError::Api { .. } | CoreError::Cancelled) => {
                CliError::Api {
                    message: other.to_string(),
                }
            }
        }
    }
}

/// Login failures read better as "login failed" than as a generic rejection.
pub fn login_error(err: CoreError) -> CliError {
    match err {
        CoreError::Rejected { message, .. } => CliError::AuthFailed { message },
        other => other.into(),
    }
}
