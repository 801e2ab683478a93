//! Clap derive structures for the `clusterdash` CLI.

use std::str::FromStr;

use clap::{Args, Parser, Subcommand, ValueEnum};
use strum::IntoEnumIterator;

use clusterdash_core::PolledResource;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// clusterdash -- inspect a distributed notebook cluster from the terminal
#[derive(Debug, Parser)]
#[command(
    name = "clusterdash",
    version,
    about = "Inspect a distributed notebook cluster from the command line",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Dashboard origin (overrides the config file)
    #[arg(long, short = 's', global = true)]
    pub server: Option<String>,

    /// Deployment prefix when served behind a reverse proxy
    #[arg(long, global = true)]
    pub base_path: Option<String>,

    /// Output format
    #[arg(long, short = 'o', env = "CLUSTERDASH_OUTPUT", default_value = "json", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', global = true)]
    pub insecure: bool,

    /// Request timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Log in and store the session token
    Login(LoginArgs),

    /// Forget the stored session token
    Logout,

    /// Fetch a resource once and print it
    Get(ResourceArgs),

    /// Poll a resource and print every change until interrupted
    Watch(ResourceArgs),

    /// Print the reconciled workload list
    #[command(alias = "wl")]
    Workloads(WorkloadsArgs),

    /// Follow a container's log output
    Logs(LogsArgs),

    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    #[arg(long, short = 'u', env = "CLUSTERDASH_USERNAME")]
    pub username: String,

    /// Read the password from this environment variable instead of prompting
    #[arg(long, value_name = "VAR")]
    pub password_env: Option<String>,
}

#[derive(Debug, Args)]
pub struct ResourceArgs {
    /// Resource name
    #[arg(value_parser = parse_resource)]
    pub resource: PolledResource,
}

#[derive(Debug, Args)]
pub struct WorkloadsArgs {
    /// Keep printing the list as updates arrive
    #[arg(long, short = 'w')]
    pub watch: bool,
}

#[derive(Debug, Args)]
pub struct LogsArgs {
    /// Container ID
    pub container: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,
    /// Print the effective configuration as TOML
    Show,
}

fn parse_resource(raw: &str) -> Result<PolledResource, String> {
    PolledResource::from_str(raw).map_err(|_| {
        let known: Vec<String> = PolledResource::iter().map(|r| r.to_string()).collect();
        format!("unknown resource '{raw}' (expected one of: {})", known.join(", "))
    })
}
