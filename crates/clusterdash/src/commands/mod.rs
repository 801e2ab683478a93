//! Command dispatch: bridges CLI args -> dashboard hooks -> output formatting.

pub mod config_cmd;
pub mod logs;
pub mod resource;
pub mod session;
pub mod workloads;

use clusterdash_core::Dashboard;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a backend-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, dashboard: &Dashboard, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Login(args) => session::login(dashboard, &args).await,
        Command::Logout => session::logout(dashboard),
        Command::Get(args) => resource::get(dashboard, args.resource, global).await,
        Command::Watch(args) => resource::watch(dashboard, args.resource, global).await,
        Command::Workloads(args) => workloads::handle(dashboard, &args, global).await,
        Command::Logs(args) => logs::handle(dashboard, &args).await,
        Command::Config(args) => config_cmd::handle(&args, global),
    }
}

/// Fail fast instead of waiting on a session that will never start.
fn require_login(dashboard: &Dashboard) -> Result<(), CliError> {
    if dashboard.is_authenticated() {
        Ok(())
    } else {
        Err(CliError::NotLoggedIn)
    }
}
