//! CLI flag overrides layered over the file + environment config.

use clusterdash_config::Config;
use clusterdash_core::ClientConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the config and apply global flags on top.
pub fn effective_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let mut config = clusterdash_config::load_config()?;
    apply_overrides(&mut config, global);
    Ok(config)
}

/// Build the runtime `ClientConfig` for commands that talk to the backend.
pub fn client_config(global: &GlobalOpts) -> Result<ClientConfig, CliError> {
    let config = effective_config(global)?;
    Ok(clusterdash_config::to_client_config(&config)?)
}

fn apply_overrides(config: &mut Config, global: &GlobalOpts) {
    if let Some(ref server) = global.server {
        config.server.clone_from(server);
    }
    if let Some(ref base_path) = global.base_path {
        config.base_path.clone_from(base_path);
    }
    if global.insecure {
        config.insecure = true;
    }
    if global.timeout.is_some() {
        config.timeout = global.timeout;
    }
}
