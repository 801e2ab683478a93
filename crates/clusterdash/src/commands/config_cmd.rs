use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::config::effective_config;
use crate::error::CliError;
use crate::output;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&clusterdash_config::config_path().display().to_string());
        }
        ConfigCommand::Show => {
            let config = effective_config(global)?;
            output::print_output(clusterdash_config::to_toml(&config)?.trim_end());
        }
    }
    Ok(())
}
