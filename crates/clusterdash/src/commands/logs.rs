use std::io::Write;

use clusterdash_core::Dashboard;

use super::require_login;
use crate::cli::LogsArgs;
use crate::error::CliError;

pub async fn handle(dashboard: &Dashboard, args: &LogsArgs) -> Result<(), CliError> {
    require_login(dashboard)?;
    let mut tail = dashboard.logs(&args.container);

    loop {
        let chunks = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            chunks = tail.next_chunks() => chunks,
        };
        let Some(chunks) = chunks else { break };

        let mut stdout = std::io::stdout().lock();
        for chunk in chunks {
            stdout.write_all(chunk.as_bytes())?;
        }
        stdout.flush()?;
    }

    tail.close();
    Ok(())
}
