use clusterdash_core::{Dashboard, Workload};

use super::require_login;
use crate::cli::{GlobalOpts, WorkloadsArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(dashboard: &Dashboard, args: &WorkloadsArgs, global: &GlobalOpts) -> Result<(), CliError> {
    require_login(dashboard)?;
    let feed = dashboard.workloads();

    // The resync reply is applied before it resolves, so the snapshot is
    // current once this returns.
    feed.refresh().await?;
    let mut stream = feed.stream();
    print_snapshot(stream.current(), global)?;

    if !args.watch {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            snapshot = stream.changed() => match snapshot {
                Some(snapshot) => print_snapshot(&snapshot, global)?,
                None => return Ok(()),
            },
        }
    }
}

fn print_snapshot(snapshot: &[std::sync::Arc<Workload>], global: &GlobalOpts) -> Result<(), CliError> {
    output::print_output(&output::render(global.output, snapshot)?);
    Ok(())
}
