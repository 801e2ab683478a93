//! `get` and `watch` over the polled resource catalog.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use clusterdash_core::{Dashboard, PolledResource, Resource};

use super::require_login;
use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

pub async fn get(dashboard: &Dashboard, resource: PolledResource, global: &GlobalOpts) -> Result<(), CliError> {
    require_login(dashboard)?;
    let value = dashboard.fetch_json(resource).await?;
    output::print_output(&output::render(global.output, &value)?);
    Ok(())
}

pub async fn watch(dashboard: &Dashboard, resource: PolledResource, global: &GlobalOpts) -> Result<(), CliError> {
    require_login(dashboard)?;
    match resource {
        PolledResource::Nodes => follow(dashboard.nodes(), global).await,
        PolledResource::Kernels => follow(dashboard.kernels(), global).await,
        PolledResource::KernelSpecs => follow(dashboard.kernel_specs(), global).await,
        PolledResource::DeploymentMode => follow(dashboard.deployment_mode(), global).await,
        PolledResource::SchedulingPolicy => follow(dashboard.scheduling_policy(), global).await,
        PolledResource::ClusterAge => follow(dashboard.cluster_age(), global).await,
        PolledResource::JupyterAddress => follow(dashboard.jupyter_address(), global).await,
        PolledResource::WorkloadPresets => follow(dashboard.workload_presets(), global).await,
        PolledResource::WorkloadTemplates => follow(dashboard.workload_templates(), global).await,
    }
}

/// Print each fresh value and each new error until Ctrl-C or logout.
async fn follow<T>(mut resource: Resource<T>, global: &GlobalOpts) -> Result<(), CliError>
where
    T: Serialize + Send + Sync + 'static,
{
    let mut printed_at = None;
    let mut last_error = None;

    loop {
        let state = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            state = resource.changed() => state?,
        };

        if let Some(ref error) = state.error {
            if error.is_unauthorized() {
                return Err(CliError::NotLoggedIn);
            }
            if last_error.as_ref().is_none_or(|last| !Arc::ptr_eq(last, error)) {
                warn!(resource = resource.name(), error = %error, "refresh failed");
                last_error = Some(Arc::clone(error));
            }
        }

        if let Some(ref data) = state.data {
            if state.updated_at != printed_at {
                printed_at = state.updated_at;
                output::print_output(&output::render(global.output, data.as_ref())?);
            }
        }
    }
}
