// ── Resource catalog ──
//
// Every HTTP resource the dashboard polls, with its path relative to
// the base path and its default schedule and deadline.

use std::time::Duration;

use clusterdash_api::DEFAULT_TIMEOUT;
use strum::{Display, EnumIter, EnumString};

use crate::poll::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum PolledResource {
    Nodes,
    Kernels,
    KernelSpecs,
    DeploymentMode,
    SchedulingPolicy,
    ClusterAge,
    JupyterAddress,
    WorkloadPresets,
    WorkloadTemplates,
}

/// How a resource's response body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Json,
    Text,
}

impl PolledResource {
    pub fn path(self) -> &'static str {
        match self {
            Self::Nodes => "api/nodes",
            Self::Kernels => "api/get-kernels",
            Self::KernelSpecs => "jupyter/api/kernelspecs",
            Self::DeploymentMode => "api/deployment-mode",
            Self::SchedulingPolicy => "api/scheduling-policy",
            Self::ClusterAge => "api/cluster-age",
            Self::JupyterAddress => "jupyter-address",
            Self::WorkloadPresets => "api/workload-presets",
            Self::WorkloadTemplates => "api/workload-templates",
        }
    }

    pub fn default_schedule(self) -> Schedule {
        match self {
            Self::Kernels => Schedule::Fixed(Duration::from_secs(5)),
            Self::DeploymentMode | Self::SchedulingPolicy | Self::WorkloadPresets | Self::WorkloadTemplates => {
                Schedule::Fixed(Duration::from_secs(120))
            }
            // Poll fast until the cluster reports a valid start time.
            Self::ClusterAge => Schedule::Adaptive {
                pending: Duration::from_millis(250),
                settled: Duration::from_secs(30),
            },
            Self::Nodes | Self::KernelSpecs | Self::JupyterAddress => Schedule::Fixed(Duration::from_secs(600)),
        }
    }

    pub fn default_timeout(self) -> Duration {
        DEFAULT_TIMEOUT
    }

    pub fn body_format(self) -> BodyFormat {
        match self {
            Self::DeploymentMode | Self::SchedulingPolicy | Self::ClusterAge => BodyFormat::Text,
            _ => BodyFormat::Json,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn names_round_trip_through_strum() {
        for resource in PolledResource::iter() {
            let name = resource.to_string();
            assert_eq!(name.parse::<PolledResource>().unwrap(), resource);
        }
        assert_eq!(PolledResource::KernelSpecs.to_string(), "kernel-specs");
        assert!("gpus".parse::<PolledResource>().is_err());
    }

    #[test]
    fn paths_are_relative() {
        for resource in PolledResource::iter() {
            assert!(!resource.path().starts_with('/'), "{resource}");
        }
    }

    #[test]
    fn cluster_age_polls_adaptively() {
        let schedule = PolledResource::ClusterAge.default_schedule();
        assert_eq!(schedule.period(false), Duration::from_millis(250));
        assert_eq!(schedule.period(true), Duration::from_secs(30));
        assert_eq!(
            PolledResource::Kernels.default_schedule(),
            Schedule::Fixed(Duration::from_secs(5))
        );
    }
}
