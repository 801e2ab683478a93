use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Entity, attr_str};

/// A workload registered with the workload driver. Delivered over the
/// workload WebSocket as delta batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,

    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Workload {
    pub fn name(&self) -> Option<&str> {
        attr_str(&self.attributes, "name")
    }

    pub fn state(&self) -> Option<&str> {
        attr_str(&self.attributes, "workload_state")
            .or_else(|| attr_str(&self.attributes, "status"))
    }
}

impl Entity for Workload {
    const ID_FIELD: &'static str = "id";
    const PATCH_ID_FIELD: &'static str = "workloadId";

    fn entity_id(&self) -> &str {
        &self.id
    }
}

/// Body of a `register_workload` request, built from a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRegistration {
    pub name: String,
    /// Preset key.
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// RNG seed; `-1` lets the server pick one.
    pub seed: i64,
    pub debug_logging: bool,
    pub adjust_gpu_reservations: bool,
    pub timescale_adjustment_factor: f64,
    #[serde(rename = "sessions_sample_percentage")]
    pub sessions_sample_percent: f64,
    pub template_file_path: String,
}

impl WorkloadRegistration {
    pub fn from_preset(name: impl Into<String>, preset: &WorkloadPreset) -> Self {
        Self {
            name: name.into(),
            key: preset.key.clone(),
            kind: "preset".into(),
            seed: -1,
            debug_logging: false,
            adjust_gpu_reservations: false,
            timescale_adjustment_factor: 1.0,
            sessions_sample_percent: 1.0,
            template_file_path: String::new(),
        }
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }
}

/// A preset workload definition offered when registering a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadPreset {
    pub key: String,

    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl WorkloadPreset {
    pub fn name(&self) -> Option<&str> {
        attr_str(&self.attributes, "name")
    }
}

impl Entity for WorkloadPreset {
    const ID_FIELD: &'static str = "key";

    fn entity_id(&self) -> &str {
        &self.key
    }
}
