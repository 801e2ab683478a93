// ── Domain model ──
//
// Entities are server-owned records identified by a stable string id.
// Their attributes are opaque to the sync layer and kept as raw JSON;
// only the id field is ever inspected.

pub mod cluster;
pub mod kernel;
pub mod node;
pub mod workload;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

// ── Re-exports ──────────────────────────────────────────────────────

pub use cluster::{ClusterAge, DeploymentMode, JupyterAddress, SchedulingPolicy};
pub use kernel::{Kernel, KernelSpec};
pub use node::ClusterNode;
pub use workload::{Workload, WorkloadPreset, WorkloadRegistration};

/// A uniquely identified, server-owned record.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire field that carries the id (`"NodeId"`, `"kernelId"`, `"id"`).
    const ID_FIELD: &'static str;

    /// Wire field naming the target of a merge patch. Defaults to
    /// [`Self::ID_FIELD`].
    const PATCH_ID_FIELD: &'static str = Self::ID_FIELD;

    fn entity_id(&self) -> &str;
}

/// Read a string attribute out of an opaque attribute map.
pub(crate) fn attr_str<'a>(attributes: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    attributes.get(key).and_then(Value::as_str)
}
