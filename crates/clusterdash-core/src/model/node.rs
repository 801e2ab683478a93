use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Entity, attr_str};

/// A compute node in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    #[serde(rename = "NodeId")]
    pub node_id: String,

    /// Everything else the server reports (resources, pods, type...).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl ClusterNode {
    pub fn name(&self) -> Option<&str> {
        attr_str(&self.attributes, "NodeName")
    }

    pub fn node_type(&self) -> Option<&str> {
        attr_str(&self.attributes, "NodeType")
    }

    pub fn is_enabled(&self) -> bool {
        self.attributes
            .get("Enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

impl Entity for ClusterNode {
    const ID_FIELD: &'static str = "NodeId";

    fn entity_id(&self) -> &str {
        &self.node_id
    }
}
