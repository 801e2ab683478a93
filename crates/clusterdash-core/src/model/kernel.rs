use bytes::Bytes;
use clusterdash_api::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Entity, attr_str};

/// A running Jupyter kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    #[serde(rename = "kernelId")]
    pub kernel_id: String,

    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Kernel {
    pub fn status(&self) -> Option<&str> {
        attr_str(&self.attributes, "status")
    }
}

impl Entity for Kernel {
    const ID_FIELD: &'static str = "kernelId";

    fn entity_id(&self) -> &str {
        &self.kernel_id
    }
}

/// An installed kernel specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,

    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl KernelSpec {
    pub fn display_name(&self) -> Option<&str> {
        self.attributes
            .get("spec")
            .and_then(|s| s.get("display_name"))
            .and_then(Value::as_str)
    }
}

impl Entity for KernelSpec {
    const ID_FIELD: &'static str = "name";

    fn entity_id(&self) -> &str {
        &self.name
    }
}

#[derive(Deserialize)]
struct KernelSpecsResponse {
    #[serde(default)]
    kernelspecs: Map<String, Value>,
}

/// Flatten Jupyter's `{default, kernelspecs: {name: {...}}}` map into a
/// list sorted by name. The map key wins over any `name` in the entry.
pub fn decode_kernel_specs(body: &Bytes) -> Result<Vec<KernelSpec>, Error> {
    let parsed: KernelSpecsResponse = serde_json::from_slice(body)
        .map_err(|e| Error::decode(e, String::from_utf8_lossy(body)))?;

    let mut specs = parsed
        .kernelspecs
        .into_iter()
        .map(|(name, entry)| {
            let mut attributes = match entry {
                Value::Object(map) => map,
                other => {
                    let mut map = Map::new();
                    map.insert("spec".into(), other);
                    map
                }
            };
            attributes.remove("name");
            KernelSpec { name, attributes }
        })
        .collect::<Vec<_>>();
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(specs)
}
