// ── Update batches ──
//
// One inbound frame describes a set of creates, modifies, merge patches,
// and deletes for a single resource stream. Field names carry the
// resource: `new_<resource>`, `modified_<resource>`, `patched_<resource>`,
// `deleted_<resource>`.

use clusterdash_api::Error;
use serde_json::{Map, Value};

use crate::model::Entity;

/// A merge patch targeted at one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPatch {
    pub id: String,
    /// RFC 7386 JSON Merge Patch document.
    pub patch: Value,
}

/// Creates, modifies, patches, and deletes to apply as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBatch<T> {
    pub created: Vec<T>,
    pub modified: Vec<T>,
    pub patched: Vec<EntityPatch>,
    pub deleted: Vec<String>,
}

impl<T> Default for UpdateBatch<T> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            modified: Vec::new(),
            patched: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> UpdateBatch<T> {
    pub fn created(entities: impl IntoIterator<Item = T>) -> Self {
        Self {
            created: entities.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn modified(entities: impl IntoIterator<Item = T>) -> Self {
        Self {
            modified: entities.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn deleted<S: Into<String>>(ids: impl IntoIterator<Item = S>) -> Self {
        Self {
            deleted: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.modified.is_empty()
            && self.patched.is_empty()
            && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.patched.len() + self.deleted.len()
    }
}

impl<T: Entity> UpdateBatch<T> {
    /// Decode the batch fields for `resource` out of a frame object.
    ///
    /// Missing or `null` fields are empty. Returns `Ok(None)` when the
    /// frame carries none of the four fields at all.
    pub fn from_frame(resource: &str, frame: &Map<String, Value>) -> Result<Option<Self>, Error> {
        let field = |prefix: &str| frame.get(&format!("{prefix}_{resource}")).filter(|v| !v.is_null());

        let (new, modified, patched, deleted) =
            (field("new"), field("modified"), field("patched"), field("deleted"));
        if new.is_none() && modified.is_none() && patched.is_none() && deleted.is_none() {
            return Ok(None);
        }

        Ok(Some(Self {
            created: decode_entities(resource, "new", new)?,
            modified: decode_entities(resource, "modified", modified)?,
            patched: decode_patches::<T>(resource, patched)?,
            deleted: decode_deleted::<T>(resource, deleted)?,
        }))
    }
}

fn elements<'a>(resource: &str, prefix: &str, value: Option<&'a Value>) -> Result<&'a [Value], Error> {
    match value {
        None => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(Error::decode(
            format!("{prefix}_{resource} must be an array"),
            other.to_string(),
        )),
    }
}

fn decode_entities<T: Entity>(resource: &str, prefix: &str, value: Option<&Value>) -> Result<Vec<T>, Error> {
    elements(resource, prefix, value)?
        .iter()
        .map(|item| {
            serde_json::from_value(item.clone()).map_err(|e| {
                Error::decode(format!("invalid entity in {prefix}_{resource}: {e}"), item.to_string())
            })
        })
        .collect()
}

fn decode_patches<T: Entity>(resource: &str, value: Option<&Value>) -> Result<Vec<EntityPatch>, Error> {
    elements(resource, "patched", value)?
        .iter()
        .map(|item| {
            let id = item
                .get(T::PATCH_ID_FIELD)
                .or_else(|| item.get(T::ID_FIELD))
                .and_then(id_string)
                .ok_or_else(|| {
                    Error::decode(
                        format!("patch in patched_{resource} has no {}", T::PATCH_ID_FIELD),
                        item.to_string(),
                    )
                })?;
            let patch = match item.get("patch") {
                Some(Value::String(text)) => serde_json::from_str(text).map_err(|e| {
                    Error::decode(format!("patch for {id} is not valid JSON: {e}"), text.clone())
                })?,
                Some(doc @ Value::Object(_)) => doc.clone(),
                _ => {
                    return Err(Error::decode(
                        format!("patch for {id} is missing or not an object"),
                        item.to_string(),
                    ));
                }
            };
            Ok(EntityPatch { id, patch })
        })
        .collect()
}

fn decode_deleted<T: Entity>(resource: &str, value: Option<&Value>) -> Result<Vec<String>, Error> {
    elements(resource, "deleted", value)?
        .iter()
        .map(|item| {
            let id = match item {
                Value::Object(map) => map.get(T::ID_FIELD).and_then(id_string),
                other => id_string(other),
            };
            id.ok_or_else(|| {
                Error::decode(
                    format!("entry in deleted_{resource} has no usable id"),
                    item.to_string(),
                )
            })
        })
        .collect()
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Workload;
    use serde_json::json;

    fn frame(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("frame must be an object"),
        }
    }

    #[test]
    fn decodes_every_field() {
        let batch = UpdateBatch::<Workload>::from_frame(
            "workloads",
            &frame(json!({
                "msg_id": "m1",
                "new_workloads": [{"id": "w1", "name": "a"}],
                "modified_workloads": [{"id": "w2", "name": "b"}],
                "patched_workloads": [{"workloadId": "w2", "patch": "{\"name\":\"c\"}"}],
                "deleted_workloads": ["w3", {"id": "w4"}]
            })),
        )
        .unwrap()
        .unwrap();

        assert_eq!(batch.created[0].id, "w1");
        assert_eq!(batch.modified[0].id, "w2");
        assert_eq!(batch.patched, vec![EntityPatch { id: "w2".into(), patch: json!({"name": "c"}) }]);
        assert_eq!(batch.deleted, vec!["w3".to_owned(), "w4".to_owned()]);
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn frames_without_batch_fields_are_not_batches() {
        let none = UpdateBatch::<Workload>::from_frame(
            "workloads",
            &frame(json!({"msg_id": "m1", "op": "pong", "new_workloads": null})),
        )
        .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn empty_arrays_decode_to_an_empty_batch() {
        let batch = UpdateBatch::<Workload>::from_frame(
            "workloads",
            &frame(json!({"new_workloads": [], "deleted_workloads": []})),
        )
        .unwrap()
        .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn wrong_shapes_are_decode_errors() {
        let not_array = UpdateBatch::<Workload>::from_frame("workloads", &frame(json!({"new_workloads": {}})));
        assert!(matches!(not_array, Err(Error::Decode { .. })));

        let missing_id =
            UpdateBatch::<Workload>::from_frame("workloads", &frame(json!({"new_workloads": [{"name": "x"}]})));
        assert!(matches!(missing_id, Err(Error::Decode { .. })));

        let bad_patch = UpdateBatch::<Workload>::from_frame(
            "workloads",
            &frame(json!({"patched_workloads": [{"workloadId": "w1", "patch": "{oops"}]})),
        );
        assert!(matches!(bad_patch, Err(Error::Decode { .. })));
    }
}
