// ── Keyed entity storage ──
//
// `UpdateBatch` is the wire-level unit of change; `EntityCollection`
// merges batches into the current keyed state and publishes snapshots.

mod batch;
mod collection;

pub use batch::{EntityPatch, UpdateBatch};
pub use collection::{ApplyStats, EntityCollection};
