// ── Delta reconciliation engine ──
//
// A keyed collection fed by update batches, with push-based change
// notification via a `watch` channel. The collection is owned by exactly
// one task; every mutation goes through `apply`.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::batch::UpdateBatch;
use crate::model::Entity;

/// What one `apply` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub inserted: usize,
    pub updated: usize,
    pub patched: usize,
    pub removed: usize,
    /// Patches for unknown ids, or patches that broke the entity.
    pub skipped: usize,
}

/// Keyed collection for a single entity type.
///
/// Entries keep first-seen order, so snapshots are stable between
/// batches. Every `apply` publishes a freshly built snapshot; snapshots
/// already handed out never change.
pub struct EntityCollection<T: Entity> {
    /// Primary storage: entity id -> latest known value.
    by_id: IndexMap<String, Arc<T>>,

    /// Version counter, bumped on every apply.
    version: watch::Sender<u64>,

    /// Full snapshot, rebuilt on every apply.
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,
}

impl<T: Entity> Default for EntityCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> EntityCollection<T> {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            by_id: IndexMap::new(),
            version,
            snapshot,
        }
    }

    /// Merge one batch: created, then modified, then patched, then deleted.
    ///
    /// Applying the same batch twice leaves the collection as applying it
    /// once. An id both modified and deleted in one batch ends up absent.
    pub fn apply(&mut self, batch: UpdateBatch<T>) -> ApplyStats {
        let mut stats = ApplyStats::default();

        for entity in batch.created {
            let id = entity.entity_id().to_owned();
            if self.by_id.insert(id, Arc::new(entity)).is_none() {
                stats.inserted += 1;
            } else {
                stats.updated += 1;
            }
        }

        // Out-of-order delivery: a modify for an unseen id is an insert.
        for entity in batch.modified {
            let id = entity.entity_id().to_owned();
            if self.by_id.insert(id, Arc::new(entity)).is_none() {
                stats.inserted += 1;
            } else {
                stats.updated += 1;
            }
        }

        for patch in batch.patched {
            let Some(current) = self.by_id.get(&patch.id) else {
                warn!(id = %patch.id, "patch for unknown entity skipped");
                stats.skipped += 1;
                continue;
            };
            match patch_entity(current.as_ref(), &patch.patch) {
                Ok(patched) if patched.entity_id() == patch.id => {
                    self.by_id.insert(patch.id, Arc::new(patched));
                    stats.patched += 1;
                }
                Ok(_) => {
                    warn!(id = %patch.id, "patch would change the entity id, skipped");
                    stats.skipped += 1;
                }
                Err(e) => {
                    warn!(id = %patch.id, error = %e, "patch produced an invalid entity, skipped");
                    stats.skipped += 1;
                }
            }
        }

        for id in &batch.deleted {
            if self.by_id.shift_remove(id).is_some() {
                stats.removed += 1;
            }
        }

        self.publish();
        debug!(
            inserted = stats.inserted,
            updated = stats.updated,
            patched = stats.patched,
            removed = stats.removed,
            skipped = stats.skipped,
            len = self.by_id.len(),
            "batch applied"
        );
        stats
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.by_id.get(id).map(Arc::clone)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Get the current snapshot (cheap `Arc` clone).
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes via a `watch::Receiver`.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    /// Number of batches applied so far.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// Collect all values into a new snapshot vec and broadcast it.
    fn publish(&self) {
        let values: Vec<Arc<T>> = self.by_id.values().map(Arc::clone).collect();
        // `send_replace` updates unconditionally, even with zero receivers.
        self.snapshot.send_replace(Arc::new(values));
        self.version.send_modify(|v| *v += 1);
    }
}

fn patch_entity<T: Entity>(current: &T, patch: &serde_json::Value) -> Result<T, serde_json::Error> {
    let mut doc = serde_json::to_value(current)?;
    json_patch::merge(&mut doc, patch);
    serde_json::from_value(doc)
}
