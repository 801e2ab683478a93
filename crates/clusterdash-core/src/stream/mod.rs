// ── Snapshot subscriptions ──
//
// A cursor over a feed's published snapshots. Each snapshot is an
// immutable `Arc<Vec<_>>`, so holding one never blocks the feed.

use std::sync::Arc;

use tokio::sync::watch;

/// One published state of a collection, in first-seen order.
pub type Snapshot<T> = Arc<Vec<Arc<T>>>;

/// Follows a feed's snapshots one change at a time.
///
/// `current()` is the snapshot this cursor last observed; it only moves
/// forward on [`changed`](Self::changed), so a consumer can render it and
/// then wait for the next one without missing an update in between.
pub struct SnapshotStream<T> {
    seen: Snapshot<T>,
    receiver: watch::Receiver<Snapshot<T>>,
}

impl<T> SnapshotStream<T> {
    pub(crate) fn new(mut receiver: watch::Receiver<Snapshot<T>>) -> Self {
        let seen = Arc::clone(&receiver.borrow_and_update());
        Self { seen, receiver }
    }

    pub fn current(&self) -> &Snapshot<T> {
        &self.seen
    }

    /// Wait for a newer snapshot. `None` once the feed has shut down.
    pub async fn changed(&mut self) -> Option<Snapshot<T>> {
        self.receiver.changed().await.ok()?;
        self.seen = Arc::clone(&self.receiver.borrow_and_update());
        Some(Arc::clone(&self.seen))
    }
}
