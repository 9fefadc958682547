//! Row cache shared by every context of a domain.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use strata_types::{ObjectId, Snapshot};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Changes one context committed, broadcast to its siblings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotEvent {
    /// Context that produced the change.
    pub source: Uuid,
    /// Fresh row snapshots of objects written by the commit.
    pub modified: Vec<(ObjectId, Snapshot)>,
    /// Objects deleted, or whose id was replaced.
    pub deleted: Vec<ObjectId>,
    /// Objects whose cached rows must be refetched.
    pub invalidated: Vec<ObjectId>,
}

impl SnapshotEvent {
    pub fn new(source: Uuid) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.deleted.is_empty() && self.invalidated.is_empty()
    }
}

/// Bounded id → row snapshot map.
///
/// Entries are evicted oldest-first once `capacity` is exceeded. Every
/// [`process_changes`](Self::process_changes) call is re-broadcast to
/// subscribers after it has been applied.
pub struct RowCache {
    rows: RwLock<IndexMap<ObjectId, Snapshot>>,
    capacity: usize,
    events: broadcast::Sender<SnapshotEvent>,
}

impl RowCache {
    pub fn new(capacity: usize, channel_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            rows: RwLock::new(IndexMap::new()),
            capacity,
            events,
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, IndexMap<ObjectId, Snapshot>>> {
        self.rows.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, IndexMap<ObjectId, Snapshot>>> {
        self.rows.write().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn get(&self, id: &ObjectId) -> StoreResult<Option<Snapshot>> {
        Ok(self.read()?.get(id).cloned())
    }

    pub fn contains(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.read()?.contains_key(id))
    }

    pub fn put(&self, id: ObjectId, snapshot: Snapshot) -> StoreResult<()> {
        let mut rows = self.write()?;
        self.insert_bounded(&mut rows, id, snapshot);
        Ok(())
    }

    /// Replace the row for `id` only if it currently equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    pub fn compare_and_replace(
        &self,
        id: &ObjectId,
        expected: Option<&Snapshot>,
        snapshot: Snapshot,
    ) -> StoreResult<bool> {
        let mut rows = self.write()?;
        if rows.get(id) != expected {
            return Ok(false);
        }
        self.insert_bounded(&mut rows, id.clone(), snapshot);
        Ok(true)
    }

    pub fn invalidate<'a>(&self, ids: impl IntoIterator<Item = &'a ObjectId>) -> StoreResult<usize> {
        let mut rows = self.write()?;
        Ok(ids
            .into_iter()
            .filter(|id| rows.shift_remove(*id).is_some())
            .count())
    }

    /// Apply a committed change set, then notify subscribers.
    pub fn process_changes(&self, event: SnapshotEvent) -> StoreResult<()> {
        {
            let mut rows = self.write()?;
            for id in event.deleted.iter().chain(&event.invalidated) {
                rows.shift_remove(id);
            }
            for (id, snapshot) in &event.modified {
                self.insert_bounded(&mut rows, id.clone(), snapshot.clone());
            }
        }
        debug!(
            source = %event.source,
            modified = event.modified.len(),
            deleted = event.deleted.len(),
            invalidated = event.invalidated.len(),
            "cache changes processed"
        );
        // No subscribers is not an error.
        let _ = self.events.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.read()?.is_empty())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) -> StoreResult<()> {
        self.write()?.clear();
        Ok(())
    }

    fn insert_bounded(&self, rows: &mut IndexMap<ObjectId, Snapshot>, id: ObjectId, snapshot: Snapshot) {
        rows.insert(id, snapshot);
        let overflow = rows.len().saturating_sub(self.capacity);
        if overflow > 0 {
            rows.drain(..overflow);
            warn!(evicted = overflow, capacity = self.capacity, "row cache full, evicted oldest entries");
        }
    }
}

impl std::fmt::Debug for RowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_types::snapshot_of;

    fn artist(n: i64) -> ObjectId {
        ObjectId::single("Artist", "ARTIST_ID", n)
    }

    fn row(name: &str) -> Snapshot {
        snapshot_of([("ARTIST_NAME", json!(name))])
    }

    #[test]
    fn put_and_get() {
        let cache = RowCache::new(10, 4);
        cache.put(artist(1), row("a")).unwrap();
        assert_eq!(cache.get(&artist(1)).unwrap(), Some(row("a")));
        assert_eq!(cache.get(&artist(2)).unwrap(), None);
    }

    #[test]
    fn evicts_oldest_first() {
        let cache = RowCache::new(2, 4);
        cache.put(artist(1), row("a")).unwrap();
        cache.put(artist(2), row("b")).unwrap();
        cache.put(artist(3), row("c")).unwrap();
        assert_eq!(cache.len().unwrap(), 2);
        assert!(!cache.contains(&artist(1)).unwrap());
        assert!(cache.contains(&artist(3)).unwrap());
    }

    #[test]
    fn compare_and_replace_checks_expected() {
        let cache = RowCache::new(10, 4);
        assert!(cache.compare_and_replace(&artist(1), None, row("a")).unwrap());
        assert!(!cache.compare_and_replace(&artist(1), Some(&row("x")), row("b")).unwrap());
        assert!(cache.compare_and_replace(&artist(1), Some(&row("a")), row("b")).unwrap());
        assert_eq!(cache.get(&artist(1)).unwrap(), Some(row("b")));
    }

    #[test]
    fn invalidate_removes_entries() {
        let cache = RowCache::new(10, 4);
        cache.put(artist(1), row("a")).unwrap();
        assert_eq!(cache.invalidate([&artist(1), &artist(2)]).unwrap(), 1);
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn process_changes_applies_and_broadcasts() {
        let cache = RowCache::new(10, 4);
        let mut rx = cache.subscribe();
        cache.put(artist(1), row("a")).unwrap();
        cache.put(artist(2), row("b")).unwrap();

        let mut event = SnapshotEvent::new(Uuid::now_v7());
        event.modified.push((artist(3), row("c")));
        event.deleted.push(artist(1));
        event.invalidated.push(artist(2));
        cache.process_changes(event.clone()).unwrap();

        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.get(&artist(3)).unwrap(), Some(row("c")));
        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[test]
    fn process_changes_without_subscribers() {
        let cache = RowCache::new(10, 4);
        assert!(SnapshotEvent::new(Uuid::nil()).is_empty());
        cache.process_changes(SnapshotEvent::new(Uuid::nil())).unwrap();
    }
}
