//! Snapshot-level diff: compare two column or property maps.
//!
//! Used to decide whether a refreshed row actually changes anything for an
//! object already in memory, and which columns an update has to touch.

use strata_types::{Snapshot, Value};

/// The result of comparing two snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotDiff {
    pub changes: Vec<SnapshotChange>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Names of every key that differs, in key order.
    pub fn keys(&self) -> Vec<&str> {
        self.changes.iter().map(SnapshotChange::key).collect()
    }
}

/// A single change between two snapshots.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotChange {
    Added { key: String, value: Value },
    Removed { key: String, value: Value },
    Modified { key: String, old: Value, new: Value },
}

impl SnapshotChange {
    pub fn key(&self) -> &str {
        match self {
            Self::Added { key, .. } | Self::Removed { key, .. } | Self::Modified { key, .. } => key,
        }
    }
}

/// Compute the changes that turn `old` into `new`.
///
/// A key missing on one side and `null` on the other is not a change.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> SnapshotDiff {
    let mut changes = Vec::new();

    for (key, old_val) in old {
        match new.get(key) {
            Some(new_val) if new_val != old_val => changes.push(SnapshotChange::Modified {
                key: key.clone(),
                old: old_val.clone(),
                new: new_val.clone(),
            }),
            Some(_) => {}
            None if old_val.is_null() => {}
            None => changes.push(SnapshotChange::Removed {
                key: key.clone(),
                value: old_val.clone(),
            }),
        }
    }

    for (key, new_val) in new {
        if !old.contains_key(key) && !new_val.is_null() {
            changes.push(SnapshotChange::Added {
                key: key.clone(),
                value: new_val.clone(),
            });
        }
    }

    changes.sort_by(|a, b| a.key().cmp(b.key()));
    SnapshotDiff { changes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_types::snapshot_of;

    #[test]
    fn identical_snapshots_no_diff() {
        let snap = snapshot_of([("A", json!(1)), ("B", json!("x"))]);
        assert!(diff_snapshots(&snap, &snap).is_empty());
    }

    #[test]
    fn detects_each_kind() {
        let old = snapshot_of([("A", json!(1)), ("B", json!("x"))]);
        let new = snapshot_of([("A", json!(2)), ("C", json!(true))]);
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.keys(), vec!["A", "B", "C"]);
        assert!(matches!(diff.changes[0], SnapshotChange::Modified { .. }));
        assert!(matches!(diff.changes[1], SnapshotChange::Removed { .. }));
        assert!(matches!(diff.changes[2], SnapshotChange::Added { .. }));
    }

    #[test]
    fn missing_equals_null() {
        let old = snapshot_of([("A", Value::Null)]);
        let new = snapshot_of([("B", Value::Null)]);
        assert!(diff_snapshots(&old, &new).is_empty());
    }
}
