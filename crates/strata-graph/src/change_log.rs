//! Ordered record of graph operations since the last checkpoint.

use std::collections::HashMap;

use strata_diff::{CompoundDiff, GraphDiff};
use strata_types::ObjectId;

/// Append-only operation log with named markers.
#[derive(Clone, Debug, Default)]
pub struct ChangeLog {
    diffs: Vec<GraphDiff>,
    markers: HashMap<String, usize>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, diff: GraphDiff) {
        self.diffs.push(diff);
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &GraphDiff> {
        self.diffs.iter()
    }

    /// Remember the current position under `label`, replacing any earlier
    /// marker with the same label.
    pub fn set_marker(&mut self, label: impl Into<String>) {
        self.markers.insert(label.into(), self.diffs.len());
    }

    pub fn remove_marker(&mut self, label: &str) -> bool {
        self.markers.remove(label).is_some()
    }

    /// Operations recorded after `label` was set, or `None` for an unknown
    /// label.
    pub fn changes_since(&self, label: &str) -> Option<CompoundDiff> {
        let start = *self.markers.get(label)?;
        let start = start.min(self.diffs.len());
        Some(CompoundDiff::from_diffs(self.diffs[start..].to_vec()))
    }

    /// Every recorded operation folded into one diff.
    pub fn to_compound(&self) -> CompoundDiff {
        CompoundDiff::from_diffs(self.diffs.clone())
    }

    /// Drop every operation and marker.
    pub fn clear(&mut self) {
        self.diffs.clear();
        self.markers.clear();
    }

    /// Remove and return the operations recorded after position `at`.
    /// Markers past `at` are dropped.
    pub(crate) fn split_off(&mut self, at: usize) -> Vec<GraphDiff> {
        if at >= self.diffs.len() {
            return Vec::new();
        }
        self.markers.retain(|_, position| *position <= at);
        self.diffs.split_off(at)
    }

    pub(crate) fn remap_ids(&mut self, changes: &HashMap<ObjectId, ObjectId>) {
        for diff in &mut self.diffs {
            remap_diff(diff, changes);
        }
    }
}

fn remap_diff(diff: &mut GraphDiff, changes: &HashMap<ObjectId, ObjectId>) {
    let swap = |id: &mut ObjectId| {
        if let Some(new_id) = changes.get(id) {
            *id = new_id.clone();
        }
    };
    match diff {
        GraphDiff::NodeCreate { id } | GraphDiff::NodeRemove { id } => swap(id),
        GraphDiff::NodeIdChange { id, new_id } => {
            swap(id);
            swap(new_id);
        }
        GraphDiff::PropertyChange { id, .. } => swap(id),
        GraphDiff::ArcCreate { id, target, .. } | GraphDiff::ArcDelete { id, target, .. } => {
            swap(id);
            swap(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(n: i64) -> GraphDiff {
        GraphDiff::PropertyChange {
            id: ObjectId::single("Artist", "ARTIST_ID", 1),
            property: "artistName".into(),
            old: json!(n - 1),
            new: json!(n),
        }
    }

    #[test]
    fn changes_since_marker() {
        let mut log = ChangeLog::new();
        log.add(change(1));
        log.set_marker("checkpoint");
        log.add(change(2));
        log.add(change(3));

        let since = log.changes_since("checkpoint").unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since.iter().next(), Some(&change(2)));
        assert!(log.changes_since("missing").is_none());
        assert_eq!(log.to_compound().len(), 3);
    }

    #[test]
    fn split_off_drops_later_markers() {
        let mut log = ChangeLog::new();
        log.add(change(1));
        log.set_marker("kept");
        log.add(change(2));
        log.set_marker("dropped");
        log.add(change(3));

        let tail = log.split_off(1);
        assert_eq!(tail, vec![change(2), change(3)]);
        assert_eq!(log.len(), 1);
        assert!(log.changes_since("kept").unwrap().is_empty());
        assert!(log.changes_since("dropped").is_none());
        assert!(log.split_off(5).is_empty());
    }

    #[test]
    fn clear_drops_markers() {
        let mut log = ChangeLog::new();
        log.set_marker("m");
        log.add(change(1));
        log.clear();
        assert!(log.is_empty());
        assert!(log.changes_since("m").is_none());
    }

    #[test]
    fn remap_rewrites_arc_targets() {
        let tmp = ObjectId::temporary("Painting");
        let permanent = ObjectId::single("Painting", "PAINTING_ID", 4);
        let artist = ObjectId::single("Artist", "ARTIST_ID", 1);
        let mut log = ChangeLog::new();
        log.add(GraphDiff::NodeCreate { id: tmp.clone() });
        log.add(GraphDiff::ArcCreate {
            id: artist.clone(),
            target: tmp.clone(),
            arc: "paintingArray".into(),
        });
        log.remap_ids(&HashMap::from([(tmp, permanent.clone())]));
        let diffs: Vec<_> = log.iter().cloned().collect();
        assert_eq!(diffs[0], GraphDiff::NodeCreate { id: permanent.clone() });
        assert_eq!(
            diffs[1],
            GraphDiff::ArcCreate {
                id: artist,
                target: permanent,
                arc: "paintingArray".into()
            }
        );
    }
}
