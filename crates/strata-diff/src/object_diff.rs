//! Per-object change record.
//!
//! An [`ObjectDiff`] accumulates every change made to one object since its
//! last synchronization point. Attribute and to-one changes are compared
//! against the baseline taken when the diff was opened, so a value changed
//! and changed back leaves nothing to apply. To-many arc operations are kept
//! keyed by `(arc, target)` and an operation cancels its opposite.
//!
//! # Invariants
//!
//! - [`ObjectDiff::is_noop`] is `true` exactly when [`ObjectDiff::apply`]
//!   would not invoke the handler.
//! - A diff for an object created and removed within the same window applies
//!   nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::Infallible;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strata_types::{ObjectId, Snapshot, Value};

use crate::graph_diff::{DiffCollector, GraphChangeHandler, GraphDiff};

/// How an arc is stored, which decides how its operations fold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArcKind {
    /// To-one property; compared against the baseline target.
    ToOne,
    /// Plain to-many property.
    ToMany,
    /// To-many through a join table; each operation is a join row.
    Flattened,
    /// Foreign key with no navigable property on this side.
    Phantom,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ArcKey {
    arc: String,
    target: ObjectId,
}

/// One recorded arc create or delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArcOperation {
    pub arc: String,
    pub target: ObjectId,
    pub kind: ArcKind,
    pub delete: bool,
}

/// Accumulated changes of one object.
#[derive(Clone, Debug)]
pub struct ObjectDiff {
    id: ObjectId,
    created: bool,
    removed: bool,
    /// Attribute values at the last checkpoint. `None` for new objects.
    snapshot: Option<Snapshot>,
    /// To-one targets at the last checkpoint.
    arc_snapshot: BTreeMap<String, Option<ObjectId>>,
    /// Latest values of attributes touched since the checkpoint.
    current: Snapshot,
    /// Latest targets of to-one and phantom arcs touched since the checkpoint.
    current_arcs: BTreeMap<String, Option<ObjectId>>,
    arc_ops: IndexMap<ArcKey, ArcOperation>,
    /// Arcs recorded as phantom foreign keys; emitted through `arc_ops` only.
    phantom_arcs: BTreeSet<String>,
}

impl ObjectDiff {
    /// Diff for an object that has never been stored.
    pub fn for_new(id: ObjectId) -> Self {
        Self {
            id,
            created: true,
            removed: false,
            snapshot: None,
            arc_snapshot: BTreeMap::new(),
            current: Snapshot::new(),
            current_arcs: BTreeMap::new(),
            arc_ops: IndexMap::new(),
            phantom_arcs: BTreeSet::new(),
        }
    }

    /// Diff for a stored object, starting from its present state.
    pub fn with_baseline(
        id: ObjectId,
        snapshot: Snapshot,
        arc_snapshot: BTreeMap<String, Option<ObjectId>>,
    ) -> Self {
        Self {
            id,
            created: false,
            removed: false,
            snapshot: Some(snapshot),
            arc_snapshot,
            current: Snapshot::new(),
            current_arcs: BTreeMap::new(),
            arc_ops: IndexMap::new(),
            phantom_arcs: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Baseline attributes, `None` for new objects.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_value(&self, property: &str) -> Option<&Value> {
        self.snapshot.as_ref()?.get(property)
    }

    /// Baseline target of a to-one or phantom arc.
    pub fn arc_snapshot_value(&self, arc: &str) -> Option<&ObjectId> {
        self.arc_snapshot.get(arc)?.as_ref()
    }

    /// Current target of a touched to-one or phantom arc. The outer `None`
    /// means the arc was not touched.
    pub fn current_arc_value(&self, arc: &str) -> Option<Option<&ObjectId>> {
        self.current_arcs.get(arc).map(Option::as_ref)
    }

    // ---------------------------------------------------------------
    // Recording
    // ---------------------------------------------------------------

    pub fn record_created(&mut self) {
        self.created = true;
    }

    pub fn record_removed(&mut self) {
        self.removed = true;
    }

    pub fn record_property(&mut self, property: &str, old: &Value, new: &Value) {
        if let Some(snapshot) = &mut self.snapshot {
            snapshot
                .entry(property.to_string())
                .or_insert_with(|| old.clone());
        }
        self.current.insert(property.to_string(), new.clone());
    }

    pub fn record_arc(&mut self, kind: ArcKind, arc: &str, target: &ObjectId, delete: bool) {
        match kind {
            ArcKind::ToOne => self.record_to_one(arc, target, delete),
            ArcKind::Phantom => {
                self.phantom_arcs.insert(arc.to_string());
                self.record_to_one(arc, target, delete);
                self.record_op(kind, arc, target, delete);
            }
            ArcKind::ToMany | ArcKind::Flattened => self.record_op(kind, arc, target, delete),
        }
    }

    fn record_to_one(&mut self, arc: &str, target: &ObjectId, delete: bool) {
        if !self.arc_snapshot.contains_key(arc) && !self.current_arcs.contains_key(arc) {
            let baseline = delete.then(|| target.clone());
            self.arc_snapshot.insert(arc.to_string(), baseline);
        }
        if delete {
            let current = match self.current_arcs.get(arc) {
                Some(current) => current.as_ref(),
                None => self.arc_snapshot.get(arc).and_then(Option::as_ref),
            };
            if current.is_none() || current == Some(target) {
                self.current_arcs.insert(arc.to_string(), None);
            }
        } else {
            self.current_arcs
                .insert(arc.to_string(), Some(target.clone()));
        }
    }

    fn record_op(&mut self, kind: ArcKind, arc: &str, target: &ObjectId, delete: bool) {
        let key = ArcKey {
            arc: arc.to_string(),
            target: target.clone(),
        };
        if let Some(existing) = self.arc_ops.get(&key) {
            if existing.delete != delete {
                self.arc_ops.shift_remove(&key);
                return;
            }
        }
        self.arc_ops.insert(
            key,
            ArcOperation {
                arc: arc.to_string(),
                target: target.clone(),
                kind,
                delete,
            },
        );
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Attributes whose current value differs from the baseline, as
    /// `(property, old, new)`.
    pub fn changed_properties(&self) -> Vec<(&str, &Value, &Value)> {
        self.current
            .iter()
            .filter_map(|(property, new)| {
                let old = self.snapshot_value(property).unwrap_or(&Value::Null);
                (old != new).then_some((property.as_str(), old, new))
            })
            .collect()
    }

    /// To-one and phantom arcs whose current target differs from the
    /// baseline, as `(arc, old, new)`.
    pub fn changed_arcs(&self) -> Vec<(&str, Option<&ObjectId>, Option<&ObjectId>)> {
        self.current_arcs
            .iter()
            .filter_map(|(arc, new)| {
                let old = self.arc_snapshot_value(arc);
                let new = new.as_ref();
                (old != new).then_some((arc.as_str(), old, new))
            })
            .collect()
    }

    pub fn arc_operations(&self) -> impl Iterator<Item = &ArcOperation> {
        self.arc_ops.values()
    }

    pub fn flattened_operations(&self) -> impl Iterator<Item = &ArcOperation> {
        self.arc_ops
            .values()
            .filter(|op| op.kind == ArcKind::Flattened)
    }

    // ---------------------------------------------------------------
    // Replay
    // ---------------------------------------------------------------

    /// Replay the net change against `handler`.
    ///
    /// Order: creation, attributes, to-one arcs, to-many arcs, removal.
    pub fn apply<H: GraphChangeHandler>(&self, handler: &mut H) -> Result<(), H::Error> {
        if self.created && self.removed {
            return Ok(());
        }
        if self.created {
            handler.node_created(&self.id)?;
        }
        for (property, old, new) in self.changed_properties() {
            handler.node_property_changed(&self.id, property, old, new)?;
        }
        for (arc, old, new) in self.changed_arcs() {
            if self.phantom_arcs.contains(arc) {
                continue;
            }
            if let Some(old) = old {
                handler.arc_deleted(&self.id, old, arc)?;
            }
            if let Some(new) = new {
                handler.arc_created(&self.id, new, arc)?;
            }
        }
        for op in self.arc_ops.values() {
            if op.delete {
                handler.arc_deleted(&self.id, &op.target, &op.arc)?;
            } else {
                handler.arc_created(&self.id, &op.target, &op.arc)?;
            }
        }
        if self.removed {
            handler.node_removed(&self.id)?;
        }
        Ok(())
    }

    /// `true` when [`Self::apply`] would invoke no callback.
    pub fn is_noop(&self) -> bool {
        let mut counter = CallCounter::default();
        match self.apply(&mut counter) {
            Ok(()) => counter.calls == 0,
            Err(never) => match never {},
        }
    }

    /// The net change as a list of operations.
    pub fn to_diffs(&self) -> Vec<GraphDiff> {
        let mut collector = DiffCollector::new();
        match self.apply(&mut collector) {
            Ok(()) => collector.into_diffs(),
            Err(never) => match never {},
        }
    }

    // ---------------------------------------------------------------
    // Identity changes
    // ---------------------------------------------------------------

    /// Rewrite every id this diff refers to.
    pub fn remap_ids(&mut self, changes: &HashMap<ObjectId, ObjectId>) {
        let remap = |id: &mut ObjectId| {
            if let Some(new_id) = changes.get(id) {
                *id = new_id.clone();
            }
        };
        remap(&mut self.id);
        for target in self.arc_snapshot.values_mut().flatten() {
            remap(target);
        }
        for target in self.current_arcs.values_mut().flatten() {
            remap(target);
        }
        let ops = std::mem::take(&mut self.arc_ops);
        for (_, mut op) in ops {
            remap(&mut op.target);
            let key = ArcKey {
                arc: op.arc.clone(),
                target: op.target.clone(),
            };
            self.arc_ops.insert(key, op);
        }
    }
}

#[derive(Default)]
struct CallCounter {
    calls: usize,
}

impl GraphChangeHandler for CallCounter {
    type Error = Infallible;

    fn node_created(&mut self, _: &ObjectId) -> Result<(), Infallible> {
        self.calls += 1;
        Ok(())
    }

    fn node_removed(&mut self, _: &ObjectId) -> Result<(), Infallible> {
        self.calls += 1;
        Ok(())
    }

    fn node_id_changed(&mut self, _: &ObjectId, _: &ObjectId) -> Result<(), Infallible> {
        self.calls += 1;
        Ok(())
    }

    fn node_property_changed(&mut self, _: &ObjectId, _: &str, _: &Value, _: &Value) -> Result<(), Infallible> {
        self.calls += 1;
        Ok(())
    }

    fn arc_created(&mut self, _: &ObjectId, _: &ObjectId, _: &str) -> Result<(), Infallible> {
        self.calls += 1;
        Ok(())
    }

    fn arc_deleted(&mut self, _: &ObjectId, _: &ObjectId, _: &str) -> Result<(), Infallible> {
        self.calls += 1;
        Ok(())
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

    fn painting(n: i64) -> ObjectId {
        ObjectId::single("Painting", "PAINTING_ID", n)
    }

    fn committed_painting() -> ObjectDiff {
        let mut arcs = BTreeMap::new();
        arcs.insert("toArtist".to_string(), Some(artist(1)));
        ObjectDiff::with_baseline(
            painting(10),
            snapshot_of([("paintingTitle", json!("Water Lilies")), ("estimatedPrice", json!(100))]),
            arcs,
        )
    }

    // ---------------------------------------------------------------
    // No-op detection
    // ---------------------------------------------------------------

    #[test]
    fn untouched_diff_is_noop() {
        let diff = committed_painting();
        assert!(diff.is_noop());
        assert!(diff.to_diffs().is_empty());
    }

    #[test]
    fn property_changed_back_is_noop() {
        let mut diff = committed_painting();
        diff.record_property("estimatedPrice", &json!(100), &json!(200));
        assert!(!diff.is_noop());
        diff.record_property("estimatedPrice", &json!(200), &json!(100));
        assert!(diff.is_noop());
    }

    #[test]
    fn to_one_reassigned_back_is_noop() {
        let mut diff = committed_painting();
        diff.record_arc(ArcKind::ToOne, "toArtist", &artist(1), true);
        diff.record_arc(ArcKind::ToOne, "toArtist", &artist(2), false);
        assert_eq!(
            diff.to_diffs(),
            vec![
                GraphDiff::ArcDelete {
                    id: painting(10),
                    target: artist(1),
                    arc: "toArtist".into()
                },
                GraphDiff::ArcCreate {
                    id: painting(10),
                    target: artist(2),
                    arc: "toArtist".into()
                },
            ]
        );
        diff.record_arc(ArcKind::ToOne, "toArtist", &artist(2), true);
        diff.record_arc(ArcKind::ToOne, "toArtist", &artist(1), false);
        assert!(diff.is_noop());
    }

    #[test]
    fn new_object_is_never_noop() {
        let diff = ObjectDiff::for_new(ObjectId::temporary("Artist"));
        assert!(!diff.is_noop());
        assert!(matches!(diff.to_diffs()[0], GraphDiff::NodeCreate { .. }));
    }

    #[test]
    fn created_then_removed_applies_nothing() {
        let mut diff = ObjectDiff::for_new(ObjectId::temporary("Artist"));
        diff.record_property("artistName", &Value::Null, &json!("x"));
        diff.record_removed();
        assert!(diff.is_noop());
    }

    // ---------------------------------------------------------------
    // Arc folding
    // ---------------------------------------------------------------

    #[test]
    fn flattened_create_delete_cancels() {
        let mut diff = ObjectDiff::with_baseline(artist(1), Snapshot::new(), BTreeMap::new());
        let exhibit = ObjectId::single("Exhibit", "EXHIBIT_ID", 4);
        diff.record_arc(ArcKind::Flattened, "exhibitArray", &exhibit, false);
        assert_eq!(diff.flattened_operations().count(), 1);
        diff.record_arc(ArcKind::Flattened, "exhibitArray", &exhibit, true);
        assert_eq!(diff.flattened_operations().count(), 0);
        assert!(diff.is_noop());
    }

    #[test]
    fn repeated_op_is_recorded_once() {
        let mut diff = ObjectDiff::with_baseline(artist(1), Snapshot::new(), BTreeMap::new());
        diff.record_arc(ArcKind::ToMany, "paintingArray", &painting(3), false);
        diff.record_arc(ArcKind::ToMany, "paintingArray", &painting(3), false);
        assert_eq!(diff.arc_operations().count(), 1);
    }

    #[test]
    fn phantom_arc_tracks_current_target() {
        let t4 = ObjectId::single("Table4", "ID", 1);
        let t1 = ObjectId::temporary("Table1");
        let mut diff = ObjectDiff::with_baseline(t4.clone(), Snapshot::new(), BTreeMap::new());
        diff.record_arc(ArcKind::Phantom, "db:toTable1", &t1, false);
        assert_eq!(diff.current_arc_value("db:toTable1"), Some(Some(&t1)));
        assert_eq!(diff.changed_arcs().len(), 1);
        // Emitted once, through the operation list.
        assert_eq!(diff.to_diffs().len(), 1);

        diff.record_arc(ArcKind::Phantom, "db:toTable1", &t1, true);
        assert!(diff.is_noop());
        assert!(diff.changed_arcs().is_empty());
    }

    // ---------------------------------------------------------------
    // Baselines
    // ---------------------------------------------------------------

    #[test]
    fn first_recorded_old_value_becomes_baseline() {
        let mut diff = ObjectDiff::with_baseline(artist(1), Snapshot::new(), BTreeMap::new());
        diff.record_property("artistName", &json!("a"), &json!("b"));
        diff.record_property("artistName", &json!("b"), &json!("c"));
        assert_eq!(diff.snapshot_value("artistName"), Some(&json!("a")));
        assert_eq!(
            diff.changed_properties(),
            vec![("artistName", &json!("a"), &json!("c"))]
        );
    }

    #[test]
    fn apply_order_is_stable() {
        let mut diff = ObjectDiff::for_new(ObjectId::temporary("Artist"));
        diff.record_property("artistName", &Value::Null, &json!("Monet"));
        diff.record_arc(ArcKind::ToMany, "paintingArray", &painting(1), false);
        diff.record_removed();
        diff.created = false;
        let kinds: Vec<&str> = diff
            .to_diffs()
            .iter()
            .map(|d| match d {
                GraphDiff::NodeCreate { .. } => "create",
                GraphDiff::PropertyChange { .. } => "property",
                GraphDiff::ArcCreate { .. } => "arc",
                GraphDiff::NodeRemove { .. } => "remove",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["property", "arc", "remove"]);
    }

    #[test]
    fn remap_rewrites_every_reference() {
        let tmp_artist = ObjectId::temporary("Artist");
        let tmp_painting = ObjectId::temporary("Painting");
        let mut diff = ObjectDiff::for_new(tmp_painting.clone());
        diff.record_arc(ArcKind::ToOne, "toArtist", &tmp_artist, false);

        let mut changes = HashMap::new();
        changes.insert(tmp_artist, artist(5));
        changes.insert(tmp_painting, painting(6));
        diff.remap_ids(&changes);

        assert_eq!(diff.id(), &painting(6));
        assert_eq!(diff.current_arc_value("toArtist"), Some(Some(&artist(5))));
    }
}
