//! Graph change operations and their replay.

use std::convert::Infallible;

use serde::{Deserialize, Serialize};
use strata_types::{ObjectId, Value};

use crate::error::{DiffError, DiffResult};

// ---------------------------------------------------------------------------
// GraphChangeHandler
// ---------------------------------------------------------------------------

/// Receiver of replayed graph operations.
pub trait GraphChangeHandler {
    type Error;

    fn node_created(&mut self, id: &ObjectId) -> Result<(), Self::Error>;

    fn node_removed(&mut self, id: &ObjectId) -> Result<(), Self::Error>;

    fn node_id_changed(&mut self, id: &ObjectId, new_id: &ObjectId) -> Result<(), Self::Error>;

    fn node_property_changed(
        &mut self,
        id: &ObjectId,
        property: &str,
        old: &Value,
        new: &Value,
    ) -> Result<(), Self::Error>;

    fn arc_created(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) -> Result<(), Self::Error>;

    fn arc_deleted(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) -> Result<(), Self::Error>;
}

// ---------------------------------------------------------------------------
// GraphDiff
// ---------------------------------------------------------------------------

/// A single graph operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GraphDiff {
    NodeCreate {
        id: ObjectId,
    },
    NodeRemove {
        id: ObjectId,
    },
    NodeIdChange {
        id: ObjectId,
        new_id: ObjectId,
    },
    PropertyChange {
        id: ObjectId,
        property: String,
        old: Value,
        new: Value,
    },
    ArcCreate {
        id: ObjectId,
        target: ObjectId,
        arc: String,
    },
    ArcDelete {
        id: ObjectId,
        target: ObjectId,
        arc: String,
    },
}

impl GraphDiff {
    /// The node the operation applies to.
    pub fn node_id(&self) -> &ObjectId {
        match self {
            Self::NodeCreate { id }
            | Self::NodeRemove { id }
            | Self::NodeIdChange { id, .. }
            | Self::PropertyChange { id, .. }
            | Self::ArcCreate { id, .. }
            | Self::ArcDelete { id, .. } => id,
        }
    }

    /// Operations that would not change anything when applied.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::PropertyChange { old, new, .. } => old == new,
            Self::NodeIdChange { id, new_id } => id == new_id,
            _ => false,
        }
    }

    pub fn apply<H: GraphChangeHandler>(&self, handler: &mut H) -> Result<(), H::Error> {
        match self {
            Self::NodeCreate { id } => handler.node_created(id),
            Self::NodeRemove { id } => handler.node_removed(id),
            Self::NodeIdChange { id, new_id } => handler.node_id_changed(id, new_id),
            Self::PropertyChange {
                id,
                property,
                old,
                new,
            } => handler.node_property_changed(id, property, old, new),
            Self::ArcCreate { id, target, arc } => handler.arc_created(id, target, arc),
            Self::ArcDelete { id, target, arc } => handler.arc_deleted(id, target, arc),
        }
    }

    /// Replay the inverse operation.
    pub fn undo<H: GraphChangeHandler>(&self, handler: &mut H) -> Result<(), H::Error> {
        match self {
            Self::NodeCreate { id } => handler.node_removed(id),
            Self::NodeRemove { id } => handler.node_created(id),
            Self::NodeIdChange { id, new_id } => handler.node_id_changed(new_id, id),
            Self::PropertyChange {
                id,
                property,
                old,
                new,
            } => handler.node_property_changed(id, property, new, old),
            Self::ArcCreate { id, target, arc } => handler.arc_deleted(id, target, arc),
            Self::ArcDelete { id, target, arc } => handler.arc_created(id, target, arc),
        }
    }
}

// ---------------------------------------------------------------------------
// CompoundDiff
// ---------------------------------------------------------------------------

/// An ordered list of operations replayed as one unit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompoundDiff {
    diffs: Vec<GraphDiff>,
}

impl CompoundDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_diffs(diffs: Vec<GraphDiff>) -> Self {
        Self { diffs }
    }

    pub fn add(&mut self, diff: GraphDiff) {
        self.diffs.push(diff);
    }

    pub fn extend(&mut self, diffs: impl IntoIterator<Item = GraphDiff>) {
        self.diffs.extend(diffs);
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphDiff> {
        self.diffs.iter()
    }

    pub fn into_diffs(self) -> Vec<GraphDiff> {
        self.diffs
    }

    /// `true` when every contained operation is a no-op.
    pub fn is_noop(&self) -> bool {
        self.diffs.iter().all(GraphDiff::is_noop)
    }

    /// Replay every operation in order.
    pub fn apply<H: GraphChangeHandler>(&self, handler: &mut H) -> Result<(), H::Error> {
        for diff in &self.diffs {
            diff.apply(handler)?;
        }
        Ok(())
    }

    /// Replay the inverse of every operation, last first.
    pub fn undo<H: GraphChangeHandler>(&self, handler: &mut H) -> Result<(), H::Error> {
        for diff in self.diffs.iter().rev() {
            diff.undo(handler)?;
        }
        Ok(())
    }

    /// Encode for transmission across a process boundary.
    pub fn to_bytes(&self) -> DiffResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DiffError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> DiffResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| DiffError::Serialization(e.to_string()))
    }
}

impl IntoIterator for CompoundDiff {
    type Item = GraphDiff;
    type IntoIter = std::vec::IntoIter<GraphDiff>;

    fn into_iter(self) -> Self::IntoIter {
        self.diffs.into_iter()
    }
}

// ---------------------------------------------------------------------------
// DiffCollector
// ---------------------------------------------------------------------------

/// Handler that records every callback as a [`GraphDiff`].
#[derive(Debug, Default)]
pub struct DiffCollector {
    diffs: Vec<GraphDiff>,
}

impl DiffCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn into_diffs(self) -> Vec<GraphDiff> {
        self.diffs
    }
}

impl GraphChangeHandler for DiffCollector {
    type Error = Infallible;

    fn node_created(&mut self, id: &ObjectId) -> Result<(), Infallible> {
        self.diffs.push(GraphDiff::NodeCreate { id: id.clone() });
        Ok(())
    }

    fn node_removed(&mut self, id: &ObjectId) -> Result<(), Infallible> {
        self.diffs.push(GraphDiff::NodeRemove { id: id.clone() });
        Ok(())
    }

    fn node_id_changed(&mut self, id: &ObjectId, new_id: &ObjectId) -> Result<(), Infallible> {
        self.diffs.push(GraphDiff::NodeIdChange {
            id: id.clone(),
            new_id: new_id.clone(),
        });
        Ok(())
    }

    fn node_property_changed(
        &mut self,
        id: &ObjectId,
        property: &str,
        old: &Value,
        new: &Value,
    ) -> Result<(), Infallible> {
        self.diffs.push(GraphDiff::PropertyChange {
            id: id.clone(),
            property: property.to_string(),
            old: old.clone(),
            new: new.clone(),
        });
        Ok(())
    }

    fn arc_created(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) -> Result<(), Infallible> {
        self.diffs.push(GraphDiff::ArcCreate {
            id: id.clone(),
            target: target.clone(),
            arc: arc.to_string(),
        });
        Ok(())
    }

    fn arc_deleted(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) -> Result<(), Infallible> {
        self.diffs.push(GraphDiff::ArcDelete {
            id: id.clone(),
            target: target.clone(),
            arc: arc.to_string(),
        });
        Ok(())
    }
}
