//! Replaying a child context's changes onto its parent's graph.

use strata_diff::GraphChangeHandler;
use strata_flush::{FaultResolver, FlushError, FlushResult};
use strata_graph::GraphManager;
use strata_map::{PropertyKind, DB_ARC_PREFIX};
use strata_types::{ObjectId, Value};

/// Applies each operation through the parent's editing API so the parent
/// records its own diffs. Reverse relationships are not maintained here:
/// the child recorded both sides already.
pub(crate) struct ChildDiffReplay<'g, 'f> {
    graph: &'g mut GraphManager,
    faults: &'f dyn FaultResolver,
}

impl<'g, 'f> ChildDiffReplay<'g, 'f> {
    pub(crate) fn new(graph: &'g mut GraphManager, faults: &'f dyn FaultResolver) -> Self {
        Self { graph, faults }
    }

    /// Register `id` in the parent and load it if it is a fault.
    fn node(&mut self, id: &ObjectId) -> FlushResult<()> {
        if !self.graph.contains(id) {
            if id.is_temporary() {
                return Err(FlushError::ObjectNotFound(id.clone()));
            }
            self.graph.local_node(id)?;
        }
        self.faults.resolve_object(self.graph, id)
    }

    /// Register a relationship target without loading it.
    fn target(&mut self, id: &ObjectId) -> FlushResult<()> {
        if !self.graph.contains(id) {
            if id.is_temporary() {
                return Err(FlushError::ObjectNotFound(id.clone()));
            }
            self.graph.local_node(id)?;
        }
        Ok(())
    }

    fn kind(&self, id: &ObjectId, arc: &str) -> FlushResult<PropertyKind> {
        let descriptor = self.graph.resolver().class_descriptor(id.entity_name())?;
        descriptor.property_kind(arc).ok_or_else(|| FlushError::Classifier {
            entity: id.entity_name().to_string(),
            property: arc.to_string(),
            reason: "unknown relationship in child changes".into(),
        })
    }
}

impl GraphChangeHandler for ChildDiffReplay<'_, '_> {
    type Error = FlushError;

    fn node_created(&mut self, id: &ObjectId) -> FlushResult<()> {
        if !self.graph.contains(id) {
            self.graph.insert_new(id.clone())?;
        }
        Ok(())
    }

    /// Delete rules already ran in the child, and their effects arrive as
    /// separate ops, so the parent only marks the object deleted.
    fn node_removed(&mut self, id: &ObjectId) -> FlushResult<()> {
        self.node(id)?;
        self.graph.delete_node(id)?;
        Ok(())
    }

    fn node_id_changed(&mut self, id: &ObjectId, new_id: &ObjectId) -> FlushResult<()> {
        self.graph.node_id_changed(id, new_id);
        Ok(())
    }

    fn node_property_changed(&mut self, id: &ObjectId, property: &str, _old: &Value, new: &Value) -> FlushResult<()> {
        self.node(id)?;
        self.graph.write_property(id, property, new.clone())?;
        Ok(())
    }

    fn arc_created(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) -> FlushResult<()> {
        self.node(id)?;
        self.target(target)?;
        if arc.starts_with(DB_ARC_PREFIX) {
            self.graph.arc_created(id, target, arc);
            return Ok(());
        }
        match self.kind(id, arc)? {
            PropertyKind::ToOne => self.graph.set_to_one(id, arc, Some(target), false)?,
            _ => self.graph.add_to_many(id, arc, target, false)?,
        }
        Ok(())
    }

    fn arc_deleted(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) -> FlushResult<()> {
        self.node(id)?;
        if arc.starts_with(DB_ARC_PREFIX) {
            self.graph.arc_deleted(id, target, arc);
            return Ok(());
        }
        match self.kind(id, arc)? {
            PropertyKind::ToOne => {
                let current = self
                    .graph
                    .get_node(id)
                    .and_then(|o| o.to_one_target(arc));
                if current.as_ref() == Some(target) {
                    self.graph.set_to_one(id, arc, None, false)?;
                }
            }
            _ => self.graph.remove_to_many(id, arc, target, false)?,
        }
        Ok(())
    }
}

