//! Fault resolution for contexts: root contexts read storage through the
//! row cache, child contexts copy from their parent.

use strata_flush::{FaultResolver, FlushError, FlushResult, StorageFaults};
use strata_graph::GraphManager;
use strata_types::{ObjectId, PersistenceState};
use tracing::debug;

use crate::context::ObjectContext;

pub(crate) struct ContextFaults<'c> {
    context: &'c ObjectContext,
}

impl<'c> ContextFaults<'c> {
    pub(crate) fn new(context: &'c ObjectContext) -> Self {
        Self { context }
    }

    fn storage(&self) -> StorageFaults<'c> {
        StorageFaults::new(self.context.domain().storage()).with_cache(self.context.cache())
    }
}

impl FaultResolver for ContextFaults<'_> {
    fn resolve_object(&self, graph: &mut GraphManager, id: &ObjectId) -> FlushResult<()> {
        let Some(parent) = self.context.parent() else {
            return self.storage().resolve_object(graph, id);
        };
        let Some(object) = graph.get_node(id) else {
            return Err(FlushError::ObjectNotFound(id.clone()));
        };
        if object.state() != PersistenceState::Hollow {
            return Ok(());
        }
        let (values, to_one) = parent.export_object(id)?;
        graph.inflate(id, values, to_one)?;
        debug!(id = %id, "object copied from parent context");
        Ok(())
    }

    fn resolve_to_many(&self, graph: &mut GraphManager, id: &ObjectId, relationship: &str) -> FlushResult<()> {
        let Some(parent) = self.context.parent() else {
            return self.storage().resolve_to_many(graph, id, relationship);
        };
        let Some(object) = graph.get_node(id) else {
            return Err(FlushError::ObjectNotFound(id.clone()));
        };
        if !object.borrow().is_to_many_fault(relationship) {
            return Ok(());
        }
        let targets = if id.is_temporary() && !parent.contains(id) {
            Vec::new()
        } else {
            parent.export_to_many(id, relationship)?
        };
        for target in &targets {
            graph.local_node(target)?;
        }
        graph.resolve_to_many(id, relationship, targets)?;
        Ok(())
    }
}
