//! Object contexts: the single-threaded unit-of-work API.
//!
//! An [`ObjectContext`] owns one object graph. Root contexts commit to
//! storage and listen to cache events from their siblings; child contexts
//! load from and commit into their parent.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use strata_diff::{CompoundDiff, GraphDiff};
use strata_flush::{
    values_from_row, CommitSummary, DecodedRow, DeleteAction, FaultResolver, FlushEngine, FlushError, FlushResult,
};
use strata_graph::{GraphError, GraphManager, ObjectRef};
use strata_store::{RowCache, SnapshotEvent, TxHandle};
use strata_types::{ObjectId, PersistenceState, Value};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::DataDomain;
use crate::error::{ContextError, ContextResult};
use crate::faults::ContextFaults;
use crate::replay::ChildDiffReplay;

/// Handle to a context. Clones share the same graph.
#[derive(Clone)]
pub struct ObjectContext {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    id: Uuid,
    domain: Arc<DataDomain>,
    cache: Arc<RowCache>,
    graph: RefCell<GraphManager>,
    parent: Option<ObjectContext>,
    children: RefCell<Vec<Weak<ContextInner>>>,
    events: RefCell<Option<broadcast::Receiver<SnapshotEvent>>>,
}

impl ObjectContext {
    /// A root context over `domain`.
    pub fn new(domain: Arc<DataDomain>) -> Self {
        let cache = domain.cache_for_context();
        let events = cache.subscribe();
        let graph = GraphManager::new(Arc::clone(domain.resolver()));
        let inner = ContextInner {
            id: Uuid::now_v7(),
            domain,
            cache,
            graph: RefCell::new(graph),
            parent: None,
            children: RefCell::default(),
            events: RefCell::new(Some(events)),
        };
        debug!(context = %inner.id, "root context created");
        Self { inner: Rc::new(inner) }
    }

    /// A nested context whose faults and commits go through `self`.
    pub fn create_child(&self) -> Self {
        let inner = Rc::new(ContextInner {
            id: Uuid::now_v7(),
            domain: Arc::clone(&self.inner.domain),
            cache: Arc::clone(&self.inner.cache),
            graph: RefCell::new(GraphManager::new(Arc::clone(self.inner.domain.resolver()))),
            parent: Some(self.clone()),
            children: RefCell::default(),
            events: RefCell::new(None),
        });
        self.inner.children.borrow_mut().push(Rc::downgrade(&inner));
        debug!(context = %inner.id, parent = %self.inner.id, "child context created");
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn domain(&self) -> &Arc<DataDomain> {
        &self.inner.domain
    }

    pub fn parent(&self) -> Option<&ObjectContext> {
        self.inner.parent.as_ref()
    }

    pub(crate) fn cache(&self) -> &RowCache {
        &self.inner.cache
    }

    fn children(&self) -> Vec<ObjectContext> {
        let mut children = self.inner.children.borrow_mut();
        children.retain(|child| child.strong_count() > 0);
        children
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| ObjectContext { inner })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner.graph.borrow().contains(id)
    }

    /// The registered object for `id`, loaded or not.
    pub fn object(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.inner.graph.borrow().get_node(id)
    }

    pub fn state_of(&self, id: &ObjectId) -> Option<PersistenceState> {
        self.object(id).map(|o| o.state())
    }

    pub fn registered_objects(&self) -> usize {
        self.inner.graph.borrow().len()
    }

    pub fn has_changes(&self) -> bool {
        self.inner.graph.borrow().has_changes()
    }

    pub fn new_objects(&self) -> Vec<ObjectId> {
        self.inner.graph.borrow().dirty_nodes(Some(PersistenceState::New))
    }

    pub fn modified_objects(&self) -> Vec<ObjectId> {
        self.inner.graph.borrow().dirty_nodes(Some(PersistenceState::Modified))
    }

    pub fn deleted_objects(&self) -> Vec<ObjectId> {
        self.inner.graph.borrow().dirty_nodes(Some(PersistenceState::Deleted))
    }

    /// Every uncommitted change as one replayable diff.
    pub fn get_diffs(&self) -> CompoundDiff {
        self.inner.graph.borrow().get_diffs()
    }

    fn require(&self, id: &ObjectId) -> ContextResult<ObjectRef> {
        self.object(id)
            .ok_or_else(|| GraphError::UnknownObject(id.clone()).into())
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Create a NEW object with a temporary id.
    pub fn new_object(&self, entity: &str) -> ContextResult<ObjectRef> {
        Ok(self.inner.graph.borrow_mut().new_object(entity)?)
    }

    /// Register a caller-built TRANSIENT object as NEW.
    pub fn register_new_object(&self, object: ObjectRef) -> ContextResult<()> {
        self.inner.graph.borrow_mut().register_new(object)?;
        Ok(())
    }

    /// The object for `id`, registering a HOLLOW placeholder if needed.
    pub fn local_object(&self, id: &ObjectId) -> ContextResult<ObjectRef> {
        Ok(self.inner.graph.borrow_mut().local_node(id)?)
    }

    /// Load the object for `id`. `None` when no stored row exists.
    pub fn select_by_id(&self, id: &ObjectId) -> ContextResult<Option<ObjectRef>> {
        let object = self.local_object(id)?;
        match self.resolve_fault(id) {
            Ok(()) => Ok(Some(object)),
            Err(FlushError::ObjectNotFound(_)) => {
                if object.state() == PersistenceState::Hollow {
                    self.inner.graph.borrow_mut().unregister_node(id);
                }
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Apply delete rules and mark `ids` deleted. Returns every object
    /// deleted, cascades included. A DENY rule fails the whole call with
    /// nothing changed.
    pub fn delete_objects(&self, ids: &[ObjectId]) -> ContextResult<Vec<ObjectId>> {
        let faults = ContextFaults::new(self);
        let mut graph = self.inner.graph.borrow_mut();
        let deleted = DeleteAction::new(&faults).delete_objects(&mut graph, ids)?;
        debug!(context = %self.inner.id, requested = ids.len(), deleted = deleted.len(), "objects deleted");
        Ok(deleted)
    }

    pub fn read_property(&self, id: &ObjectId, property: &str) -> ContextResult<Value> {
        let object = self.require(id)?;
        self.inner.domain.resolver().attribute(id.entity_name(), property)?;
        self.resolve_fault(id)?;
        Ok(object.value(property).unwrap_or(Value::Null))
    }

    pub fn write_property(&self, id: &ObjectId, property: &str, value: impl Into<Value>) -> ContextResult<()> {
        self.require(id)?;
        self.resolve_fault(id)?;
        self.inner
            .graph
            .borrow_mut()
            .write_property(id, property, value.into())?;
        Ok(())
    }

    pub fn to_one(&self, id: &ObjectId, relationship: &str) -> ContextResult<Option<ObjectId>> {
        let object = self.require(id)?;
        self.inner.domain.resolver().relationship(id.entity_name(), relationship)?;
        self.resolve_fault(id)?;
        Ok(object.to_one_target(relationship))
    }

    /// Members of a to-many relationship, loading them if it is a fault.
    pub fn to_many(&self, id: &ObjectId, relationship: &str) -> ContextResult<Vec<ObjectId>> {
        self.require(id)?;
        self.resolve_fault(id)?;
        self.resolve_to_many(id, relationship)?;
        Ok(self.member_ids(id, relationship))
    }

    /// Point a to-one relationship at `target`, maintaining the reverse.
    pub fn set_to_one(&self, id: &ObjectId, relationship: &str, target: Option<&ObjectId>) -> ContextResult<()> {
        let object = self.require(id)?;
        self.resolve_fault(id)?;
        if let Some(old) = object.to_one_target(relationship) {
            self.load_target(&old)?;
        }
        if let Some(target) = target {
            self.load_target(target)?;
        }
        self.inner
            .graph
            .borrow_mut()
            .set_to_one(id, relationship, target, true)?;
        Ok(())
    }

    pub fn add_to_many(&self, id: &ObjectId, relationship: &str, target: &ObjectId) -> ContextResult<()> {
        self.require(id)?;
        self.resolve_fault(id)?;
        self.load_target(target)?;
        self.inner
            .graph
            .borrow_mut()
            .add_to_many(id, relationship, target, true)?;
        Ok(())
    }

    pub fn remove_to_many(&self, id: &ObjectId, relationship: &str, target: &ObjectId) -> ContextResult<()> {
        self.require(id)?;
        self.resolve_fault(id)?;
        self.load_target(target)?;
        self.inner
            .graph
            .borrow_mut()
            .remove_to_many(id, relationship, target, true)?;
        Ok(())
    }

    fn load_target(&self, id: &ObjectId) -> FlushResult<()> {
        self.ensure_registered(id)?;
        self.resolve_fault(id)
    }

    // -----------------------------------------------------------------------
    // Commit and rollback
    // -----------------------------------------------------------------------

    /// Commit every change to storage. A child context first commits into
    /// its parent, which then commits.
    pub fn commit_changes(&self) -> ContextResult<CommitSummary> {
        self.commit(None)
    }

    /// Commit inside a caller-owned transaction. The transaction is left
    /// open on success and marked rollback-only on failure.
    pub fn commit_changes_in(&self, tx: &TxHandle) -> ContextResult<CommitSummary> {
        self.commit(Some(tx))
    }

    fn commit(&self, tx: Option<&TxHandle>) -> ContextResult<CommitSummary> {
        if let Some(parent) = self.parent() {
            self.commit_changes_to_parent()?;
            return parent.commit(tx);
        }

        let domain = Arc::clone(&self.inner.domain);
        let faults = ContextFaults::new(self);
        let mut engine = FlushEngine::new(domain.storage(), domain.sorter(), &faults);
        if let Some(validators) = domain.validators() {
            engine = engine.with_validation(validators);
        }
        let outcome = engine.flush(&mut self.inner.graph.borrow_mut(), tx)?;

        let mut event = SnapshotEvent::new(self.inner.id);
        event.modified = outcome.modified_rows;
        event.deleted = outcome.deleted_ids;
        if !event.is_empty() {
            self.inner.cache.process_changes(event)?;
        }
        self.propagate_id_changes(&outcome.result_diff);

        info!(
            context = %self.inner.id,
            inserted = outcome.summary.inserted,
            updated = outcome.summary.updated,
            deleted = outcome.summary.deleted,
            "context committed"
        );
        Ok(outcome.summary)
    }

    /// Push every change into the parent context. The parent records them
    /// as its own uncommitted changes; this context accepts them as its new
    /// baseline.
    pub fn commit_changes_to_parent(&self) -> ContextResult<()> {
        let parent = self.parent().ok_or(ContextError::NoParent)?;
        let diff = self.get_diffs();
        if !diff.is_empty() {
            parent.apply_child_changes(&diff)?;
        }
        self.inner.graph.borrow_mut().post_commit();
        info!(
            context = %self.inner.id,
            parent = %parent.id(),
            operations = diff.len(),
            "changes committed to parent"
        );
        Ok(())
    }

    fn apply_child_changes(&self, diff: &CompoundDiff) -> ContextResult<()> {
        let faults = ContextFaults::new(self);
        let mut graph = self.inner.graph.borrow_mut();
        diff.apply(&mut ChildDiffReplay::new(&mut graph, &faults))?;
        Ok(())
    }

    /// Re-key objects in child contexts after a commit replaced ids.
    fn propagate_id_changes(&self, diff: &CompoundDiff) {
        let changes: HashMap<ObjectId, ObjectId> = diff
            .iter()
            .filter_map(|op| match op {
                GraphDiff::NodeIdChange { id, new_id } => Some((id.clone(), new_id.clone())),
                _ => None,
            })
            .collect();
        if changes.is_empty() {
            return;
        }
        for child in self.children() {
            child.remap(&changes);
        }
    }

    fn remap(&self, changes: &HashMap<ObjectId, ObjectId>) {
        self.inner.graph.borrow_mut().remap_ids(changes);
        for child in self.children() {
            child.remap(changes);
        }
    }

    /// Undo every uncommitted change.
    pub fn rollback_changes(&self) {
        self.inner.graph.borrow_mut().rollback();
        debug!(context = %self.inner.id, "changes rolled back");
    }

    // -----------------------------------------------------------------------
    // Cache and events
    // -----------------------------------------------------------------------

    /// Turn COMMITTED objects back into faults and drop their cached rows.
    /// Other contexts sharing the cache are told to do the same.
    pub fn invalidate_objects(&self, ids: &[ObjectId]) -> ContextResult<()> {
        {
            let mut graph = self.inner.graph.borrow_mut();
            for id in ids {
                if !graph.contains(id) {
                    continue;
                }
                graph.make_hollow(id)?;
            }
        }
        let mut event = SnapshotEvent::new(self.inner.id);
        event.invalidated = ids.to_vec();
        self.inner.cache.process_changes(event)?;
        Ok(())
    }

    /// Apply snapshot events other contexts committed since the last call.
    /// Returns how many events were applied.
    pub fn process_snapshot_events(&self) -> ContextResult<usize> {
        let mut events = self.inner.events.borrow_mut();
        let Some(receiver) = events.as_mut() else {
            return Ok(0);
        };
        let mut applied = 0;
        loop {
            match receiver.try_recv() {
                Ok(event) if event.source == self.inner.id => {}
                Ok(event) => {
                    self.apply_snapshot_event(&event)?;
                    applied += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(context = %self.inner.id, skipped, "snapshot events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        Ok(applied)
    }

    fn apply_snapshot_event(&self, event: &SnapshotEvent) -> ContextResult<()> {
        let resolver = Arc::clone(self.inner.domain.resolver());
        let mut graph = self.inner.graph.borrow_mut();
        for id in &event.deleted {
            match graph.get_node(id).map(|o| o.state()) {
                Some(PersistenceState::Committed | PersistenceState::Hollow) => {
                    graph.set_state(id, PersistenceState::Transient)?;
                    graph.unregister_node(id);
                }
                // Local edits survive as a fresh insert.
                Some(PersistenceState::Modified) => graph.set_state(id, PersistenceState::New)?,
                _ => {}
            }
        }
        for id in &event.invalidated {
            if graph.contains(id) {
                graph.make_hollow(id)?;
            }
        }
        for (id, row) in &event.modified {
            if graph
                .get_node(id)
                .is_some_and(|o| o.state() == PersistenceState::Committed)
            {
                let (values, to_one) = values_from_row(&resolver, id.entity_name(), row)?;
                graph.inflate(id, values, to_one)?;
            }
        }
        debug!(
            context = %self.inner.id,
            source = %event.source,
            modified = event.modified.len(),
            deleted = event.deleted.len(),
            invalidated = event.invalidated.len(),
            "snapshot event applied"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Faulting
    // -----------------------------------------------------------------------

    fn resolve_fault(&self, id: &ObjectId) -> FlushResult<()> {
        let hollow = self
            .object(id)
            .is_some_and(|o| o.state() == PersistenceState::Hollow);
        if hollow {
            let faults = ContextFaults::new(self);
            faults.resolve_object(&mut self.inner.graph.borrow_mut(), id)?;
        }
        Ok(())
    }

    fn resolve_to_many(&self, id: &ObjectId, relationship: &str) -> FlushResult<()> {
        let faults = ContextFaults::new(self);
        faults.resolve_to_many(&mut self.inner.graph.borrow_mut(), id, relationship)
    }

    fn ensure_registered(&self, id: &ObjectId) -> FlushResult<()> {
        if self.contains(id) {
            return Ok(());
        }
        if id.is_temporary() {
            return Err(FlushError::ObjectNotFound(id.clone()));
        }
        self.inner.graph.borrow_mut().local_node(id)?;
        Ok(())
    }

    fn member_ids(&self, id: &ObjectId, relationship: &str) -> Vec<ObjectId> {
        let Some(object) = self.object(id) else {
            return Vec::new();
        };
        let members = object
            .borrow()
            .to_many(relationship)
            .and_then(|m| m.ids())
            .map(|ids| ids.into_iter().cloned().collect())
            .unwrap_or_default();
        members
    }

    /// Current values of `id` for a child context to load.
    pub(crate) fn export_object(&self, id: &ObjectId) -> FlushResult<DecodedRow> {
        self.ensure_registered(id)?;
        self.resolve_fault(id)?;
        let object = self
            .object(id)
            .ok_or_else(|| FlushError::ObjectNotFound(id.clone()))?;
        let object = object.borrow();
        if object.state() == PersistenceState::Deleted {
            return Err(FlushError::ObjectNotFound(id.clone()));
        }
        Ok((object.values().clone(), object.to_one_map().clone()))
    }

    /// Current members of a to-many relationship for a child context.
    pub(crate) fn export_to_many(&self, id: &ObjectId, relationship: &str) -> FlushResult<Vec<ObjectId>> {
        self.ensure_registered(id)?;
        self.resolve_fault(id)?;
        self.resolve_to_many(id, relationship)?;
        Ok(self.member_ids(id, relationship))
    }
}

impl fmt::Debug for ObjectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectContext")
            .field("id", &self.inner.id)
            .field("parent", &self.parent().map(|p| p.id()))
            .field("objects", &self.registered_objects())
            .finish()
    }
}
