//! Identity map, per-object diffs, and the change log of one context.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use indexmap::IndexMap;
use strata_diff::{ArcKind, CompoundDiff, GraphChangeHandler, GraphDiff, ObjectDiff};
use strata_map::{EntityResolver, PropertyKind, DB_ARC_PREFIX};
use strata_types::{ObjectId, PersistenceState, Snapshot, Value};
use tracing::{debug, warn};

use crate::change_log::ChangeLog;
use crate::error::{GraphError, GraphResult};
use crate::object::{map_key_of, Collection, ObjectRef, PersistentObject};

/// What part of a lazily opened baseline must be patched with the value the
/// property had before the change being recorded.
enum Baseline<'a> {
    Untouched,
    Property(&'a str, &'a Value),
    Arc(&'a str),
}

/// The reverse side of a relationship.
struct Reverse {
    name: String,
    to_many: bool,
}

/// Graph state captured by [`GraphManager::savepoint`].
#[derive(Debug)]
pub struct Savepoint {
    objects: IndexMap<ObjectId, (ObjectRef, PersistenceState)>,
    diffs: IndexMap<ObjectId, ObjectDiff>,
    log_len: usize,
}

/// Owner of every live object in one context.
///
/// The manager enforces uniquing (one instance per id), keeps one
/// [`ObjectDiff`] per touched object, and appends every recorded operation
/// to its [`ChangeLog`]. Editing methods mutate an object and record the
/// change in one step, optionally maintaining the reverse relationship.
pub struct GraphManager {
    resolver: Arc<EntityResolver>,
    objects: IndexMap<ObjectId, ObjectRef>,
    diffs: IndexMap<ObjectId, ObjectDiff>,
    log: ChangeLog,
}

impl GraphManager {
    pub fn new(resolver: Arc<EntityResolver>) -> Self {
        Self {
            resolver,
            objects: IndexMap::new(),
            diffs: IndexMap::new(),
            log: ChangeLog::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    // ---------------------------------------------------------------
    // Identity map
    // ---------------------------------------------------------------

    /// Register `object` under its id.
    ///
    /// Registering the same instance twice is a no-op; a different instance
    /// under an equal id is rejected.
    pub fn register_node(&mut self, object: ObjectRef) -> GraphResult<()> {
        let id = object.id();
        if let Some(existing) = self.objects.get(&id) {
            if existing.same_instance(&object) {
                return Ok(());
            }
            return Err(GraphError::DuplicateIdentity(id));
        }
        debug!(id = %id, state = %object.state(), "node registered");
        self.objects.insert(id, object);
        Ok(())
    }

    pub fn unregister_node(&mut self, id: &ObjectId) -> Option<ObjectRef> {
        let removed = self.objects.shift_remove(id);
        if removed.is_some() {
            debug!(id = %id, "node unregistered");
        }
        removed
    }

    pub fn get_node(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.objects.get(id).cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Registered objects in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ObjectRef> {
        self.objects.values()
    }

    fn require(&self, id: &ObjectId) -> GraphResult<ObjectRef> {
        self.get_node(id)
            .ok_or_else(|| GraphError::UnknownObject(id.clone()))
    }

    /// Create and register a NEW object with a fresh temporary id.
    pub fn new_object(&mut self, entity: &str) -> GraphResult<ObjectRef> {
        self.insert_new(ObjectId::temporary(entity))
    }

    /// Create and register a NEW object under `id`.
    pub fn insert_new(&mut self, id: ObjectId) -> GraphResult<ObjectRef> {
        let object = ObjectRef::new(PersistentObject::new(id));
        self.register_new(object.clone())?;
        Ok(object)
    }

    /// Register a caller-built TRANSIENT object as NEW. Values already set
    /// on it become part of its insert.
    pub fn register_new(&mut self, object: ObjectRef) -> GraphResult<()> {
        let id = object.id();
        let descriptor = self.resolver.class_descriptor(id.entity_name())?;
        if self.objects.contains_key(&id) {
            return Err(GraphError::DuplicateIdentity(id));
        }
        {
            let entity = self.resolver.obj_entity(id.entity_name())?;
            let mut inner = object.borrow_mut();
            for name in &descriptor.to_many {
                if inner.to_many(name).is_none() {
                    let keyed = entity
                        .relationship(name)
                        .is_some_and(|r| r.map_key.is_some());
                    inner.init_to_many(name, keyed);
                }
            }
            inner.set_state(PersistenceState::New);
        }
        self.register_node(object)?;
        self.node_created(&id);
        Ok(())
    }

    /// The registered object for `id`, or a new HOLLOW placeholder.
    pub fn local_node(&mut self, id: &ObjectId) -> GraphResult<ObjectRef> {
        if let Some(object) = self.get_node(id) {
            return Ok(object);
        }
        self.resolver.class_descriptor(id.entity_name())?;
        let object = ObjectRef::new(PersistentObject::hollow(id.clone()));
        self.register_node(object.clone())?;
        Ok(object)
    }

    // ---------------------------------------------------------------
    // Recording
    // ---------------------------------------------------------------

    pub fn node_created(&mut self, id: &ObjectId) {
        match self.diffs.get_mut(id) {
            Some(diff) => diff.record_created(),
            None => {
                self.diffs.insert(id.clone(), ObjectDiff::for_new(id.clone()));
            }
        }
        self.log.add(GraphDiff::NodeCreate { id: id.clone() });
    }

    pub fn node_removed(&mut self, id: &ObjectId) {
        self.diff_for(id, Baseline::Untouched).record_removed();
        self.log.add(GraphDiff::NodeRemove { id: id.clone() });
    }

    /// Record an attribute change. The object itself must already hold
    /// `new`.
    pub fn node_property_changed(&mut self, id: &ObjectId, property: &str, old: &Value, new: &Value) {
        self.diff_for(id, Baseline::Property(property, old))
            .record_property(property, old, new);
        self.mark_modified(id);
        self.log.add(GraphDiff::PropertyChange {
            id: id.clone(),
            property: property.to_string(),
            old: old.clone(),
            new: new.clone(),
        });
    }

    pub fn arc_created(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) {
        self.record_arc(id, target, arc, false);
        self.log.add(GraphDiff::ArcCreate {
            id: id.clone(),
            target: target.clone(),
            arc: arc.to_string(),
        });
    }

    pub fn arc_deleted(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) {
        self.record_arc(id, target, arc, true);
        self.log.add(GraphDiff::ArcDelete {
            id: id.clone(),
            target: target.clone(),
            arc: arc.to_string(),
        });
    }

    /// Re-key a single object. See [`Self::remap_ids`].
    pub fn node_id_changed(&mut self, id: &ObjectId, new_id: &ObjectId) {
        self.remap_ids(&HashMap::from([(id.clone(), new_id.clone())]));
    }

    /// Replace ids everywhere in one step: the identity map, every object's
    /// own id and relationship targets, pending diffs, and the change log.
    pub fn remap_ids(&mut self, changes: &HashMap<ObjectId, ObjectId>) {
        if changes.is_empty() {
            return;
        }
        let objects = std::mem::take(&mut self.objects);
        for (id, object) in objects {
            object.borrow_mut().remap(changes);
            let key = changes.get(&id).cloned().unwrap_or(id);
            self.objects.insert(key, object);
        }
        let diffs = std::mem::take(&mut self.diffs);
        for (id, mut diff) in diffs {
            diff.remap_ids(changes);
            let key = changes.get(&id).cloned().unwrap_or(id);
            self.diffs.insert(key, diff);
        }
        self.log.remap_ids(changes);
        debug!(count = changes.len(), "node ids changed");
    }

    fn record_arc(&mut self, id: &ObjectId, target: &ObjectId, arc: &str, delete: bool) {
        let kind = self.arc_kind(id, arc);
        self.diff_for(id, Baseline::Arc(arc))
            .record_arc(kind, arc, target, delete);
        self.mark_modified(id);
    }

    fn arc_kind(&self, id: &ObjectId, arc: &str) -> ArcKind {
        if arc.starts_with(DB_ARC_PREFIX) {
            return ArcKind::Phantom;
        }
        let kind = self
            .resolver
            .class_descriptor(id.entity_name())
            .ok()
            .and_then(|d| d.property_kind(arc));
        match kind {
            Some(PropertyKind::ToMany) => ArcKind::ToMany,
            Some(PropertyKind::Flattened) => ArcKind::Flattened,
            _ => ArcKind::ToOne,
        }
    }

    fn diff_for(&mut self, id: &ObjectId, baseline: Baseline<'_>) -> &mut ObjectDiff {
        let objects = &self.objects;
        self.diffs
            .entry(id.clone())
            .or_insert_with(|| open_diff(objects, id, baseline))
    }

    fn mark_modified(&self, id: &ObjectId) {
        if let Some(object) = self.objects.get(id) {
            let state = object.state();
            if matches!(state, PersistenceState::Committed | PersistenceState::Hollow) {
                object.borrow_mut().set_state(PersistenceState::Modified);
                debug!(id = %id, from = %state, "node modified");
            }
        }
    }

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    /// Ids of NEW, MODIFIED and DELETED objects, optionally only those in
    /// `state`.
    pub fn dirty_nodes(&self, state: Option<PersistenceState>) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, object)| {
                let current = object.state();
                current.is_dirty() && state.map_or(true, |s| s == current)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        self.objects.values().any(|o| o.state().is_dirty())
    }

    pub fn diff(&self, id: &ObjectId) -> Option<&ObjectDiff> {
        self.diffs.get(id)
    }

    pub fn object_diffs(&self) -> impl Iterator<Item = &ObjectDiff> {
        self.diffs.values()
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut ChangeLog {
        &mut self.log
    }

    /// Net changes of every object as one replayable diff: node creations
    /// first, then attribute and arc changes, then node removals.
    pub fn get_diffs(&self) -> CompoundDiff {
        let mut created = Vec::new();
        let mut changed = Vec::new();
        let mut removed = Vec::new();
        for diff in self.diffs.values() {
            for op in diff.to_diffs() {
                match op {
                    GraphDiff::NodeCreate { .. } => created.push(op),
                    GraphDiff::NodeRemove { .. } => removed.push(op),
                    _ => changed.push(op),
                }
            }
        }
        let mut compound = CompoundDiff::from_diffs(created);
        compound.extend(changed);
        compound.extend(removed);
        compound
    }

    // ---------------------------------------------------------------
    // Editing
    // ---------------------------------------------------------------

    fn check_kind(&self, id: &ObjectId, property: &str, wanted: &[PropertyKind], expected: &'static str) -> GraphResult<()> {
        let descriptor = self.resolver.class_descriptor(id.entity_name())?;
        match descriptor.property_kind(property) {
            Some(kind) if wanted.contains(&kind) => Ok(()),
            _ => Err(GraphError::WrongPropertyKind {
                entity: id.entity_name().to_string(),
                property: property.to_string(),
                expected,
            }),
        }
    }

    fn writable(&self, id: &ObjectId) -> GraphResult<ObjectRef> {
        let object = self.require(id)?;
        if object.state() == PersistenceState::Deleted {
            return Err(GraphError::ObjectDeleted(id.clone()));
        }
        Ok(object)
    }

    /// Set an attribute and record the change.
    pub fn write_property(&mut self, id: &ObjectId, property: &str, value: Value) -> GraphResult<()> {
        self.check_kind(id, property, &[PropertyKind::Attribute], "an attribute")?;
        let object = self.writable(id)?;
        let old = object.borrow_mut().set_value(property, value.clone());
        if old != value {
            self.node_property_changed(id, property, &old, &value);
        }
        Ok(())
    }

    /// Point a to-one relationship at `target` (or clear it).
    pub fn set_to_one(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        target: Option<&ObjectId>,
        set_reverse: bool,
    ) -> GraphResult<()> {
        self.check_kind(id, relationship, &[PropertyKind::ToOne], "a to-one relationship")?;
        // Clearing is allowed on DELETED objects so delete rules can detach them.
        let object = match target {
            Some(_) => self.writable(id)?,
            None => self.require(id)?,
        };
        let old = object.borrow().to_one_target(relationship).cloned();
        if old.as_ref() == target {
            return Ok(());
        }
        let reverse = if set_reverse { self.reverse_of(id.entity_name(), relationship) } else { None };
        if let Some(target) = target {
            self.check_reverse_holder(target, reverse.as_ref())?;
        }

        object.borrow_mut().set_to_one(relationship, target.cloned());
        if let Some(old) = &old {
            self.arc_deleted(id, old, relationship);
        }
        if let Some(target) = target {
            self.arc_created(id, target, relationship);
        }

        if let Some(reverse) = reverse {
            if let Some(old) = &old {
                self.unset_reverse(old, &reverse, id)?;
            }
            if let Some(target) = target {
                self.set_reverse(target, &reverse, id)?;
            }
        }
        Ok(())
    }

    /// Add `target` to a to-many relationship.
    pub fn add_to_many(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        target: &ObjectId,
        set_reverse: bool,
    ) -> GraphResult<()> {
        self.check_kind(id, relationship, &[PropertyKind::ToMany, PropertyKind::Flattened], "a to-many relationship")?;
        let object = self.writable(id)?;
        let reverse = if set_reverse { self.reverse_of(id.entity_name(), relationship) } else { None };
        self.check_reverse_holder(target, reverse.as_ref())?;
        let key = self.map_key_for(id.entity_name(), relationship, target);
        let added = object
            .borrow_mut()
            .to_many_mut(relationship)
            .add(target.clone(), key);
        if !added {
            return Ok(());
        }
        self.arc_created(id, target, relationship);

        if set_reverse {
            match reverse {
                Some(reverse) if reverse.to_many => {
                    self.add_to_many(target, &reverse.name, id, false)?;
                }
                Some(reverse) => {
                    self.set_to_one(target, &reverse.name, Some(id), true)?;
                }
                None => self.record_phantom(target, id, relationship, false),
            }
        }
        Ok(())
    }

    /// Remove `target` from a to-many relationship.
    pub fn remove_to_many(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        target: &ObjectId,
        set_reverse: bool,
    ) -> GraphResult<()> {
        self.check_kind(id, relationship, &[PropertyKind::ToMany, PropertyKind::Flattened], "a to-many relationship")?;
        let object = self.require(id)?;
        let removed = object.borrow_mut().to_many_mut(relationship).remove(target);
        if !removed {
            return Ok(());
        }
        self.arc_deleted(id, target, relationship);

        if set_reverse {
            match self.reverse_of(id.entity_name(), relationship) {
                Some(reverse) => self.unset_reverse(target, &reverse, id)?,
                None => self.record_phantom(target, id, relationship, true),
            }
        }
        Ok(())
    }

    /// Record a foreign-key arc with no navigable property behind it.
    pub fn record_phantom(&mut self, id: &ObjectId, source: &ObjectId, relationship: &str, delete: bool) {
        let Some(arc) = self.phantom_arc(source.entity_name(), relationship) else {
            warn!(
                entity = source.entity_name(),
                relationship,
                "no reverse db relationship, foreign key change not recorded"
            );
            return;
        };
        if delete {
            self.arc_deleted(id, source, &arc);
        } else {
            self.arc_created(id, source, &arc);
        }
    }

    fn phantom_arc(&self, entity: &str, relationship: &str) -> Option<String> {
        let db_rel = self.resolver.single_step(entity, relationship).ok()?;
        let table = self.resolver.db_entity_for(entity).ok()?;
        let reverse = self.resolver.reverse_db_relationship(&table.name, db_rel)?;
        Some(format!("{DB_ARC_PREFIX}{}", reverse.name))
    }

    /// Mark an object deleted, or drop it when it never reached storage.
    pub fn delete_node(&mut self, id: &ObjectId) -> GraphResult<PersistenceState> {
        let object = self.require(id)?;
        let state = object.state();
        let next = match state {
            PersistenceState::New => {
                self.node_removed(id);
                self.unregister_node(id);
                PersistenceState::Transient
            }
            PersistenceState::Deleted | PersistenceState::Transient => return Ok(state),
            _ => {
                self.node_removed(id);
                PersistenceState::Deleted
            }
        };
        object.borrow_mut().set_state(next);
        debug!(id = %id, from = %state, to = %next, "node deleted");
        Ok(next)
    }

    /// Fails when the reverse side of an edit cannot be written, so the
    /// edit is rejected before either side changes.
    fn check_reverse_holder(&self, holder: &ObjectId, reverse: Option<&Reverse>) -> GraphResult<()> {
        if reverse.is_some() && self.contains(holder) {
            self.writable(holder)?;
        }
        Ok(())
    }

    fn set_reverse(&mut self, holder: &ObjectId, reverse: &Reverse, source: &ObjectId) -> GraphResult<()> {
        if !self.contains(holder) {
            return Ok(());
        }
        if reverse.to_many {
            self.add_to_many(holder, &reverse.name, source, false)
        } else {
            self.set_to_one(holder, &reverse.name, Some(source), false)
        }
    }

    fn unset_reverse(&mut self, holder: &ObjectId, reverse: &Reverse, source: &ObjectId) -> GraphResult<()> {
        let Some(object) = self.get_node(holder) else {
            return Ok(());
        };
        if reverse.to_many {
            self.remove_to_many(holder, &reverse.name, source, false)
        } else {
            let points_back = object.borrow().to_one_target(&reverse.name) == Some(source);
            if points_back {
                self.set_to_one(holder, &reverse.name, None, false)?;
            }
            Ok(())
        }
    }

    fn reverse_of(&self, entity: &str, relationship: &str) -> Option<Reverse> {
        let reverse = self.resolver.reverse_relationship(entity, relationship)?;
        let target = &self.resolver.relationship(entity, relationship).ok()?.target;
        Some(Reverse {
            name: reverse.name.clone(),
            to_many: self.resolver.is_to_many(target, &reverse.name),
        })
    }

    fn map_key_for(&self, entity: &str, relationship: &str, target: &ObjectId) -> Option<String> {
        let rel = self.resolver.relationship(entity, relationship).ok()?;
        let key = rel.map_key.as_ref()?;
        let value = self.objects.get(target).and_then(|o| o.value(key));
        Some(map_key_of(value.as_ref()))
    }

    // ---------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------

    /// Install a fetched row on a registered object. HOLLOW objects become
    /// COMMITTED; to-many relationships become faults.
    pub fn inflate(
        &mut self,
        id: &ObjectId,
        values: Snapshot,
        to_one: BTreeMap<String, Option<ObjectId>>,
    ) -> GraphResult<()> {
        let object = self.require(id)?;
        let mut inner = object.borrow_mut();
        inner.load(values, to_one);
        if inner.state() == PersistenceState::Hollow {
            inner.set_state(PersistenceState::Committed);
        }
        debug!(id = %id, "node inflated");
        Ok(())
    }

    /// Drop loaded values and turn a COMMITTED object back into a fault.
    pub fn make_hollow(&mut self, id: &ObjectId) -> GraphResult<bool> {
        let object = self.require(id)?;
        let mut inner = object.borrow_mut();
        if inner.state() != PersistenceState::Committed {
            return Ok(false);
        }
        inner.unload();
        inner.set_state(PersistenceState::Hollow);
        Ok(true)
    }

    /// Install the fetched members of a faulted to-many relationship,
    /// merging changes queued while it was a fault.
    pub fn resolve_to_many(&mut self, id: &ObjectId, relationship: &str, targets: Vec<ObjectId>) -> GraphResult<()> {
        let object = self.require(id)?;
        if !object.borrow().is_to_many_fault(relationship) {
            return Ok(());
        }
        let key_attr = self
            .resolver
            .relationship(id.entity_name(), relationship)?
            .map_key
            .clone();

        let pending: Vec<ObjectId> = object
            .borrow()
            .to_many(relationship)
            .map(|m| m.pending().0.to_vec())
            .unwrap_or_default();
        let key_of = |target: &ObjectId| {
            key_attr.as_ref().map(|attr| {
                let value = self.objects.get(target).and_then(|o| o.value(attr));
                map_key_of(value.as_ref())
            })
        };
        let keys: HashMap<ObjectId, Option<String>> = targets
            .iter()
            .chain(&pending)
            .map(|t| (t.clone(), key_of(t)))
            .collect();

        let fetched = match &key_attr {
            Some(_) => Collection::Map(
                targets
                    .iter()
                    .map(|t| (keys.get(t).cloned().flatten().unwrap_or_default(), t.clone()))
                    .collect(),
            ),
            None => Collection::List(targets),
        };
        object
            .borrow_mut()
            .to_many_mut(relationship)
            .resolve(fetched, |t| keys.get(t).cloned().flatten());
        Ok(())
    }

    pub fn set_state(&mut self, id: &ObjectId, state: PersistenceState) -> GraphResult<()> {
        self.require(id)?.borrow_mut().set_state(state);
        Ok(())
    }

    /// Re-key map relationships whose target key attribute changed.
    ///
    /// Returns a delete/create arc pair per moved entry. Nothing is recorded.
    pub fn repair_map_keys(&mut self) -> Vec<GraphDiff> {
        let mut repairs = Vec::new();
        for (source_id, source) in &self.objects {
            let Ok(entity) = self.resolver.obj_entity(source_id.entity_name()) else {
                continue;
            };
            for rel in entity.relationships.iter().filter(|r| r.map_key.is_some()) {
                let Some(key_attr) = &rel.map_key else { continue };
                let entries: Vec<(String, ObjectId)> = match source
                    .borrow()
                    .to_many(&rel.name)
                    .and_then(|m| m.collection())
                {
                    Some(Collection::Map(map)) => {
                        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                    }
                    _ => continue,
                };
                for (key, target) in entries {
                    let current = self
                        .objects
                        .get(&target)
                        .map(|t| map_key_of(t.value(key_attr).as_ref()));
                    let Some(current) = current else { continue };
                    if current == key {
                        continue;
                    }
                    source.borrow_mut().to_many_mut(&rel.name).rekey(&target, current);
                    repairs.push(GraphDiff::ArcDelete {
                        id: source_id.clone(),
                        target: target.clone(),
                        arc: rel.name.clone(),
                    });
                    repairs.push(GraphDiff::ArcCreate {
                        id: source_id.clone(),
                        target,
                        arc: rel.name.clone(),
                    });
                }
            }
        }
        if !repairs.is_empty() {
            debug!(count = repairs.len() / 2, "map relationships re-keyed");
        }
        repairs
    }

    // ---------------------------------------------------------------
    // Checkpoints
    // ---------------------------------------------------------------

    /// Accept every change as the new baseline: DELETED objects leave the
    /// graph, NEW and MODIFIED objects become COMMITTED.
    pub fn post_commit(&mut self) {
        for id in self.dirty_nodes(None) {
            let Some(object) = self.get_node(&id) else { continue };
            if object.state() == PersistenceState::Deleted {
                self.unregister_node(&id);
                object.borrow_mut().set_state(PersistenceState::Transient);
            } else {
                object.borrow_mut().set_state(PersistenceState::Committed);
            }
        }
        self.diffs.clear();
        self.log.clear();
    }

    /// Undo every change since the last checkpoint.
    pub fn rollback(&mut self) {
        let log = std::mem::take(&mut self.log);
        let mut reverter = Reverter { graph: self };
        for op in log.iter().rev() {
            match op.undo(&mut reverter) {
                Ok(()) => {}
                Err(never) => match never {},
            }
        }

        let diffs = std::mem::take(&mut self.diffs);
        for (id, diff) in diffs {
            let Some(object) = self.get_node(&id) else { continue };
            if diff.is_created() {
                self.unregister_node(&id);
                object.borrow_mut().set_state(PersistenceState::Transient);
            } else if object.state().is_dirty() {
                object.borrow_mut().set_state(PersistenceState::Committed);
            }
        }
        debug!(undone = log.len(), "graph rolled back");
    }

    /// Capture registrations, states and diffs so a failed operation can
    /// be undone with [`restore`](Self::restore).
    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            objects: self
                .objects
                .iter()
                .map(|(id, object)| (id.clone(), (object.clone(), object.state())))
                .collect(),
            diffs: self.diffs.clone(),
            log_len: self.log.len(),
        }
    }

    /// Return to `savepoint`, undoing every change recorded since.
    ///
    /// Objects loaded in the meantime stay registered and return to
    /// COMMITTED; objects created in the meantime are dropped. HOLLOW
    /// objects that were inflated become HOLLOW again.
    pub fn restore(&mut self, savepoint: Savepoint) {
        let undone = self.log.split_off(savepoint.log_len);
        let mut reverter = Reverter { graph: self };
        for op in undone.iter().rev() {
            match op.undo(&mut reverter) {
                Ok(()) => {}
                Err(never) => match never {},
            }
        }

        let mut objects = IndexMap::with_capacity(self.objects.len());
        for (id, (object, _)) in &savepoint.objects {
            objects.insert(id.clone(), object.clone());
        }
        for (id, object) in &self.objects {
            if objects.contains_key(id) {
                continue;
            }
            match object.state() {
                PersistenceState::New => {
                    object.borrow_mut().set_state(PersistenceState::Transient);
                    continue;
                }
                state if state.is_dirty() => {
                    object.borrow_mut().set_state(PersistenceState::Committed);
                }
                _ => {}
            }
            objects.insert(id.clone(), object.clone());
        }
        self.objects = objects;

        for (object, state) in savepoint.objects.into_values() {
            if object.state() == state {
                continue;
            }
            let mut inner = object.borrow_mut();
            if state == PersistenceState::Hollow {
                inner.unload();
            }
            inner.set_state(state);
        }
        self.diffs = savepoint.diffs;
        debug!(undone = undone.len(), "graph restored to savepoint");
    }
}

impl std::fmt::Debug for GraphManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphManager")
            .field("objects", &self.objects.len())
            .field("diffs", &self.diffs.len())
            .field("log", &self.log.len())
            .finish()
    }
}

fn open_diff(objects: &IndexMap<ObjectId, ObjectRef>, id: &ObjectId, baseline: Baseline<'_>) -> ObjectDiff {
    let Some(object) = objects.get(id) else {
        return ObjectDiff::with_baseline(id.clone(), Snapshot::new(), BTreeMap::new());
    };
    let object = object.borrow();
    if object.state() == PersistenceState::New {
        return ObjectDiff::for_new(id.clone());
    }
    let mut snapshot = object.values().clone();
    let mut arcs = object.to_one_map().clone();
    match baseline {
        Baseline::Untouched => {}
        Baseline::Property(property, old) => {
            snapshot.insert(property.to_string(), old.clone());
        }
        Baseline::Arc(arc) => {
            arcs.remove(arc);
        }
    }
    ObjectDiff::with_baseline(id.clone(), snapshot, arcs)
}

/// Applies undone operations to objects without recording them.
struct Reverter<'a> {
    graph: &'a mut GraphManager,
}

impl Reverter<'_> {
    fn apply_arc(&mut self, id: &ObjectId, target: &ObjectId, arc: &str, create: bool) {
        let Some(object) = self.graph.get_node(id) else { return };
        match self.graph.arc_kind(id, arc) {
            ArcKind::Phantom => {}
            ArcKind::ToOne => {
                let mut inner = object.borrow_mut();
                if create {
                    inner.set_to_one(arc, Some(target.clone()));
                } else if inner.to_one_target(arc) == Some(target) {
                    inner.set_to_one(arc, None);
                }
            }
            ArcKind::ToMany | ArcKind::Flattened => {
                if create {
                    let key = self.graph.map_key_for(id.entity_name(), arc, target);
                    object.borrow_mut().to_many_mut(arc).add(target.clone(), key);
                } else {
                    object.borrow_mut().to_many_mut(arc).remove(target);
                }
            }
        }
    }
}

impl GraphChangeHandler for Reverter<'_> {
    type Error = Infallible;

    fn node_created(&mut self, _: &ObjectId) -> Result<(), Infallible> {
        Ok(())
    }

    fn node_removed(&mut self, _: &ObjectId) -> Result<(), Infallible> {
        Ok(())
    }

    fn node_id_changed(&mut self, id: &ObjectId, new_id: &ObjectId) -> Result<(), Infallible> {
        self.graph.node_id_changed(id, new_id);
        Ok(())
    }

    fn node_property_changed(&mut self, id: &ObjectId, property: &str, _: &Value, new: &Value) -> Result<(), Infallible> {
        if let Some(object) = self.graph.get_node(id) {
            object.borrow_mut().set_value(property, new.clone());
        }
        Ok(())
    }

    fn arc_created(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) -> Result<(), Infallible> {
        self.apply_arc(id, target, arc, true);
        Ok(())
    }

    fn arc_deleted(&mut self, id: &ObjectId, target: &ObjectId, arc: &str) -> Result<(), Infallible> {
        self.apply_arc(id, target, arc, false);
        Ok(())
    }
}
