//! Translating dirty objects into insert, update and delete batches.

use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::IndexMap;
use strata_diff::ObjectDiff;
use strata_graph::{GraphManager, PersistentObject};
use strata_map::{
    DbEntity, DbRelationship, EntityResolver, ObjAttribute, ObjEntity, PropertyKind, DB_ARC_PREFIX,
};
use strata_store::Storage;
use strata_types::{ObjectId, PersistenceState, Snapshot, Value};
use tracing::{debug, warn};

use crate::deferred::{DeferredValue, ReplacementMap};
use crate::descriptor::{BatchDescriptor, DeleteRowPlan, InsertRowPlan, RowKind, UpdateRowPlan};
use crate::error::{FlushError, FlushResult};
use crate::qualifier::{Qualifier, QualifierBuilder};
use crate::sorter::{layers, EntitySorter};

/// Everything a flush will write, before ordering.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub batches: Vec<BatchDescriptor>,
    /// Primary keys known before execution: meaningful keys, keys drawn
    /// from a sequence, and rewritten keys of stored objects.
    pub replacements: ReplacementMap,
    pub inserted: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
    /// Stored objects whose primary key is being rewritten.
    pub key_changes: Vec<ObjectId>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

type InsertShape = (String, Vec<String>);
type UpdateShape = (String, Vec<String>, Vec<String>, Vec<String>);
type DeleteShape = (String, Vec<String>, Vec<String>);
type JoinRowKey = (String, bool, BTreeMap<String, ObjectId>);

/// Rows grouped by statement shape.
#[derive(Default)]
struct Buckets {
    inserts: IndexMap<InsertShape, Vec<InsertRowPlan>>,
    updates: IndexMap<UpdateShape, Vec<UpdateRowPlan>>,
    deletes: IndexMap<DeleteShape, Vec<DeleteRowPlan>>,
    /// Deleted object -> deleted objects of the same table referencing it.
    referenced_by: HashMap<ObjectId, Vec<ObjectId>>,
    join_rows: HashSet<JoinRowKey>,
}

impl Buckets {
    fn insert(&mut self, table: &str, object: &ObjectId, kind: RowKind, row: BTreeMap<String, DeferredValue>) {
        let columns: Vec<String> = row.keys().cloned().collect();
        let values = row.into_values().collect();
        self.inserts
            .entry((table.to_string(), columns))
            .or_default()
            .push(InsertRowPlan {
                object: object.clone(),
                kind,
                values,
            });
    }

    fn update(
        &mut self,
        table: &str,
        object: &ObjectId,
        kind: RowKind,
        set: BTreeMap<String, DeferredValue>,
        qualifier: Qualifier,
    ) {
        let shape = (
            table.to_string(),
            set.keys().cloned().collect(),
            qualifier.columns(),
            qualifier.null_columns(),
        );
        self.updates.entry(shape).or_default().push(UpdateRowPlan {
            object: object.clone(),
            kind,
            values: set.into_values().collect(),
            qualifier: qualifier.values(),
            locking: qualifier.locking,
        });
    }

    fn delete(&mut self, table: &str, object: &ObjectId, kind: RowKind, qualifier: Qualifier) {
        let shape = (table.to_string(), qualifier.columns(), qualifier.null_columns());
        self.deletes.entry(shape).or_default().push(DeleteRowPlan {
            object: object.clone(),
            kind,
            qualifier: qualifier.values(),
            locking: qualifier.locking,
        });
    }

    fn into_batches(self, sorter: &EntitySorter) -> Vec<BatchDescriptor> {
        let mut batches = Vec::new();
        for ((table, columns), rows) in self.inserts {
            let layered = if sorter.is_reflexive(&table) {
                layers(rows, |r| r.object.clone(), |r| propagated_sources(&r.values))
            } else {
                vec![rows]
            };
            for (layer, rows) in layered.into_iter().enumerate() {
                batches.push(BatchDescriptor::Insert {
                    table: table.clone(),
                    layer,
                    columns: columns.clone(),
                    rows,
                });
            }
        }
        for ((table, set_columns, qualifier_columns, null_qualifier_columns), rows) in self.updates {
            batches.push(BatchDescriptor::Update {
                table,
                set_columns,
                qualifier_columns,
                null_qualifier_columns,
                rows,
            });
        }
        for ((table, qualifier_columns, null_qualifier_columns), rows) in self.deletes {
            let layered = if sorter.is_reflexive(&table) {
                let referenced_by = &self.referenced_by;
                layers(
                    rows,
                    |r| r.object.clone(),
                    |r| referenced_by.get(&r.object).cloned().unwrap_or_default(),
                )
            } else {
                vec![rows]
            };
            for (layer, rows) in layered.into_iter().enumerate() {
                batches.push(BatchDescriptor::Delete {
                    table: table.clone(),
                    layer,
                    qualifier_columns: qualifier_columns.clone(),
                    null_qualifier_columns: null_qualifier_columns.clone(),
                    rows,
                });
            }
        }
        batches
    }
}

fn propagated_sources(values: &[DeferredValue]) -> Vec<ObjectId> {
    values
        .iter()
        .filter_map(|v| match v {
            DeferredValue::PropagatedFrom { object, .. } => Some(object.clone()),
            DeferredValue::Literal(_) => None,
        })
        .collect()
}

/// Flattened attributes of one dependent table.
struct DependentTable<'m> {
    relationship: &'m DbRelationship,
    table: &'m DbEntity,
    /// (attribute, column) pairs.
    columns: Vec<(&'m ObjAttribute, String)>,
}

/// Sorts dirty objects into sync buckets and builds their rows.
pub struct Classifier<'a> {
    graph: &'a GraphManager,
    resolver: &'a EntityResolver,
    storage: &'a dyn Storage,
    sorter: &'a EntitySorter,
}

impl<'a> Classifier<'a> {
    pub fn new(graph: &'a GraphManager, storage: &'a dyn Storage, sorter: &'a EntitySorter) -> Self {
        Self {
            graph,
            resolver: graph.resolver(),
            storage,
            sorter,
        }
    }

    /// Build the batches for `dirty`.
    ///
    /// NEW objects become inserts of their root row and any non-empty
    /// dependent rows. MODIFIED objects become updates of the columns
    /// whose values changed. DELETED objects become deletes of their
    /// dependent rows and root row. Flattened relationship changes of any
    /// object become join-row inserts and deletes.
    pub fn classify(&self, dirty: &[ObjectId]) -> FlushResult<FlushPlan> {
        let mut plan = FlushPlan::default();
        let mut buckets = Buckets::default();
        for id in dirty {
            let Some(object) = self.graph.get_node(id) else { continue };
            let object = object.borrow();
            match object.state() {
                PersistenceState::New => self.classify_insert(&object, &mut buckets, &mut plan)?,
                PersistenceState::Modified => self.classify_update(&object, &mut buckets, &mut plan)?,
                PersistenceState::Deleted => self.classify_delete(&object, &mut buckets, &mut plan)?,
                _ => {}
            }
        }
        self.classify_join_rows(&mut buckets)?;
        plan.batches = buckets.into_batches(self.sorter);
        debug!(
            inserted = plan.inserted.len(),
            updated = plan.updated.len(),
            deleted = plan.deleted.len(),
            batches = plan.batches.len(),
            "objects classified"
        );
        Ok(plan)
    }

    fn classify_insert(&self, object: &PersistentObject, buckets: &mut Buckets, plan: &mut FlushPlan) -> FlushResult<()> {
        let id = object.id();
        let entity = self.resolver.obj_entity(id.entity_name())?;
        let table = self.resolver.db_entity(&entity.db_entity)?;

        let mut row: BTreeMap<String, DeferredValue> = BTreeMap::new();
        for attr in entity.attributes.iter().filter(|a| !a.is_flattened()) {
            let value = object.value(&attr.name).cloned().unwrap_or(Value::Null);
            row.insert(attr.db_path.clone(), value.into());
        }
        for (column, value) in self.foreign_key_columns(entity, |rel| object.to_one_target(rel).cloned())? {
            row.insert(column, value);
        }
        if let Some(diff) = self.graph.diff(id) {
            for (column, value) in self.phantom_columns(table, diff)? {
                row.insert(column, value);
            }
        }

        if let Some(key) = id.id_snapshot() {
            for (column, value) in key {
                let slot = row.entry(column.clone()).or_insert_with(DeferredValue::null);
                if slot.is_null() {
                    *slot = value.clone().into();
                }
            }
        }

        let mut known = Snapshot::new();
        for pk in table.primary_key() {
            match row.get(&pk.name) {
                Some(DeferredValue::Literal(value)) if !value.is_null() => {
                    known.insert(pk.name.clone(), value.clone());
                }
                Some(DeferredValue::PropagatedFrom { .. }) => {}
                _ if pk.generated => {
                    row.remove(&pk.name);
                }
                _ => {
                    let value = self.storage.next_primary_key(&table.name)?;
                    known.insert(pk.name.clone(), value.clone());
                    row.insert(pk.name.clone(), value.into());
                }
            }
        }
        if !known.is_empty() {
            plan.replacements.record(id, known);
        }
        buckets.insert(&table.name, id, RowKind::Root, row);

        for dependent in self.dependent_tables(entity)? {
            let values: BTreeMap<String, Value> = dependent
                .columns
                .iter()
                .map(|(attr, column)| {
                    let value = object.value(&attr.name).cloned().unwrap_or(Value::Null);
                    (column.clone(), value)
                })
                .collect();
            if values.values().all(Value::is_null) {
                continue;
            }
            let mut dependent_row: BTreeMap<String, DeferredValue> =
                values.into_iter().map(|(c, v)| (c, v.into())).collect();
            for join in &dependent.relationship.joins {
                dependent_row.insert(join.target.clone(), master_value(id, &join.source));
            }
            buckets.insert(&dependent.table.name, id, RowKind::Dependent, dependent_row);
        }
        plan.inserted.push(id.clone());
        Ok(())
    }

    fn classify_update(&self, object: &PersistentObject, buckets: &mut Buckets, plan: &mut FlushPlan) -> FlushResult<()> {
        let id = object.id();
        let Some(diff) = self.graph.diff(id) else {
            return Ok(());
        };
        let entity = self.resolver.obj_entity(id.entity_name())?;
        let table = self.resolver.db_entity(&entity.db_entity)?;
        let descriptor = self.resolver.class_descriptor(&entity.name)?;

        let mut set: BTreeMap<String, DeferredValue> = BTreeMap::new();
        let mut flattened: Vec<(&str, Value)> = Vec::new();
        for (property, _, new) in diff.changed_properties() {
            let Some(attr) = entity.attribute(property) else { continue };
            if attr.is_flattened() {
                flattened.push((property, new.clone()));
            } else {
                set.insert(attr.db_path.clone(), new.clone().into());
            }
        }
        for (arc, _, target) in diff.changed_arcs() {
            if arc.starts_with(DB_ARC_PREFIX) {
                continue;
            }
            if descriptor.property_kind(arc) != Some(PropertyKind::ToOne) {
                continue;
            }
            let Some(db_rel) = self.foreign_key(&entity.name, arc)? else { continue };
            for join in &db_rel.joins {
                let value = match target {
                    Some(target) => self.fk_value(target, &join.target)?,
                    None => DeferredValue::null(),
                };
                set.insert(join.source.clone(), value);
            }
        }
        for (column, value) in self.phantom_columns(table, diff)? {
            set.insert(column, value);
        }

        if !set.is_empty() {
            let qualifier = QualifierBuilder::new(self.resolver).root(object, Some(diff))?;
            let key_update: Snapshot = set
                .iter()
                .filter(|(column, _)| table.is_primary_key(column))
                .filter_map(|(column, value)| match value {
                    DeferredValue::Literal(v) => Some((column.clone(), v.clone())),
                    DeferredValue::PropagatedFrom { .. } => None,
                })
                .collect();
            if !key_update.is_empty() {
                let mut key = id.id_snapshot().cloned().unwrap_or_default();
                key.extend(key_update);
                plan.replacements.record(id, key);
                plan.key_changes.push(id.clone());
            }
            buckets.update(&table.name, id, RowKind::Root, set, qualifier);
        }

        if !flattened.is_empty() {
            for dependent in self.dependent_tables(entity)? {
                let changed: BTreeMap<String, DeferredValue> = dependent
                    .columns
                    .iter()
                    .filter_map(|(attr, column)| {
                        flattened
                            .iter()
                            .find(|(name, _)| *name == attr.name)
                            .map(|(_, value)| (column.clone(), value.clone().into()))
                    })
                    .collect();
                if changed.is_empty() {
                    continue;
                }
                let existed = dependent
                    .columns
                    .iter()
                    .any(|(attr, _)| diff.snapshot_value(&attr.name).is_some_and(|v| !v.is_null()));
                if existed {
                    let qualifier = QualifierBuilder::new(self.resolver).dependent(id, dependent.relationship)?;
                    buckets.update(&dependent.table.name, id, RowKind::Dependent, changed, qualifier);
                } else {
                    let mut row: BTreeMap<String, DeferredValue> = dependent
                        .columns
                        .iter()
                        .map(|(attr, column)| {
                            let value = object.value(&attr.name).cloned().unwrap_or(Value::Null);
                            (column.clone(), value.into())
                        })
                        .collect();
                    for join in &dependent.relationship.joins {
                        row.insert(join.target.clone(), master_value(id, &join.source));
                    }
                    buckets.insert(&dependent.table.name, id, RowKind::Dependent, row);
                }
            }
        }
        plan.updated.push(id.clone());
        Ok(())
    }

    fn classify_delete(&self, object: &PersistentObject, buckets: &mut Buckets, plan: &mut FlushPlan) -> FlushResult<()> {
        let id = object.id();
        if id.is_temporary() {
            return Ok(());
        }
        let entity = self.resolver.obj_entity(id.entity_name())?;
        let table = self.resolver.db_entity(&entity.db_entity)?;
        let diff = self.graph.diff(id);

        for dependent in self.dependent_tables(entity)? {
            let qualifier = QualifierBuilder::new(self.resolver).dependent(id, dependent.relationship)?;
            buckets.delete(&dependent.table.name, id, RowKind::Dependent, qualifier);
        }
        let qualifier = QualifierBuilder::new(self.resolver).root(object, diff)?;
        buckets.delete(&table.name, id, RowKind::Root, qualifier);

        if self.sorter.is_reflexive(&table.name) {
            let descriptor = self.resolver.class_descriptor(&entity.name)?;
            for name in &descriptor.to_one {
                let target = match diff {
                    Some(diff) => diff.arc_snapshot_value(name),
                    None => object.to_one_target(name),
                };
                let Some(target) = target else { continue };
                let same_table = self
                    .resolver
                    .db_entity_for(target.entity_name())
                    .is_ok_and(|t| t.name == table.name);
                if same_table && target != id {
                    buckets
                        .referenced_by
                        .entry(target.clone())
                        .or_default()
                        .push(id.clone());
                }
            }
        }
        plan.deleted.push(id.clone());
        Ok(())
    }

    /// Join-table rows for every flattened relationship change, once per
    /// row even when both sides recorded it.
    fn classify_join_rows(&self, buckets: &mut Buckets) -> FlushResult<()> {
        for diff in self.graph.object_diffs() {
            let source = diff.id();
            for op in diff.flattened_operations() {
                if !self.join_endpoint(source, op.delete) || !self.join_endpoint(&op.target, op.delete) {
                    continue;
                }
                let (first, join_table, second) = self
                    .resolver
                    .flattened_steps(source.entity_name(), &op.arc)
                    .map_err(FlushError::classifier)?;

                let mut row = BTreeMap::new();
                let mut identity = BTreeMap::new();
                for join in &first.joins {
                    row.insert(join.target.clone(), self.fk_value(source, &join.source)?);
                    identity.insert(join.target.clone(), source.clone());
                }
                for join in &second.joins {
                    row.insert(join.source.clone(), self.fk_value(&op.target, &join.target)?);
                    identity.insert(join.source.clone(), op.target.clone());
                }
                if !buckets
                    .join_rows
                    .insert((join_table.name.clone(), op.delete, identity))
                {
                    continue;
                }
                if op.delete {
                    let mut qualifier = Qualifier::default();
                    for (column, value) in row {
                        qualifier.add(column, value);
                    }
                    buckets.delete(&join_table.name, source, RowKind::Join, qualifier);
                } else {
                    buckets.insert(&join_table.name, source, RowKind::Join, row);
                }
            }
        }
        Ok(())
    }

    /// Whether a join row touching `id` can be written.
    fn join_endpoint(&self, id: &ObjectId, delete: bool) -> bool {
        let state = self.graph.get_node(id).map(|o| o.state());
        if delete {
            !id.is_temporary()
        } else {
            matches!(
                state,
                Some(
                    PersistenceState::New
                        | PersistenceState::Hollow
                        | PersistenceState::Committed
                        | PersistenceState::Modified
                )
            )
        }
    }

    /// Foreign-key columns of the root row from to-one relationships.
    fn foreign_key_columns(
        &self,
        entity: &ObjEntity,
        target_of: impl Fn(&str) -> Option<ObjectId>,
    ) -> FlushResult<Vec<(String, DeferredValue)>> {
        let descriptor = self.resolver.class_descriptor(&entity.name)?;
        let mut columns = Vec::new();
        for name in &descriptor.to_one {
            let Some(db_rel) = self.foreign_key(&entity.name, name)? else { continue };
            let target = target_of(name);
            for join in &db_rel.joins {
                let value = match &target {
                    Some(target) => self.fk_value(target, &join.target)?,
                    None => DeferredValue::null(),
                };
                columns.push((join.source.clone(), value));
            }
        }
        Ok(columns)
    }

    /// Foreign-key columns changed through arcs with no navigable property.
    fn phantom_columns(&self, table: &DbEntity, diff: &ObjectDiff) -> FlushResult<Vec<(String, DeferredValue)>> {
        let mut columns = Vec::new();
        for (arc, _, target) in diff.changed_arcs() {
            let Some(name) = arc.strip_prefix(DB_ARC_PREFIX) else { continue };
            let db_rel = self.resolver.db_relationship(&table.name, name)?;
            for join in &db_rel.joins {
                let value = match target {
                    Some(target) => self.fk_value(target, &join.target)?,
                    None => DeferredValue::null(),
                };
                columns.push((join.source.clone(), value));
            }
        }
        Ok(columns)
    }

    /// The db relationship behind a to-one property when this side holds the
    /// foreign key.
    fn foreign_key(&self, entity: &str, relationship: &str) -> FlushResult<Option<&'a DbRelationship>> {
        let resolver = self.resolver;
        let db_rel = resolver
            .single_step(entity, relationship)
            .map_err(FlushError::classifier)?;
        let target = resolver.db_entity(&db_rel.target)?;
        Ok(db_rel.is_foreign_key(target).then_some(db_rel))
    }

    fn dependent_tables(&self, entity: &'a ObjEntity) -> FlushResult<Vec<DependentTable<'a>>> {
        let mut tables: IndexMap<String, DependentTable<'a>> = IndexMap::new();
        for attr in entity.attributes.iter().filter(|a| a.is_flattened()) {
            let Some((relationship, table, column)) = self
                .resolver
                .dependent_table(&entity.name, attr)
                .map_err(FlushError::classifier)?
            else {
                continue;
            };
            tables
                .entry(table.name.clone())
                .or_insert_with(|| DependentTable {
                    relationship,
                    table,
                    columns: Vec::new(),
                })
                .columns
                .push((attr, column));
        }
        Ok(tables.into_values().collect())
    }

    /// Value of `column` in the row of `target`, deferred when that row is
    /// inserted by this flush. A stored target must carry the column in
    /// its id.
    fn fk_value(&self, target: &ObjectId, column: &str) -> FlushResult<DeferredValue> {
        if !target.is_temporary() {
            return target
                .key_value(column)
                .cloned()
                .map(DeferredValue::from)
                .ok_or_else(|| FlushError::Propagation {
                    object: target.clone(),
                    column: column.to_string(),
                });
        }
        let pending = self
            .graph
            .get_node(target)
            .is_some_and(|o| o.state() == PersistenceState::New);
        if pending {
            Ok(DeferredValue::PropagatedFrom {
                object: target.clone(),
                column: column.to_string(),
            })
        } else {
            warn!(target = %target, column, "reference to an object that will not be stored, writing null");
            Ok(DeferredValue::null())
        }
    }
}

/// A master's key column for its dependent or join rows.
fn master_value(id: &ObjectId, column: &str) -> DeferredValue {
    if id.is_temporary() {
        DeferredValue::PropagatedFrom {
            object: id.clone(),
            column: column.to_string(),
        }
    } else {
        id.key_value(column).cloned().unwrap_or(Value::Null).into()
    }
}
