//! The flush state machine.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use strata_diff::{CompoundDiff, GraphDiff, ObjectDiff};
use strata_graph::GraphManager;
use strata_map::EntityResolver;
use strata_store::{BatchOutcome, BatchStatement, Storage, TxHandle};
use strata_types::{ObjectId, PersistenceState, Snapshot, Value};
use tracing::{debug, info, warn};

use crate::cascade::DeleteAction;
use crate::classifier::{Classifier, FlushPlan};
use crate::deferred::ReplacementMap;
use crate::descriptor::{BatchDescriptor, RowKind};
use crate::error::{FlushError, FlushResult};
use crate::faults::FaultResolver;
use crate::rows::object_row;
use crate::sorter::EntitySorter;
use crate::validation::ValidationPipeline;

/// Steps of one flush, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlushStage {
    Collect,
    Cascade,
    Classify,
    Order,
    Execute,
    Remap,
    Finalize,
}

impl fmt::Display for FlushStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Collect => "collect",
            Self::Cascade => "cascade",
            Self::Classify => "classify",
            Self::Order => "order",
            Self::Execute => "execute",
            Self::Remap => "remap",
            Self::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Counts of what a flush wrote.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub batches: usize,
    /// Tables touched, in execution order.
    pub tables: Vec<String>,
}

impl CommitSummary {
    pub fn is_empty(&self) -> bool {
        self.batches == 0
    }
}

/// Everything a successful flush reports back.
#[derive(Debug)]
pub struct FlushOutcome {
    /// Id changes and map re-keying to replay on other graphs.
    pub result_diff: CompoundDiff,
    pub summary: CommitSummary,
    /// Row snapshots of every inserted or updated object, under its final id.
    pub modified_rows: Vec<(ObjectId, Snapshot)>,
    /// Ids whose rows no longer exist, including replaced primary keys.
    pub deleted_ids: Vec<ObjectId>,
}

impl FlushOutcome {
    fn empty() -> Self {
        Self {
            result_diff: CompoundDiff::new(),
            summary: CommitSummary::default(),
            modified_rows: Vec::new(),
            deleted_ids: Vec::new(),
        }
    }
}

/// Writes a graph's pending changes to storage.
///
/// `flush` runs COLLECT, CASCADE, CLASSIFY, ORDER, EXECUTE, REMAP and
/// FINALIZE. Errors before EXECUTE leave storage untouched and undo the
/// delete rules applied during CASCADE. An error during
/// EXECUTE rolls back the transaction the flush started, or marks the
/// caller's transaction rollback-only; the graph keeps its pending changes
/// either way.
pub struct FlushEngine<'a> {
    storage: &'a dyn Storage,
    sorter: &'a EntitySorter,
    faults: &'a dyn FaultResolver,
    validators: Option<&'a ValidationPipeline>,
}

impl<'a> FlushEngine<'a> {
    pub fn new(storage: &'a dyn Storage, sorter: &'a EntitySorter, faults: &'a dyn FaultResolver) -> Self {
        Self {
            storage,
            sorter,
            faults,
            validators: None,
        }
    }

    /// Check NEW and MODIFIED objects with `validators` before classifying.
    pub fn with_validation(mut self, validators: &'a ValidationPipeline) -> Self {
        self.validators = Some(validators);
        self
    }

    /// Flush every pending change of `graph`, inside `tx` when given.
    pub fn flush(&self, graph: &mut GraphManager, tx: Option<&TxHandle>) -> FlushResult<FlushOutcome> {
        let resolver = graph.resolver().clone();

        let deleted = graph.dirty_nodes(Some(PersistenceState::Deleted));
        debug!(stage = %FlushStage::Collect, dirty = graph.dirty_nodes(None).len(), "flush started");

        let savepoint = (!deleted.is_empty()).then(|| graph.savepoint());
        let planned = match self.plan(graph, &resolver, &deleted) {
            Ok(planned) => planned,
            Err(err) => {
                if let Some(savepoint) = savepoint {
                    graph.restore(savepoint);
                    debug!(stage = %FlushStage::Cascade, "delete rules undone");
                }
                return Err(err);
            }
        };
        let Some(mut plan) = planned else {
            graph.post_commit();
            return Ok(FlushOutcome::empty());
        };

        let batches = self.sorter.sort(std::mem::take(&mut plan.batches));
        debug!(
            stage = %FlushStage::Order,
            order = ?batches.iter().map(|b| format!("{} {}", b.kind(), b.table())).collect::<Vec<_>>(),
            "batches ordered"
        );

        let owned_tx;
        let (tx, owns_tx) = match tx {
            Some(tx) => (tx, false),
            None => {
                owned_tx = self.storage.begin()?;
                (&owned_tx, true)
            }
        };
        let executed = self
            .execute(&resolver, &batches, &mut plan.replacements, tx)
            .and_then(|()| id_changes(&resolver, &plan));
        let changes = match executed {
            Ok(changes) => changes,
            Err(err) => {
                if owns_tx {
                    if let Err(rollback) = self.storage.rollback(tx) {
                        warn!(error = %rollback, "rollback after failed flush also failed");
                    }
                } else {
                    tx.mark_rollback_only();
                }
                warn!(stage = %FlushStage::Execute, error = %err, "flush aborted");
                return Err(err);
            }
        };
        if owns_tx {
            self.storage.commit(tx)?;
        }

        let mut result_diff = CompoundDiff::new();
        for (old, new) in &changes {
            result_diff.add(GraphDiff::NodeIdChange {
                id: old.clone(),
                new_id: new.clone(),
            });
        }
        graph.remap_ids(&changes);
        copy_generated_keys(graph, &resolver, &plan, &changes)?;
        debug!(stage = %FlushStage::Remap, remapped = changes.len(), "ids remapped");

        result_diff.extend(graph.repair_map_keys());
        let final_id = |id: &ObjectId| changes.get(id).cloned().unwrap_or_else(|| id.clone());
        let mut modified_rows = Vec::new();
        for id in plan.inserted.iter().chain(&plan.updated).map(final_id) {
            if let Some(object) = graph.get_node(&id) {
                let row = object_row(&resolver, &object.borrow())?;
                modified_rows.push((id, row));
            }
        }
        let mut deleted_ids = plan.deleted.clone();
        deleted_ids.extend(plan.key_changes.iter().cloned());
        graph.post_commit();

        let mut tables: Vec<String> = Vec::new();
        for batch in &batches {
            if !tables.iter().any(|t| t == batch.table()) {
                tables.push(batch.table().to_string());
            }
        }
        let summary = CommitSummary {
            inserted: plan.inserted.len(),
            updated: plan.updated.len(),
            deleted: plan.deleted.len(),
            batches: batches.len(),
            tables,
        };
        info!(
            stage = %FlushStage::Finalize,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            batches = summary.batches,
            "flush committed"
        );
        Ok(FlushOutcome {
            result_diff,
            summary,
            modified_rows,
            deleted_ids,
        })
    }

    /// CASCADE, the pre-write checks and CLASSIFY. `None` when no object
    /// has a net change.
    fn plan(
        &self,
        graph: &mut GraphManager,
        resolver: &EntityResolver,
        deleted: &[ObjectId],
    ) -> FlushResult<Option<FlushPlan>> {
        if !deleted.is_empty() {
            let touched = DeleteAction::new(self.faults).cascade_deleted(graph, deleted)?;
            debug!(stage = %FlushStage::Cascade, deleted = deleted.len(), touched = touched.len(), "delete rules applied");
        }

        let dirty = graph.dirty_nodes(None);
        if dirty.iter().all(|id| graph.diff(id).map_or(true, ObjectDiff::is_noop)) {
            debug!(stage = %FlushStage::Collect, objects = dirty.len(), "no net changes, nothing to write");
            return Ok(None);
        }
        self.check_read_only(graph, resolver, &dirty)?;
        if let Some(validators) = self.validators {
            validators.validate(graph, &dirty)?;
        }

        let plan = Classifier::new(graph, self.storage, self.sorter).classify(&dirty)?;
        debug!(stage = %FlushStage::Classify, batches = plan.batches.len(), "batches built");
        Ok(Some(plan))
    }

    fn check_read_only(&self, graph: &GraphManager, resolver: &EntityResolver, dirty: &[ObjectId]) -> FlushResult<()> {
        for id in dirty {
            let entity = resolver.obj_entity(id.entity_name())?;
            if !entity.read_only {
                continue;
            }
            let writes = match graph.get_node(id).map(|o| o.state()) {
                Some(PersistenceState::New | PersistenceState::Deleted) => true,
                Some(PersistenceState::Modified) => graph
                    .diff(id)
                    .is_some_and(|d| !d.changed_properties().is_empty() || !d.changed_arcs().is_empty()),
                _ => false,
            };
            if writes {
                return Err(FlushError::ReadOnlyEntity {
                    entity: entity.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        resolver: &EntityResolver,
        batches: &[BatchDescriptor],
        replacements: &mut ReplacementMap,
        tx: &TxHandle,
    ) -> FlushResult<()> {
        for batch in batches {
            let statement = batch.resolve(replacements)?;
            let outcome = self.storage.execute_batch(tx, &statement)?;
            debug!(
                stage = %FlushStage::Execute,
                kind = %batch.kind(),
                table = batch.table(),
                rows = batch.len(),
                "batch executed"
            );
            if let BatchStatement::Insert { columns, rows, .. } = &statement {
                record_inserted_keys(resolver, batch, columns, rows, &outcome, replacements)?;
            }
            for row in 0..batch.len() {
                if batch.is_locking(row) && outcome.affected_rows.get(row).copied() == Some(0) {
                    return Err(FlushError::OptimisticLockFailure {
                        table: batch.table().to_string(),
                        row,
                        qualifier: describe_qualifier(&statement, row),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Record the key of every inserted root row so later batches can read it.
fn record_inserted_keys(
    resolver: &EntityResolver,
    batch: &BatchDescriptor,
    columns: &[String],
    rows: &[Vec<Value>],
    outcome: &BatchOutcome,
    replacements: &mut ReplacementMap,
) -> FlushResult<()> {
    let table = resolver.db_entity(batch.table())?;
    for (index, values) in rows.iter().enumerate() {
        let Some((object, RowKind::Root)) = batch.row_source(index) else {
            continue;
        };
        let mut key: Snapshot = columns
            .iter()
            .zip(values)
            .filter(|(column, _)| table.is_primary_key(column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        if let Some(generated) = outcome.generated_keys.get(index) {
            key.extend(generated.clone());
        }
        replacements.record(object, key);
    }
    Ok(())
}

/// Permanent ids for inserted temporary objects and for stored objects
/// whose primary key changed.
fn id_changes(resolver: &EntityResolver, plan: &FlushPlan) -> FlushResult<HashMap<ObjectId, ObjectId>> {
    let mut changes = HashMap::new();
    let temporary = plan.inserted.iter().filter(|id| id.is_temporary());
    for id in temporary.chain(&plan.key_changes) {
        let table = resolver.db_entity_for(id.entity_name())?;
        let mut key = Snapshot::new();
        for column in table.primary_key_names() {
            let value = plan
                .replacements
                .value(id, &column)
                .cloned()
                .ok_or_else(|| FlushError::Propagation {
                    object: id.clone(),
                    column: column.clone(),
                })?;
            key.insert(column, value);
        }
        let new_id = ObjectId::permanent(id.entity_name(), key).map_err(|e| FlushError::Classifier {
            entity: id.entity_name().to_string(),
            property: table.primary_key_names().join(","),
            reason: e.to_string(),
        })?;
        if &new_id != id {
            changes.insert(id.clone(), new_id);
        }
    }
    Ok(changes)
}

/// Write generated primary keys into attributes mapped to key columns.
fn copy_generated_keys(
    graph: &mut GraphManager,
    resolver: &EntityResolver,
    plan: &FlushPlan,
    changes: &HashMap<ObjectId, ObjectId>,
) -> FlushResult<()> {
    for old in &plan.inserted {
        let Some(id) = changes.get(old) else { continue };
        let entity = resolver.obj_entity(id.entity_name())?;
        let Some(key) = id.id_snapshot() else { continue };
        for (column, value) in key {
            let Some(attr) = entity.attribute_for_column(column) else { continue };
            let current = graph.get_node(id).and_then(|o| o.value(&attr.name));
            if current.map_or(true, |v| v.is_null()) {
                graph.write_property(id, &attr.name, value.clone())?;
            }
        }
    }
    Ok(())
}

/// Qualifier of one update or delete row, for error messages.
fn describe_qualifier(statement: &BatchStatement, row: usize) -> String {
    let (columns, nulls, values) = match statement {
        BatchStatement::Update {
            qualifier_columns,
            null_qualifier_columns,
            rows,
            ..
        } => (qualifier_columns, null_qualifier_columns, rows.get(row).map(|r| &r.qualifier)),
        BatchStatement::Delete {
            qualifier_columns,
            null_qualifier_columns,
            rows,
            ..
        } => (qualifier_columns, null_qualifier_columns, rows.get(row)),
        BatchStatement::Insert { .. } => return String::new(),
    };
    let mut parts: Vec<String> = columns
        .iter()
        .zip(values.into_iter().flatten())
        .map(|(column, value)| format!("{column} = {value}"))
        .collect();
    parts.extend(nulls.iter().map(|column| format!("{column} IS NULL")));
    parts.join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::StorageFaults;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use strata_map::{DbAttribute, DbEntity, EntityMap, ObjAttribute, ObjEntity};
    use strata_store::{InMemoryDatabase, StatementKind};
    use strata_types::snapshot_of;

    const GALLERY: &str = include_str!("../../../fixtures/gallery.toml");
    const TABLES: &str = include_str!("../../../fixtures/tables.toml");

    struct Fixture {
        graph: GraphManager,
        db: InMemoryDatabase,
        sorter: EntitySorter,
    }

    impl Fixture {
        fn new(text: &str) -> Self {
            Self::from_resolver(EntityResolver::from_toml_str(text).unwrap())
        }

        fn from_resolver(resolver: EntityResolver) -> Self {
            let resolver = Arc::new(resolver);
            Self {
                db: InMemoryDatabase::new(&resolver),
                sorter: EntitySorter::new(&resolver),
                graph: GraphManager::new(resolver),
            }
        }

        /// Register an object that already has a stored row.
        fn load(&mut self, id: &ObjectId) {
            self.graph.local_node(id).unwrap();
            StorageFaults::new(&self.db)
                .resolve_object(&mut self.graph, id)
                .unwrap();
        }

        fn flush(&mut self) -> FlushResult<FlushOutcome> {
            let faults = StorageFaults::new(&self.db);
            let validators = ValidationPipeline::default();
            FlushEngine::new(&self.db, &self.sorter, &faults)
                .with_validation(&validators)
                .flush(&mut self.graph, None)
        }

        fn flush_in(&mut self, tx: &TxHandle) -> FlushResult<FlushOutcome> {
            let faults = StorageFaults::new(&self.db);
            FlushEngine::new(&self.db, &self.sorter, &faults).flush(&mut self.graph, Some(tx))
        }

        fn statements(&self) -> Vec<(StatementKind, String)> {
            self.db
                .statements()
                .unwrap()
                .into_iter()
                .map(|s| (s.kind, s.table))
                .collect()
        }
    }

    fn state(graph: &GraphManager, id: &ObjectId) -> Option<PersistenceState> {
        graph.get_node(id).map(|o| o.state())
    }

    // -----------------------------------------------------------------------
    // Inserts and remapping
    // -----------------------------------------------------------------------

    #[test]
    fn parent_and_child_insert_with_propagated_key() {
        let mut fx = Fixture::new(TABLES);
        let t1 = fx.graph.new_object("Table1").unwrap().id();
        let t2 = fx.graph.new_object("Table2").unwrap().id();
        fx.graph.write_property(&t1, "attr1", json!("a")).unwrap();
        fx.graph.set_to_one(&t2, "toTable1", Some(&t1), true).unwrap();

        let outcome = fx.flush().unwrap();
        assert_eq!(
            fx.statements(),
            vec![
                (StatementKind::Insert, "TABLE1".to_string()),
                (StatementKind::Insert, "TABLE2".to_string())
            ]
        );
        let parent = &fx.db.rows("TABLE1").unwrap()[0];
        let child = &fx.db.rows("TABLE2").unwrap()[0];
        assert_eq!(child["TABLE1_ID"], parent["ID"]);

        assert_eq!(outcome.summary.inserted, 2);
        assert_eq!(outcome.result_diff.len(), 2);
        assert!(fx.graph.get_node(&t1).is_none());
        let new_t2 = ObjectId::single("Table2", "ID", child["ID"].clone());
        let new_t1 = ObjectId::single("Table1", "ID", parent["ID"].clone());
        assert_eq!(state(&fx.graph, &new_t2), Some(PersistenceState::Committed));
        assert_eq!(fx.graph.get_node(&new_t2).unwrap().to_one_target("toTable1"), Some(new_t1));
        assert!(!fx.graph.has_changes());
    }

    #[test]
    fn join_row_between_new_objects() {
        let mut fx = Fixture::new(GALLERY);
        let gallery = fx.graph.new_object("Gallery").unwrap().id();
        fx.graph.write_property(&gallery, "galleryId", json!(7)).unwrap();
        fx.graph.write_property(&gallery, "galleryName", json!("Tate")).unwrap();
        let exhibit = fx.graph.new_object("Exhibit").unwrap().id();
        fx.graph.set_to_one(&exhibit, "toGallery", Some(&gallery), true).unwrap();
        let artist = fx.graph.new_object("Artist").unwrap().id();
        fx.graph.write_property(&artist, "artistName", json!("Turner")).unwrap();
        fx.graph.add_to_many(&artist, "exhibitArray", &exhibit, true).unwrap();

        fx.flush().unwrap();
        let join = fx.db.rows("ARTIST_EXHIBIT").unwrap();
        assert_eq!(join.len(), 1);
        assert_eq!(join[0]["ARTIST_ID"], fx.db.rows("ARTIST").unwrap()[0]["ARTIST_ID"]);
        assert_eq!(join[0]["EXHIBIT_ID"], fx.db.rows("EXHIBIT").unwrap()[0]["EXHIBIT_ID"]);
        assert_eq!(fx.db.rows("EXHIBIT").unwrap()[0]["GALLERY_ID"], json!(7));
        assert!(fx
            .graph
            .get_node(&ObjectId::single("Gallery", "GALLERY_ID", 7))
            .is_some());
    }

    #[test]
    fn no_net_change_is_a_phantom_commit() {
        let mut fx = Fixture::new(TABLES);
        fx.db.insert_row("TABLE1", snapshot_of([("ID", json!(1)), ("ATTR1", json!("a"))])).unwrap();
        fx.db.clear_statements().unwrap();
        let t1 = ObjectId::single("Table1", "ID", 1);
        fx.load(&t1);
        fx.graph.write_property(&t1, "attr1", json!("b")).unwrap();
        fx.graph.write_property(&t1, "attr1", json!("a")).unwrap();

        let outcome = fx.flush().unwrap();
        assert!(outcome.summary.is_empty());
        assert!(fx.statements().is_empty());
        assert_eq!(fx.db.open_transactions().unwrap(), 0);
        assert_eq!(state(&fx.graph, &t1), Some(PersistenceState::Committed));
    }

    // -----------------------------------------------------------------------
    // Updates, deletes and key changes
    // -----------------------------------------------------------------------

    #[test]
    fn cascade_runs_before_any_statement() {
        let mut fx = Fixture::new(GALLERY);
        fx.db.insert_row("ARTIST", snapshot_of([("ARTIST_ID", json!(1)), ("ARTIST_NAME", json!("Monet"))]))
            .unwrap();
        fx.db
            .insert_row(
                "PAINTING",
                snapshot_of([("PAINTING_ID", json!(2)), ("PAINTING_TITLE", json!("Poppies")), ("ARTIST_ID", json!(1))]),
            )
            .unwrap();
        fx.db.clear_statements().unwrap();
        let artist = ObjectId::single("Artist", "ARTIST_ID", 1);
        fx.load(&artist);
        fx.graph.delete_node(&artist).unwrap();

        let outcome = fx.flush().unwrap();
        let statements = fx.statements();
        let painting_delete = statements
            .iter()
            .position(|s| *s == (StatementKind::Delete, "PAINTING".to_string()))
            .unwrap();
        let artist_delete = statements
            .iter()
            .position(|s| *s == (StatementKind::Delete, "ARTIST".to_string()))
            .unwrap();
        assert!(painting_delete < artist_delete);
        assert_eq!(fx.db.row_count("ARTIST").unwrap(), 0);
        assert_eq!(fx.db.row_count("PAINTING").unwrap(), 0);
        assert_eq!(outcome.summary.deleted, 2);
        assert!(outcome.deleted_ids.contains(&ObjectId::single("Painting", "PAINTING_ID", 2)));
        assert!(fx.graph.is_empty());
    }

    #[test]
    fn optimistic_conflict_is_reported() {
        let mut fx = Fixture::new(GALLERY);
        fx.db
            .insert_row(
                "PAINTING",
                snapshot_of([("PAINTING_ID", json!(2)), ("PAINTING_TITLE", json!("Poppies")), ("ESTIMATED_PRICE", json!(100))]),
            )
            .unwrap();
        let painting = ObjectId::single("Painting", "PAINTING_ID", 2);
        fx.graph.local_node(&painting).unwrap();
        fx.graph
            .inflate(
                &painting,
                snapshot_of([("paintingTitle", json!("Poppies")), ("estimatedPrice", json!(90))]),
                BTreeMap::from([("toArtist".to_string(), None), ("toGallery".to_string(), None)]),
            )
            .unwrap();
        fx.graph.write_property(&painting, "paintingTitle", json!("Wild Poppies")).unwrap();

        let err = fx.flush().unwrap_err();
        match &err {
            FlushError::OptimisticLockFailure { table, row, qualifier } => {
                assert_eq!(table, "PAINTING");
                assert_eq!(*row, 0);
                assert!(qualifier.contains("ESTIMATED_PRICE = 90"));
                assert!(qualifier.contains("ARTIST_ID IS NULL"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_recoverable());
        assert_eq!(fx.db.open_transactions().unwrap(), 0);
        assert_eq!(fx.db.rows("PAINTING").unwrap()[0]["PAINTING_TITLE"], json!("Poppies"));
        assert_eq!(state(&fx.graph, &painting), Some(PersistenceState::Modified));
    }

    #[test]
    fn meaningful_key_change_replaces_id() {
        let mut fx = Fixture::new(GALLERY);
        fx.db.insert_row("GALLERY", snapshot_of([("GALLERY_ID", json!(5)), ("GALLERY_NAME", json!("Orsay"))]))
            .unwrap();
        let old = ObjectId::single("Gallery", "GALLERY_ID", 5);
        fx.load(&old);
        fx.graph.write_property(&old, "galleryId", json!(6)).unwrap();

        let outcome = fx.flush().unwrap();
        let new = ObjectId::single("Gallery", "GALLERY_ID", 6);
        assert_eq!(fx.db.rows("GALLERY").unwrap()[0]["GALLERY_ID"], json!(6));
        assert!(outcome.deleted_ids.contains(&old));
        assert_eq!(outcome.modified_rows[0].0, new);
        assert!(fx.graph.get_node(&old).is_none());
        assert_eq!(state(&fx.graph, &new), Some(PersistenceState::Committed));
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[test]
    fn failed_batch_rolls_back_everything() {
        let mut fx = Fixture::new(TABLES);
        let t1 = fx.graph.new_object("Table1").unwrap().id();
        let t2 = fx.graph.new_object("Table2").unwrap().id();
        fx.graph.set_to_one(&t2, "toTable1", Some(&t1), true).unwrap();
        fx.db.fail_on("TABLE2", Some(0)).unwrap();

        let err = fx.flush().unwrap_err();
        assert!(matches!(err, FlushError::Storage { table: Some(ref t), .. } if t == "TABLE2"));
        assert!(!err.is_recoverable());
        assert_eq!(fx.db.row_count("TABLE1").unwrap(), 0);
        assert_eq!(fx.db.open_transactions().unwrap(), 0);
        assert_eq!(state(&fx.graph, &t1), Some(PersistenceState::New));
    }

    #[test]
    fn callers_transaction_is_marked_rollback_only() {
        let mut fx = Fixture::new(TABLES);
        let t1 = fx.graph.new_object("Table1").unwrap().id();
        fx.graph.write_property(&t1, "attr1", json!("a")).unwrap();
        fx.db.fail_on("TABLE1", None).unwrap();

        let tx = fx.db.begin().unwrap();
        fx.flush_in(&tx).unwrap_err();
        assert!(tx.is_rollback_only());
        assert_eq!(fx.db.open_transactions().unwrap(), 1);
        fx.db.rollback(&tx).unwrap();
    }

    #[test]
    fn callers_transaction_is_left_open() {
        let mut fx = Fixture::new(TABLES);
        let t1 = fx.graph.new_object("Table1").unwrap().id();
        fx.graph.write_property(&t1, "attr1", json!("a")).unwrap();

        let tx = fx.db.begin().unwrap();
        fx.flush_in(&tx).unwrap();
        assert_eq!(fx.db.row_count("TABLE1").unwrap(), 0);
        fx.db.commit(&tx).unwrap();
        assert_eq!(fx.db.row_count("TABLE1").unwrap(), 1);
    }

    #[test]
    fn validation_failure_writes_nothing() {
        let mut fx = Fixture::new(GALLERY);
        let artist = fx.graph.new_object("Artist").unwrap().id();

        let err = fx.flush().unwrap_err();
        assert!(matches!(err, FlushError::Validation(_)));
        assert!(fx.statements().is_empty());
        assert_eq!(state(&fx.graph, &artist), Some(PersistenceState::New));
    }

    #[test]
    fn failed_check_undoes_delete_rules() {
        let mut fx = Fixture::new(GALLERY);
        fx.db.insert_row("ARTIST", snapshot_of([("ARTIST_ID", json!(1)), ("ARTIST_NAME", json!("Monet"))]))
            .unwrap();
        fx.db
            .insert_row(
                "PAINTING",
                snapshot_of([("PAINTING_ID", json!(2)), ("PAINTING_TITLE", json!("Poppies")), ("ARTIST_ID", json!(1))]),
            )
            .unwrap();
        fx.db.clear_statements().unwrap();
        let artist = ObjectId::single("Artist", "ARTIST_ID", 1);
        let stored = ObjectId::single("Painting", "PAINTING_ID", 2);
        fx.load(&artist);
        let fresh = fx.graph.new_object("Painting").unwrap().id();
        fx.graph.write_property(&fresh, "paintingTitle", json!("Haystacks")).unwrap();
        fx.graph.set_to_one(&fresh, "toArtist", Some(&artist), true).unwrap();
        fx.graph.delete_node(&artist).unwrap();
        let unnamed = fx.graph.new_object("Artist").unwrap().id();
        let diffs_before = fx.graph.get_diffs().len();

        let err = fx.flush().unwrap_err();
        assert!(matches!(err, FlushError::Validation(_)));
        assert!(fx.statements().is_empty());
        assert_eq!(state(&fx.graph, &fresh), Some(PersistenceState::New));
        assert_eq!(fx.graph.get_node(&fresh).unwrap().to_one_target("toArtist"), Some(artist.clone()));
        assert_eq!(state(&fx.graph, &artist), Some(PersistenceState::Deleted));
        assert_eq!(state(&fx.graph, &stored), Some(PersistenceState::Committed));
        assert_eq!(fx.graph.get_diffs().len(), diffs_before);

        fx.graph.delete_node(&unnamed).unwrap();
        let outcome = fx.flush().unwrap();
        assert_eq!(outcome.summary.deleted, 2);
        assert_eq!(fx.db.row_count("PAINTING").unwrap(), 0);
        assert_eq!(fx.db.row_count("ARTIST").unwrap(), 0);
        assert!(fx.graph.get_node(&fresh).is_none());
    }

    #[test]
    fn read_only_entity_rejects_writes() {
        let map = EntityMap::new()
            .with_db_entity(
                DbEntity::new("NOTE")
                    .with_attribute(DbAttribute::new("ID").primary_key().generated())
                    .with_attribute(DbAttribute::new("TEXT")),
            )
            .with_obj_entity(
                ObjEntity::new("Note", "NOTE")
                    .with_attribute(ObjAttribute::new("text", "TEXT"))
                    .read_only(),
            );
        let mut fx = Fixture::from_resolver(EntityResolver::new(map).unwrap());
        let note = fx.graph.new_object("Note").unwrap().id();
        fx.graph.write_property(&note, "text", json!("hi")).unwrap();

        let err = fx.flush().unwrap_err();
        assert!(matches!(err, FlushError::ReadOnlyEntity { ref entity } if entity == "Note"));
        assert!(fx.statements().is_empty());
    }

    #[test]
    fn stage_names() {
        assert_eq!(FlushStage::Collect.to_string(), "collect");
        assert_eq!(FlushStage::Finalize.to_string(), "finalize");
    }
}
