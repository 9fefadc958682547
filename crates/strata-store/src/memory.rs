use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_map::EntityResolver;
use strata_types::{Snapshot, Value};
use tracing::debug;
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchStatement, ExecutedStatement, UpdateRow};
use crate::error::{StoreError, StoreResult};
use crate::traits::{Storage, TxHandle};

#[derive(Clone, Debug)]
struct ColumnSchema {
    name: String,
    primary_key: bool,
    not_null: bool,
    generated: bool,
}

#[derive(Clone, Debug)]
struct ForeignKey {
    name: String,
    /// (local column, referenced column)
    columns: Vec<(String, String)>,
    target: String,
}

#[derive(Clone, Debug)]
struct TableSchema {
    name: String,
    columns: Vec<ColumnSchema>,
    foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn key_of(&self, row: &Snapshot) -> Vec<Value> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| row.get(&c.name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

type Tables = HashMap<String, Vec<Snapshot>>;

struct FailurePoint {
    table: String,
    row: Option<usize>,
}

#[derive(Default)]
struct DbState {
    committed: Tables,
    transactions: HashMap<Uuid, Tables>,
    sequences: HashMap<String, i64>,
    failures: Vec<FailurePoint>,
    log: Vec<ExecutedStatement>,
}

/// In-memory, constraint-checking database.
///
/// Intended for tests and embedding. Tables, columns, and foreign keys are
/// derived from the mapping. Every statement checks NOT NULL, primary-key
/// uniqueness, and foreign keys immediately, so a badly ordered flush fails
/// the same way it would against a real database.
///
/// Transactions work on a private copy of the data taken at `begin` and
/// replace the committed data on `commit`. Key sequences are not
/// transactional.
pub struct InMemoryDatabase {
    schema: HashMap<String, TableSchema>,
    state: RwLock<DbState>,
}

impl InMemoryDatabase {
    /// Create an empty database with one table per db entity.
    pub fn new(resolver: &EntityResolver) -> Self {
        let mut schema = HashMap::new();
        let mut committed = Tables::new();
        for entity in resolver.db_entities() {
            let columns = entity
                .attributes
                .iter()
                .map(|a| ColumnSchema {
                    name: a.name.clone(),
                    primary_key: a.primary_key,
                    not_null: a.is_not_null(),
                    generated: a.generated,
                })
                .collect();
            let foreign_keys = entity
                .foreign_keys(move |name| resolver.db_entity(name).ok())
                .map(|(rel, target)| ForeignKey {
                    name: rel.name.clone(),
                    columns: rel
                        .joins
                        .iter()
                        .map(|j| (j.source.clone(), j.target.clone()))
                        .collect(),
                    target: target.name.clone(),
                })
                .collect();
            schema.insert(
                entity.name.clone(),
                TableSchema {
                    name: entity.name.clone(),
                    columns,
                    foreign_keys,
                },
            );
            committed.insert(entity.name.clone(), Vec::new());
        }
        Self {
            schema,
            state: RwLock::new(DbState {
                committed,
                ..DbState::default()
            }),
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, DbState>> {
        self.state.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, DbState>> {
        self.state.write().map_err(|_| StoreError::LockPoisoned)
    }

    fn table_schema(&self, table: &str) -> StoreResult<&TableSchema> {
        self.schema
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    // ---------------------------------------------------------------
    // Inspection and test hooks
    // ---------------------------------------------------------------

    /// Committed rows of a table.
    pub fn rows(&self, table: &str) -> StoreResult<Vec<Snapshot>> {
        self.table_schema(table)?;
        Ok(self
            .read()?
            .committed
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    pub fn row_count(&self, table: &str) -> StoreResult<usize> {
        Ok(self.rows(table)?.len())
    }

    /// Insert one row directly into committed data, with constraint checks.
    pub fn insert_row(&self, table: &str, row: Snapshot) -> StoreResult<()> {
        let (columns, values): (Vec<String>, Vec<Value>) = row.into_iter().unzip();
        let tx = self.begin()?;
        let batch = BatchStatement::Insert {
            table: table.to_string(),
            columns,
            rows: vec![values],
        };
        match self.execute_batch(&tx, &batch) {
            Ok(_) => self.commit(&tx),
            Err(e) => {
                self.rollback(&tx)?;
                Err(e)
            }
        }
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> StoreResult<Vec<ExecutedStatement>> {
        Ok(self.read()?.log.clone())
    }

    pub fn clear_statements(&self) -> StoreResult<()> {
        self.write()?.log.clear();
        Ok(())
    }

    /// Make the next statement touching `table` fail, at `row` if given or
    /// at its first row otherwise.
    pub fn fail_on(&self, table: &str, row: Option<usize>) -> StoreResult<()> {
        self.write()?.failures.push(FailurePoint {
            table: table.to_string(),
            row,
        });
        Ok(())
    }

    /// Number of transactions begun but not yet finished.
    pub fn open_transactions(&self) -> StoreResult<usize> {
        Ok(self.read()?.transactions.len())
    }

    // ---------------------------------------------------------------
    // Statement execution
    // ---------------------------------------------------------------

    fn insert(
        &self,
        tables: &mut Tables,
        state: &mut ExecState<'_>,
        schema: &TableSchema,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> StoreResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for (i, values) in rows.iter().enumerate() {
            state.check_failure(&schema.name, i)?;
            let mut row = Snapshot::new();
            for (column, value) in columns.iter().zip(values) {
                if schema.column(column).is_none() {
                    return Err(StoreError::UnknownColumn {
                        table: schema.name.clone(),
                        column: column.clone(),
                    });
                }
                row.insert(column.clone(), value.clone());
            }

            let mut generated = Snapshot::new();
            for column in &schema.columns {
                let value = row.entry(column.name.clone()).or_insert(Value::Null);
                if column.generated && value.is_null() {
                    let next = Value::from(state.next_key(&schema.name));
                    *value = next.clone();
                    generated.insert(column.name.clone(), next);
                } else if column.primary_key {
                    if let Some(n) = value.as_i64() {
                        state.observe_key(&schema.name, n);
                    }
                }
            }

            self.check_not_null(schema, &row, i, schema.columns.iter().map(|c| c.name.as_str()))?;
            let key = schema.key_of(&row);
            let existing = tables.get(&schema.name).map(Vec::as_slice).unwrap_or_default();
            if existing.iter().any(|r| schema.key_of(r) == key) {
                return Err(StoreError::DuplicateKey {
                    table: schema.name.clone(),
                    row: i,
                });
            }
            self.check_references_exist(tables, schema, &row, i, None)?;

            tables.entry(schema.name.clone()).or_default().push(row);
            outcome.generated_keys.push(generated);
            outcome.affected_rows.push(1);
        }
        Ok(outcome)
    }

    fn update(
        &self,
        tables: &mut Tables,
        state: &mut ExecState<'_>,
        schema: &TableSchema,
        set_columns: &[String],
        qualifier_columns: &[String],
        null_columns: &[String],
        rows: &[UpdateRow],
    ) -> StoreResult<BatchOutcome> {
        self.check_columns(schema, set_columns.iter().chain(qualifier_columns).chain(null_columns))?;
        let mut outcome = BatchOutcome::default();
        for (i, update) in rows.iter().enumerate() {
            state.check_failure(&schema.name, i)?;
            let matched = matching(
                tables.get(&schema.name),
                qualifier_columns,
                &update.qualifier,
                null_columns,
            );
            for &index in &matched {
                let old = tables[&schema.name][index].clone();
                let mut new = old.clone();
                for (column, value) in set_columns.iter().zip(&update.values) {
                    new.insert(column.clone(), value.clone());
                }
                self.check_not_null(schema, &new, i, set_columns.iter().map(String::as_str))?;
                let old_key = schema.key_of(&old);
                let new_key = schema.key_of(&new);
                if old_key != new_key {
                    if let Some(detail) = self.referenced_by(tables, schema, &old) {
                        return Err(StoreError::ForeignKeyViolation {
                            table: schema.name.clone(),
                            row: i,
                            detail,
                        });
                    }
                    if tables[&schema.name].iter().any(|r| schema.key_of(r) == new_key) {
                        return Err(StoreError::DuplicateKey {
                            table: schema.name.clone(),
                            row: i,
                        });
                    }
                }
                self.check_references_exist(tables, schema, &new, i, Some(set_columns))?;
                if let Some(rows) = tables.get_mut(&schema.name) {
                    rows[index] = new;
                }
            }
            outcome.affected_rows.push(matched.len());
        }
        Ok(outcome)
    }

    fn delete(
        &self,
        tables: &mut Tables,
        state: &mut ExecState<'_>,
        schema: &TableSchema,
        qualifier_columns: &[String],
        null_columns: &[String],
        rows: &[Vec<Value>],
    ) -> StoreResult<BatchOutcome> {
        self.check_columns(schema, qualifier_columns.iter().chain(null_columns))?;
        let mut outcome = BatchOutcome::default();
        for (i, qualifier) in rows.iter().enumerate() {
            state.check_failure(&schema.name, i)?;
            let matched = matching(tables.get(&schema.name), qualifier_columns, qualifier, null_columns);
            for &index in matched.iter().rev() {
                let row = tables[&schema.name][index].clone();
                if let Some(detail) = self.referenced_by(tables, schema, &row) {
                    return Err(StoreError::ForeignKeyViolation {
                        table: schema.name.clone(),
                        row: i,
                        detail,
                    });
                }
                if let Some(rows) = tables.get_mut(&schema.name) {
                    rows.remove(index);
                }
            }
            outcome.affected_rows.push(matched.len());
        }
        Ok(outcome)
    }

    // ---------------------------------------------------------------
    // Constraint checks
    // ---------------------------------------------------------------

    fn check_columns<'a>(
        &self,
        schema: &TableSchema,
        columns: impl IntoIterator<Item = &'a String>,
    ) -> StoreResult<()> {
        for column in columns {
            if schema.column(column).is_none() {
                return Err(StoreError::UnknownColumn {
                    table: schema.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_not_null<'a>(
        &self,
        schema: &TableSchema,
        row: &Snapshot,
        index: usize,
        columns: impl IntoIterator<Item = &'a str>,
    ) -> StoreResult<()> {
        for name in columns {
            let Some(column) = schema.column(name) else {
                continue;
            };
            if column.not_null && row.get(name).map_or(true, Value::is_null) {
                return Err(StoreError::NotNullViolation {
                    table: schema.name.clone(),
                    row: index,
                    column: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Every non-null foreign key of `row` must point at an existing row.
    /// With `only` set, just the keys touching those columns are checked.
    fn check_references_exist(
        &self,
        tables: &Tables,
        schema: &TableSchema,
        row: &Snapshot,
        index: usize,
        only: Option<&[String]>,
    ) -> StoreResult<()> {
        for fk in &schema.foreign_keys {
            if let Some(only) = only {
                if !fk.columns.iter().any(|(local, _)| only.contains(local)) {
                    continue;
                }
            }
            let values: Vec<&Value> = fk
                .columns
                .iter()
                .map(|(local, _)| row.get(local).unwrap_or(&Value::Null))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            let found = tables.get(&fk.target).is_some_and(|rows| {
                rows.iter().any(|target| {
                    fk.columns
                        .iter()
                        .zip(&values)
                        .all(|((_, remote), v)| target.get(remote) == Some(*v))
                })
            });
            if !found {
                return Err(StoreError::ForeignKeyViolation {
                    table: schema.name.clone(),
                    row: index,
                    detail: format!("{} references a missing {} row", fk.name, fk.target),
                });
            }
        }
        Ok(())
    }

    /// Describe the first foreign key still pointing at `row`, if any.
    fn referenced_by(&self, tables: &Tables, schema: &TableSchema, row: &Snapshot) -> Option<String> {
        for other in self.schema.values() {
            for fk in other.foreign_keys.iter().filter(|fk| fk.target == schema.name) {
                let Some(referencing) = tables.get(&other.name) else {
                    continue;
                };
                let hit = referencing.iter().any(|candidate| {
                    candidate != row
                        && fk.columns.iter().all(|(local, remote)| {
                            let value = candidate.get(local).unwrap_or(&Value::Null);
                            !value.is_null() && Some(value) == row.get(remote)
                        })
                });
                if hit {
                    return Some(format!("{}.{} still references it", other.name, fk.name));
                }
            }
        }
        None
    }
}

/// Mutable bookkeeping shared by the statement methods.
struct ExecState<'a> {
    sequences: &'a mut HashMap<String, i64>,
    failures: &'a mut Vec<FailurePoint>,
}

impl ExecState<'_> {
    fn next_key(&mut self, table: &str) -> i64 {
        let counter = self.sequences.entry(table.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn observe_key(&mut self, table: &str, value: i64) {
        let counter = self.sequences.entry(table.to_string()).or_insert(0);
        *counter = (*counter).max(value);
    }

    fn check_failure(&mut self, table: &str, row: usize) -> StoreResult<()> {
        let hit = self
            .failures
            .iter()
            .position(|f| f.table == table && f.row.map_or(true, |r| r == row));
        match hit {
            Some(index) => {
                self.failures.remove(index);
                Err(StoreError::InjectedFailure {
                    table: table.to_string(),
                    row,
                })
            }
            None => Ok(()),
        }
    }
}

fn matching(
    rows: Option<&Vec<Snapshot>>,
    qualifier_columns: &[String],
    qualifier: &[Value],
    null_columns: &[String],
) -> Vec<usize> {
    let Some(rows) = rows else {
        return Vec::new();
    };
    rows.iter()
        .enumerate()
        .filter(|(_, row)| {
            qualifier_columns
                .iter()
                .zip(qualifier)
                .all(|(c, v)| row.get(c).unwrap_or(&Value::Null) == v)
                && null_columns
                    .iter()
                    .all(|c| row.get(c).map_or(true, Value::is_null))
        })
        .map(|(i, _)| i)
        .collect()
}

impl Storage for InMemoryDatabase {
    fn begin(&self) -> StoreResult<TxHandle> {
        let tx = TxHandle::new();
        let mut state = self.write()?;
        let copy = state.committed.clone();
        state.transactions.insert(tx.id(), copy);
        debug!(tx = %tx.id(), "transaction started");
        Ok(tx)
    }

    fn commit(&self, tx: &TxHandle) -> StoreResult<()> {
        let mut state = self.write()?;
        let tables = state
            .transactions
            .remove(&tx.id())
            .ok_or(StoreError::UnknownTransaction(tx.id()))?;
        if tx.is_rollback_only() {
            return Err(StoreError::RollbackOnly(tx.id()));
        }
        state.committed = tables;
        debug!(tx = %tx.id(), "transaction committed");
        Ok(())
    }

    fn rollback(&self, tx: &TxHandle) -> StoreResult<()> {
        let mut state = self.write()?;
        state
            .transactions
            .remove(&tx.id())
            .ok_or(StoreError::UnknownTransaction(tx.id()))?;
        debug!(tx = %tx.id(), "transaction rolled back");
        Ok(())
    }

    fn execute_batch(&self, tx: &TxHandle, batch: &BatchStatement) -> StoreResult<BatchOutcome> {
        let schema = self.table_schema(batch.table())?;
        let mut guard = self.write()?;
        let DbState {
            transactions,
            sequences,
            failures,
            log,
            ..
        } = &mut *guard;
        let tables = transactions
            .get_mut(&tx.id())
            .ok_or(StoreError::UnknownTransaction(tx.id()))?;
        let mut work = tables.clone();
        let mut exec = ExecState { sequences, failures };

        let outcome = match batch {
            BatchStatement::Insert { columns, rows, .. } => {
                self.insert(&mut work, &mut exec, schema, columns, rows)?
            }
            BatchStatement::Update {
                set_columns,
                qualifier_columns,
                null_qualifier_columns,
                rows,
                ..
            } => self.update(
                &mut work,
                &mut exec,
                schema,
                set_columns,
                qualifier_columns,
                null_qualifier_columns,
                rows,
            )?,
            BatchStatement::Delete {
                qualifier_columns,
                null_qualifier_columns,
                rows,
                ..
            } => self.delete(
                &mut work,
                &mut exec,
                schema,
                qualifier_columns,
                null_qualifier_columns,
                rows,
            )?,
        };

        *tables = work;
        log.push(ExecutedStatement {
            tx: tx.id(),
            kind: batch.kind(),
            table: batch.table().to_string(),
            rows: batch.row_count(),
        });
        debug!(statement = %batch, "batch executed");
        Ok(outcome)
    }

    fn select(&self, tx: Option<&TxHandle>, table: &str, qualifier: &Snapshot) -> StoreResult<Vec<Snapshot>> {
        self.table_schema(table)?;
        let state = self.read()?;
        let tables = match tx {
            Some(tx) => state
                .transactions
                .get(&tx.id())
                .ok_or(StoreError::UnknownTransaction(tx.id()))?,
            None => &state.committed,
        };
        let rows = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        qualifier
                            .iter()
                            .all(|(c, v)| row.get(c).unwrap_or(&Value::Null) == v)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    fn next_primary_key(&self, table: &str) -> StoreResult<Value> {
        self.table_schema(table)?;
        let mut state = self.write()?;
        let counter = state.sequences.entry(table.to_string()).or_insert(0);
        *counter += 1;
        Ok(Value::from(*counter))
    }
}

impl std::fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDatabase")
            .field("tables", &self.schema.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::StatementKind;
    use serde_json::json;
    use strata_types::snapshot_of;

    const GALLERY: &str = include_str!("../../../fixtures/gallery.toml");

    fn db() -> InMemoryDatabase {
        InMemoryDatabase::new(&EntityResolver::from_toml_str(GALLERY).unwrap())
    }

    fn insert_artist(name: &str) -> BatchStatement {
        BatchStatement::Insert {
            table: "ARTIST".into(),
            columns: vec!["ARTIST_NAME".into()],
            rows: vec![vec![json!(name)]],
        }
    }

    // ---------------------------------------------------------------
    // Inserts
    // ---------------------------------------------------------------

    #[test]
    fn insert_returns_generated_keys() {
        let db = db();
        let tx = db.begin().unwrap();
        let outcome = db
            .execute_batch(
                &tx,
                &BatchStatement::Insert {
                    table: "ARTIST".into(),
                    columns: vec!["ARTIST_NAME".into()],
                    rows: vec![vec![json!("a")], vec![json!("b")]],
                },
            )
            .unwrap();
        assert_eq!(
            outcome.generated_keys,
            vec![snapshot_of([("ARTIST_ID", 1)]), snapshot_of([("ARTIST_ID", 2)])]
        );
        db.commit(&tx).unwrap();
        assert_eq!(db.row_count("ARTIST").unwrap(), 2);
    }

    #[test]
    fn not_null_enforced() {
        let db = db();
        let err = db
            .insert_row("ARTIST", snapshot_of([("DATE_OF_BIRTH", json!("1840"))]))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotNullViolation { ref column, row: 0, .. } if column == "ARTIST_NAME"
        ));
    }

    #[test]
    fn foreign_key_enforced_on_insert() {
        let db = db();
        let err = db
            .insert_row(
                "PAINTING",
                snapshot_of([("PAINTING_TITLE", json!("x")), ("ARTIST_ID", json!(99))]),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));
        assert_eq!(err.table(), Some("PAINTING"));
    }

    #[test]
    fn duplicate_key_rejected() {
        let db = db();
        db.insert_row("GALLERY", snapshot_of([("GALLERY_ID", json!(1)), ("GALLERY_NAME", json!("g"))]))
            .unwrap();
        let err = db
            .insert_row("GALLERY", snapshot_of([("GALLERY_ID", json!(1)), ("GALLERY_NAME", json!("h"))]))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        // Explicit keys advance the sequence.
        assert_eq!(db.next_primary_key("GALLERY").unwrap(), json!(2));
    }

    // ---------------------------------------------------------------
    // Updates and deletes
    // ---------------------------------------------------------------

    #[test]
    fn update_reports_affected_rows() {
        let db = db();
        db.insert_row("ARTIST", snapshot_of([("ARTIST_NAME", json!("a"))])).unwrap();
        let tx = db.begin().unwrap();
        let outcome = db
            .execute_batch(
                &tx,
                &BatchStatement::Update {
                    table: "ARTIST".into(),
                    set_columns: vec!["ARTIST_NAME".into()],
                    qualifier_columns: vec!["ARTIST_ID".into(), "ARTIST_NAME".into()],
                    null_qualifier_columns: vec!["DATE_OF_BIRTH".into()],
                    rows: vec![
                        UpdateRow {
                            values: vec![json!("b")],
                            qualifier: vec![json!(1), json!("a")],
                        },
                        UpdateRow {
                            values: vec![json!("c")],
                            qualifier: vec![json!(1), json!("stale")],
                        },
                    ],
                },
            )
            .unwrap();
        assert_eq!(outcome.affected_rows, vec![1, 0]);
        db.commit(&tx).unwrap();
        assert_eq!(db.rows("ARTIST").unwrap()[0]["ARTIST_NAME"], json!("b"));
    }

    #[test]
    fn delete_of_referenced_row_rejected() {
        let db = db();
        db.insert_row("ARTIST", snapshot_of([("ARTIST_NAME", json!("a"))])).unwrap();
        db.insert_row(
            "PAINTING",
            snapshot_of([("PAINTING_TITLE", json!("p")), ("ARTIST_ID", json!(1))]),
        )
        .unwrap();
        let tx = db.begin().unwrap();
        let err = db
            .execute_batch(
                &tx,
                &BatchStatement::Delete {
                    table: "ARTIST".into(),
                    qualifier_columns: vec!["ARTIST_ID".into()],
                    null_qualifier_columns: vec![],
                    rows: vec![vec![json!(1)]],
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { ref detail, .. } if detail.contains("PAINTING")));
        db.rollback(&tx).unwrap();
        assert_eq!(db.row_count("ARTIST").unwrap(), 1);
    }

    // ---------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------

    #[test]
    fn rollback_discards_work() {
        let db = db();
        let tx = db.begin().unwrap();
        db.execute_batch(&tx, &insert_artist("a")).unwrap();
        assert_eq!(db.select(Some(&tx), "ARTIST", &Snapshot::new()).unwrap().len(), 1);
        assert!(db.select(None, "ARTIST", &Snapshot::new()).unwrap().is_empty());
        db.rollback(&tx).unwrap();
        assert_eq!(db.row_count("ARTIST").unwrap(), 0);
        assert_eq!(db.open_transactions().unwrap(), 0);
    }

    #[test]
    fn rollback_only_commit_fails() {
        let db = db();
        let tx = db.begin().unwrap();
        db.execute_batch(&tx, &insert_artist("a")).unwrap();
        tx.mark_rollback_only();
        assert!(matches!(db.commit(&tx), Err(StoreError::RollbackOnly(_))));
        assert_eq!(db.row_count("ARTIST").unwrap(), 0);
    }

    #[test]
    fn failed_batch_leaves_no_partial_rows() {
        let db = db();
        db.fail_on("ARTIST", Some(1)).unwrap();
        let tx = db.begin().unwrap();
        let err = db
            .execute_batch(
                &tx,
                &BatchStatement::Insert {
                    table: "ARTIST".into(),
                    columns: vec!["ARTIST_NAME".into()],
                    rows: vec![vec![json!("a")], vec![json!("b")]],
                },
            )
            .unwrap_err();
        assert_eq!(err.row(), Some(1));
        assert!(db.select(Some(&tx), "ARTIST", &Snapshot::new()).unwrap().is_empty());
        db.rollback(&tx).unwrap();
    }

    #[test]
    fn statements_are_logged() {
        let db = db();
        let tx = db.begin().unwrap();
        db.execute_batch(&tx, &insert_artist("a")).unwrap();
        db.commit(&tx).unwrap();
        let log = db.statements().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, StatementKind::Insert);
        assert_eq!(log[0].table, "ARTIST");
        db.clear_statements().unwrap();
        assert!(db.statements().unwrap().is_empty());
    }

    #[test]
    fn select_filters_by_qualifier() {
        let db = db();
        db.insert_row("ARTIST", snapshot_of([("ARTIST_NAME", json!("a"))])).unwrap();
        db.insert_row("ARTIST", snapshot_of([("ARTIST_NAME", json!("b"))])).unwrap();
        let rows = db
            .select(None, "ARTIST", &snapshot_of([("ARTIST_NAME", json!("b"))]))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["ARTIST_ID"], json!(2));
        assert!(matches!(
            db.select(None, "NOPE", &Snapshot::new()),
            Err(StoreError::UnknownTable(_))
        ));
    }
}
