//! Planned batch statements whose rows may still hold deferred values.

use strata_store::{BatchStatement, StatementKind, UpdateRow};
use strata_types::ObjectId;

use crate::deferred::{DeferredValue, ReplacementMap};
use crate::error::FlushResult;

/// Which table of an object a row belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RowKind {
    /// The object's root table.
    Root,
    /// A table whose primary key is propagated from the root row.
    Dependent,
    /// A join-table row of a flattened relationship.
    Join,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InsertRowPlan {
    pub object: ObjectId,
    pub kind: RowKind,
    /// Aligned with the batch's columns.
    pub values: Vec<DeferredValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateRowPlan {
    pub object: ObjectId,
    pub kind: RowKind,
    pub values: Vec<DeferredValue>,
    /// Aligned with the batch's non-null qualifier columns.
    pub qualifier: Vec<DeferredValue>,
    /// Zero matched rows is an optimistic lock failure.
    pub locking: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteRowPlan {
    pub object: ObjectId,
    pub kind: RowKind,
    pub qualifier: Vec<DeferredValue>,
    pub locking: bool,
}

/// A batch of same-shaped rows against one table.
///
/// `layer` orders batches of a table that references itself: rows of a
/// lower layer must be written first.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchDescriptor {
    Insert {
        table: String,
        layer: usize,
        columns: Vec<String>,
        rows: Vec<InsertRowPlan>,
    },
    Update {
        table: String,
        set_columns: Vec<String>,
        qualifier_columns: Vec<String>,
        null_qualifier_columns: Vec<String>,
        rows: Vec<UpdateRowPlan>,
    },
    Delete {
        table: String,
        layer: usize,
        qualifier_columns: Vec<String>,
        null_qualifier_columns: Vec<String>,
        rows: Vec<DeleteRowPlan>,
    },
}

impl BatchDescriptor {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }

    pub fn kind(&self) -> StatementKind {
        match self {
            Self::Insert { .. } => StatementKind::Insert,
            Self::Update { .. } => StatementKind::Update,
            Self::Delete { .. } => StatementKind::Delete,
        }
    }

    pub fn layer(&self) -> usize {
        match self {
            Self::Insert { layer, .. } | Self::Delete { layer, .. } => *layer,
            Self::Update { .. } => 0,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Insert { rows, .. } => rows.len(),
            Self::Update { rows, .. } => rows.len(),
            Self::Delete { rows, .. } => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Object and row kind of row `index`.
    pub fn row_source(&self, index: usize) -> Option<(&ObjectId, RowKind)> {
        match self {
            Self::Insert { rows, .. } => rows.get(index).map(|r| (&r.object, r.kind)),
            Self::Update { rows, .. } => rows.get(index).map(|r| (&r.object, r.kind)),
            Self::Delete { rows, .. } => rows.get(index).map(|r| (&r.object, r.kind)),
        }
    }

    /// Whether row `index` is checked for a matched row after execution.
    pub fn is_locking(&self, index: usize) -> bool {
        match self {
            Self::Insert { .. } => false,
            Self::Update { rows, .. } => rows.get(index).is_some_and(|r| r.locking),
            Self::Delete { rows, .. } => rows.get(index).is_some_and(|r| r.locking),
        }
    }

    /// Substitute every deferred value, producing an executable statement.
    pub fn resolve(&self, replacements: &ReplacementMap) -> FlushResult<BatchStatement> {
        let resolve_all = |values: &[DeferredValue]| -> FlushResult<Vec<_>> {
            values.iter().map(|v| v.resolve(replacements)).collect()
        };
        let statement = match self {
            Self::Insert {
                table,
                columns,
                rows,
                ..
            } => BatchStatement::Insert {
                table: table.clone(),
                columns: columns.clone(),
                rows: rows
                    .iter()
                    .map(|row| resolve_all(&row.values))
                    .collect::<FlushResult<_>>()?,
            },
            Self::Update {
                table,
                set_columns,
                qualifier_columns,
                null_qualifier_columns,
                rows,
            } => BatchStatement::Update {
                table: table.clone(),
                set_columns: set_columns.clone(),
                qualifier_columns: qualifier_columns.clone(),
                null_qualifier_columns: null_qualifier_columns.clone(),
                rows: rows
                    .iter()
                    .map(|row| {
                        Ok(UpdateRow {
                            values: resolve_all(&row.values)?,
                            qualifier: resolve_all(&row.qualifier)?,
                        })
                    })
                    .collect::<FlushResult<_>>()?,
            },
            Self::Delete {
                table,
                qualifier_columns,
                null_qualifier_columns,
                rows,
                ..
            } => BatchStatement::Delete {
                table: table.clone(),
                qualifier_columns: qualifier_columns.clone(),
                null_qualifier_columns: null_qualifier_columns.clone(),
                rows: rows
                    .iter()
                    .map(|row| resolve_all(&row.qualifier))
                    .collect::<FlushResult<_>>()?,
            },
        };
        Ok(statement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_types::snapshot_of;

    #[test]
    fn insert_resolves_propagated_keys() {
        let artist = ObjectId::temporary("Artist");
        let painting = ObjectId::temporary("Painting");
        let batch = BatchDescriptor::Insert {
            table: "PAINTING".into(),
            layer: 0,
            columns: vec!["ARTIST_ID".into(), "PAINTING_TITLE".into()],
            rows: vec![InsertRowPlan {
                object: painting.clone(),
                kind: RowKind::Root,
                values: vec![
                    DeferredValue::PropagatedFrom {
                        object: artist.clone(),
                        column: "ARTIST_ID".into(),
                    },
                    json!("Sunflowers").into(),
                ],
            }],
        };
        let mut replacements = ReplacementMap::new();
        replacements.record(&artist, snapshot_of([("ARTIST_ID", json!(7))]));

        let statement = batch.resolve(&replacements).unwrap();
        assert_eq!(
            statement,
            BatchStatement::Insert {
                table: "PAINTING".into(),
                columns: vec!["ARTIST_ID".into(), "PAINTING_TITLE".into()],
                rows: vec![vec![json!(7), json!("Sunflowers")]],
            }
        );
        assert_eq!(batch.row_source(0), Some((&painting, RowKind::Root)));
        assert!(!batch.is_locking(0));
    }

    #[test]
    fn unresolvable_row_fails_the_whole_batch() {
        let batch = BatchDescriptor::Delete {
            table: "ARTIST".into(),
            layer: 0,
            qualifier_columns: vec!["ARTIST_ID".into()],
            null_qualifier_columns: Vec::new(),
            rows: vec![DeleteRowPlan {
                object: ObjectId::temporary("Artist"),
                kind: RowKind::Root,
                qualifier: vec![DeferredValue::PropagatedFrom {
                    object: ObjectId::temporary("Artist"),
                    column: "ARTIST_ID".into(),
                }],
                locking: true,
            }],
        };
        assert!(batch.resolve(&ReplacementMap::new()).is_err());
        assert!(batch.is_locking(0));
        assert_eq!(batch.kind(), StatementKind::Delete);
    }
}
