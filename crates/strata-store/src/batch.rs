//! Resolved batch statements.
//!
//! A [`BatchStatement`] is one parameterized statement applied to many rows.
//! Every value is a literal: deferred values are resolved by the flush engine
//! immediately before the batch is handed to storage.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_types::{Snapshot, Value};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// SET values plus WHERE values of one updated row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRow {
    pub values: Vec<Value>,
    pub qualifier: Vec<Value>,
}

/// One statement template applied to a list of rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BatchStatement {
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Update {
        table: String,
        set_columns: Vec<String>,
        qualifier_columns: Vec<String>,
        /// Columns qualified with `IS NULL`; they carry no row value.
        null_qualifier_columns: Vec<String>,
        rows: Vec<UpdateRow>,
    },
    Delete {
        table: String,
        qualifier_columns: Vec<String>,
        null_qualifier_columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
}

impl BatchStatement {
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

    pub fn row_count(&self) -> usize {
        match self {
            Self::Insert { rows, .. } | Self::Delete { rows, .. } => rows.len(),
            Self::Update { rows, .. } => rows.len(),
        }
    }
}

impl fmt::Display for BatchStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert { table, columns, rows } => write!(
                f,
                "INSERT INTO {table} ({}) x{}",
                columns.join(", "),
                rows.len()
            ),
            Self::Update {
                table,
                set_columns,
                qualifier_columns,
                null_qualifier_columns,
                rows,
            } => write!(
                f,
                "UPDATE {table} SET ({}) WHERE ({}{}{}) x{}",
                set_columns.join(", "),
                qualifier_columns.join(", "),
                if null_qualifier_columns.is_empty() { "" } else { "; null: " },
                null_qualifier_columns.join(", "),
                rows.len()
            ),
            Self::Delete {
                table,
                qualifier_columns,
                null_qualifier_columns,
                rows,
            } => write!(
                f,
                "DELETE FROM {table} WHERE ({}{}{}) x{}",
                qualifier_columns.join(", "),
                if null_qualifier_columns.is_empty() { "" } else { "; null: " },
                null_qualifier_columns.join(", "),
                rows.len()
            ),
        }
    }
}

/// Per-row results of one executed batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchOutcome {
    /// Database-assigned column values, one entry per inserted row.
    pub generated_keys: Vec<Snapshot>,
    /// Rows matched by each update or delete row, 1 for each insert row.
    pub affected_rows: Vec<usize>,
}

/// A statement the backend executed, kept for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub tx: Uuid,
    pub kind: StatementKind,
    pub table: String,
    pub rows: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accessors() {
        let insert = BatchStatement::Insert {
            table: "ARTIST".into(),
            columns: vec!["ARTIST_NAME".into()],
            rows: vec![vec![json!("a")], vec![json!("b")]],
        };
        assert_eq!(insert.table(), "ARTIST");
        assert_eq!(insert.kind(), StatementKind::Insert);
        assert_eq!(insert.row_count(), 2);
        assert_eq!(insert.to_string(), "INSERT INTO ARTIST (ARTIST_NAME) x2");
    }

    #[test]
    fn update_display_lists_null_qualifiers() {
        let update = BatchStatement::Update {
            table: "PAINTING".into(),
            set_columns: vec!["ESTIMATED_PRICE".into()],
            qualifier_columns: vec!["PAINTING_ID".into()],
            null_qualifier_columns: vec!["ARTIST_ID".into()],
            rows: vec![UpdateRow {
                values: vec![json!(10)],
                qualifier: vec![json!(1)],
            }],
        };
        assert_eq!(
            update.to_string(),
            "UPDATE PAINTING SET (ESTIMATED_PRICE) WHERE (PAINTING_ID; null: ARTIST_ID) x1"
        );
    }
}
