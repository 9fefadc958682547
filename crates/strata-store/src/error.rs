use uuid::Uuid;

/// Errors from storage and cache operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {table}.{column}")]
    UnknownColumn { table: String, column: String },

    #[error("{table} row {row}: column {column} must not be null")]
    NotNullViolation {
        table: String,
        row: usize,
        column: String,
    },

    #[error("{table} row {row}: duplicate primary key")]
    DuplicateKey { table: String, row: usize },

    #[error("{table} row {row}: foreign key violation ({detail})")]
    ForeignKeyViolation {
        table: String,
        row: usize,
        detail: String,
    },

    /// Failure raised on purpose by a test backend.
    #[error("{table} row {row}: injected failure")]
    InjectedFailure { table: String, row: usize },

    #[error("unknown transaction {0}")]
    UnknownTransaction(Uuid),

    #[error("transaction {0} is marked rollback-only")]
    RollbackOnly(Uuid),

    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Table a row-level failure happened in.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::UnknownTable(table)
            | Self::UnknownColumn { table, .. }
            | Self::NotNullViolation { table, .. }
            | Self::DuplicateKey { table, .. }
            | Self::ForeignKeyViolation { table, .. }
            | Self::InjectedFailure { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Index of the failed row within its batch.
    pub fn row(&self) -> Option<usize> {
        match self {
            Self::NotNullViolation { row, .. }
            | Self::DuplicateKey { row, .. }
            | Self::ForeignKeyViolation { row, .. }
            | Self::InjectedFailure { row, .. } => Some(*row),
            _ => None,
        }
    }
}

/// Result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
