use strata_graph::GraphError;
use strata_map::MapError;
use strata_store::StoreError;
use strata_types::ObjectId;

use crate::validation::ValidationFailure;

/// Errors raised while deleting objects or flushing a graph.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    /// A DENY rule blocks the delete. Nothing was changed.
    #[error("cannot delete {id}: {entity}.{relationship} still has related objects")]
    DeleteDenied {
        entity: String,
        id: ObjectId,
        relationship: String,
    },

    /// The mapping has a shape the flush engine cannot translate.
    #[error("cannot classify {entity}.{property}: {reason}")]
    Classifier {
        entity: String,
        property: String,
        reason: String,
    },

    /// A deferred value was consumed before the row producing it was
    /// inserted.
    #[error("no value for {column} of {object} at resolution time")]
    Propagation { object: ObjectId, column: String },

    #[error("entity {entity} is read-only")]
    ReadOnlyEntity { entity: String },

    #[error("validation failed with {} failure(s)", .0.len())]
    Validation(Vec<ValidationFailure>),

    /// An optimistic update or delete matched no row.
    #[error("optimistic lock failure on {table} row {row} (qualifier {qualifier})")]
    OptimisticLockFailure {
        table: String,
        row: usize,
        qualifier: String,
    },

    #[error("object {0} not found in storage")]
    ObjectNotFound(ObjectId),

    #[error("storage failure: {source}")]
    Storage {
        table: Option<String>,
        row: Option<usize>,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Map(#[from] MapError),
}

impl FlushError {
    /// Whether the caller can fix the cause and retry the same commit.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DeleteDenied { .. }
                | Self::ReadOnlyEntity { .. }
                | Self::Validation(_)
                | Self::OptimisticLockFailure { .. }
        )
    }

    /// Convert a mapping error met during classification.
    pub(crate) fn classifier(err: MapError) -> Self {
        match err {
            MapError::UnsupportedPath {
                entity,
                property,
                reason,
                ..
            } => Self::Classifier {
                entity,
                property,
                reason,
            },
            other => Self::Map(other),
        }
    }
}

impl From<StoreError> for FlushError {
    fn from(source: StoreError) -> Self {
        Self::Storage {
            table: source.table().map(str::to_string),
            row: source.row(),
            source,
        }
    }
}

/// Result alias for flush operations.
pub type FlushResult<T> = Result<T, FlushError>;
