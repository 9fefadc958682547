use strata_map::MapError;
use strata_types::ObjectId;

/// Errors raised while editing or recording changes to an object graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A different live object is already registered under this id.
    #[error("duplicate identity: {0} is already registered")]
    DuplicateIdentity(ObjectId),

    #[error("object not registered: {0}")]
    UnknownObject(ObjectId),

    #[error("{entity}.{property} is not {expected}")]
    WrongPropertyKind {
        entity: String,
        property: String,
        expected: &'static str,
    },

    #[error("object {0} is deleted")]
    ObjectDeleted(ObjectId),

    #[error(transparent)]
    Map(#[from] MapError),
}

/// Result alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
