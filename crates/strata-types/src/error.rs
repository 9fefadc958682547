use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("permanent identity for {entity} requires at least one key value")]
    EmptyKey { entity: String },

    #[error("entity name must not be empty")]
    EmptyEntityName,

    #[error("unknown persistence state: {0}")]
    UnknownState(String),
}
