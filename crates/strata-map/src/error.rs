//! Error types for mapping metadata.

/// Errors produced while loading or validating mapping metadata.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("unknown db entity: {0}")]
    UnknownDbEntity(String),

    #[error("unknown object entity: {0}")]
    UnknownObjEntity(String),

    #[error("duplicate entity name: {0}")]
    DuplicateEntity(String),

    #[error("{entity} has no property named {property}")]
    UnknownProperty { entity: String, property: String },

    #[error("{entity} has no column named {column}")]
    UnknownColumn { entity: String, column: String },

    #[error("{entity} has no db relationship named {relationship}")]
    UnknownDbRelationship { entity: String, relationship: String },

    #[error("db entity {0} declares no primary key")]
    MissingPrimaryKey(String),

    /// A property path uses a shape the flush engine cannot handle.
    #[error("unsupported path '{path}' for {entity}.{property}: {reason}")]
    UnsupportedPath {
        entity: String,
        property: String,
        path: String,
        reason: String,
    },

    /// Relationship path steps do not chain source to target.
    #[error("broken path '{path}' for {entity}.{property}")]
    BrokenPath {
        entity: String,
        property: String,
        path: String,
    },

    #[error("invalid map key '{key}' for {entity}.{relationship}")]
    InvalidMapKey {
        entity: String,
        relationship: String,
        key: String,
    },

    #[error("mapping parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias for mapping operations.
pub type MapResult<T> = Result<T, MapError>;
