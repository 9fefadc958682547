use strata_flush::FlushError;
use strata_graph::GraphError;
use strata_map::MapError;
use strata_store::StoreError;

/// Errors surfaced by object contexts.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context has no parent")]
    NoParent,

    #[error("invalid domain configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Flush(#[from] FlushError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("cache error: {0}")]
    Store(#[from] StoreError),
}

impl ContextError {
    /// Whether fixing the reported cause and committing again can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Flush(err) => err.is_recoverable(),
            _ => false,
        }
    }
}

pub type ContextResult<T> = Result<T, ContextError>;
