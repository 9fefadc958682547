use serde::{Deserialize, Serialize};

use crate::error::ContextResult;

/// Settings shared by every context of a domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Maximum number of rows kept in the row cache.
    pub cache_capacity: usize,
    /// One cache for all root contexts. When `false` every root context
    /// gets a private cache and sees no sibling events.
    pub shared_cache: bool,
    /// Buffered snapshot events per subscriber before the oldest are dropped.
    pub event_channel_capacity: usize,
    /// Run the validation pipeline before every commit.
    pub validate_on_commit: bool,
    /// Skip validation entirely, whatever `validate_on_commit` says.
    pub permissive: bool,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            shared_cache: true,
            event_channel_capacity: 1024,
            validate_on_commit: true,
            permissive: false,
        }
    }
}

impl DomainConfig {
    /// A configuration that commits without validation.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Default::default()
        }
    }

    /// Parse from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> ContextResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validates(&self) -> bool {
        self.validate_on_commit && !self.permissive
    }
}
