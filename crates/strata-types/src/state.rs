use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Lifecycle state of a persistent object relative to its context.
///
/// ```text
/// TRANSIENT -> NEW -> COMMITTED <-> MODIFIED
///                \        |   \        |
///                 \       v    \       v
///                  `-> TRANSIENT   DELETED -> (removed)
/// HOLLOW -> COMMITTED on fault resolution
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Not registered with any context.
    Transient,
    /// Registered, never stored.
    New,
    /// Identity known, attributes not loaded.
    Hollow,
    /// In sync with the last known committed state.
    Committed,
    /// Changed since the last commit.
    Modified,
    /// Marked for deletion.
    Deleted,
}

impl PersistenceState {
    /// States that make an object part of a flush.
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::New | Self::Modified | Self::Deleted)
    }

    /// States that have a stored row behind them.
    pub fn is_stored(self) -> bool {
        matches!(
            self,
            Self::Hollow | Self::Committed | Self::Modified | Self::Deleted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::New => "new",
            Self::Hollow => "hollow",
            Self::Committed => "committed",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersistenceState {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "transient" => Ok(Self::Transient),
            "new" => Ok(Self::New),
            "hollow" => Ok(Self::Hollow),
            "committed" => Ok(Self::Committed),
            "modified" => Ok(Self::Modified),
            "deleted" => Ok(Self::Deleted),
            other => Err(TypeError::UnknownState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_states() {
        assert!(PersistenceState::New.is_dirty());
        assert!(PersistenceState::Modified.is_dirty());
        assert!(PersistenceState::Deleted.is_dirty());
        assert!(!PersistenceState::Committed.is_dirty());
        assert!(!PersistenceState::Hollow.is_dirty());
        assert!(!PersistenceState::Transient.is_dirty());
    }

    #[test]
    fn parse_roundtrip() {
        for state in [
            PersistenceState::Transient,
            PersistenceState::New,
            PersistenceState::Hollow,
            PersistenceState::Committed,
            PersistenceState::Modified,
            PersistenceState::Deleted,
        ] {
            assert_eq!(state.to_string().parse::<PersistenceState>(), Ok(state));
        }
        assert!("bogus".parse::<PersistenceState>().is_err());
    }
}
