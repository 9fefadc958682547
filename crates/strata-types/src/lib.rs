//! Foundation types for Strata.
//!
//! This crate provides the identity, state, and value types shared by every
//! other Strata crate: the graph manager, the diff engine, the flush
//! orchestrator, and the storage collaborators.
//!
//! # Key Types
//!
//! - [`ObjectId`] -- Temporary or permanent identity of a persistent object
//! - [`PersistenceState`] -- Per-object lifecycle state
//! - [`Value`] / [`Snapshot`] -- Attribute values and column/property maps

pub mod error;
pub mod identity;
pub mod state;
pub mod value;

pub use error::TypeError;
pub use identity::{IdKey, ObjectId};
pub use state::PersistenceState;
pub use value::{snapshot_of, Snapshot, Value};
