//! Object graph for Strata.
//!
//! A [`GraphManager`] is the unit of work behind one object context: it owns
//! every live [`PersistentObject`] keyed by [`ObjectId`](strata_types::ObjectId),
//! records each mutation into a per-object [`ObjectDiff`](strata_diff::ObjectDiff)
//! and an ordered [`ChangeLog`], and can fold the accumulated changes into a
//! replayable [`CompoundDiff`](strata_diff::CompoundDiff).
//!
//! Relationship edits keep both sides consistent: setting a to-one updates
//! the reverse collection, and to-many relationships without a mapped
//! reverse record a phantom foreign-key arc on the target so its column is
//! still written.
//!
//! # Key Types
//!
//! - [`GraphManager`] -- Identity map, diffs, editing, commit and rollback
//! - [`ObjectRef`] / [`PersistentObject`] -- Shared handle and object state
//! - [`ToMany`] / [`Collection`] -- Possibly faulted to-many contents
//! - [`ChangeLog`] -- Ordered operations with named markers

pub mod change_log;
pub mod error;
pub mod manager;
pub mod object;

pub use change_log::ChangeLog;
pub use error::{GraphError, GraphResult};
pub use manager::{GraphManager, Savepoint};
pub use object::{map_key_of, Collection, ObjectRef, PersistentObject, ToMany};
