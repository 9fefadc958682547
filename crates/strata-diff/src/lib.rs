//! Graph diffs for Strata.
//!
//! Every change made to an object graph is expressed as a [`GraphDiff`]
//! operation. Operations are replayed against a [`GraphChangeHandler`],
//! grouped into a [`CompoundDiff`] to cross a context boundary, and folded
//! per object into an [`ObjectDiff`] that remembers the baseline the object
//! had at its last synchronization point.
//!
//! # Key Types
//!
//! - [`GraphDiff`] -- A single create/remove/id-change/property/arc operation
//! - [`CompoundDiff`] -- An ordered, replayable, serializable list of operations
//! - [`ObjectDiff`] / [`ArcKind`] -- Per-object delta against a baseline
//! - [`SnapshotDiff`] / [`SnapshotChange`] -- Column or property map comparison

pub mod error;
pub mod graph_diff;
pub mod object_diff;
pub mod snapshot_diff;

pub use error::{DiffError, DiffResult};
pub use graph_diff::{CompoundDiff, DiffCollector, GraphChangeHandler, GraphDiff};
pub use object_diff::{ArcKind, ArcOperation, ObjectDiff};
pub use snapshot_diff::{diff_snapshots, SnapshotChange, SnapshotDiff};
