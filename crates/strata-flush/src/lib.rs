//! Flush engine for Strata.
//!
//! Turns the pending changes of a [`GraphManager`](strata_graph::GraphManager)
//! into ordered batch statements and runs them against a
//! [`Storage`](strata_store::Storage) backend:
//!
//! 1. **Collect** the NEW, MODIFIED and DELETED objects.
//! 2. **Cascade** delete rules from every deleted object.
//! 3. **Classify** objects into insert, update and delete buckets, building
//!    rows, qualifiers, dependent-table rows and join-table rows.
//! 4. **Order** batches so referenced rows are written first and removed
//!    last.
//! 5. **Execute** every batch in one transaction, resolving keys of rows
//!    inserted earlier in the same flush.
//! 6. **Remap** temporary ids to the permanent ids built from stored keys.
//! 7. **Finalize** by re-keying map relationships and accepting the new
//!    baseline.
//!
//! # Key Types
//!
//! - [`FlushEngine`] / [`FlushOutcome`] -- Runs a flush and reports its results
//! - [`DeleteAction`] -- Applies delete rules before anything is removed
//! - [`Classifier`] / [`FlushPlan`] -- Sync buckets and their rows
//! - [`QualifierBuilder`] / [`Qualifier`] -- WHERE clauses for updates and deletes
//! - [`EntitySorter`] -- Table order derived from foreign keys
//! - [`DeferredValue`] / [`ReplacementMap`] -- Keys known only during execution
//! - [`FaultResolver`] / [`StorageFaults`] -- Loading HOLLOW objects and to-many faults
//! - [`ValidationPipeline`] -- Pre-commit checks

pub mod cascade;
pub mod classifier;
pub mod deferred;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod faults;
pub mod qualifier;
pub mod rows;
pub mod sorter;
pub mod validation;

pub use cascade::DeleteAction;
pub use classifier::{Classifier, FlushPlan};
pub use deferred::{DeferredValue, ReplacementMap};
pub use descriptor::{BatchDescriptor, DeleteRowPlan, InsertRowPlan, RowKind, UpdateRowPlan};
pub use engine::{CommitSummary, FlushEngine, FlushOutcome, FlushStage};
pub use error::{FlushError, FlushResult};
pub use faults::{FaultResolver, StorageFaults};
pub use qualifier::{Qualifier, QualifierBuilder};
pub use rows::{complete_row, fetch_row, id_from_row, object_row, values_from_row, DecodedRow};
pub use sorter::{layers, EntitySorter};
pub use validation::{MandatoryAttributes, MandatoryToOne, ValidationFailure, ValidationPipeline, Validator};
