//! Storage collaborators for Strata.
//!
//! The flush engine talks to storage only through the [`Storage`] trait:
//! explicit transactions, ordered batch execution returning generated keys,
//! simple equality selects, and a primary-key sequence. The crate also
//! provides the reference [`InMemoryDatabase`] backend and the [`RowCache`]
//! shared by every context of a domain.
//!
//! # Key Types
//!
//! - [`Storage`] / [`TxHandle`] -- Executor and transaction contract
//! - [`BatchStatement`] / [`BatchOutcome`] -- Resolved statements and results
//! - [`InMemoryDatabase`] -- Constraint-checking in-memory backend
//! - [`RowCache`] / [`SnapshotEvent`] -- Bounded row cache with change broadcast

pub mod batch;
pub mod cache;
pub mod error;
pub mod memory;
pub mod traits;

pub use batch::{BatchOutcome, BatchStatement, ExecutedStatement, StatementKind, UpdateRow};
pub use cache::{RowCache, SnapshotEvent};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryDatabase;
pub use traits::{Storage, TxHandle};
