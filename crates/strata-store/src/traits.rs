use std::sync::atomic::{AtomicBool, Ordering};

use strata_types::{Snapshot, Value};
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchStatement};
use crate::error::StoreResult;

/// An open storage transaction.
///
/// Handles are passed explicitly; nothing is bound to the current thread.
/// A handle marked rollback-only can no longer be committed.
#[derive(Debug)]
pub struct TxHandle {
    id: Uuid,
    rollback_only: AtomicBool,
}

impl TxHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            rollback_only: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }
}

impl Default for TxHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Statement executor and transaction boundary.
///
/// All implementations must satisfy these invariants:
/// - A batch either applies every row or fails as a whole; the error names
///   the table and the index of the failing row.
/// - Work done through a transaction is invisible to other transactions
///   until `commit` succeeds, and discarded by `rollback`.
/// - `commit` of a rollback-only transaction fails and discards its work.
pub trait Storage: Send + Sync {
    fn begin(&self) -> StoreResult<TxHandle>;

    fn commit(&self, tx: &TxHandle) -> StoreResult<()>;

    fn rollback(&self, tx: &TxHandle) -> StoreResult<()>;

    /// Execute one batch inside `tx`.
    fn execute_batch(&self, tx: &TxHandle, batch: &BatchStatement) -> StoreResult<BatchOutcome>;

    /// Execute batches in order, stopping at the first failure.
    ///
    /// Default implementation calls `execute_batch()` for each batch.
    fn execute(&self, tx: &TxHandle, batches: &[BatchStatement]) -> StoreResult<Vec<BatchOutcome>> {
        batches
            .iter()
            .map(|batch| self.execute_batch(tx, batch))
            .collect()
    }

    /// Rows of `table` whose columns equal every entry of `qualifier`.
    ///
    /// Reads committed data, or the transaction's own view when `tx` is set.
    fn select(&self, tx: Option<&TxHandle>, table: &str, qualifier: &Snapshot) -> StoreResult<Vec<Snapshot>>;

    /// Draw the next value of the table's primary-key sequence.
    fn next_primary_key(&self, table: &str) -> StoreResult<Value>;
}
