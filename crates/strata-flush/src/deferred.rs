//! Column values that only become known while a flush executes.

use std::collections::HashMap;

use strata_types::{ObjectId, Snapshot, Value};
use tracing::trace;

use crate::error::{FlushError, FlushResult};

/// A column value in a batch row.
#[derive(Clone, Debug, PartialEq)]
pub enum DeferredValue {
    Literal(Value),
    /// The value `column` takes in the row inserted for `object`, read from
    /// the [`ReplacementMap`] once that row exists.
    PropagatedFrom { object: ObjectId, column: String },
}

impl DeferredValue {
    pub fn null() -> Self {
        Self::Literal(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Literal(Value::Null))
    }

    pub fn resolve(&self, replacements: &ReplacementMap) -> FlushResult<Value> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::PropagatedFrom { object, column } => {
                let value = replacements.value(object, column).cloned().ok_or_else(|| {
                    FlushError::Propagation {
                        object: object.clone(),
                        column: column.clone(),
                    }
                })?;
                trace!(object = %object, column = %column, value = %value, "deferred value resolved");
                Ok(value)
            }
        }
    }
}

impl From<Value> for DeferredValue {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

/// Primary-key values of objects whose row is being written, keyed by the
/// object's id before the flush.
#[derive(Clone, Debug, Default)]
pub struct ReplacementMap {
    values: HashMap<ObjectId, Snapshot>,
}

impl ReplacementMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `values` into the entry for `id`.
    pub fn record(&mut self, id: &ObjectId, values: Snapshot) {
        self.values.entry(id.clone()).or_default().extend(values);
    }

    pub fn get(&self, id: &ObjectId) -> Option<&Snapshot> {
        self.values.get(id)
    }

    pub fn value(&self, id: &ObjectId, column: &str) -> Option<&Value> {
        self.values.get(id)?.get(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
