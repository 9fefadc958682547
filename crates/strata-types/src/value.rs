//! Attribute values and snapshots.
//!
//! Values are plain JSON values so that snapshots, diffs and batch rows can
//! cross a serialization boundary without a bespoke codec.

use std::collections::BTreeMap;

/// A single attribute or column value.
pub type Value = serde_json::Value;

/// A name → value map: object properties, a database row, or a key map.
///
/// `BTreeMap` keeps iteration order deterministic, which matters for hashing
/// identities and for building batch column lists.
pub type Snapshot = BTreeMap<String, Value>;

/// Build a snapshot from `(name, value)` pairs.
pub fn snapshot_of<K, V, I>(pairs: I) -> Snapshot
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_of_orders_keys() {
        let snap = snapshot_of([("b", json!(2)), ("a", json!(1))]);
        let keys: Vec<&String> = snap.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
