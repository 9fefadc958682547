use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;
use crate::value::{Snapshot, Value};

/// The key part of an [`ObjectId`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdKey {
    /// Client-generated placeholder for an object that was never inserted.
    /// Compared by token only; two temporary ids are never equal unless they
    /// are copies of the same id.
    Temporary(Uuid),
    /// Primary-key column → value mapping of a stored row.
    Permanent(Snapshot),
}

/// Identity of a persistent object.
///
/// An `ObjectId` is immutable once constructed. Its digest is computed once
/// from the entity name plus either the temporary token or the sorted key
/// values, and hashing only ever reads that digest.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "IdParts", into = "IdParts")]
pub struct ObjectId {
    entity_name: String,
    key: IdKey,
    digest: [u8; 32],
}

#[derive(Clone, Serialize, Deserialize)]
struct IdParts {
    entity_name: String,
    key: IdKey,
}

impl From<IdParts> for ObjectId {
    fn from(parts: IdParts) -> Self {
        Self::from_parts(parts.entity_name, parts.key)
    }
}

impl From<ObjectId> for IdParts {
    fn from(id: ObjectId) -> Self {
        Self {
            entity_name: id.entity_name,
            key: id.key,
        }
    }
}

impl ObjectId {
    fn from_parts(entity_name: String, key: IdKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"strata-oid-v1:");
        hasher.update(entity_name.as_bytes());
        match &key {
            IdKey::Temporary(token) => {
                hasher.update(b":tmp:");
                hasher.update(token.as_bytes());
            }
            IdKey::Permanent(values) => {
                hasher.update(b":pk:");
                for (column, value) in values {
                    hasher.update(column.as_bytes());
                    hasher.update(b"=");
                    hasher.update(value.to_string().as_bytes());
                    hasher.update(b";");
                }
            }
        }
        Self {
            entity_name,
            key,
            digest: *hasher.finalize().as_bytes(),
        }
    }

    /// Create a fresh temporary id for a new object of `entity_name`.
    pub fn temporary(entity_name: impl Into<String>) -> Self {
        Self::from_parts(entity_name.into(), IdKey::Temporary(Uuid::now_v7()))
    }

    /// Create a permanent id from primary-key values.
    pub fn permanent(entity_name: impl Into<String>, key: Snapshot) -> Result<Self, TypeError> {
        let entity_name = entity_name.into();
        if entity_name.is_empty() {
            return Err(TypeError::EmptyEntityName);
        }
        if key.is_empty() {
            return Err(TypeError::EmptyKey {
                entity: entity_name,
            });
        }
        Ok(Self::from_parts(entity_name, IdKey::Permanent(key)))
    }

    /// Permanent id with a single primary-key column.
    pub fn single(
        entity_name: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let mut key = Snapshot::new();
        key.insert(column.into(), value.into());
        Self::from_parts(entity_name.into(), IdKey::Permanent(key))
    }

    /// Entity this id belongs to.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn key(&self) -> &IdKey {
        &self.key
    }

    /// Returns `true` for ids of objects that were never stored.
    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    /// The temporary token, if any.
    pub fn temporary_key(&self) -> Option<Uuid> {
        match self.key {
            IdKey::Temporary(token) => Some(token),
            IdKey::Permanent(_) => None,
        }
    }

    /// Primary-key values of a permanent id.
    pub fn id_snapshot(&self) -> Option<&Snapshot> {
        match &self.key {
            IdKey::Permanent(values) => Some(values),
            IdKey::Temporary(_) => None,
        }
    }

    /// Value of one primary-key column of a permanent id.
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.id_snapshot().and_then(|values| values.get(column))
    }

    /// The identity digest.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Short identifier (entity name plus first 8 hex characters of the digest).
    pub fn short_id(&self) -> String {
        format!("{}:{}", self.entity_name, hex::encode(&self.digest[..4]))
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.entity_name == other.entity_name && self.key == other.key
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(&self.digest[..8]);
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Temporary(token) => write!(f, "{}<tmp:{}>", self.entity_name, token.simple()),
            IdKey::Permanent(values) => {
                write!(f, "{}<", self.entity_name)?;
                for (i, (column, value)) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{column}={value}")?;
                }
                write!(f, ">")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashSet;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn hash_of(id: &ObjectId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn permanent_ids_compare_structurally() {
        let a = ObjectId::single("Artist", "ID", 1);
        let b = ObjectId::single("Artist", "ID", 1);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn entity_name_is_part_of_identity() {
        let a = ObjectId::single("Artist", "ID", 1);
        let b = ObjectId::single("Painting", "ID", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn temporary_ids_never_collide() {
        let a = ObjectId::temporary("Artist");
        let b = ObjectId::temporary("Artist");
        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert_eq!(a, a.clone());
    }

    #[test]
    fn temporary_and_permanent_differ() {
        let tmp = ObjectId::temporary("Artist");
        assert!(tmp.id_snapshot().is_none());
        let perm = ObjectId::single("Artist", "ID", 5);
        assert_eq!(perm.key_value("ID"), Some(&json!(5)));
        assert_ne!(tmp, perm);
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = ObjectId::permanent("Artist", Snapshot::new()).unwrap_err();
        assert!(matches!(err, TypeError::EmptyKey { .. }));
        assert_eq!(
            ObjectId::permanent("", Snapshot::new()).unwrap_err(),
            TypeError::EmptyEntityName
        );
    }

    #[test]
    fn compound_keys_ignore_insertion_order() {
        let mut k1 = Snapshot::new();
        k1.insert("A".into(), json!(1));
        k1.insert("B".into(), json!("x"));
        let mut k2 = Snapshot::new();
        k2.insert("B".into(), json!("x"));
        k2.insert("A".into(), json!(1));
        let a = ObjectId::permanent("Join", k1).unwrap();
        let b = ObjectId::permanent("Join", k2).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn display_formats() {
        let perm = ObjectId::single("Artist", "ID", 7);
        assert_eq!(perm.to_string(), "Artist<ID=7>");
        let tmp = ObjectId::temporary("Artist");
        assert!(tmp.to_string().starts_with("Artist<tmp:"));
        assert!(perm.short_id().starts_with("Artist:"));
        assert_eq!(perm.short_id().len(), "Artist:".len() + 8);
    }

    #[test]
    fn serde_roundtrip_preserves_identity() {
        let tmp = ObjectId::temporary("Artist");
        let json = serde_json::to_string(&tmp).unwrap();
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tmp);
        assert_eq!(parsed.digest(), tmp.digest());
    }

    #[test]
    fn usable_as_set_key() {
        let mut set = HashSet::new();
        set.insert(ObjectId::single("Artist", "ID", 1));
        set.insert(ObjectId::single("Artist", "ID", 1));
        set.insert(ObjectId::single("Artist", "ID", 2));
        assert_eq!(set.len(), 2);
    }

    proptest! {
        #[test]
        fn equal_keys_hash_equal(entity in "[A-Z][a-z]{0,8}", key in any::<i64>()) {
            let a = ObjectId::single(entity.clone(), "ID", key);
            let b = ObjectId::single(entity, "ID", key);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(hash_of(&a), hash_of(&b));
        }

        #[test]
        fn distinct_keys_are_unequal(key_a in any::<i64>(), key_b in any::<i64>()) {
            prop_assume!(key_a != key_b);
            let a = ObjectId::single("Artist", "ID", key_a);
            let b = ObjectId::single("Artist", "ID", key_b);
            prop_assert_ne!(a.digest(), b.digest());
            prop_assert_ne!(a, b);
        }
    }
}
