//! Object entity metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Arc names starting with this prefix name a db relationship directly
/// rather than an object property ("phantom" foreign-key arcs).
pub const DB_ARC_PREFIX: &str = "db:";

/// What happens to related objects when the source object is deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteRule {
    /// Leave related objects untouched.
    #[default]
    NoAction,
    /// Clear the reverse relationship on related objects.
    Nullify,
    /// Delete related objects too.
    Cascade,
    /// Refuse the delete while related objects exist.
    Deny,
}

impl fmt::Display for DeleteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoAction => "no_action",
            Self::Nullify => "nullify",
            Self::Cascade => "cascade",
            Self::Deny => "deny",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    #[default]
    None,
    /// Update and delete qualifiers include previously known values of the
    /// properties marked `used_for_locking`.
    Optimistic,
}

/// An entity as seen by application code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjEntity {
    pub name: String,
    /// Root table.
    pub db_entity: String,
    #[serde(default)]
    pub attributes: Vec<ObjAttribute>,
    #[serde(default)]
    pub relationships: Vec<ObjRelationship>,
    #[serde(default)]
    pub lock_type: LockType,
    #[serde(default)]
    pub read_only: bool,
}

impl ObjEntity {
    pub fn new(name: impl Into<String>, db_entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_entity: db_entity.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            lock_type: LockType::None,
            read_only: false,
        }
    }

    pub fn with_attribute(mut self, attribute: ObjAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_relationship(mut self, relationship: ObjRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn optimistic(mut self) -> Self {
        self.lock_type = LockType::Optimistic;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&ObjAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&ObjRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// The attribute mapped directly to a root-table column, if any.
    pub fn attribute_for_column(&self, column: &str) -> Option<&ObjAttribute> {
        self.attributes
            .iter()
            .find(|a| !a.is_flattened() && a.db_path == column)
    }

    pub fn is_optimistic(&self) -> bool {
        self.lock_type == LockType::Optimistic
    }
}

/// A simple property.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjAttribute {
    pub name: String,
    /// A root-table column, or `relationship.COLUMN` for a column stored in
    /// a dependent table.
    pub db_path: String,
    #[serde(default)]
    pub used_for_locking: bool,
}

impl ObjAttribute {
    pub fn new(name: impl Into<String>, db_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_path: db_path.into(),
            used_for_locking: false,
        }
    }

    pub fn locking(mut self) -> Self {
        self.used_for_locking = true;
        self
    }

    pub fn is_flattened(&self) -> bool {
        self.db_path.contains('.')
    }

    /// Split a flattened path into (db relationship, column).
    pub fn dependent_column(&self) -> Option<(&str, &str)> {
        self.db_path.rsplit_once('.')
    }
}

/// A relationship between object entities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjRelationship {
    pub name: String,
    /// Target object entity.
    pub target: String,
    /// Dot-separated db relationship names starting at the source's root
    /// table. Two steps denote a many-to-many through a join table.
    pub db_path: String,
    #[serde(default)]
    pub delete_rule: DeleteRule,
    #[serde(default)]
    pub used_for_locking: bool,
    /// For to-many relationships exposed as a map: the target attribute
    /// whose value keys the map.
    #[serde(default)]
    pub map_key: Option<String>,
}

impl ObjRelationship {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        db_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            db_path: db_path.into(),
            delete_rule: DeleteRule::NoAction,
            used_for_locking: false,
            map_key: None,
        }
    }

    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    pub fn locking(mut self) -> Self {
        self.used_for_locking = true;
        self
    }

    pub fn map_key(mut self, key: impl Into<String>) -> Self {
        self.map_key = Some(key.into());
        self
    }

    pub fn steps(&self) -> Vec<&str> {
        self.db_path.split('.').collect()
    }

    /// Spans an intermediate join table.
    pub fn is_flattened(&self) -> bool {
        self.db_path.contains('.')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattened_attribute_path() {
        let bio = ObjAttribute::new("biography", "artistInfo.BIO");
        assert!(bio.is_flattened());
        assert_eq!(bio.dependent_column(), Some(("artistInfo", "BIO")));
        let name = ObjAttribute::new("artistName", "ARTIST_NAME");
        assert!(!name.is_flattened());
        assert_eq!(name.dependent_column(), None);
    }

    #[test]
    fn relationship_steps() {
        let rel = ObjRelationship::new("exhibitArray", "Exhibit", "artistExhibitArray.toExhibit");
        assert!(rel.is_flattened());
        assert_eq!(rel.steps(), vec!["artistExhibitArray", "toExhibit"]);
    }

    #[test]
    fn attribute_for_column_skips_flattened() {
        let entity = ObjEntity::new("Artist", "ARTIST")
            .with_attribute(ObjAttribute::new("artistName", "ARTIST_NAME"))
            .with_attribute(ObjAttribute::new("bio", "artistInfo.ARTIST_NAME"));
        assert_eq!(
            entity.attribute_for_column("ARTIST_NAME").map(|a| a.name.as_str()),
            Some("artistName")
        );
    }

    #[test]
    fn delete_rule_serde_names() {
        let rule: DeleteRule = serde_json::from_str("\"cascade\"").unwrap();
        assert_eq!(rule, DeleteRule::Cascade);
        assert_eq!(DeleteRule::NoAction.to_string(), "no_action");
        let lock: LockType = serde_json::from_str("\"optimistic\"").unwrap();
        assert_eq!(lock, LockType::Optimistic);
    }
}
