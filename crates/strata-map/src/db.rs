//! Physical table metadata.

use serde::{Deserialize, Serialize};

/// A physical table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbEntity {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<DbAttribute>,
    #[serde(default)]
    pub relationships: Vec<DbRelationship>,
}

impl DbEntity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: DbAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_relationship(mut self, relationship: DbRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&DbAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&DbRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Primary-key columns in declaration order.
    pub fn primary_key(&self) -> Vec<&DbAttribute> {
        self.attributes.iter().filter(|a| a.primary_key).collect()
    }

    /// Primary-key column names in declaration order.
    pub fn primary_key_names(&self) -> Vec<String> {
        self.primary_key().into_iter().map(|a| a.name.clone()).collect()
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.attribute(column).is_some_and(|a| a.primary_key)
    }

    /// Relationships whose joins hold a foreign key to another table's
    /// primary key on this side.
    pub fn foreign_keys<'a>(
        &'a self,
        target_of: impl Fn(&str) -> Option<&'a DbEntity> + 'a,
    ) -> impl Iterator<Item = (&'a DbRelationship, &'a DbEntity)> + 'a {
        self.relationships.iter().filter_map(move |rel| {
            let target = target_of(&rel.target)?;
            rel.is_foreign_key(target).then_some((rel, target))
        })
    }
}

/// A column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbAttribute {
    pub name: String,
    #[serde(default)]
    pub primary_key: bool,
    /// NOT NULL.
    #[serde(default)]
    pub mandatory: bool,
    /// Value is assigned by the database on insert.
    #[serde(default)]
    pub generated: bool,
}

impl DbAttribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            mandatory: false,
            generated: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Whether an insert must supply a non-null value for this column.
    pub fn is_not_null(&self) -> bool {
        self.mandatory || (self.primary_key && !self.generated)
    }
}

/// One column pair of a relationship join.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbJoin {
    /// Column on the relationship's source table.
    pub source: String,
    /// Column on the relationship's target table.
    pub target: String,
}

/// A directed relationship between two tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRelationship {
    pub name: String,
    /// Target table name.
    pub target: String,
    pub joins: Vec<DbJoin>,
    #[serde(default)]
    pub to_many: bool,
    /// The target's primary key is propagated from this side's primary key.
    #[serde(default)]
    pub to_dependent_pk: bool,
}

impl DbRelationship {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        source_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            joins: vec![DbJoin {
                source: source_column.into(),
                target: target_column.into(),
            }],
            to_many: false,
            to_dependent_pk: false,
        }
    }

    pub fn to_many(mut self) -> Self {
        self.to_many = true;
        self
    }

    pub fn to_dependent_pk(mut self) -> Self {
        self.to_dependent_pk = true;
        self
    }

    pub fn join(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.joins.push(DbJoin {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// All target-side join columns form the target's primary key.
    pub fn is_to_pk(&self, target: &DbEntity) -> bool {
        let pk = target.primary_key_names();
        !pk.is_empty()
            && pk.len() == self.joins.len()
            && self.joins.iter().all(|j| pk.contains(&j.target))
    }

    /// The source side holds a foreign key into the target's primary key.
    pub fn is_foreign_key(&self, target: &DbEntity) -> bool {
        !self.to_many && !self.to_dependent_pk && self.is_to_pk(target)
    }

    /// Whether `other` (declared on the target table) joins the same columns
    /// in the opposite direction.
    pub fn is_reverse_of(&self, other: &DbRelationship, source_table: &str) -> bool {
        if other.target != source_table || other.joins.len() != self.joins.len() {
            return false;
        }
        self.joins.iter().all(|j| {
            other
                .joins
                .iter()
                .any(|o| o.source == j.target && o.target == j.source)
        })
    }

    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.joins.iter().map(|j| j.source.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist() -> DbEntity {
        DbEntity::new("ARTIST")
            .with_attribute(DbAttribute::new("ARTIST_ID").primary_key().generated())
            .with_attribute(DbAttribute::new("ARTIST_NAME").mandatory())
            .with_relationship(
                DbRelationship::new("paintingArray", "PAINTING", "ARTIST_ID", "ARTIST_ID").to_many(),
            )
    }

    fn painting() -> DbEntity {
        DbEntity::new("PAINTING")
            .with_attribute(DbAttribute::new("PAINTING_ID").primary_key())
            .with_attribute(DbAttribute::new("ARTIST_ID"))
            .with_relationship(DbRelationship::new("toArtist", "ARTIST", "ARTIST_ID", "ARTIST_ID"))
    }

    #[test]
    fn primary_key_lookup() {
        let artist = artist();
        assert_eq!(artist.primary_key_names(), vec!["ARTIST_ID".to_string()]);
        assert!(artist.is_primary_key("ARTIST_ID"));
        assert!(!artist.is_primary_key("ARTIST_NAME"));
    }

    #[test]
    fn not_null_rules() {
        let artist = artist();
        assert!(!artist.attribute("ARTIST_ID").unwrap().is_not_null());
        assert!(artist.attribute("ARTIST_NAME").unwrap().is_not_null());
        let painting = painting();
        assert!(painting.attribute("PAINTING_ID").unwrap().is_not_null());
    }

    #[test]
    fn foreign_key_side() {
        let artist = artist();
        let painting = painting();
        let to_artist = painting.relationship("toArtist").unwrap();
        assert!(to_artist.is_foreign_key(&artist));
        let to_paintings = artist.relationship("paintingArray").unwrap();
        assert!(!to_paintings.is_foreign_key(&painting));
        assert!(to_paintings.is_reverse_of(to_artist, "ARTIST"));
        assert!(to_artist.is_reverse_of(to_paintings, "PAINTING"));
    }

    #[test]
    fn foreign_keys_iterator() {
        let artist = artist();
        let painting = painting();
        let fks: Vec<_> = painting
            .foreign_keys(|name| (name == "ARTIST").then_some(&artist))
            .map(|(rel, target)| (rel.name.clone(), target.name.clone()))
            .collect();
        assert_eq!(fks, vec![("toArtist".to_string(), "ARTIST".to_string())]);
    }
}
