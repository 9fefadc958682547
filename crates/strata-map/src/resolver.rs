//! The validated, indexed view over an [`EntityMap`].

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{DbEntity, DbRelationship};
use crate::error::{MapError, MapResult};
use crate::obj::{ObjAttribute, ObjEntity, ObjRelationship};

// ---------------------------------------------------------------------------
// EntityMap
// ---------------------------------------------------------------------------

/// The complete mapping: every table plus every object entity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMap {
    #[serde(default)]
    pub db_entities: Vec<DbEntity>,
    #[serde(default)]
    pub obj_entities: Vec<ObjEntity>,
}

impl EntityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db_entity(mut self, entity: DbEntity) -> Self {
        self.db_entities.push(entity);
        self
    }

    pub fn with_obj_entity(mut self, entity: ObjEntity) -> Self {
        self.obj_entities.push(entity);
        self
    }

    /// Parse a mapping from TOML text.
    pub fn from_toml_str(text: &str) -> MapResult<Self> {
        Ok(toml::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// ClassDescriptor
// ---------------------------------------------------------------------------

/// How a property of an object entity is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Attribute,
    ToOne,
    ToMany,
    /// To-many through a join table.
    Flattened,
}

impl PropertyKind {
    pub fn is_arc(self) -> bool {
        !matches!(self, Self::Attribute)
    }

    pub fn is_to_many(self) -> bool {
        matches!(self, Self::ToMany | Self::Flattened)
    }
}

/// Property layout of one object entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub entity: String,
    pub attributes: Vec<String>,
    pub to_one: Vec<String>,
    pub to_many: Vec<String>,
    /// Properties whose previous values qualify optimistic updates. Empty
    /// unless the entity uses optimistic locking.
    pub locked: Vec<String>,
    kinds: HashMap<String, PropertyKind>,
}

impl ClassDescriptor {
    pub fn property_kind(&self, property: &str) -> Option<PropertyKind> {
        self.kinds.get(property).copied()
    }

    pub fn has_property(&self, property: &str) -> bool {
        self.kinds.contains_key(property)
    }
}

// ---------------------------------------------------------------------------
// EntityResolver
// ---------------------------------------------------------------------------

/// Indexed, validated mapping metadata.
#[derive(Clone, Debug)]
pub struct EntityResolver {
    map: EntityMap,
    db_entities: IndexMap<String, usize>,
    obj_entities: IndexMap<String, usize>,
    descriptors: HashMap<String, ClassDescriptor>,
    reverses: HashMap<(String, String), String>,
}

impl EntityResolver {
    /// Index and validate a mapping.
    pub fn new(map: EntityMap) -> MapResult<Self> {
        let resolver = Self::unvalidated(map)?;
        resolver.validate()?;
        debug!(
            db_entities = resolver.db_entities.len(),
            obj_entities = resolver.obj_entities.len(),
            "entity resolver ready"
        );
        Ok(resolver)
    }

    /// Index a mapping without checking paths, primary keys, or map keys.
    ///
    /// Only duplicate names are rejected. Unsupported shapes surface later,
    /// when something tries to use them.
    pub fn unvalidated(map: EntityMap) -> MapResult<Self> {
        let mut db_entities = IndexMap::new();
        for (i, entity) in map.db_entities.iter().enumerate() {
            if db_entities.insert(entity.name.clone(), i).is_some() {
                return Err(MapError::DuplicateEntity(entity.name.clone()));
            }
        }
        let mut obj_entities = IndexMap::new();
        for (i, entity) in map.obj_entities.iter().enumerate() {
            if obj_entities.insert(entity.name.clone(), i).is_some() {
                return Err(MapError::DuplicateEntity(entity.name.clone()));
            }
        }

        let mut resolver = Self {
            map,
            db_entities,
            obj_entities,
            descriptors: HashMap::new(),
            reverses: HashMap::new(),
        };
        resolver.index_descriptors();
        resolver.index_reverses();
        Ok(resolver)
    }

    /// Parse, index, and validate a TOML mapping.
    pub fn from_toml_str(text: &str) -> MapResult<Self> {
        Self::new(EntityMap::from_toml_str(text)?)
    }

    pub fn entity_map(&self) -> &EntityMap {
        &self.map
    }

    // ---------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------

    pub fn db_entity(&self, name: &str) -> MapResult<&DbEntity> {
        self.db_entities
            .get(name)
            .map(|&i| &self.map.db_entities[i])
            .ok_or_else(|| MapError::UnknownDbEntity(name.to_string()))
    }

    pub fn obj_entity(&self, name: &str) -> MapResult<&ObjEntity> {
        self.obj_entities
            .get(name)
            .map(|&i| &self.map.obj_entities[i])
            .ok_or_else(|| MapError::UnknownObjEntity(name.to_string()))
    }

    /// Root table of an object entity.
    pub fn db_entity_for(&self, obj_entity: &str) -> MapResult<&DbEntity> {
        let entity = self.obj_entity(obj_entity)?;
        self.db_entity(&entity.db_entity)
    }

    pub fn class_descriptor(&self, obj_entity: &str) -> MapResult<&ClassDescriptor> {
        self.descriptors
            .get(obj_entity)
            .ok_or_else(|| MapError::UnknownObjEntity(obj_entity.to_string()))
    }

    pub fn db_entities(&self) -> impl Iterator<Item = &DbEntity> {
        self.map.db_entities.iter()
    }

    pub fn obj_entities(&self) -> impl Iterator<Item = &ObjEntity> {
        self.map.obj_entities.iter()
    }

    pub fn attribute(&self, entity: &str, name: &str) -> MapResult<&ObjAttribute> {
        self.obj_entity(entity)?
            .attribute(name)
            .ok_or_else(|| MapError::UnknownProperty {
                entity: entity.to_string(),
                property: name.to_string(),
            })
    }

    pub fn relationship(&self, entity: &str, name: &str) -> MapResult<&ObjRelationship> {
        self.obj_entity(entity)?
            .relationship(name)
            .ok_or_else(|| MapError::UnknownProperty {
                entity: entity.to_string(),
                property: name.to_string(),
            })
    }

    pub fn db_relationship(&self, table: &str, name: &str) -> MapResult<&DbRelationship> {
        self.db_entity(table)?
            .relationship(name)
            .ok_or_else(|| MapError::UnknownDbRelationship {
                entity: table.to_string(),
                relationship: name.to_string(),
            })
    }

    /// Resolve a relationship's db path to `(source table, step)` pairs.
    pub fn db_path(
        &self,
        entity: &str,
        relationship: &str,
    ) -> MapResult<Vec<(&DbEntity, &DbRelationship)>> {
        let rel = self.relationship(entity, relationship)?;
        let mut table = self.db_entity_for(entity)?;
        let mut path = Vec::new();
        for step in rel.steps() {
            let db_rel = self.db_relationship(&table.name, step)?;
            path.push((table, db_rel));
            table = self.db_entity(&db_rel.target)?;
        }
        Ok(path)
    }

    /// The single db relationship behind a non-flattened relationship.
    pub fn single_step(&self, entity: &str, relationship: &str) -> MapResult<&DbRelationship> {
        let path = self.db_path(entity, relationship)?;
        match path.as_slice() {
            [(_, step)] => Ok(step),
            _ => Err(MapError::UnsupportedPath {
                entity: entity.to_string(),
                property: relationship.to_string(),
                path: self.relationship(entity, relationship)?.db_path.clone(),
                reason: "expected a single-step relationship".into(),
            }),
        }
    }

    /// Join table plus both steps of a flattened relationship.
    pub fn flattened_steps(
        &self,
        entity: &str,
        relationship: &str,
    ) -> MapResult<(&DbRelationship, &DbEntity, &DbRelationship)> {
        let path = self.db_path(entity, relationship)?;
        match path.as_slice() {
            [(_, first), (join, second)] => Ok((first, join, second)),
            _ => Err(MapError::UnsupportedPath {
                entity: entity.to_string(),
                property: relationship.to_string(),
                path: self.relationship(entity, relationship)?.db_path.clone(),
                reason: "only two-step join-table relationships can be flattened".into(),
            }),
        }
    }

    /// The dependent table and master-side relationship behind a flattened
    /// attribute.
    pub fn dependent_table(
        &self,
        entity: &str,
        attribute: &ObjAttribute,
    ) -> MapResult<Option<(&DbRelationship, &DbEntity, String)>> {
        let Some((path, column)) = attribute.dependent_column() else {
            return Ok(None);
        };
        if path.contains('.') {
            return Err(MapError::UnsupportedPath {
                entity: entity.to_string(),
                property: attribute.name.clone(),
                path: attribute.db_path.clone(),
                reason: "only single-step dependent relationships supported".into(),
            });
        }
        let root = self.db_entity_for(entity)?;
        let rel = self.db_relationship(&root.name, path)?;
        let target = self.db_entity(&rel.target)?;
        Ok(Some((rel, target, column.to_string())))
    }

    /// The relationship on the target entity that walks the same db path
    /// backwards, if one is mapped.
    pub fn reverse_relationship(&self, entity: &str, relationship: &str) -> Option<&ObjRelationship> {
        let name = self
            .reverses
            .get(&(entity.to_string(), relationship.to_string()))?;
        let target = &self.obj_entity(entity).ok()?.relationship(relationship)?.target;
        self.obj_entity(target).ok()?.relationship(name)
    }

    /// The reverse of a db relationship declared on `source_table`.
    pub fn reverse_db_relationship(
        &self,
        source_table: &str,
        relationship: &DbRelationship,
    ) -> Option<&DbRelationship> {
        let target = self.db_entity(&relationship.target).ok()?;
        target
            .relationships
            .iter()
            .find(|candidate| relationship.is_reverse_of(candidate, source_table))
    }

    /// Whether the relationship is to-many (plain or flattened).
    pub fn is_to_many(&self, entity: &str, relationship: &str) -> bool {
        self.class_descriptor(entity)
            .ok()
            .and_then(|d| d.property_kind(relationship))
            .is_some_and(PropertyKind::is_to_many)
    }

    // ---------------------------------------------------------------
    // Indexing
    // ---------------------------------------------------------------

    fn index_descriptors(&mut self) {
        let mut descriptors = HashMap::new();
        for entity in &self.map.obj_entities {
            let mut descriptor = ClassDescriptor {
                entity: entity.name.clone(),
                attributes: Vec::new(),
                to_one: Vec::new(),
                to_many: Vec::new(),
                locked: Vec::new(),
                kinds: HashMap::new(),
            };
            for attribute in &entity.attributes {
                descriptor.attributes.push(attribute.name.clone());
                descriptor
                    .kinds
                    .insert(attribute.name.clone(), PropertyKind::Attribute);
                if entity.is_optimistic() && attribute.used_for_locking {
                    descriptor.locked.push(attribute.name.clone());
                }
            }
            for rel in &entity.relationships {
                let to_many = self
                    .db_path(&entity.name, &rel.name)
                    .map(|path| path.iter().any(|(_, step)| step.to_many))
                    .unwrap_or(false);
                let kind = match (to_many, rel.is_flattened()) {
                    (true, true) => PropertyKind::Flattened,
                    (true, false) => PropertyKind::ToMany,
                    (false, _) => PropertyKind::ToOne,
                };
                if kind.is_to_many() {
                    descriptor.to_many.push(rel.name.clone());
                } else {
                    descriptor.to_one.push(rel.name.clone());
                    if entity.is_optimistic() && rel.used_for_locking {
                        descriptor.locked.push(rel.name.clone());
                    }
                }
                descriptor.kinds.insert(rel.name.clone(), kind);
            }
            descriptors.insert(entity.name.clone(), descriptor);
        }
        self.descriptors = descriptors;
    }

    fn index_reverses(&mut self) {
        let mut reverses = HashMap::new();
        for entity in &self.map.obj_entities {
            for rel in &entity.relationships {
                if let Some(reverse) = self.find_reverse(entity, rel) {
                    reverses.insert((entity.name.clone(), rel.name.clone()), reverse);
                }
            }
        }
        self.reverses = reverses;
    }

    fn find_reverse(&self, entity: &ObjEntity, rel: &ObjRelationship) -> Option<String> {
        let path = self.db_path(&entity.name, &rel.name).ok()?;
        let mut reversed = Vec::with_capacity(path.len());
        for (source, step) in path.iter().rev() {
            reversed.push(self.reverse_db_relationship(&source.name, step)?.name.clone());
        }
        let reversed = reversed.join(".");
        let target = self.obj_entity(&rel.target).ok()?;
        target
            .relationships
            .iter()
            .find(|candidate| candidate.target == entity.name && candidate.db_path == reversed)
            .map(|candidate| candidate.name.clone())
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    fn validate(&self) -> MapResult<()> {
        for table in &self.map.db_entities {
            if table.primary_key().is_empty() {
                return Err(MapError::MissingPrimaryKey(table.name.clone()));
            }
            for rel in &table.relationships {
                let target = self.db_entity(&rel.target)?;
                for join in &rel.joins {
                    if table.attribute(&join.source).is_none() {
                        return Err(MapError::UnknownColumn {
                            entity: table.name.clone(),
                            column: join.source.clone(),
                        });
                    }
                    if target.attribute(&join.target).is_none() {
                        return Err(MapError::UnknownColumn {
                            entity: target.name.clone(),
                            column: join.target.clone(),
                        });
                    }
                }
            }
        }

        for entity in &self.map.obj_entities {
            let root = self.db_entity(&entity.db_entity)?;
            for attribute in &entity.attributes {
                self.validate_attribute(entity, root, attribute)?;
            }
            for rel in &entity.relationships {
                self.validate_relationship(entity, rel)?;
            }
        }
        Ok(())
    }

    fn validate_attribute(
        &self,
        entity: &ObjEntity,
        root: &DbEntity,
        attribute: &ObjAttribute,
    ) -> MapResult<()> {
        match self.dependent_table(&entity.name, attribute)? {
            None => {
                if root.attribute(&attribute.db_path).is_none() {
                    return Err(MapError::UnknownColumn {
                        entity: root.name.clone(),
                        column: attribute.db_path.clone(),
                    });
                }
            }
            Some((rel, table, column)) => {
                if !rel.to_dependent_pk || rel.to_many {
                    return Err(MapError::UnsupportedPath {
                        entity: entity.name.clone(),
                        property: attribute.name.clone(),
                        path: attribute.db_path.clone(),
                        reason: "flattened attributes must follow a to-dependent-pk relationship"
                            .into(),
                    });
                }
                if table.attribute(&column).is_none() {
                    return Err(MapError::UnknownColumn {
                        entity: table.name.clone(),
                        column,
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_relationship(&self, entity: &ObjEntity, rel: &ObjRelationship) -> MapResult<()> {
        let target = self.obj_entity(&rel.target)?;
        let path = self.db_path(&entity.name, &rel.name)?;
        let broken = || MapError::BrokenPath {
            entity: entity.name.clone(),
            property: rel.name.clone(),
            path: rel.db_path.clone(),
        };
        let (_, last) = path.last().ok_or_else(broken)?;
        if last.target != target.db_entity {
            return Err(broken());
        }
        match path.as_slice() {
            [_] => {}
            [(_, first), (_, second)] => {
                if !first.to_many || second.to_many {
                    return Err(MapError::UnsupportedPath {
                        entity: entity.name.clone(),
                        property: rel.name.clone(),
                        path: rel.db_path.clone(),
                        reason: "flattened relationships must go to-many into a join table \
                                 and to-one out of it"
                            .into(),
                    });
                }
            }
            _ => {
                return Err(MapError::UnsupportedPath {
                    entity: entity.name.clone(),
                    property: rel.name.clone(),
                    path: rel.db_path.clone(),
                    reason: "only single-step dependent relationships supported".into(),
                })
            }
        }
        if let Some(key) = &rel.map_key {
            let to_many = path.iter().any(|(_, step)| step.to_many);
            if !to_many || target.attribute(key).is_none() {
                return Err(MapError::InvalidMapKey {
                    entity: entity.name.clone(),
                    relationship: rel.name.clone(),
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbAttribute;
    use crate::obj::{DeleteRule, LockType};

    const GALLERY: &str = include_str!("../../../fixtures/gallery.toml");
    const TABLES: &str = include_str!("../../../fixtures/tables.toml");

    fn gallery() -> EntityResolver {
        EntityResolver::from_toml_str(GALLERY).expect("gallery mapping")
    }

    // ---------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------

    #[test]
    fn fixtures_load() {
        let resolver = gallery();
        assert_eq!(resolver.db_entities().count(), 6);
        assert_eq!(resolver.obj_entities().count(), 4);
        let tables = EntityResolver::from_toml_str(TABLES).unwrap();
        assert_eq!(tables.db_entity_for("Table2").unwrap().name, "TABLE2");
    }

    #[test]
    fn toml_defaults_apply() {
        let resolver = gallery();
        let painting = resolver.obj_entity("Painting").unwrap();
        assert_eq!(painting.lock_type, LockType::Optimistic);
        assert!(!painting.read_only);
        let artist = resolver.obj_entity("Artist").unwrap();
        assert_eq!(artist.lock_type, LockType::None);
        assert_eq!(
            artist.relationship("paintingArray").unwrap().delete_rule,
            DeleteRule::Cascade
        );
    }

    #[test]
    fn malformed_toml_is_reported() {
        let err = EntityResolver::from_toml_str("[[db_entities]]\nname = 3").unwrap_err();
        assert!(matches!(err, MapError::Toml(_)));
    }

    #[test]
    fn duplicate_entities_rejected() {
        let map = EntityMap::new()
            .with_db_entity(DbEntity::new("A").with_attribute(DbAttribute::new("ID").primary_key()))
            .with_db_entity(DbEntity::new("A").with_attribute(DbAttribute::new("ID").primary_key()));
        assert!(matches!(
            EntityResolver::new(map),
            Err(MapError::DuplicateEntity(name)) if name == "A"
        ));
    }

    // ---------------------------------------------------------------
    // Descriptors and reverses
    // ---------------------------------------------------------------

    #[test]
    fn class_descriptor_kinds() {
        let resolver = gallery();
        let artist = resolver.class_descriptor("Artist").unwrap();
        assert_eq!(artist.property_kind("artistName"), Some(PropertyKind::Attribute));
        assert_eq!(artist.property_kind("paintingArray"), Some(PropertyKind::ToMany));
        assert_eq!(artist.property_kind("exhibitArray"), Some(PropertyKind::Flattened));
        assert!(artist.locked.is_empty());

        let painting = resolver.class_descriptor("Painting").unwrap();
        assert_eq!(painting.property_kind("toArtist"), Some(PropertyKind::ToOne));
        assert_eq!(painting.locked, vec!["estimatedPrice", "toArtist"]);
    }

    #[test]
    fn reverse_relationships() {
        let resolver = gallery();
        let reverse = resolver.reverse_relationship("Artist", "paintingArray").unwrap();
        assert_eq!(reverse.name, "toArtist");
        let reverse = resolver.reverse_relationship("Painting", "toGallery").unwrap();
        assert_eq!(reverse.name, "paintingArray");
        let reverse = resolver.reverse_relationship("Artist", "exhibitArray").unwrap();
        assert_eq!(reverse.name, "artistArray");
    }

    #[test]
    fn missing_reverse_is_none() {
        let resolver = EntityResolver::from_toml_str(TABLES).unwrap();
        assert!(resolver.reverse_relationship("Table1", "table4Array").is_none());
        assert_eq!(
            resolver
                .reverse_relationship("Table1", "table2Array")
                .map(|r| r.name.as_str()),
            Some("toTable1")
        );
    }

    #[test]
    fn flattened_steps_resolve_join_table() {
        let resolver = gallery();
        let (first, join, second) = resolver.flattened_steps("Artist", "exhibitArray").unwrap();
        assert_eq!(first.name, "artistExhibitArray");
        assert_eq!(join.name, "ARTIST_EXHIBIT");
        assert_eq!(second.target, "EXHIBIT");
        assert!(resolver.single_step("Artist", "exhibitArray").is_err());
    }

    #[test]
    fn dependent_table_for_flattened_attribute() {
        let resolver = gallery();
        let bio = resolver.attribute("Artist", "biography").unwrap().clone();
        let (rel, table, column) = resolver.dependent_table("Artist", &bio).unwrap().unwrap();
        assert_eq!(rel.name, "artistInfo");
        assert_eq!(table.name, "ARTIST_INFO");
        assert_eq!(column, "BIO");
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    fn two_tables() -> EntityMap {
        EntityMap::new()
            .with_db_entity(
                DbEntity::new("A")
                    .with_attribute(DbAttribute::new("ID").primary_key())
                    .with_attribute(DbAttribute::new("NAME"))
                    .with_relationship(DbRelationship::new("toB", "B", "ID", "ID").to_dependent_pk()),
            )
            .with_db_entity(
                DbEntity::new("B")
                    .with_attribute(DbAttribute::new("ID").primary_key())
                    .with_attribute(DbAttribute::new("NOTE"))
                    .with_relationship(DbRelationship::new("toA", "A", "ID", "ID").to_dependent_pk()),
            )
    }

    #[test]
    fn multi_step_attribute_rejected() {
        let map = two_tables().with_obj_entity(
            ObjEntity::new("A", "A").with_attribute(ObjAttribute::new("note", "toB.toA.NAME")),
        );
        let err = EntityResolver::new(map.clone()).unwrap_err();
        assert!(
            matches!(&err, MapError::UnsupportedPath { reason, .. } if reason.contains("single-step"))
        );
        // Without validation the same map indexes fine.
        assert!(EntityResolver::unvalidated(map).is_ok());
    }

    #[test]
    fn unknown_column_rejected() {
        let map = two_tables()
            .with_obj_entity(ObjEntity::new("A", "A").with_attribute(ObjAttribute::new("x", "MISSING")));
        assert!(matches!(
            EntityResolver::new(map),
            Err(MapError::UnknownColumn { column, .. }) if column == "MISSING"
        ));
    }

    #[test]
    fn missing_primary_key_rejected() {
        let map = EntityMap::new().with_db_entity(DbEntity::new("NOPK").with_attribute(DbAttribute::new("X")));
        assert!(matches!(
            EntityResolver::new(map),
            Err(MapError::MissingPrimaryKey(name)) if name == "NOPK"
        ));
    }

    #[test]
    fn broken_relationship_target_rejected() {
        let map = two_tables()
            .with_obj_entity(ObjEntity::new("A", "A").with_relationship(ObjRelationship::new("b", "A", "toB")));
        assert!(matches!(EntityResolver::new(map), Err(MapError::BrokenPath { .. })));
    }

    #[test]
    fn map_key_must_name_target_attribute() {
        let text = TABLES.replace("map_key = \"name\"", "map_key = \"nope\"");
        assert!(matches!(
            EntityResolver::from_toml_str(&text),
            Err(MapError::InvalidMapKey { key, .. }) if key == "nope"
        ));
    }
}
