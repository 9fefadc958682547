//! Row qualifiers for updates and deletes.

use std::collections::{BTreeMap, BTreeSet};

use strata_diff::ObjectDiff;
use strata_graph::PersistentObject;
use strata_map::{DbRelationship, EntityResolver, ObjEntity, PropertyKind};
use strata_types::{ObjectId, Value};

use crate::deferred::DeferredValue;
use crate::error::{FlushError, FlushResult};

/// Column equalities identifying a row, with null columns kept apart
/// since they are matched with `IS NULL`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Qualifier {
    pub values: BTreeMap<String, DeferredValue>,
    pub nulls: BTreeSet<String>,
    /// Includes optimistic-lock columns.
    pub locking: bool,
}

impl Qualifier {
    /// Add or replace the condition on `column`.
    pub fn add(&mut self, column: impl Into<String>, value: DeferredValue) {
        let column = column.into();
        if value.is_null() {
            self.values.remove(&column);
            self.nulls.insert(column);
        } else {
            self.nulls.remove(&column);
            self.values.insert(column, value);
        }
    }

    pub fn columns(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn null_columns(&self) -> Vec<String> {
        self.nulls.iter().cloned().collect()
    }

    pub fn values(&self) -> Vec<DeferredValue> {
        self.values.values().cloned().collect()
    }

    /// `COL=value, ...` for error messages.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .values
            .iter()
            .map(|(column, value)| match value {
                DeferredValue::Literal(v) => format!("{column}={v}"),
                DeferredValue::PropagatedFrom { object, column: c } => {
                    format!("{column}={object}.{c}")
                }
            })
            .collect();
        parts.extend(self.nulls.iter().map(|column| format!("{column} IS NULL")));
        parts.join(", ")
    }
}

/// Builds qualifiers from an object's id and its values at the last
/// checkpoint.
pub struct QualifierBuilder<'a> {
    resolver: &'a EntityResolver,
}

impl<'a> QualifierBuilder<'a> {
    pub fn new(resolver: &'a EntityResolver) -> Self {
        Self { resolver }
    }

    /// Qualifier of the object's root row.
    ///
    /// Optimistic entities also match every locking attribute and locking
    /// to-one relationship against its checkpoint value. When an attribute
    /// and a relationship lock the same column, the relationship wins.
    pub fn root(
        &self,
        object: &PersistentObject,
        diff: Option<&ObjectDiff>,
    ) -> FlushResult<Qualifier> {
        let id = object.id();
        let entity = self.resolver.obj_entity(id.entity_name())?;
        let table = self.resolver.db_entity(&entity.db_entity)?;
        let mut qualifier = self.primary_key(entity, id)?;
        if !entity.is_optimistic() {
            return Ok(qualifier);
        }
        qualifier.locking = true;

        for attr in entity
            .attributes
            .iter()
            .filter(|a| a.used_for_locking && !a.is_flattened())
        {
            if table.is_primary_key(&attr.db_path) {
                continue;
            }
            let value = match diff {
                Some(diff) => diff.snapshot_value(&attr.name).cloned(),
                None => object.value(&attr.name).cloned(),
            };
            qualifier.add(attr.db_path.clone(), value.unwrap_or(Value::Null).into());
        }

        let descriptor = self.resolver.class_descriptor(&entity.name)?;
        for rel in entity.relationships.iter().filter(|r| r.used_for_locking) {
            if descriptor.property_kind(&rel.name) != Some(PropertyKind::ToOne) {
                continue;
            }
            let Some(db_rel) = self.foreign_key(entity, &rel.name)? else {
                continue;
            };
            let target = match diff {
                Some(diff) => diff.arc_snapshot_value(&rel.name),
                None => object.to_one_target(&rel.name),
            };
            for join in &db_rel.joins {
                let value = target
                    .and_then(|t| t.key_value(&join.target))
                    .cloned()
                    .unwrap_or(Value::Null);
                qualifier.add(join.source.clone(), value.into());
            }
        }
        Ok(qualifier)
    }

    /// Qualifier of a dependent-table row of `master`.
    pub fn dependent(&self, master: &ObjectId, relationship: &DbRelationship) -> FlushResult<Qualifier> {
        let mut qualifier = Qualifier::default();
        for join in &relationship.joins {
            let value = key_value(master, &join.source)?;
            qualifier.add(join.target.clone(), value.into());
        }
        Ok(qualifier)
    }

    fn primary_key(&self, entity: &ObjEntity, id: &ObjectId) -> FlushResult<Qualifier> {
        let key = id.id_snapshot().ok_or_else(|| FlushError::Classifier {
            entity: entity.name.clone(),
            property: "id".into(),
            reason: format!("{id} has no stored row to qualify"),
        })?;
        let mut qualifier = Qualifier::default();
        for (column, value) in key {
            qualifier.add(column.clone(), value.clone().into());
        }
        Ok(qualifier)
    }

    fn foreign_key(&self, entity: &ObjEntity, relationship: &str) -> FlushResult<Option<&'a DbRelationship>> {
        let resolver = self.resolver;
        let db_rel = resolver
            .single_step(&entity.name, relationship)
            .map_err(FlushError::classifier)?;
        let target = resolver.db_entity(&db_rel.target)?;
        Ok(db_rel.is_foreign_key(target).then_some(db_rel))
    }
}

/// A primary-key column value of a stored object.
pub(crate) fn key_value(id: &ObjectId, column: &str) -> FlushResult<Value> {
    id.key_value(column).cloned().ok_or_else(|| FlushError::Classifier {
        entity: id.entity_name().to_string(),
        property: column.to_string(),
        reason: format!("{id} has no value for key column {column}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use strata_graph::GraphManager;
    use strata_map::{DbAttribute, DbEntity, EntityMap, ObjAttribute, ObjRelationship};
    use strata_store::InMemoryDatabase;
    use strata_types::snapshot_of;

    use crate::classifier::Classifier;
    use crate::descriptor::BatchDescriptor;
    use crate::sorter::EntitySorter;

    const GALLERY: &str = include_str!("../../../fixtures/gallery.toml");

    fn graph() -> GraphManager {
        GraphManager::new(Arc::new(EntityResolver::from_toml_str(GALLERY).unwrap()))
    }

    fn lit(value: Value) -> DeferredValue {
        DeferredValue::Literal(value)
    }

    fn painting(n: i64) -> ObjectId {
        ObjectId::single("Painting", "PAINTING_ID", n)
    }

    fn artist(n: i64) -> ObjectId {
        ObjectId::single("Artist", "ARTIST_ID", n)
    }

    #[test]
    fn null_and_non_null_columns_are_separate() {
        let mut q = Qualifier::default();
        q.add("A", lit(json!(1)));
        q.add("B", DeferredValue::null());
        assert_eq!(q.columns(), vec!["A".to_string()]);
        assert_eq!(q.null_columns(), vec!["B".to_string()]);
        q.add("B", lit(json!(2)));
        assert!(q.nulls.is_empty());
        assert_eq!(q.describe(), "A=1, B=2");
    }

    #[test]
    fn optimistic_root_uses_checkpoint_values() {
        let mut graph = graph();
        let id = painting(1);
        graph.local_node(&id).unwrap();
        graph
            .inflate(
                &id,
                snapshot_of([("paintingTitle", json!("P")), ("estimatedPrice", json!(100))]),
                [("toArtist".to_string(), Some(artist(5)))].into(),
            )
            .unwrap();
        graph.write_property(&id, "estimatedPrice", json!(250)).unwrap();

        let object = graph.get_node(&id).unwrap();
        let builder = QualifierBuilder::new(graph.resolver());
        let q = builder.root(&object.borrow(), graph.diff(&id)).unwrap();
        assert!(q.locking);
        assert_eq!(q.values["PAINTING_ID"], lit(json!(1)));
        assert_eq!(q.values["ESTIMATED_PRICE"], lit(json!(100)));
        assert_eq!(q.values["ARTIST_ID"], lit(json!(5)));
        assert!(q.nulls.is_empty());
    }

    #[test]
    fn relationship_lock_with_no_target_is_null() {
        let mut graph = graph();
        let id = painting(2);
        graph.local_node(&id).unwrap();
        graph
            .inflate(&id, snapshot_of([("estimatedPrice", json!(null))]), Default::default())
            .unwrap();
        let object = graph.get_node(&id).unwrap();
        let builder = QualifierBuilder::new(graph.resolver());
        let q = builder.root(&object.borrow(), None).unwrap();
        assert!(q.nulls.contains("ARTIST_ID"));
        assert!(q.nulls.contains("ESTIMATED_PRICE"));
    }

    #[test]
    fn plain_entity_qualifies_by_key_only() {
        let mut graph = graph();
        let id = artist(3);
        graph.local_node(&id).unwrap();
        graph
            .inflate(&id, snapshot_of([("artistName", json!("A"))]), Default::default())
            .unwrap();
        let object = graph.get_node(&id).unwrap();
        let q = QualifierBuilder::new(graph.resolver())
            .root(&object.borrow(), None)
            .unwrap();
        assert!(!q.locking);
        assert_eq!(q.columns(), vec!["ARTIST_ID".to_string()]);
    }

    #[test]
    fn temporary_ids_cannot_be_qualified() {
        let mut graph = graph();
        let object = graph.new_object("Artist").unwrap();
        let builder = QualifierBuilder::new(graph.resolver());
        assert!(matches!(
            builder.root(&object.borrow(), None),
            Err(FlushError::Classifier { .. })
        ));
    }

    /// An optimistic entity whose `ownerKey` attribute and `toOwner`
    /// relationship both lock the OWNER_ID column.
    fn shared_lock_column() -> GraphManager {
        let map = EntityMap::new()
            .with_db_entity(DbEntity::new("OWNER").with_attribute(DbAttribute::new("OWNER_ID").primary_key()))
            .with_db_entity(
                DbEntity::new("ITEM")
                    .with_attribute(DbAttribute::new("ITEM_CODE").primary_key())
                    .with_attribute(DbAttribute::new("PRICE"))
                    .with_attribute(DbAttribute::new("OWNER_ID"))
                    .with_relationship(DbRelationship::new("toOwner", "OWNER", "OWNER_ID", "OWNER_ID")),
            )
            .with_obj_entity(ObjEntity::new("Owner", "OWNER"))
            .with_obj_entity(
                ObjEntity::new("Item", "ITEM")
                    .optimistic()
                    .with_attribute(ObjAttribute::new("code", "ITEM_CODE"))
                    .with_attribute(ObjAttribute::new("price", "PRICE").locking())
                    .with_attribute(ObjAttribute::new("ownerKey", "OWNER_ID").locking())
                    .with_relationship(ObjRelationship::new("toOwner", "Owner", "toOwner").locking()),
            );
        GraphManager::new(Arc::new(EntityResolver::new(map).unwrap()))
    }

    fn owner(n: i64) -> ObjectId {
        ObjectId::single("Owner", "OWNER_ID", n)
    }

    fn item(graph: &mut GraphManager, code: &str, owner_key: i64, target: Option<ObjectId>) -> ObjectId {
        let id = ObjectId::single("Item", "ITEM_CODE", code);
        graph.local_node(&id).unwrap();
        graph
            .inflate(
                &id,
                snapshot_of([("code", json!(code)), ("price", json!(10)), ("ownerKey", json!(owner_key))]),
                [("toOwner".to_string(), target)].into(),
            )
            .unwrap();
        id
    }

    #[test]
    fn relationship_lock_wins_over_attribute_on_same_column() {
        let mut graph = shared_lock_column();
        let id = item(&mut graph, "A1", 3, Some(owner(4)));
        graph.write_property(&id, "price", json!(20)).unwrap();
        graph.write_property(&id, "ownerKey", json!(5)).unwrap();
        graph.set_to_one(&id, "toOwner", Some(&owner(6)), true).unwrap();

        let object = graph.get_node(&id).unwrap();
        let q = QualifierBuilder::new(graph.resolver())
            .root(&object.borrow(), graph.diff(&id))
            .unwrap();
        assert_eq!(q.values["ITEM_CODE"], lit(json!("A1")));
        assert_eq!(q.values["PRICE"], lit(json!(10)));
        assert_eq!(q.values["OWNER_ID"], lit(json!(4)));
        assert!(q.nulls.is_empty());
    }

    #[test]
    fn null_relationship_lock_overrides_attribute_value() {
        let mut graph = shared_lock_column();
        let id = item(&mut graph, "A2", 3, None);
        graph.write_property(&id, "price", json!(20)).unwrap();

        let object = graph.get_node(&id).unwrap();
        let q = QualifierBuilder::new(graph.resolver())
            .root(&object.borrow(), graph.diff(&id))
            .unwrap();
        assert!(!q.values.contains_key("OWNER_ID"));
        assert_eq!(q.null_columns(), vec!["OWNER_ID".to_string()]);
        assert_eq!(q.describe(), "ITEM_CODE=\"A2\", PRICE=10, OWNER_ID IS NULL");
    }

    #[test]
    fn changed_key_is_qualified_by_stored_value() {
        let mut graph = shared_lock_column();
        let id = item(&mut graph, "A3", 4, Some(owner(4)));
        graph.write_property(&id, "code", json!("B3")).unwrap();

        let resolver = graph.resolver().clone();
        let db = InMemoryDatabase::new(&resolver);
        let sorter = EntitySorter::new(&resolver);
        let plan = Classifier::new(&graph, &db, &sorter)
            .classify(&graph.dirty_nodes(None))
            .unwrap();
        assert_eq!(plan.replacements.value(&id, "ITEM_CODE"), Some(&json!("B3")));
        assert_eq!(plan.key_changes, vec![id.clone()]);

        let Some(BatchDescriptor::Update {
            set_columns,
            qualifier_columns,
            rows,
            ..
        }) = plan.batches.first()
        else {
            panic!("expected one update batch, got {:?}", plan.batches);
        };
        let set = set_columns.iter().position(|c| c == "ITEM_CODE").unwrap();
        assert_eq!(rows[0].values[set], lit(json!("B3")));
        let key = qualifier_columns.iter().position(|c| c == "ITEM_CODE").unwrap();
        assert_eq!(rows[0].qualifier[key], lit(json!("A3")));
        let lock = qualifier_columns.iter().position(|c| c == "OWNER_ID").unwrap();
        assert_eq!(rows[0].qualifier[lock], lit(json!(4)));
        assert!(rows[0].locking);
    }

    #[test]
    fn dependent_row_keyed_by_master() {
        let graph = graph();
        let resolver = graph.resolver();
        let rel = resolver.db_relationship("ARTIST", "artistInfo").unwrap();
        let q = QualifierBuilder::new(resolver).dependent(&artist(9), rel).unwrap();
        assert_eq!(q.values["ARTIST_ID"], lit(json!(9)));
    }
}
