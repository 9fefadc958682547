//! Conversions between stored rows and object state.
//!
//! A row snapshot holds the root-table columns of an object plus the
//! columns of its dependent tables, keyed by the flattened attribute path
//! (`artistInfo.BIO`). The row cache stores these snapshots.

use std::collections::BTreeMap;

use strata_graph::PersistentObject;
use strata_map::{EntityResolver, PropertyKind};
use strata_store::Storage;
use strata_types::{ObjectId, Snapshot, Value};

use crate::error::{FlushError, FlushResult};

/// Attribute values and to-one targets decoded from a row snapshot.
pub type DecodedRow = (Snapshot, BTreeMap<String, Option<ObjectId>>);

/// Permanent id of the `entity` object stored in `row`.
pub fn id_from_row(resolver: &EntityResolver, entity: &str, row: &Snapshot) -> FlushResult<ObjectId> {
    let table = resolver.db_entity_for(entity)?;
    let mut key = Snapshot::new();
    for column in table.primary_key_names() {
        match row.get(&column) {
            Some(value) if !value.is_null() => {
                key.insert(column, value.clone());
            }
            _ => {
                return Err(FlushError::Classifier {
                    entity: entity.to_string(),
                    property: column,
                    reason: "row has no primary key value".into(),
                })
            }
        }
    }
    ObjectId::permanent(entity, key).map_err(|e| FlushError::Classifier {
        entity: entity.to_string(),
        property: "id".into(),
        reason: e.to_string(),
    })
}

/// Decode attribute values and foreign-key targets of `entity` from a row
/// snapshot.
pub fn values_from_row(resolver: &EntityResolver, entity: &str, row: &Snapshot) -> FlushResult<DecodedRow> {
    let obj = resolver.obj_entity(entity)?;
    let values = obj
        .attributes
        .iter()
        .map(|attr| {
            let value = row.get(&attr.db_path).cloned().unwrap_or(Value::Null);
            (attr.name.clone(), value)
        })
        .collect();

    let descriptor = resolver.class_descriptor(entity)?;
    let mut to_one = BTreeMap::new();
    for name in &descriptor.to_one {
        let rel = resolver.relationship(entity, name)?;
        let db_rel = resolver.single_step(entity, name).map_err(FlushError::classifier)?;
        let target_table = resolver.db_entity(&db_rel.target)?;
        if !db_rel.is_foreign_key(target_table) {
            continue;
        }
        let mut key = Snapshot::new();
        for join in &db_rel.joins {
            match row.get(&join.source) {
                Some(value) if !value.is_null() => {
                    key.insert(join.target.clone(), value.clone());
                }
                _ => break,
            }
        }
        let target = if key.len() == db_rel.joins.len() {
            ObjectId::permanent(rel.target.clone(), key).ok()
        } else {
            None
        };
        to_one.insert(name.clone(), target);
    }
    Ok((values, to_one))
}

/// Row snapshot of an object's current state.
///
/// Foreign keys to objects without a permanent id come out null.
pub fn object_row(resolver: &EntityResolver, object: &PersistentObject) -> FlushResult<Snapshot> {
    let id = object.id();
    let entity = resolver.obj_entity(id.entity_name())?;
    let mut row = Snapshot::new();
    if let Some(key) = id.id_snapshot() {
        row.extend(key.clone());
    }
    for attr in &entity.attributes {
        let value = object.value(&attr.name).cloned().unwrap_or(Value::Null);
        row.insert(attr.db_path.clone(), value);
    }
    let descriptor = resolver.class_descriptor(&entity.name)?;
    for rel in &entity.relationships {
        if descriptor.property_kind(&rel.name) != Some(PropertyKind::ToOne) {
            continue;
        }
        let db_rel = resolver
            .single_step(&entity.name, &rel.name)
            .map_err(FlushError::classifier)?;
        let target_table = resolver.db_entity(&db_rel.target)?;
        if !db_rel.is_foreign_key(target_table) {
            continue;
        }
        let target = object.to_one_target(&rel.name);
        for join in &db_rel.joins {
            let value = target
                .and_then(|t| t.key_value(&join.target))
                .cloned()
                .unwrap_or(Value::Null);
            row.insert(join.source.clone(), value);
        }
    }
    Ok(row)
}

/// Read the row snapshot of a stored object: its root row plus one row per
/// dependent table. `None` when the root row does not exist.
pub fn fetch_row(resolver: &EntityResolver, storage: &dyn Storage, id: &ObjectId) -> FlushResult<Option<Snapshot>> {
    let Some(key) = id.id_snapshot() else {
        return Ok(None);
    };
    let entity = resolver.obj_entity(id.entity_name())?;
    let mut rows = storage.select(None, &entity.db_entity, key)?;
    let Some(mut row) = rows.pop() else {
        return Ok(None);
    };
    complete_row(resolver, storage, id, &mut row)?;
    Ok(Some(row))
}

/// Add dependent-table columns to a fetched root row.
pub fn complete_row(
    resolver: &EntityResolver,
    storage: &dyn Storage,
    id: &ObjectId,
    row: &mut Snapshot,
) -> FlushResult<()> {
    let entity = resolver.obj_entity(id.entity_name())?;
    let mut fetched: BTreeMap<String, Option<Snapshot>> = BTreeMap::new();
    for attr in entity.attributes.iter().filter(|a| a.is_flattened()) {
        let Some((db_rel, table, column)) = resolver
            .dependent_table(&entity.name, attr)
            .map_err(FlushError::classifier)?
        else {
            continue;
        };
        if !fetched.contains_key(&table.name) {
            let mut qualifier = Snapshot::new();
            for join in &db_rel.joins {
                let value = row.get(&join.source).cloned().unwrap_or(Value::Null);
                qualifier.insert(join.target.clone(), value);
            }
            let dependent = storage.select(None, &table.name, &qualifier)?.pop();
            fetched.insert(table.name.clone(), dependent);
        }
        let value = fetched
            .get(&table.name)
            .and_then(|r| r.as_ref())
            .and_then(|r| r.get(&column))
            .cloned()
            .unwrap_or(Value::Null);
        row.insert(attr.db_path.clone(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_store::InMemoryDatabase;
    use strata_types::snapshot_of;

    const GALLERY: &str = include_str!("../../../fixtures/gallery.toml");

    fn resolver() -> EntityResolver {
        EntityResolver::from_toml_str(GALLERY).unwrap()
    }

    #[test]
    fn decodes_foreign_keys_into_targets() {
        let resolver = resolver();
        let row = snapshot_of([
            ("PAINTING_ID", json!(4)),
            ("PAINTING_TITLE", json!("Irises")),
            ("ARTIST_ID", json!(2)),
            ("GALLERY_ID", json!(null)),
        ]);
        let id = id_from_row(&resolver, "Painting", &row).unwrap();
        assert_eq!(id, ObjectId::single("Painting", "PAINTING_ID", 4));

        let (values, to_one) = values_from_row(&resolver, "Painting", &row).unwrap();
        assert_eq!(values["paintingTitle"], json!("Irises"));
        assert_eq!(values["estimatedPrice"], json!(null));
        assert_eq!(to_one["toArtist"], Some(ObjectId::single("Artist", "ARTIST_ID", 2)));
        assert_eq!(to_one["toGallery"], None);
    }

    #[test]
    fn row_without_key_is_rejected() {
        let row = snapshot_of([("PAINTING_TITLE", json!("x"))]);
        assert!(id_from_row(&resolver(), "Painting", &row).is_err());
    }

    #[test]
    fn fetch_joins_dependent_columns() {
        let resolver = resolver();
        let db = InMemoryDatabase::new(&resolver);
        db.insert_row("ARTIST", snapshot_of([("ARTIST_ID", json!(1)), ("ARTIST_NAME", json!("Monet"))]))
            .unwrap();
        db.insert_row("ARTIST_INFO", snapshot_of([("ARTIST_ID", json!(1)), ("BIO", json!("painter"))]))
            .unwrap();

        let id = ObjectId::single("Artist", "ARTIST_ID", 1);
        let row = fetch_row(&resolver, &db, &id).unwrap().unwrap();
        assert_eq!(row["ARTIST_NAME"], json!("Monet"));
        assert_eq!(row["artistInfo.BIO"], json!("painter"));

        let missing = ObjectId::single("Artist", "ARTIST_ID", 99);
        assert!(fetch_row(&resolver, &db, &missing).unwrap().is_none());
    }

    #[test]
    fn object_row_encodes_current_state() {
        let resolver = std::sync::Arc::new(resolver());
        let mut graph = strata_graph::GraphManager::new(resolver.clone());
        let id = ObjectId::single("Painting", "PAINTING_ID", 8);
        let object = graph.local_node(&id).unwrap();
        graph
            .inflate(
                &id,
                snapshot_of([("paintingTitle", json!("Water Lilies"))]),
                [("toArtist".to_string(), Some(ObjectId::single("Artist", "ARTIST_ID", 3)))].into(),
            )
            .unwrap();
        let row = object_row(&resolver, &object.borrow()).unwrap();
        assert_eq!(row["PAINTING_ID"], json!(8));
        assert_eq!(row["PAINTING_TITLE"], json!("Water Lilies"));
        assert_eq!(row["ARTIST_ID"], json!(3));
        assert_eq!(row["GALLERY_ID"], json!(null));
    }
}
