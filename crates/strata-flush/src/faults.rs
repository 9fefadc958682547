//! Loading HOLLOW objects and faulted to-many relationships.

use strata_graph::GraphManager;
use strata_map::{EntityResolver, PropertyKind};
use strata_store::{RowCache, Storage};
use strata_types::{ObjectId, PersistenceState, Snapshot, Value};
use tracing::debug;

use crate::error::{FlushError, FlushResult};
use crate::rows::{complete_row, fetch_row, id_from_row, values_from_row};

/// Source of data for unresolved parts of a graph.
pub trait FaultResolver {
    /// Inflate a HOLLOW object. Other states are left alone.
    fn resolve_object(&self, graph: &mut GraphManager, id: &ObjectId) -> FlushResult<()>;

    /// Install the members of a faulted to-many relationship.
    fn resolve_to_many(&self, graph: &mut GraphManager, id: &ObjectId, relationship: &str) -> FlushResult<()>;
}

/// Resolves faults from committed storage, consulting a row cache first.
pub struct StorageFaults<'a> {
    storage: &'a dyn Storage,
    cache: Option<&'a RowCache>,
}

impl<'a> StorageFaults<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage, cache: None }
    }

    pub fn with_cache(mut self, cache: &'a RowCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Row snapshot of `id`, from the cache or storage.
    pub fn row(&self, resolver: &EntityResolver, id: &ObjectId) -> FlushResult<Option<Snapshot>> {
        if let Some(cache) = self.cache {
            if let Some(row) = cache.get(id)? {
                return Ok(Some(row));
            }
        }
        let row = fetch_row(resolver, self.storage, id)?;
        if let (Some(cache), Some(row)) = (self.cache, &row) {
            cache.put(id.clone(), row.clone())?;
        }
        Ok(row)
    }

    /// Register the object stored in a fetched root row and inflate it if
    /// it is still HOLLOW.
    fn register_row(&self, graph: &mut GraphManager, entity: &str, mut row: Snapshot) -> FlushResult<ObjectId> {
        let resolver = graph.resolver().clone();
        let id = id_from_row(&resolver, entity, &row)?;
        let object = graph.local_node(&id)?;
        if object.state() == PersistenceState::Hollow {
            complete_row(&resolver, self.storage, &id, &mut row)?;
            let (values, to_one) = values_from_row(&resolver, entity, &row)?;
            graph.inflate(&id, values, to_one)?;
            if let Some(cache) = self.cache {
                cache.put(id.clone(), row)?;
            }
        }
        Ok(id)
    }
}

impl FaultResolver for StorageFaults<'_> {
    fn resolve_object(&self, graph: &mut GraphManager, id: &ObjectId) -> FlushResult<()> {
        let Some(object) = graph.get_node(id) else {
            return Err(FlushError::ObjectNotFound(id.clone()));
        };
        if object.state() != PersistenceState::Hollow {
            return Ok(());
        }
        let resolver = graph.resolver().clone();
        let row = self
            .row(&resolver, id)?
            .ok_or_else(|| FlushError::ObjectNotFound(id.clone()))?;
        let (values, to_one) = values_from_row(&resolver, id.entity_name(), &row)?;
        graph.inflate(id, values, to_one)?;
        Ok(())
    }

    fn resolve_to_many(&self, graph: &mut GraphManager, id: &ObjectId, relationship: &str) -> FlushResult<()> {
        let Some(object) = graph.get_node(id) else {
            return Err(FlushError::ObjectNotFound(id.clone()));
        };
        if !object.borrow().is_to_many_fault(relationship) {
            return Ok(());
        }
        if id.is_temporary() {
            graph.resolve_to_many(id, relationship, Vec::new())?;
            return Ok(());
        }

        let resolver = graph.resolver().clone();
        let entity = id.entity_name();
        let target_entity = resolver.relationship(entity, relationship)?.target.clone();
        let kind = resolver
            .class_descriptor(entity)?
            .property_kind(relationship);

        let mut targets = Vec::new();
        if kind == Some(PropertyKind::Flattened) {
            let (first, join_table, second) = resolver
                .flattened_steps(entity, relationship)
                .map_err(FlushError::classifier)?;
            let qualifier = join_qualifier(id, first.joins.iter().map(|j| (&j.source, &j.target)));
            for join_row in self.storage.select(None, &join_table.name, &qualifier)? {
                let mut key = Snapshot::new();
                for join in &second.joins {
                    let value = join_row.get(&join.source).cloned().unwrap_or(Value::Null);
                    key.insert(join.target.clone(), value);
                }
                let target = ObjectId::permanent(target_entity.clone(), key).map_err(|e| {
                    FlushError::Classifier {
                        entity: entity.to_string(),
                        property: relationship.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                graph.local_node(&target)?;
                targets.push(target);
            }
        } else {
            let db_rel = resolver
                .single_step(entity, relationship)
                .map_err(FlushError::classifier)?;
            let qualifier = join_qualifier(id, db_rel.joins.iter().map(|j| (&j.source, &j.target)));
            for row in self.storage.select(None, &db_rel.target, &qualifier)? {
                targets.push(self.register_row(graph, &target_entity, row)?);
            }
        }
        debug!(id = %id, relationship, count = targets.len(), "to-many fault resolved");
        graph.resolve_to_many(id, relationship, targets)?;
        Ok(())
    }
}

/// Target-side equalities selecting the rows related to `id` through joins
/// whose source columns are part of `id`'s key.
fn join_qualifier<'j>(id: &ObjectId, joins: impl Iterator<Item = (&'j String, &'j String)>) -> Snapshot {
    joins
        .map(|(source, target)| {
            let value = id.key_value(source).cloned().unwrap_or(Value::Null);
            (target.clone(), value)
        })
        .collect()
}
