//! Deleting objects and applying delete rules.

use std::sync::Arc;

use indexmap::IndexSet;
use strata_graph::{GraphError, GraphManager};
use strata_map::{DeleteRule, EntityResolver, PropertyKind};
use strata_types::{ObjectId, PersistenceState};
use tracing::debug;

use crate::error::{FlushError, FlushResult};
use crate::faults::FaultResolver;

/// Deletes objects together with whatever their delete rules reach.
///
/// The full closure of CASCADE rules is computed and every DENY rule is
/// checked before any object changes state, so a denied delete leaves the
/// graph untouched apart from resolved faults.
pub struct DeleteAction<'a> {
    faults: &'a dyn FaultResolver,
}

struct Plan {
    objects: IndexSet<ObjectId>,
    denials: Vec<(ObjectId, String, Vec<ObjectId>)>,
}

impl<'a> DeleteAction<'a> {
    pub fn new(faults: &'a dyn FaultResolver) -> Self {
        Self { faults }
    }

    /// Delete `ids` and everything their CASCADE rules reach.
    ///
    /// Already DELETED or TRANSIENT objects are skipped. Returns every
    /// object whose state changed.
    pub fn delete_objects(&self, graph: &mut GraphManager, ids: &[ObjectId]) -> FlushResult<Vec<ObjectId>> {
        self.run(graph, ids, false)
    }

    /// Re-apply delete rules of objects that are already DELETED.
    ///
    /// Rules are idempotent: relationships that were already detached and
    /// related objects already deleted are left alone.
    pub fn cascade_deleted(&self, graph: &mut GraphManager, ids: &[ObjectId]) -> FlushResult<Vec<ObjectId>> {
        self.run(graph, ids, true)
    }

    fn run(&self, graph: &mut GraphManager, ids: &[ObjectId], include_deleted: bool) -> FlushResult<Vec<ObjectId>> {
        let resolver = graph.resolver().clone();
        let plan = self.plan(graph, &resolver, ids, include_deleted)?;

        for (id, relationship, related) in &plan.denials {
            let blocking = related.iter().find(|target| {
                !plan.objects.contains(*target) && is_live(graph, target)
            });
            if blocking.is_some() {
                return Err(FlushError::DeleteDenied {
                    entity: id.entity_name().to_string(),
                    id: id.clone(),
                    relationship: relationship.clone(),
                });
            }
        }

        let mut changed = Vec::new();
        for id in &plan.objects {
            self.apply_rules(graph, &resolver, id)?;
            let before = graph.get_node(id).map(|o| o.state());
            let after = graph.delete_node(id)?;
            if before != Some(after) {
                changed.push(id.clone());
            }
        }
        debug!(
            requested = ids.len(),
            deleted = changed.len(),
            "delete rules applied"
        );
        Ok(changed)
    }

    /// Collect the CASCADE closure and the DENY checks to run.
    fn plan(
        &self,
        graph: &mut GraphManager,
        resolver: &Arc<EntityResolver>,
        ids: &[ObjectId],
        include_deleted: bool,
    ) -> FlushResult<Plan> {
        let mut plan = Plan {
            objects: IndexSet::new(),
            denials: Vec::new(),
        };
        let mut pending: Vec<(ObjectId, bool)> = ids.iter().map(|id| (id.clone(), true)).collect();
        pending.reverse();

        while let Some((id, requested)) = pending.pop() {
            if plan.objects.contains(&id) {
                continue;
            }
            let Some(object) = graph.get_node(&id) else {
                if requested {
                    return Err(FlushError::Graph(GraphError::UnknownObject(id)));
                }
                continue;
            };
            match object.state() {
                PersistenceState::Transient => continue,
                PersistenceState::Deleted if !(include_deleted && requested) => continue,
                PersistenceState::Hollow => self.faults.resolve_object(graph, &id)?,
                _ => {}
            }
            plan.objects.insert(id.clone());

            let entity = resolver.obj_entity(id.entity_name())?;
            for rel in &entity.relationships {
                if !matches!(rel.delete_rule, DeleteRule::Cascade | DeleteRule::Deny) {
                    continue;
                }
                let related = self.related(graph, resolver, &id, &rel.name)?;
                if rel.delete_rule == DeleteRule::Cascade {
                    let mut next: Vec<(ObjectId, bool)> =
                        related.into_iter().map(|target| (target, false)).collect();
                    next.reverse();
                    pending.extend(next);
                } else if !related.is_empty() {
                    plan.denials.push((id.clone(), rel.name.clone(), related));
                }
            }
        }
        Ok(plan)
    }

    /// Detach `id` from objects reached through NULLIFY rules.
    fn apply_rules(&self, graph: &mut GraphManager, resolver: &Arc<EntityResolver>, id: &ObjectId) -> FlushResult<()> {
        let entity = resolver.obj_entity(id.entity_name())?;
        let descriptor = resolver.class_descriptor(id.entity_name())?;
        for rel in entity
            .relationships
            .iter()
            .filter(|r| r.delete_rule == DeleteRule::Nullify)
        {
            match descriptor.property_kind(&rel.name) {
                Some(PropertyKind::ToOne) => {
                    let target = graph.get_node(id).and_then(|o| o.to_one_target(&rel.name));
                    if target.is_some() {
                        graph.set_to_one(id, &rel.name, None, true)?;
                    }
                }
                Some(PropertyKind::ToMany | PropertyKind::Flattened) => {
                    for target in self.related(graph, resolver, id, &rel.name)? {
                        graph.remove_to_many(id, &rel.name, &target, true)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn related(
        &self,
        graph: &mut GraphManager,
        resolver: &Arc<EntityResolver>,
        id: &ObjectId,
        relationship: &str,
    ) -> FlushResult<Vec<ObjectId>> {
        let Some(object) = graph.get_node(id) else {
            return Ok(Vec::new());
        };
        if !resolver.is_to_many(id.entity_name(), relationship) {
            return Ok(object.to_one_target(relationship).into_iter().collect());
        }
        if object.borrow().is_to_many_fault(relationship) {
            self.faults.resolve_to_many(graph, id, relationship)?;
        }
        let members = object
            .borrow()
            .to_many(relationship)
            .and_then(|m| m.ids())
            .map(|ids| ids.into_iter().cloned().collect())
            .unwrap_or_default();
        Ok(members)
    }
}

fn is_live(graph: &GraphManager, id: &ObjectId) -> bool {
    graph
        .get_node(id)
        .is_some_and(|o| !matches!(o.state(), PersistenceState::Deleted | PersistenceState::Transient))
}
