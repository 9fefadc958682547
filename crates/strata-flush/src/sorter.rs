//! Table ordering for batch execution.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use strata_map::EntityResolver;
use strata_types::ObjectId;
use tracing::{debug, warn};

use crate::descriptor::BatchDescriptor;

/// Orders tables so that every referenced row is written before the rows
/// pointing at it.
///
/// A table comes after every table it holds a foreign key into, and a
/// dependent table comes after its master. Join tables hold foreign keys
/// into both endpoints, so they follow both. Deletes run in reverse order.
#[derive(Clone, Debug)]
pub struct EntitySorter {
    order: Vec<String>,
    index: HashMap<String, usize>,
    reflexive: BTreeSet<String>,
}

impl EntitySorter {
    pub fn new(resolver: &EntityResolver) -> Self {
        let mut names: Vec<String> = resolver.db_entities().map(|t| t.name.clone()).collect();
        names.sort();

        let mut children: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut in_degree: HashMap<String, usize> = names.iter().map(|n| (n.clone(), 0)).collect();
        let mut reflexive = BTreeSet::new();
        let mut add_edge = |before: &str, after: &str| {
            let inserted = children
                .entry(before.to_string())
                .or_default()
                .insert(after.to_string());
            if inserted {
                *in_degree.entry(after.to_string()).or_insert(0) += 1;
            }
        };

        for table in resolver.db_entities() {
            for rel in &table.relationships {
                let Ok(target) = resolver.db_entity(&rel.target) else {
                    continue;
                };
                if rel.is_foreign_key(target) {
                    if target.name == table.name {
                        reflexive.insert(table.name.clone());
                    } else {
                        add_edge(&target.name, &table.name);
                    }
                } else if rel.to_dependent_pk && target.name != table.name {
                    add_edge(&table.name, &target.name);
                }
            }
        }

        // Kahn's algorithm with name order breaking ties.
        let mut queue: VecDeque<String> = names
            .iter()
            .filter(|n| in_degree.get(*n).copied() == Some(0))
            .cloned()
            .collect();
        let mut order = Vec::with_capacity(names.len());
        let mut placed = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !placed.insert(current.clone()) {
                continue;
            }
            if let Some(next) = children.get(&current) {
                for child in next {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(child.clone());
                        }
                    }
                }
            }
            order.push(current);
        }

        if order.len() < names.len() {
            let cyclic: Vec<String> = names.into_iter().filter(|n| !placed.contains(n)).collect();
            warn!(tables = ?cyclic, "foreign key cycle between tables, ordering by name");
            order.extend(cyclic);
        }

        let index = order.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();
        debug!(tables = order.len(), reflexive = reflexive.len(), "table order computed");
        Self {
            order,
            index,
            reflexive,
        }
    }

    /// Tables in insert order.
    pub fn table_order(&self) -> &[String] {
        &self.order
    }

    /// Position of `table` in insert order. Unknown tables sort last.
    pub fn index_of(&self, table: &str) -> usize {
        self.index.get(table).copied().unwrap_or(usize::MAX)
    }

    /// Whether `table` holds a foreign key into itself.
    pub fn is_reflexive(&self, table: &str) -> bool {
        self.reflexive.contains(table)
    }

    /// Arrange batches for execution: inserts in table order, then updates,
    /// then deletes in reverse table order. Batches of the same table keep
    /// their layer order.
    pub fn sort(&self, batches: Vec<BatchDescriptor>) -> Vec<BatchDescriptor> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for batch in batches {
            match batch {
                BatchDescriptor::Insert { .. } => inserts.push(batch),
                BatchDescriptor::Update { .. } => updates.push(batch),
                BatchDescriptor::Delete { .. } => deletes.push(batch),
            }
        }
        inserts.sort_by_key(|b| (self.index_of(b.table()), b.layer()));
        updates.sort_by_key(|b| self.index_of(b.table()));
        deletes.sort_by_key(|b| (std::cmp::Reverse(self.index_of(b.table())), b.layer()));

        inserts.extend(updates);
        inserts.extend(deletes);
        inserts
    }
}

/// Split `items` into layers so that each item comes after the items named
/// by `before`. Names outside `items` are ignored. Items caught in a cycle
/// share the last layer.
pub fn layers<T>(
    items: Vec<T>,
    id_of: impl Fn(&T) -> ObjectId,
    before: impl Fn(&T) -> Vec<ObjectId>,
) -> Vec<Vec<T>> {
    let ids: Vec<ObjectId> = items.iter().map(&id_of).collect();
    let present: HashSet<&ObjectId> = ids.iter().collect();
    let prerequisites: Vec<Vec<ObjectId>> = items
        .iter()
        .map(|item| {
            before(item)
                .into_iter()
                .filter(|id| present.contains(id))
                .collect()
        })
        .collect();

    let mut layer_of: Vec<Option<usize>> = vec![None; items.len()];
    let mut assigned: HashMap<ObjectId, usize> = HashMap::new();
    let mut current = 0;
    loop {
        let ready: Vec<usize> = (0..items.len())
            .filter(|&i| layer_of[i].is_none())
            .filter(|&i| {
                prerequisites[i]
                    .iter()
                    .all(|p| *p == ids[i] || assigned.get(p).is_some_and(|&l| l < current))
            })
            .collect();
        if ready.is_empty() {
            break;
        }
        for i in ready {
            layer_of[i] = Some(current);
            assigned.insert(ids[i].clone(), current);
        }
        current += 1;
    }

    let stuck = layer_of.iter().filter(|l| l.is_none()).count();
    if stuck > 0 {
        warn!(rows = stuck, "reference cycle between rows of one table");
    }
    let mut result: Vec<Vec<T>> = Vec::new();
    for (item, layer) in items.into_iter().zip(layer_of) {
        let layer = layer.unwrap_or(current);
        if result.len() <= layer {
            result.resize_with(layer + 1, Vec::new);
        }
        result[layer].push(item);
    }
    result.retain(|l| !l.is_empty());
    result
}
