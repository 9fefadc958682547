//! Live objects held by a graph.
//!
//! A [`PersistentObject`] carries its identity, lifecycle state, attribute
//! values, and relationship targets. Relationships are stored as ids, never
//! as pointers, so identity changes only need to rewrite ids and the graph
//! manager stays the single owner of every instance.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use strata_types::{ObjectId, PersistenceState, Snapshot, Value};

/// Map key for a target whose key attribute holds `value`.
pub fn map_key_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => Value::Null.to_string(),
    }
}

// ---------------------------------------------------------------------------
// To-many collections
// ---------------------------------------------------------------------------

/// Contents of a resolved to-many relationship.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Collection {
    List(Vec<ObjectId>),
    /// Keyed by the string form of a target attribute.
    Map(BTreeMap<String, ObjectId>),
}

impl Collection {
    pub fn empty(keyed: bool) -> Self {
        if keyed {
            Self::Map(BTreeMap::new())
        } else {
            Self::List(Vec::new())
        }
    }

    pub fn ids(&self) -> Vec<&ObjectId> {
        match self {
            Self::List(ids) => ids.iter().collect(),
            Self::Map(map) => map.values().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::List(ids) => ids.len(),
            Self::Map(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        match self {
            Self::List(ids) => ids.contains(id),
            Self::Map(map) => map.values().any(|v| v == id),
        }
    }

    /// Returns `false` when `id` was already present under the same key.
    fn insert(&mut self, id: ObjectId, key: Option<String>) -> bool {
        match self {
            Self::List(ids) => {
                if ids.contains(&id) {
                    return false;
                }
                ids.push(id);
                true
            }
            Self::Map(map) => {
                let key = key.unwrap_or_else(|| map_key_of(None));
                if map.get(&key) == Some(&id) {
                    return false;
                }
                map.retain(|_, v| *v != id);
                map.insert(key, id);
                true
            }
        }
    }

    fn remove(&mut self, id: &ObjectId) -> bool {
        match self {
            Self::List(ids) => {
                let before = ids.len();
                ids.retain(|v| v != id);
                ids.len() != before
            }
            Self::Map(map) => {
                let before = map.len();
                map.retain(|_, v| v != id);
                map.len() != before
            }
        }
    }

    /// Key a map entry is stored under.
    pub fn key_of(&self, id: &ObjectId) -> Option<&str> {
        match self {
            Self::List(_) => None,
            Self::Map(map) => map
                .iter()
                .find(|(_, v)| *v == id)
                .map(|(k, _)| k.as_str()),
        }
    }

    fn remap(&mut self, changes: &HashMap<ObjectId, ObjectId>) {
        let swap = |id: &mut ObjectId| {
            if let Some(new_id) = changes.get(id) {
                *id = new_id.clone();
            }
        };
        match self {
            Self::List(ids) => ids.iter_mut().for_each(swap),
            Self::Map(map) => map.values_mut().for_each(swap),
        }
    }
}

/// A to-many relationship, possibly not yet fetched.
///
/// While the relationship is a fault, additions and removals are queued and
/// merged into the fetched contents on resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToMany {
    values: Option<Collection>,
    added: Vec<ObjectId>,
    removed: Vec<ObjectId>,
}

impl ToMany {
    pub fn resolved(values: Collection) -> Self {
        Self {
            values: Some(values),
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn fault() -> Self {
        Self::default()
    }

    pub fn is_fault(&self) -> bool {
        self.values.is_none()
    }

    pub fn collection(&self) -> Option<&Collection> {
        self.values.as_ref()
    }

    /// Target ids, `None` while faulted.
    pub fn ids(&self) -> Option<Vec<&ObjectId>> {
        self.values.as_ref().map(Collection::ids)
    }

    /// Queued `(added, removed)` targets of a faulted relationship.
    pub fn pending(&self) -> (&[ObjectId], &[ObjectId]) {
        (&self.added, &self.removed)
    }

    /// Whether `id` is known to be a member, faulted or not.
    pub fn contains(&self, id: &ObjectId) -> bool {
        match &self.values {
            Some(values) => values.contains(id),
            None => self.added.contains(id),
        }
    }

    pub(crate) fn add(&mut self, id: ObjectId, key: Option<String>) -> bool {
        match &mut self.values {
            Some(values) => values.insert(id, key),
            None => {
                if let Some(pos) = self.removed.iter().position(|v| *v == id) {
                    self.removed.remove(pos);
                    return true;
                }
                if self.added.contains(&id) {
                    return false;
                }
                self.added.push(id);
                true
            }
        }
    }

    pub(crate) fn remove(&mut self, id: &ObjectId) -> bool {
        match &mut self.values {
            Some(values) => values.remove(id),
            None => {
                if let Some(pos) = self.added.iter().position(|v| v == id) {
                    self.added.remove(pos);
                    return true;
                }
                if !self.removed.contains(id) {
                    self.removed.push(id.clone());
                }
                true
            }
        }
    }

    /// Install fetched contents and merge queued changes into them.
    pub(crate) fn resolve(
        &mut self,
        mut fetched: Collection,
        key_of: impl Fn(&ObjectId) -> Option<String>,
    ) {
        for id in std::mem::take(&mut self.added) {
            let key = key_of(&id);
            fetched.insert(id, key);
        }
        for id in std::mem::take(&mut self.removed) {
            fetched.remove(&id);
        }
        self.values = Some(fetched);
    }

    pub(crate) fn rekey(&mut self, id: &ObjectId, key: String) -> Option<String> {
        let Some(Collection::Map(map)) = &mut self.values else {
            return None;
        };
        let old = map.iter().find(|(_, v)| *v == id).map(|(k, _)| k.clone())?;
        if old == key {
            return None;
        }
        map.remove(&old);
        map.insert(key, id.clone());
        Some(old)
    }

    fn remap(&mut self, changes: &HashMap<ObjectId, ObjectId>) {
        if let Some(values) = &mut self.values {
            values.remap(changes);
        }
        for id in self.added.iter_mut().chain(self.removed.iter_mut()) {
            if let Some(new_id) = changes.get(id) {
                *id = new_id.clone();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PersistentObject
// ---------------------------------------------------------------------------

/// One entity instance.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistentObject {
    id: ObjectId,
    state: PersistenceState,
    values: Snapshot,
    to_one: BTreeMap<String, Option<ObjectId>>,
    /// A to-many relationship absent from this map is a fault.
    to_many: BTreeMap<String, ToMany>,
}

impl PersistentObject {
    /// An unregistered object with nothing loaded.
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            state: PersistenceState::Transient,
            values: Snapshot::new(),
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
        }
    }

    /// A placeholder for a stored object whose row was not fetched.
    pub fn hollow(id: ObjectId) -> Self {
        Self {
            state: PersistenceState::Hollow,
            ..Self::new(id)
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn entity_name(&self) -> &str {
        self.id.entity_name()
    }

    pub fn state(&self) -> PersistenceState {
        self.state
    }

    pub fn values(&self) -> &Snapshot {
        &self.values
    }

    pub fn value(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn to_one_map(&self) -> &BTreeMap<String, Option<ObjectId>> {
        &self.to_one
    }

    pub fn to_one_target(&self, relationship: &str) -> Option<&ObjectId> {
        self.to_one.get(relationship)?.as_ref()
    }

    pub fn to_many(&self, relationship: &str) -> Option<&ToMany> {
        self.to_many.get(relationship)
    }

    pub fn is_to_many_fault(&self, relationship: &str) -> bool {
        self.to_many.get(relationship).map_or(true, ToMany::is_fault)
    }

    pub(crate) fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    pub(crate) fn set_state(&mut self, state: PersistenceState) {
        self.state = state;
    }

    pub(crate) fn set_value(&mut self, property: &str, value: Value) -> Value {
        self.values
            .insert(property.to_string(), value)
            .unwrap_or(Value::Null)
    }

    pub(crate) fn set_to_one(&mut self, relationship: &str, target: Option<ObjectId>) -> Option<ObjectId> {
        self.to_one.insert(relationship.to_string(), target).flatten()
    }

    pub(crate) fn to_many_mut(&mut self, relationship: &str) -> &mut ToMany {
        self.to_many.entry(relationship.to_string()).or_default()
    }

    pub(crate) fn init_to_many(&mut self, relationship: &str, keyed: bool) {
        self.to_many.insert(
            relationship.to_string(),
            ToMany::resolved(Collection::empty(keyed)),
        );
    }

    /// Replace loaded state with a fetched row. To-many relationships
    /// become faults again.
    pub(crate) fn load(&mut self, values: Snapshot, to_one: BTreeMap<String, Option<ObjectId>>) {
        self.values = values;
        self.to_one = to_one;
        self.to_many.clear();
    }

    pub(crate) fn unload(&mut self) {
        self.values.clear();
        self.to_one.clear();
        self.to_many.clear();
    }

    pub(crate) fn remap(&mut self, changes: &HashMap<ObjectId, ObjectId>) {
        if let Some(new_id) = changes.get(&self.id) {
            self.id = new_id.clone();
        }
        for target in self.to_one.values_mut().flatten() {
            if let Some(new_id) = changes.get(target) {
                *target = new_id.clone();
            }
        }
        for many in self.to_many.values_mut() {
            many.remap(changes);
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectRef
// ---------------------------------------------------------------------------

/// Shared handle to a live object.
///
/// Handles compare by instance: two handles are the same object only when
/// they point at the same allocation.
#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<PersistentObject>>);

impl ObjectRef {
    pub fn new(object: PersistentObject) -> Self {
        Self(Rc::new(RefCell::new(object)))
    }

    pub fn id(&self) -> ObjectId {
        self.0.borrow().id.clone()
    }

    pub fn entity_name(&self) -> String {
        self.0.borrow().entity_name().to_string()
    }

    pub fn state(&self) -> PersistenceState {
        self.0.borrow().state
    }

    /// Loaded value of an attribute. Does not resolve faults.
    pub fn value(&self, property: &str) -> Option<Value> {
        self.0.borrow().values.get(property).cloned()
    }

    pub fn to_one_target(&self, relationship: &str) -> Option<ObjectId> {
        self.0.borrow().to_one_target(relationship).cloned()
    }

    pub fn same_instance(&self, other: &ObjectRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn borrow(&self) -> Ref<'_, PersistentObject> {
        self.0.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, PersistentObject> {
        self.0.borrow_mut()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object = self.0.borrow();
        write!(f, "ObjectRef({} {})", object.id, object.state)
    }
}
