//! Entity mapping metadata for Strata.
//!
//! Describes which tables, columns, and relationships exist, and how object
//! entities map onto them. The [`EntityResolver`] answers the questions the
//! change-tracking core asks while it runs: which table backs an entity,
//! which properties are attributes or arcs, which relationships are
//! flattened through a join table, and what the reverse of a relationship is.
//!
//! # Key Types
//!
//! - [`DbEntity`] / [`DbAttribute`] / [`DbRelationship`] -- Physical tables
//! - [`ObjEntity`] / [`ObjAttribute`] / [`ObjRelationship`] -- Object entities
//! - [`EntityMap`] -- Serializable collection of both, loadable from TOML
//! - [`EntityResolver`] / [`ClassDescriptor`] -- Validated, indexed view

pub mod db;
pub mod error;
pub mod obj;
pub mod resolver;

pub use db::{DbAttribute, DbEntity, DbJoin, DbRelationship};
pub use error::{MapError, MapResult};
pub use obj::{DeleteRule, LockType, ObjAttribute, ObjEntity, ObjRelationship, DB_ARC_PREFIX};
pub use resolver::{ClassDescriptor, EntityMap, EntityResolver, PropertyKind};
