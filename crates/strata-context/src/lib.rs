//! Object contexts for Strata.
//!
//! A [`DataDomain`] holds everything contexts share: the mapping, the
//! storage backend, table order, validators, and the row cache. Each
//! [`ObjectContext`] is a single-threaded unit of work over its own object
//! graph. Root contexts commit to storage; child contexts commit into their
//! parent. Commits publish [`SnapshotEvent`](strata_store::SnapshotEvent)s
//! that sibling contexts apply with
//! [`ObjectContext::process_snapshot_events`].
//!
//! # Key Types
//!
//! - [`DataDomain`] -- Shared mapping, storage, cache, and validators
//! - [`ObjectContext`] -- Unit-of-work API: create, edit, delete, commit, roll back
//! - [`DomainConfig`] -- Cache, event, and validation settings
//! - [`ContextError`] -- Errors surfaced by contexts

pub mod config;
pub mod context;
pub mod domain;
pub mod error;
mod faults;
mod replay;

pub use config::DomainConfig;
pub use context::ObjectContext;
pub use domain::DataDomain;
pub use error::{ContextError, ContextResult};

pub use strata_flush::CommitSummary;
