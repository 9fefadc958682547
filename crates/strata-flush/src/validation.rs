//! Pre-commit validation of NEW and MODIFIED objects.

use std::fmt;

use serde::Serialize;
use strata_graph::{GraphManager, PersistentObject};
use strata_map::{EntityResolver, PropertyKind};
use strata_types::{ObjectId, PersistenceState};
use tracing::debug;

use crate::error::{FlushError, FlushResult};

/// One broken rule on one object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub object: ObjectId,
    pub property: String,
    pub message: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.object, self.property, self.message)
    }
}

/// A single validation check.
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    /// Append a failure for every broken rule on `object`.
    fn validate(&self, resolver: &EntityResolver, object: &PersistentObject, failures: &mut Vec<ValidationFailure>);
}

/// Mandatory columns mapped by attributes must not be null.
pub struct MandatoryAttributes;

impl Validator for MandatoryAttributes {
    fn name(&self) -> &str {
        "mandatory_attributes"
    }

    fn validate(&self, resolver: &EntityResolver, object: &PersistentObject, failures: &mut Vec<ValidationFailure>) {
        let Ok(entity) = resolver.obj_entity(object.entity_name()) else {
            return;
        };
        let Ok(table) = resolver.db_entity(&entity.db_entity) else {
            return;
        };
        for attr in entity.attributes.iter().filter(|a| !a.is_flattened()) {
            let mandatory = table
                .attribute(&attr.db_path)
                .is_some_and(|column| column.mandatory && !column.primary_key);
            if !mandatory {
                continue;
            }
            if object.value(&attr.name).map_or(true, |v| v.is_null()) {
                failures.push(ValidationFailure {
                    object: object.id().clone(),
                    property: attr.name.clone(),
                    message: format!("{} is required", attr.db_path),
                });
            }
        }
    }
}

/// To-one relationships stored in mandatory foreign-key columns must point
/// at an object.
pub struct MandatoryToOne;

impl Validator for MandatoryToOne {
    fn name(&self) -> &str {
        "mandatory_to_one"
    }

    fn validate(&self, resolver: &EntityResolver, object: &PersistentObject, failures: &mut Vec<ValidationFailure>) {
        let entity_name = object.entity_name();
        let Ok(descriptor) = resolver.class_descriptor(entity_name) else {
            return;
        };
        let Ok(table) = resolver.db_entity_for(entity_name) else {
            return;
        };
        for name in &descriptor.to_one {
            if descriptor.property_kind(name) != Some(PropertyKind::ToOne) {
                continue;
            }
            let Ok(db_rel) = resolver.single_step(entity_name, name) else {
                continue;
            };
            let Ok(target) = resolver.db_entity(&db_rel.target) else {
                continue;
            };
            let mandatory = db_rel.is_foreign_key(target)
                && db_rel
                    .source_columns()
                    .all(|c| table.attribute(c).is_some_and(|a| a.mandatory));
            if mandatory && object.to_one_target(name).is_none() {
                failures.push(ValidationFailure {
                    object: object.id().clone(),
                    property: name.clone(),
                    message: "relationship is required".into(),
                });
            }
        }
    }
}

/// Ordered set of validators run before a flush.
///
/// Every validator sees every object; failures are collected rather than
/// stopping at the first one.
pub struct ValidationPipeline {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidationPipeline {
    /// A pipeline with no validators.
    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    pub fn add_validator(&mut self, validator: Box<dyn Validator>) {
        self.validators.push(validator);
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Names of the configured validators in run order.
    pub fn names(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// Check every NEW and MODIFIED object among `ids`.
    pub fn validate(&self, graph: &GraphManager, ids: &[ObjectId]) -> FlushResult<()> {
        let resolver = graph.resolver();
        let mut failures = Vec::new();
        let mut checked = 0usize;
        for id in ids {
            let Some(object) = graph.get_node(id) else { continue };
            if !matches!(object.state(), PersistenceState::New | PersistenceState::Modified) {
                continue;
            }
            checked += 1;
            let object = object.borrow();
            for validator in &self.validators {
                validator.validate(resolver, &object, &mut failures);
            }
        }
        debug!(
            objects = checked,
            validators = self.validators.len(),
            failures = failures.len(),
            "validation finished"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FlushError::Validation(failures))
        }
    }
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        Self {
            validators: vec![Box::new(MandatoryAttributes), Box::new(MandatoryToOne)],
        }
    }
}

impl fmt::Debug for ValidationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationPipeline")
            .field("validators", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    const GALLERY: &str = include_str!("../../../fixtures/gallery.toml");
    const TABLES: &str = include_str!("../../../fixtures/tables.toml");

    fn graph(fixture: &str) -> GraphManager {
        GraphManager::new(Arc::new(EntityResolver::from_toml_str(fixture).unwrap()))
    }

    #[test]
    fn default_pipeline_has_both_checks() {
        let pipeline = ValidationPipeline::default();
        assert_eq!(pipeline.names(), vec!["mandatory_attributes", "mandatory_to_one"]);
        assert!(ValidationPipeline::empty().is_empty());
    }

    #[test]
    fn missing_mandatory_attribute_fails() {
        let mut graph = graph(GALLERY);
        let artist = graph.new_object("Artist").unwrap().id();
        let err = ValidationPipeline::default()
            .validate(&graph, &[artist.clone()])
            .unwrap_err();
        let FlushError::Validation(failures) = err else {
            panic!("expected validation failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].property, "artistName");

        graph.write_property(&artist, "artistName", json!("Degas")).unwrap();
        ValidationPipeline::default().validate(&graph, &[artist]).unwrap();
    }

    #[test]
    fn failures_are_collected_across_objects() {
        let mut graph = graph(TABLES);
        let a = graph.new_object("Table2").unwrap().id();
        let b = graph.new_object("Table2").unwrap().id();
        let err = ValidationPipeline::default().validate(&graph, &[a, b]).unwrap_err();
        match err {
            FlushError::Validation(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().all(|f| f.property == "toTable1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn generated_keys_are_not_required() {
        let mut graph = graph(TABLES);
        let id = graph.new_object("Table1").unwrap().id();
        ValidationPipeline::default().validate(&graph, &[id]).unwrap();
    }

    #[test]
    fn empty_pipeline_accepts_everything() {
        let mut graph = graph(GALLERY);
        let id = graph.new_object("Painting").unwrap().id();
        ValidationPipeline::empty().validate(&graph, &[id]).unwrap();
    }
}
