//! The shared, thread-safe half of the runtime.

use std::fmt;
use std::sync::Arc;

use strata_flush::{EntitySorter, ValidationPipeline, Validator};
use strata_map::EntityResolver;
use strata_store::{RowCache, Storage};
use tracing::info;

use crate::config::DomainConfig;
use crate::context::ObjectContext;

/// Mapping, storage, table order, row cache, and validators shared by every
/// context created from it.
pub struct DataDomain {
    resolver: Arc<EntityResolver>,
    storage: Arc<dyn Storage>,
    sorter: EntitySorter,
    shared_cache: Option<Arc<RowCache>>,
    validators: ValidationPipeline,
    config: DomainConfig,
}

impl DataDomain {
    pub fn new(resolver: Arc<EntityResolver>, storage: Arc<dyn Storage>, config: DomainConfig) -> Self {
        let sorter = EntitySorter::new(&resolver);
        let shared_cache = config
            .shared_cache
            .then(|| Arc::new(RowCache::new(config.cache_capacity, config.event_channel_capacity)));
        info!(
            entities = resolver.obj_entities().count(),
            tables = sorter.table_order().len(),
            shared_cache = config.shared_cache,
            "data domain created"
        );
        Self {
            resolver,
            storage,
            sorter,
            shared_cache,
            validators: ValidationPipeline::default(),
            config,
        }
    }

    /// Replace the default validators.
    pub fn with_validators(mut self, validators: ValidationPipeline) -> Self {
        self.validators = validators;
        self
    }

    pub fn add_validator(&mut self, validator: Box<dyn Validator>) {
        self.validators.add_validator(validator);
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn sorter(&self) -> &EntitySorter {
        &self.sorter
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// The validators to run on commit, or `None` when validation is off.
    pub fn validators(&self) -> Option<&ValidationPipeline> {
        self.config.validates().then_some(&self.validators)
    }

    pub fn shared_cache(&self) -> Option<&Arc<RowCache>> {
        self.shared_cache.as_ref()
    }

    /// A new root context.
    pub fn create_context(self: &Arc<Self>) -> ObjectContext {
        ObjectContext::new(Arc::clone(self))
    }

    /// The cache a new root context should use.
    pub(crate) fn cache_for_context(&self) -> Arc<RowCache> {
        match &self.shared_cache {
            Some(cache) => Arc::clone(cache),
            None => Arc::new(RowCache::new(
                self.config.cache_capacity,
                self.config.event_channel_capacity,
            )),
        }
    }
}

impl fmt::Debug for DataDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDomain")
            .field("tables", &self.sorter.table_order())
            .field("shared_cache", &self.shared_cache.is_some())
            .field("validators", &self.validators)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::InMemoryDatabase;

    const GALLERY: &str = include_str!("../../../fixtures/gallery.toml");

    fn domain(config: DomainConfig) -> Arc<DataDomain> {
        let resolver = Arc::new(EntityResolver::from_toml_str(GALLERY).unwrap());
        let db = Arc::new(InMemoryDatabase::new(&resolver));
        Arc::new(DataDomain::new(resolver, db, config))
    }

    #[test]
    fn shared_cache_is_handed_to_every_context() {
        let domain = domain(DomainConfig::default());
        let a = domain.cache_for_context();
        let b = domain.cache_for_context();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.capacity(), 10_000);
    }

    #[test]
    fn private_caches_when_not_shared() {
        let domain = domain(DomainConfig {
            shared_cache: false,
            cache_capacity: 3,
            ..Default::default()
        });
        assert!(domain.shared_cache().is_none());
        let a = domain.cache_for_context();
        let b = domain.cache_for_context();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.capacity(), 3);
    }

    #[test]
    fn permissive_domain_has_no_validators() {
        assert!(domain(DomainConfig::default()).validators().is_some());
        assert!(domain(DomainConfig::permissive()).validators().is_none());
    }

    #[test]
    fn custom_validators_replace_defaults() {
        let domain = Arc::new(
            Arc::try_unwrap(domain(DomainConfig::default()))
                .unwrap()
                .with_validators(ValidationPipeline::empty()),
        );
        assert!(domain.validators().is_some_and(|v| v.is_empty()));
    }
}
