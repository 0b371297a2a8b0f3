use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::cache_hint::CacheSelectHint;
use crate::job::{CalculationJobSpecification, CycleId};
use crate::value::{CacheValue, ComputedValue, ValueSpecification};

/// Computation cache seen by one job.
///
/// Values are routed to the shared or private store according to the hint the
/// caller passes; reads see a value as soon as the write returned.
pub trait ViewComputationCache: Send + Sync {
    fn get_value(&self, spec: &ValueSpecification, hint: &CacheSelectHint) -> Option<CacheValue>;

    fn put_values(&self, values: Vec<ComputedValue>, hint: &CacheSelectHint);

    fn put_shared_value(&self, value: ComputedValue) {
        self.put_values(vec![value], &CacheSelectHint::AllShared);
    }
}

/// Hands out the cache for a job specification.
pub trait ViewComputationCacheSource: Send + Sync {
    fn get_cache(&self, job: &CalculationJobSpecification) -> Arc<dyn ViewComputationCache>;
}

type Store = RwLock<HashMap<ValueSpecification, CacheValue>>;
type CacheKey = (CycleId, String);

/// Shared stores keyed by cycle and calculation configuration.
#[derive(Default)]
pub struct SharedCacheStore {
    stores: RwLock<HashMap<CacheKey, Arc<Store>>>,
}

impl SharedCacheStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn store(&self, key: &CacheKey) -> Arc<Store> {
        if let Some(store) = self
            .stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return store.clone();
        }
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop every value of a finished cycle.
    pub fn release_cycle(&self, cycle_id: CycleId) {
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(cycle, _), _| *cycle != cycle_id);
    }
}

/// In-memory cache source for one worker process.
///
/// Several sources can share a [`SharedCacheStore`] while keeping their
/// private stores apart, which models independent nodes reading one shared
/// cache.
pub struct InMemoryViewComputationCacheSource {
    shared: Arc<SharedCacheStore>,
    private: SharedCacheStore,
}

impl InMemoryViewComputationCacheSource {
    pub fn new() -> Self {
        Self::with_shared(SharedCacheStore::new())
    }

    pub fn with_shared(shared: Arc<SharedCacheStore>) -> Self {
        Self {
            shared,
            private: SharedCacheStore::default(),
        }
    }

    pub fn shared_store(&self) -> Arc<SharedCacheStore> {
        self.shared.clone()
    }
}

impl Default for InMemoryViewComputationCacheSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewComputationCacheSource for InMemoryViewComputationCacheSource {
    fn get_cache(&self, job: &CalculationJobSpecification) -> Arc<dyn ViewComputationCache> {
        let key = (job.cycle_id, job.calc_config_name.clone());
        Arc::new(InMemoryViewComputationCache {
            shared: self.shared.store(&key),
            private: self.private.store(&key),
        })
    }
}

struct InMemoryViewComputationCache {
    shared: Arc<Store>,
    private: Arc<Store>,
}

impl InMemoryViewComputationCache {
    fn store_for(&self, spec: &ValueSpecification, hint: &CacheSelectHint) -> &Store {
        if hint.is_private_value(spec) {
            self.private.as_ref()
        } else {
            self.shared.as_ref()
        }
    }
}

impl ViewComputationCache for InMemoryViewComputationCache {
    fn get_value(&self, spec: &ValueSpecification, hint: &CacheSelectHint) -> Option<CacheValue> {
        self.store_for(spec, hint)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(spec)
            .cloned()
    }

    fn put_values(&self, values: Vec<ComputedValue>, hint: &CacheSelectHint) {
        for value in values {
            debug!(value = %value.specification, private = hint.is_private_value(&value.specification), "cache put");
            self.store_for(&value.specification, hint)
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(value.specification, value.value);
        }
    }
}
