use std::collections::BTreeMap;
use std::sync::Arc;

use diagd_common::{DiagError, DiagResult};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::persistence::{MemoryPersistence, PersistenceAdapter};
use crate::settings::SettingsSupplier;
use crate::store::TokenBucketStore;

/// All rate limit stores of the agent, by name.
///
/// Built once at startup from an explicit list of store names and settings
/// suppliers. Every store shares the same persistence backend, metrics sink
/// and clock but keeps its own buckets, locks and writer.
pub struct StoreRegistry {
    stores: BTreeMap<String, Arc<TokenBucketStore>>,
}

struct StoreDefinition {
    name: String,
    supplier: Box<dyn SettingsSupplier>,
}

/// Builder for [`StoreRegistry`].
pub struct StoreRegistryBuilder {
    definitions: Vec<StoreDefinition>,
    persistence: Arc<dyn PersistenceAdapter>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl StoreRegistryBuilder {
    pub fn persistence(mut self, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(mut self, name: impl Into<String>, supplier: impl SettingsSupplier + 'static) -> Self {
        self.definitions.push(StoreDefinition {
            name: name.into(),
            supplier: Box::new(supplier),
        });
        self
    }

    pub fn build(self) -> DiagResult<StoreRegistry> {
        let mut stores = BTreeMap::new();
        for definition in self.definitions {
            if stores.contains_key(&definition.name) {
                return Err(DiagError::invalid(format!(
                    "duplicate rate limit store '{}'",
                    definition.name
                )));
            }
            let store = TokenBucketStore::builder_boxed(definition.name.clone(), definition.supplier)
                .persistence(Arc::clone(&self.persistence))
                .metrics(Arc::clone(&self.metrics))
                .clock(Arc::clone(&self.clock))
                .build()?;
            stores.insert(definition.name, Arc::new(store));
        }

        info!(stores = stores.len(), "rate limit registry built");
        Ok(StoreRegistry { stores })
    }
}

impl StoreRegistry {
    pub fn builder() -> StoreRegistryBuilder {
        StoreRegistryBuilder {
            definitions: Vec::new(),
            persistence: Arc::new(MemoryPersistence::new()),
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TokenBucketStore>> {
        self.stores.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.stores.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<TokenBucketStore>)> {
        self.stores.iter().map(|(name, store)| (name.as_str(), store))
    }

    /// Take one token for `tag` in store `name`. Unknown stores allow the
    /// event.
    pub fn take_simple(&self, name: &str, tag: &str) -> bool {
        match self.stores.get(name) {
            Some(store) => store.take_simple(tag),
            None => {
                warn!(store = name, "unknown rate limit store, allowing");
                true
            }
        }
    }

    pub fn take(&self, name: &str, key: &str, count: u32) -> DiagResult<bool> {
        self.stores
            .get(name)
            .ok_or_else(|| DiagError::invalid(format!("unknown rate limit store '{}'", name)))?
            .take(key, count)
    }

    /// Refill every bucket of every store.
    pub fn reset_all(&self) {
        for store in self.stores.values() {
            store.reset();
        }
    }

    pub fn flush_all(&self) {
        for store in self.stores.values() {
            store.flush();
        }
    }
}
