//! Persisted token-bucket rate limiting for the diagnostics agent.
//!
//! Every event category the agent collects (crash backtraces, reboots, log
//! dumps, periodic metric collection, ...) gets its own
//! [`TokenBucketStore`]: a bounded set of token buckets keyed by a tag or by
//! a derived signature such as a backtrace hash.
//!
//! - **Buckets** refill one token per period, in whole periods only, so the
//!   refill phase does not drift when checks happen at irregular times.
//!
//! - **Stores** cap the number of keys and evict the least recently used
//!   bucket when a new key arrives at a full store. Settings come from a
//!   [`SettingsSupplier`] and can change at runtime.
//!
//! - **Persistence** is best-effort and off the hot path: a background writer
//!   per store saves the latest state through a [`PersistenceAdapter`], and a
//!   store built after a restart picks up where the previous process left
//!   off. Unreadable state starts the store empty, so events are let through
//!   rather than blocked.
//!
//! A [`StoreRegistry`] holds all stores of the agent by name.

pub mod clock;
pub mod key_store;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod settings;
pub mod store;
pub mod token_bucket;
mod writer;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use key_store::{BucketEntry, BucketKeyStore, KeyStoreGuard};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use persistence::{
    FilePersistence, MemoryPersistence, PersistedBucket, PersistenceAdapter, StoreState,
};
pub use registry::{StoreRegistry, StoreRegistryBuilder};
pub use settings::{
    PeriodicSettings, RateLimitSettings, SettingsSupplier, SharedSettings, StaticSettings,
};
pub use store::{StoreEditor, TokenBucketStore, TokenBucketStoreBuilder};
pub use token_bucket::TokenBucket;
