use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use diagd_common::{DiagError, DiagResult};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::key_store::{BucketKeyStore, KeyStoreGuard};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::persistence::{MemoryPersistence, PersistenceAdapter, StoreState};
use crate::settings::{RateLimitSettings, SettingsSupplier};
use crate::token_bucket::TokenBucket;
use crate::writer::PersistenceWriter;

/// A persisted, bounded collection of token buckets for one event category.
///
/// Producers call [`take`](Self::take) or [`take_simple`](Self::take_simple).
/// Decisions are made in memory. A change only marks the store dirty; a
/// background writer snapshots the buckets and saves them through the
/// store's [`PersistenceAdapter`], so the caller never waits on I/O or on
/// other keys. State saved by a previous process is
/// loaded when the store is built.
pub struct TokenBucketStore {
    name: String,
    buckets: Arc<BucketKeyStore>,
    supplier: Box<dyn SettingsSupplier>,
    last_good: ArcSwap<RateLimitSettings>,
    settings_degraded: AtomicBool,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    writer: PersistenceWriter,
}

/// Builder for [`TokenBucketStore`].
pub struct TokenBucketStoreBuilder {
    name: String,
    supplier: Box<dyn SettingsSupplier>,
    fallback: Option<RateLimitSettings>,
    persistence: Arc<dyn PersistenceAdapter>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketStoreBuilder {
    /// Where state is loaded from and saved to. Defaults to memory.
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

    /// Settings to start with if the supplier has none at build time.
    pub fn fallback_settings(mut self, settings: RateLimitSettings) -> Self {
        self.fallback = Some(settings);
        self
    }

    pub fn build(self) -> DiagResult<TokenBucketStore> {
        let initial = match self.supplier.current().filter(|s| s.validate().is_ok()) {
            Some(settings) => settings,
            None => self.fallback.ok_or_else(|| {
                DiagError::Config(format!(
                    "no valid rate limit settings available for store '{}'",
                    self.name
                ))
            })?,
        };
        let initial = RateLimitSettings::new(
            initial.default_capacity,
            initial.default_period,
            initial.max_buckets,
        )?;

        let buckets = Arc::new(BucketKeyStore::new(initial.max_buckets));
        let snapshot_source = Arc::clone(&buckets);
        let writer = PersistenceWriter::spawn(&self.name, Arc::clone(&self.persistence), move || {
            snapshot_source.snapshot()
        })?;

        let store = TokenBucketStore {
            buckets,
            supplier: self.supplier,
            last_good: ArcSwap::from_pointee(initial),
            settings_degraded: AtomicBool::new(false),
            metrics: self.metrics,
            clock: self.clock,
            writer,
            name: self.name,
        };
        store.load_from_persistence(self.persistence.as_ref());

        info!(
            store = %store.name,
            buckets = store.len(),
            capacity = initial.default_capacity,
            period_ms = initial.default_period.as_millis() as u64,
            max_buckets = initial.max_buckets,
            "rate limit store ready"
        );
        Ok(store)
    }
}

impl TokenBucketStore {
    pub fn builder(
        name: impl Into<String>,
        supplier: impl SettingsSupplier + 'static,
    ) -> TokenBucketStoreBuilder {
        Self::builder_boxed(name.into(), Box::new(supplier))
    }

    pub(crate) fn builder_boxed(name: String, supplier: Box<dyn SettingsSupplier>) -> TokenBucketStoreBuilder {
        TokenBucketStoreBuilder {
            name,
            supplier,
            fallback: None,
            persistence: Arc::new(MemoryPersistence::new()),
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// The last known-good settings.
    pub fn settings(&self) -> RateLimitSettings {
        **self.last_good.load()
    }

    /// A copy of the bucket stored under `key`, as of its last refill.
    pub fn bucket(&self, key: &str) -> Option<TokenBucket> {
        self.buckets.get(key).map(|entry| entry.lock().clone())
    }

    /// Take one token from the bucket for `tag`.
    ///
    /// Fails open: if the take cannot be evaluated the event is allowed.
    pub fn take_simple(&self, tag: &str) -> bool {
        self.take(tag, 1).unwrap_or_else(|e| {
            warn!(store = %self.name, key = tag, error = %e, "rate limit check failed, allowing");
            true
        })
    }

    /// Take `count` tokens from the bucket for `key`, creating the bucket if
    /// needed. Returns whether the tokens were granted.
    pub fn take(&self, key: &str, count: u32) -> DiagResult<bool> {
        if count == 0 {
            return Err(DiagError::invalid("token count must be > 0"));
        }

        let settings = self.current_settings();
        let now = self.clock.now();
        let (entry, created) = self.buckets.get_or_create(key, &settings, now)?;

        let (accepted, changed, remaining) = {
            let mut bucket = entry.lock();
            let before = bucket.clone();
            let accepted = bucket.try_consume(count, now)?;
            (accepted, *bucket != before, bucket.tokens())
        };

        if created || changed {
            self.persist();
        }

        self.metrics.on_consume(&self.name, key, accepted);
        trace!(store = %self.name, key, count, accepted, remaining, "rate limit decision");
        Ok(accepted)
    }

    /// Apply an administrative change under the store's admission lock, then
    /// persist the result.
    pub fn edit<R>(&self, f: impl FnOnce(&mut StoreEditor<'_>) -> R) -> R {
        let result = {
            let mut editor = StoreEditor {
                store: self,
                guard: self.buckets.lock(),
                now: self.clock.now(),
            };
            f(&mut editor)
        };
        self.persist();
        result
    }

    /// Refill every bucket to capacity.
    pub fn reset(&self) {
        self.edit(|editor| editor.reset_all());
        info!(store = %self.name, "rate limit store reset");
    }

    /// Block until the latest state has been handed to the persistence
    /// adapter.
    pub fn flush(&self) {
        self.writer.flush();
    }

    fn persist(&self) {
        self.writer.request_save();
    }

    fn current_settings(&self) -> RateLimitSettings {
        let last_good = self.settings();
        let candidate = match self.supplier.current() {
            Some(candidate) => candidate,
            None => {
                self.mark_degraded("rate limit settings unavailable, keeping last known-good");
                return last_good;
            }
        };

        let candidate = match RateLimitSettings::new(
            candidate.default_capacity,
            candidate.default_period,
            candidate.max_buckets,
        ) {
            Ok(candidate) => candidate,
            Err(e) => {
                if !self.settings_degraded.swap(true, Ordering::Relaxed) {
                    warn!(store = %self.name, error = %e, "invalid rate limit settings, keeping last known-good");
                }
                return last_good;
            }
        };

        if self.settings_degraded.swap(false, Ordering::Relaxed) {
            info!(store = %self.name, "rate limit settings available again");
        }
        if candidate != last_good {
            self.publish_settings(candidate);
        }
        candidate
    }

    fn mark_degraded(&self, message: &str) {
        if !self.settings_degraded.swap(true, Ordering::Relaxed) {
            warn!(store = %self.name, "{}", message);
        }
    }

    fn publish_settings(&self, settings: RateLimitSettings) {
        self.last_good.store(Arc::new(settings));
        info!(
            store = %self.name,
            capacity = settings.default_capacity,
            period_ms = settings.default_period.as_millis() as u64,
            max_buckets = settings.max_buckets,
            "rate limit settings updated"
        );
    }

    /// Restore buckets saved by a previous process. Missing, unreadable or
    /// corrupt state leaves the store empty.
    fn load_from_persistence(&self, persistence: &dyn PersistenceAdapter) {
        let raw = match persistence.load(&self.name) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(store = %self.name, "no persisted rate limit state");
                return;
            }
            Err(e) => {
                warn!(store = %self.name, error = %e, "failed to load rate limit state, starting empty");
                return;
            }
        };

        match StoreState::decode(&self.name, &raw) {
            Ok(state) => {
                let saved = state.buckets.len();
                let restored = self.buckets.lock().restore(state);
                debug!(store = %self.name, saved, restored, "restored rate limit state");
            }
            Err(e) => {
                warn!(store = %self.name, error = %e, "discarding corrupt rate limit state, starting empty");
            }
        }
    }
}

/// Mutable view of a store handed to [`TokenBucketStore::edit`].
///
/// No bucket can be created or evicted by producers while an editor is
/// alive.
pub struct StoreEditor<'a> {
    store: &'a TokenBucketStore,
    guard: KeyStoreGuard<'a>,
    now: Timestamp,
}

impl StoreEditor<'_> {
    pub fn settings(&self) -> RateLimitSettings {
        self.store.settings()
    }

    /// Make `settings` the store's current settings.
    ///
    /// The new defaults apply to buckets created from now on; a lower
    /// `max_buckets` evicts least recently used buckets immediately. The
    /// supplier is still polled on every take, so a supplier that reports
    /// something else will override this on the next take.
    pub fn apply_settings(&mut self, settings: RateLimitSettings) -> DiagResult<Vec<String>> {
        let settings = RateLimitSettings::new(
            settings.default_capacity,
            settings.default_period,
            settings.max_buckets,
        )?;
        if settings != self.store.settings() {
            self.store.publish_settings(settings);
        }
        Ok(self.guard.set_max_buckets(settings.max_buckets))
    }

    pub fn keys(&self) -> Vec<String> {
        self.guard.store().keys()
    }

    pub fn len(&self) -> usize {
        self.guard.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.store().is_empty()
    }

    pub fn bucket(&self, key: &str) -> Option<TokenBucket> {
        self.guard.store().get(key).map(|entry| entry.lock().clone())
    }

    /// Top up the bucket for `key`. Returns `false` if there is none.
    pub fn reset(&mut self, key: &str) -> bool {
        match self.guard.store().get(key) {
            Some(entry) => {
                entry.lock().reset(self.now);
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&mut self) {
        for key in self.keys() {
            self.reset(&key);
        }
    }

    /// Give the bucket for `key` a new capacity and period, clamping its
    /// tokens. Returns `Ok(false)` if there is no such bucket.
    pub fn reconfigure(&mut self, key: &str, capacity: u32, period: Duration) -> DiagResult<bool> {
        let Some(entry) = self.guard.store().get(key) else {
            return Ok(false);
        };
        let mut bucket = entry.lock();
        bucket.refill(self.now);
        bucket.reconfigure(capacity, period)?;
        Ok(true)
    }

    /// Move every bucket to the current default capacity and period.
    /// Returns the number of buckets changed.
    pub fn reconfigure_all(&mut self) -> DiagResult<usize> {
        let settings = self.settings();
        let mut changed = 0;
        for key in self.keys() {
            let Some(entry) = self.guard.store().get(&key) else {
                continue;
            };
            let mut bucket = entry.lock();
            if bucket.capacity() == settings.default_capacity
                && bucket.period() == settings.default_period
            {
                continue;
            }
            bucket.refill(self.now);
            bucket.reconfigure(settings.default_capacity, settings.default_period)?;
            changed += 1;
        }
        Ok(changed)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.guard.remove(key)
    }

    pub fn clear(&mut self) {
        self.guard.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::settings::{SharedSettings, StaticSettings};

    fn settings(capacity: u32, period_ms: u64, max_buckets: usize) -> RateLimitSettings {
        RateLimitSettings::new(capacity, Duration::from_millis(period_ms), max_buckets).unwrap()
    }

    fn manual_store(supplier: impl SettingsSupplier + 'static) -> (TokenBucketStore, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_millis(1_000_000));
        let store = TokenBucketStore::builder("test", supplier)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (store, clock)
    }

    #[test]
    fn take_simple_burst_then_refill() {
        let (store, clock) = manual_store(StaticSettings(settings(3, 1_000, 1)));

        assert!(store.take_simple("metrics"));
        assert!(store.take_simple("metrics"));
        assert!(store.take_simple("metrics"));
        assert!(!store.take_simple("metrics"));

        clock.advance(Duration::from_secs(1));
        assert!(store.take_simple("metrics"));
        assert!(!store.take_simple("metrics"));
    }

    #[test]
    fn take_does_not_wait_on_other_buckets() {
        let (store, _) = manual_store(StaticSettings(settings(3, 1_000, 4)));
        assert!(store.take_simple("a"));
        assert!(store.take_simple("b"));
        store.flush();

        let held = store.buckets.get("b").unwrap();
        let locked = held.lock();
        let (done, finished) = std::sync::mpsc::channel();
        let producer = &store;
        std::thread::scope(|scope| {
            scope.spawn(move || {
                let _ = done.send(producer.take("a", 1));
            });
            let result = finished.recv_timeout(Duration::from_secs(5));
            drop(locked);
            assert!(matches!(result, Ok(Ok(true))));
        });
        store.flush();
        assert_eq!(store.bucket("a").unwrap().tokens(), 1);
    }

    #[test]
    fn take_rejects_zero() {
        let (store, _) = manual_store(StaticSettings(settings(3, 1_000, 1)));
        assert!(matches!(store.take("k", 0), Err(DiagError::InvalidArgument(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn failed_take_leaves_tokens() {
        let (store, _) = manual_store(StaticSettings(settings(3, 1_000, 1)));
        assert!(store.take("k", 2).unwrap());
        assert!(!store.take("k", 2).unwrap());
        assert_eq!(store.bucket("k").unwrap().tokens(), 1);
    }

    #[test]
    fn build_requires_some_settings() {
        let unavailable = || -> Option<RateLimitSettings> { None };
        assert!(TokenBucketStore::builder("s", unavailable).build().is_err());

        let store = TokenBucketStore::builder("s", unavailable)
            .fallback_settings(settings(2, 100, 1))
            .build()
            .unwrap();
        assert_eq!(store.settings().default_capacity, 2);
    }

    #[test]
    fn unavailable_settings_keep_last_known_good() {
        let current = Arc::new(parking_lot::Mutex::new(Some(settings(2, 1_000, 4))));
        let source = Arc::clone(&current);
        let (store, _) = manual_store(move || *source.lock());

        assert!(store.take_simple("a"));
        *current.lock() = None;
        assert!(store.take_simple("b"));
        assert_eq!(store.bucket("b").unwrap().capacity(), 2);

        // Invalid values are ignored the same way.
        *current.lock() = Some(RateLimitSettings {
            default_capacity: 0,
            default_period: Duration::from_secs(1),
            max_buckets: 4,
        });
        assert!(store.take_simple("c"));
        assert_eq!(store.bucket("c").unwrap().capacity(), 2);
        assert_eq!(store.settings(), settings(2, 1_000, 4));
    }

    #[test]
    fn settings_change_only_affects_new_buckets() {
        let shared = SharedSettings::new(settings(3, 1_000, 4));
        let (store, _) = manual_store(shared.clone());

        assert!(store.take_simple("before"));
        shared.store(settings(1, 1_000, 4));
        assert!(store.take_simple("after"));

        assert_eq!(store.bucket("before").unwrap().capacity(), 3);
        assert_eq!(store.bucket("after").unwrap().capacity(), 1);

        let changed = store.edit(|e| e.reconfigure_all()).unwrap();
        assert_eq!(changed, 1);
        let before = store.bucket("before").unwrap();
        assert_eq!(before.capacity(), 1);
        assert_eq!(before.tokens(), 1);
    }

    #[test]
    fn edit_applies_settings_and_shrinks() {
        let (store, _) = manual_store(StaticSettings(settings(1, 1_000, 3)));
        for key in ["a", "b", "c"] {
            store.take_simple(key);
        }

        let evicted = store
            .edit(|e| e.apply_settings(settings(1, 1_000, 1)))
            .unwrap();
        assert_eq!(evicted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn edit_resets_and_removes() {
        let (store, _) = manual_store(StaticSettings(settings(2, 60_000, 4)));
        store.take("x", 2).unwrap();
        store.take("y", 2).unwrap();

        assert!(store.edit(|e| e.reset("x")));
        assert_eq!(store.bucket("x").unwrap().tokens(), 2);
        assert!(!store.edit(|e| e.reset("missing")));

        store.reset();
        assert_eq!(store.bucket("y").unwrap().tokens(), 2);

        assert!(store.edit(|e| e.remove("x")));
        assert_eq!(store.edit(|e| e.keys()), vec!["y".to_string()]);

        store.edit(|e| e.clear());
        assert!(store.is_empty());
    }

    #[test]
    fn reconfigure_single_bucket_clamps_tokens() {
        let (store, _) = manual_store(StaticSettings(settings(5, 1_000, 4)));
        store.take("k", 1).unwrap();

        assert!(store
            .edit(|e| e.reconfigure("k", 2, Duration::from_secs(2)))
            .unwrap());
        let bucket = store.bucket("k").unwrap();
        assert_eq!(bucket.capacity(), 2);
        assert_eq!(bucket.tokens(), 2);
        assert_eq!(bucket.period(), Duration::from_secs(2));

        assert!(store
            .edit(|e| e.reconfigure("k", 0, Duration::from_secs(2)))
            .is_err());
        assert!(!store
            .edit(|e| e.reconfigure("nope", 2, Duration::from_secs(2)))
            .unwrap());
    }
}
