use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use diagd_common::DiagResult;
use parking_lot::{Mutex, MutexGuard};

use crate::clock::{duration_millis, Timestamp};
use crate::persistence::{PersistedBucket, StoreState};
use crate::settings::RateLimitSettings;
use crate::token_bucket::TokenBucket;

/// A bucket together with its position in the LRU order.
#[derive(Debug)]
pub struct BucketEntry {
    bucket: Mutex<TokenBucket>,
    last_access: AtomicU64,
}

impl BucketEntry {
    fn new(bucket: TokenBucket, access: u64) -> Self {
        Self {
            bucket: Mutex::new(bucket),
            last_access: AtomicU64::new(access),
        }
    }

    /// Lock the bucket. Refill and consume must happen under one lock.
    pub fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock()
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn touch(&self, access: u64) {
        self.last_access.fetch_max(access, Ordering::Relaxed);
    }
}

/// Bounded map from key to token bucket.
///
/// Lookups of existing keys go straight to the sharded map and only lock the
/// bucket they hit. Creating a key, evicting, and changing the bound happen
/// under a single admission lock so `len() <= max_buckets` holds after each of
/// those operations completes. When a new key arrives at a full store the
/// least recently accessed bucket is evicted.
pub struct BucketKeyStore {
    buckets: DashMap<String, Arc<BucketEntry>>,
    admission: Mutex<()>,
    max_buckets: AtomicUsize,
    access_seq: AtomicU64,
}

impl BucketKeyStore {
    pub fn new(max_buckets: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            admission: Mutex::new(()),
            max_buckets: AtomicUsize::new(max_buckets.max(1)),
            access_seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn max_buckets(&self) -> usize {
        self.max_buckets.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// Look a key up without touching its LRU position.
    pub fn get(&self, key: &str) -> Option<Arc<BucketEntry>> {
        self.buckets.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn next_access(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return the bucket for `key`, creating a full one from the settings
    /// defaults if the key is new. The boolean is `true` when the bucket was
    /// created by this call.
    pub fn get_or_create(
        &self,
        key: &str,
        settings: &RateLimitSettings,
        now: Timestamp,
    ) -> DiagResult<(Arc<BucketEntry>, bool)> {
        if settings.max_buckets == self.max_buckets() {
            if let Some(entry) = self.get(key) {
                entry.touch(self.next_access());
                return Ok((entry, false));
            }
        }

        self.lock().get_or_create(key, settings, now)
    }

    /// Take the admission lock for a sequence of structural changes.
    pub fn lock(&self) -> KeyStoreGuard<'_> {
        KeyStoreGuard {
            store: self,
            _admission: self.admission.lock(),
        }
    }

    /// Capture every bucket for persistence.
    ///
    /// Map shards are released before any bucket is locked, and each bucket
    /// is locked on its own, so a snapshot never holds up unrelated keys.
    pub fn snapshot(&self) -> StoreState {
        let access_seq = self.access_seq.load(Ordering::Relaxed);
        let entries: Vec<(String, Arc<BucketEntry>)> = self
            .buckets
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut buckets: Vec<PersistedBucket> = entries
            .into_iter()
            .map(|(key, entry)| {
                let bucket = entry.lock();
                PersistedBucket {
                    key,
                    capacity: bucket.capacity(),
                    period_ms: duration_millis(bucket.period()),
                    tokens: bucket.tokens(),
                    last_refill_ms: bucket.last_refill().as_millis(),
                    last_access: entry.last_access(),
                }
            })
            .collect();
        buckets.sort_by(|a, b| a.key.cmp(&b.key));
        let highest = buckets.iter().map(|b| b.last_access).max().unwrap_or(0);
        StoreState::new(access_seq.max(highest), buckets)
    }
}

/// Holds the admission lock of a [`BucketKeyStore`].
pub struct KeyStoreGuard<'a> {
    store: &'a BucketKeyStore,
    _admission: MutexGuard<'a, ()>,
}

impl KeyStoreGuard<'_> {
    pub fn store(&self) -> &BucketKeyStore {
        self.store
    }

    pub fn get_or_create(
        &mut self,
        key: &str,
        settings: &RateLimitSettings,
        now: Timestamp,
    ) -> DiagResult<(Arc<BucketEntry>, bool)> {
        self.set_max_buckets(settings.max_buckets);

        let access = self.store.next_access();
        if let Some(entry) = self.store.get(key) {
            entry.touch(access);
            return Ok((entry, false));
        }

        let bucket = TokenBucket::new(settings.default_capacity, settings.default_period, now)?;

        while self.store.len() >= self.store.max_buckets() {
            if self.evict_lru().is_none() {
                break;
            }
        }

        let entry = Arc::new(BucketEntry::new(bucket, access));
        self.store.buckets.insert(key.to_string(), Arc::clone(&entry));
        tracing::trace!(key, "created rate limit bucket");
        Ok((entry, true))
    }

    /// Change the bound, evicting least recently used buckets if the store is
    /// now over it. Returns the evicted keys.
    pub fn set_max_buckets(&mut self, max_buckets: usize) -> Vec<String> {
        let max_buckets = max_buckets.max(1);
        let previous = self.store.max_buckets.swap(max_buckets, Ordering::Relaxed);
        if previous != max_buckets {
            tracing::info!(previous, max_buckets, "rate limit bucket bound changed");
        }

        let mut evicted = Vec::new();
        while self.store.len() > max_buckets {
            match self.evict_lru() {
                Some(key) => evicted.push(key),
                None => break,
            }
        }
        evicted
    }

    /// Remove the least recently accessed bucket.
    pub fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .store
            .buckets
            .iter()
            .min_by_key(|e| e.value().last_access())
            .map(|e| e.key().clone())?;
        self.store.buckets.remove(&victim);
        tracing::debug!(key = %victim, "evicted least recently used rate limit bucket");
        Some(victim)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.store.buckets.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.store.buckets.clear();
    }

    /// Replace the contents with previously persisted buckets.
    ///
    /// Invalid entries are skipped. If the saved state holds more buckets than
    /// the current bound, only the most recently accessed ones are kept.
    /// Returns the number of buckets restored.
    pub fn restore(&mut self, state: StoreState) -> usize {
        self.store.buckets.clear();

        let mut entries = state.buckets;
        entries.sort_by(|a, b| b.last_access.cmp(&a.last_access));

        let max_buckets = self.store.max_buckets();
        let mut highest_access = state.access_seq;
        for persisted in entries {
            if self.store.len() >= max_buckets {
                tracing::debug!(key = %persisted.key, "dropping persisted bucket over the bound");
                continue;
            }
            let bucket = match TokenBucket::from_parts(
                persisted.capacity,
                Duration::from_millis(persisted.period_ms),
                persisted.tokens,
                Timestamp::from_millis(persisted.last_refill_ms),
            ) {
                Ok(bucket) => bucket,
                Err(e) => {
                    tracing::warn!(key = %persisted.key, error = %e, "skipping invalid persisted bucket");
                    continue;
                }
            };
            highest_access = highest_access.max(persisted.last_access);
            self.store.buckets.insert(
                persisted.key,
                Arc::new(BucketEntry::new(bucket, persisted.last_access)),
            );
        }

        self.store.access_seq.fetch_max(highest_access, Ordering::Relaxed);
        self.store.len()
    }
}
