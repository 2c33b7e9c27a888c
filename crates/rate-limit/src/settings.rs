use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use diagd_common::{DiagError, DiagResult, StoreLimits};

use crate::clock::duration_millis;
use crate::token_bucket::validate_limits;

/// Limits applied by a store to the buckets it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub default_capacity: u32,
    pub default_period: Duration,
    pub max_buckets: usize,
}

impl RateLimitSettings {
    pub fn new(default_capacity: u32, default_period: Duration, max_buckets: usize) -> DiagResult<Self> {
        let settings = Self {
            default_capacity,
            default_period,
            max_buckets,
        };
        settings.validate()?;
        Ok(settings.normalized())
    }

    /// Settings for a periodic task: `capacity` runs per
    /// `interval * percent / 100`, one bucket.
    pub fn periodic(collection_interval: Duration, capacity: u32, percent_of_interval: u32) -> DiagResult<Self> {
        if percent_of_interval == 0 {
            return Err(DiagError::invalid("percent_of_interval must be > 0"));
        }
        let period_ms = duration_millis(collection_interval)
            .saturating_mul(u64::from(percent_of_interval))
            / 100;
        Self::new(capacity, Duration::from_millis(period_ms), 1)
    }

    pub fn validate(&self) -> DiagResult<()> {
        validate_limits(self.default_capacity, self.default_period)?;
        if self.max_buckets == 0 {
            return Err(DiagError::invalid("max_buckets must be > 0"));
        }
        Ok(())
    }

    fn normalized(self) -> Self {
        Self {
            default_period: Duration::from_millis(duration_millis(self.default_period)),
            ..self
        }
    }
}

/// Source of a store's current settings.
///
/// Suppliers are polled on every take. Returning `None` means "no settings
/// available right now"; the store then keeps its last known-good values.
pub trait SettingsSupplier: Send + Sync {
    fn current(&self) -> Option<RateLimitSettings>;
}

impl<F> SettingsSupplier for F
where
    F: Fn() -> Option<RateLimitSettings> + Send + Sync,
{
    fn current(&self) -> Option<RateLimitSettings> {
        self()
    }
}

/// Settings fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct StaticSettings(pub RateLimitSettings);

impl SettingsSupplier for StaticSettings {
    fn current(&self) -> Option<RateLimitSettings> {
        Some(self.0)
    }
}

/// Hot-swappable settings cell.
///
/// Clones share the same cell, so the settings source can keep one handle and
/// publish new values while the store polls another.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<ArcSwap<RateLimitSettings>>,
}

impl SharedSettings {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    pub fn store(&self, settings: RateLimitSettings) {
        self.inner.store(Arc::new(settings));
    }

    pub fn load(&self) -> RateLimitSettings {
        **self.inner.load()
    }
}

impl SettingsSupplier for SharedSettings {
    fn current(&self) -> Option<RateLimitSettings> {
        Some(self.load())
    }
}

/// Settings derived from the collection interval of a periodic task.
///
/// The interval can be changed at runtime; the derived period follows it.
#[derive(Clone)]
pub struct PeriodicSettings {
    interval_ms: Arc<AtomicU64>,
    capacity: u32,
    percent_of_interval: u32,
}

impl PeriodicSettings {
    pub fn new(collection_interval: Duration, capacity: u32, percent_of_interval: u32) -> Self {
        Self {
            interval_ms: Arc::new(AtomicU64::new(duration_millis(collection_interval))),
            capacity,
            percent_of_interval,
        }
    }

    pub fn set_interval(&self, collection_interval: Duration) {
        self.interval_ms
            .store(duration_millis(collection_interval), Ordering::Relaxed);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }
}

impl SettingsSupplier for PeriodicSettings {
    fn current(&self) -> Option<RateLimitSettings> {
        RateLimitSettings::periodic(self.interval(), self.capacity, self.percent_of_interval).ok()
    }
}

impl TryFrom<&StoreLimits> for RateLimitSettings {
    type Error = DiagError;

    fn try_from(limits: &StoreLimits) -> DiagResult<Self> {
        match limits {
            StoreLimits::Explicit {
                capacity,
                period_ms,
                max_buckets,
            } => Self::new(*capacity, Duration::from_millis(*period_ms), *max_buckets),
            StoreLimits::Periodic(p) => Self::periodic(
                Duration::from_millis(p.collection_interval_ms),
                p.capacity,
                p.percent_of_interval,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagd_common::PeriodicStoreConfig;

    #[test]
    fn new_validates() {
        assert!(RateLimitSettings::new(1, Duration::from_secs(1), 1).is_ok());
        assert!(RateLimitSettings::new(0, Duration::from_secs(1), 1).is_err());
        assert!(RateLimitSettings::new(1, Duration::ZERO, 1).is_err());
        assert!(RateLimitSettings::new(1, Duration::from_secs(1), 0).is_err());
    }

    #[test]
    fn periodic_derives_half_interval_by_default() {
        let s = RateLimitSettings::periodic(Duration::from_secs(3600), 2, 50).unwrap();
        assert_eq!(s.default_capacity, 2);
        assert_eq!(s.default_period, Duration::from_secs(1800));
        assert_eq!(s.max_buckets, 1);
    }

    #[test]
    fn shared_settings_clones_observe_updates() {
        let first = RateLimitSettings::new(3, Duration::from_secs(1), 4).unwrap();
        let second = RateLimitSettings::new(1, Duration::from_secs(5), 2).unwrap();

        let publisher = SharedSettings::new(first);
        let reader = publisher.clone();
        assert_eq!(reader.current(), Some(first));

        publisher.store(second);
        assert_eq!(reader.current(), Some(second));
    }

    #[test]
    fn periodic_settings_follow_interval() {
        let supplier = PeriodicSettings::new(Duration::from_secs(60), 2, 50);
        assert_eq!(
            supplier.current().unwrap().default_period,
            Duration::from_secs(30)
        );

        supplier.set_interval(Duration::from_secs(10));
        assert_eq!(
            supplier.current().unwrap().default_period,
            Duration::from_secs(5)
        );

        // Too short to derive a period: reported as unavailable.
        supplier.set_interval(Duration::ZERO);
        assert_eq!(supplier.current(), None);
    }

    #[test]
    fn closures_are_suppliers() {
        let supplier = || RateLimitSettings::new(2, Duration::from_secs(1), 1).ok();
        assert_eq!(supplier.current().unwrap().default_capacity, 2);
    }

    #[test]
    fn converts_from_config_limits() {
        let explicit = StoreLimits::Explicit {
            capacity: 4,
            period_ms: 900_000,
            max_buckets: 100,
        };
        let s = RateLimitSettings::try_from(&explicit).unwrap();
        assert_eq!(s.default_period, Duration::from_secs(900));
        assert_eq!(s.max_buckets, 100);

        let periodic = StoreLimits::Periodic(PeriodicStoreConfig {
            collection_interval_ms: 60_000,
            capacity: 2,
            percent_of_interval: 50,
        });
        let s = RateLimitSettings::try_from(&periodic).unwrap();
        assert_eq!(s.default_period, Duration::from_secs(30));
        assert_eq!(s.max_buckets, 1);
    }
}
