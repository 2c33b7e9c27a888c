use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use diagd_common::{AgentConfig, PeriodicStoreConfig, StoreLimits};
use diagd_rate_limit::{
    Clock, MetricsSink, PeriodicSettings, PersistenceAdapter, RateLimitSettings, SharedSettings,
    StoreRegistry,
};
use tracing::{error, info, warn};

use crate::config::AgentSettings;

/// The live settings source behind one store.
enum SettingsHandle {
    Shared(SharedSettings),
    Periodic {
        settings: PeriodicSettings,
        config: PeriodicStoreConfig,
    },
}

/// Settings handles for every configured store, keyed by store name.
pub struct StoreSettings {
    handles: BTreeMap<String, (StoreLimits, SettingsHandle)>,
}

/// Build the registry described by `config`, keeping the handles needed to
/// push reloaded settings into it later.
pub fn build_registry(
    config: &AgentConfig,
    persistence: Arc<dyn PersistenceAdapter>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
) -> Result<(StoreRegistry, StoreSettings)> {
    let mut builder = StoreRegistry::builder()
        .persistence(persistence)
        .metrics(metrics)
        .clock(clock);
    let mut handles = BTreeMap::new();

    for store in &config.stores {
        let limits = store.limits()?;
        let handle = match &limits {
            StoreLimits::Periodic(p) => {
                let settings = PeriodicSettings::new(
                    Duration::from_millis(p.collection_interval_ms),
                    p.capacity,
                    p.percent_of_interval,
                );
                builder = builder.store(store.name.clone(), settings.clone());
                SettingsHandle::Periodic {
                    settings,
                    config: p.clone(),
                }
            }
            explicit => {
                let settings = SharedSettings::new(RateLimitSettings::try_from(explicit)?);
                builder = builder.store(store.name.clone(), settings.clone());
                SettingsHandle::Shared(settings)
            }
        };
        handles.insert(store.name.clone(), (limits, handle));
    }

    Ok((builder.build()?, StoreSettings { handles }))
}

impl StoreSettings {
    /// Push changed limits from `config` into the running stores. Returns the
    /// names of the stores that were updated.
    ///
    /// Stores cannot be added or removed at runtime, and a periodic store
    /// only follows changes to its collection interval.
    pub fn apply(&mut self, registry: &StoreRegistry, config: &AgentConfig) -> Vec<String> {
        let mut updated = Vec::new();

        for store in &config.stores {
            let Some((current, handle)) = self.handles.get_mut(&store.name) else {
                warn!(store = %store.name, "new rate limit store ignored until restart");
                continue;
            };
            let limits = match store.limits() {
                Ok(limits) => limits,
                Err(e) => {
                    warn!(store = %store.name, error = %e, "invalid reloaded limits, keeping current");
                    continue;
                }
            };
            if limits == *current {
                continue;
            }

            let settings = match RateLimitSettings::try_from(&limits) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(store = %store.name, error = %e, "invalid reloaded limits, keeping current");
                    continue;
                }
            };

            match (handle, &limits) {
                (SettingsHandle::Shared(shared), StoreLimits::Explicit { .. }) => {
                    shared.store(settings);
                }
                (SettingsHandle::Periodic { settings: periodic, config }, StoreLimits::Periodic(p))
                    if p.capacity == config.capacity
                        && p.percent_of_interval == config.percent_of_interval =>
                {
                    periodic.set_interval(Duration::from_millis(p.collection_interval_ms));
                    config.collection_interval_ms = p.collection_interval_ms;
                }
                _ => {
                    warn!(store = %store.name, "rate limit store kind changed, restart required");
                    continue;
                }
            }

            if let Some(target) = registry.get(&store.name) {
                let applied = target.edit(|editor| editor.apply_settings(settings));
                match applied {
                    Ok(evicted) if !evicted.is_empty() => {
                        info!(store = %store.name, evicted = evicted.len(), "buckets evicted after reload");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(store = %store.name, error = %e, "failed to apply reloaded settings");
                        continue;
                    }
                }
            }

            *current = limits;
            updated.push(store.name.clone());
        }

        for name in self.handles.keys() {
            if config.store(name).is_none() {
                warn!(store = %name, "rate limit store removed from config, keeping until restart");
            }
        }

        updated
    }
}

/// Background thread that re-reads the config file on a fixed interval.
pub struct Reloader {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reloader {
    pub fn spawn(
        mut agent_settings: AgentSettings,
        mut store_settings: StoreSettings,
        registry: Arc<StoreRegistry>,
    ) -> std::io::Result<Self> {
        let interval = Duration::from_secs(agent_settings.config.settings_reload_secs);
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("settings-reload".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match agent_settings.reload() {
                        Ok(config) => {
                            let updated = store_settings.apply(&registry, config);
                            if !updated.is_empty() {
                                info!(stores = ?updated, "rate limit settings reloaded");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "config reload failed, keeping previous settings");
                        }
                    },
                    _ => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for Reloader {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("settings reload thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagd_rate_limit::{ManualClock, MemoryPersistence, NoopMetrics, Timestamp};

    const INITIAL: &str = r#"
stores:
  - name: java_exceptions
    capacity: 3
    period_ms: 60000
    max_buckets: 3
  - name: metrics_periodic
    periodic:
      collection_interval_ms: 3600000
"#;

    fn build(yaml: &str) -> (StoreRegistry, StoreSettings) {
        let config = AgentConfig::from_yaml(yaml).unwrap();
        build_registry(
            &config,
            Arc::new(MemoryPersistence::new()),
            Arc::new(NoopMetrics),
            Arc::new(ManualClock::new(Timestamp::from_millis(0))),
        )
        .unwrap()
    }

    #[test]
    fn builds_one_store_per_entry() {
        let (registry, _) = build(INITIAL);
        assert_eq!(registry.names(), vec!["java_exceptions", "metrics_periodic"]);

        let periodic = registry.get("metrics_periodic").unwrap().settings();
        assert_eq!(periodic.default_capacity, 2);
        assert_eq!(periodic.default_period, Duration::from_secs(1800));
        assert_eq!(periodic.max_buckets, 1);
    }

    #[test]
    fn unchanged_config_updates_nothing() {
        let (registry, mut settings) = build(INITIAL);
        let config = AgentConfig::from_yaml(INITIAL).unwrap();
        assert!(settings.apply(&registry, &config).is_empty());
    }

    #[test]
    fn reload_shrinks_explicit_store() {
        let (registry, mut settings) = build(INITIAL);
        for key in ["a", "b", "c"] {
            assert!(registry.take_simple("java_exceptions", key));
        }

        let config = AgentConfig::from_yaml(
            r#"
stores:
  - name: java_exceptions
    capacity: 1
    period_ms: 60000
    max_buckets: 1
  - name: metrics_periodic
    periodic:
      collection_interval_ms: 3600000
"#,
        )
        .unwrap();
        assert_eq!(settings.apply(&registry, &config), vec!["java_exceptions"]);

        let store = registry.get("java_exceptions").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.settings().default_capacity, 1);
    }

    #[test]
    fn reload_follows_periodic_interval() {
        let (registry, mut settings) = build(INITIAL);
        let config = AgentConfig::from_yaml(
            r#"
stores:
  - name: java_exceptions
    capacity: 3
    period_ms: 60000
    max_buckets: 3
  - name: metrics_periodic
    periodic:
      collection_interval_ms: 600000
"#,
        )
        .unwrap();

        assert_eq!(settings.apply(&registry, &config), vec!["metrics_periodic"]);
        let store = registry.get("metrics_periodic").unwrap();
        assert_eq!(store.settings().default_period, Duration::from_secs(300));
        // New buckets pick up the derived period through the supplier too.
        assert!(store.take_simple("metrics"));
        assert_eq!(store.bucket("metrics").unwrap().period(), Duration::from_secs(300));
    }

    #[test]
    fn kind_changes_and_new_stores_wait_for_restart() {
        let (registry, mut settings) = build(INITIAL);
        let config = AgentConfig::from_yaml(
            r#"
stores:
  - name: java_exceptions
    periodic:
      collection_interval_ms: 600000
  - name: reboot_events
    capacity: 5
    period_ms: 3600000
"#,
        )
        .unwrap();

        assert!(settings.apply(&registry, &config).is_empty());
        assert!(registry.get("reboot_events").is_none());
        assert_eq!(
            registry.get("java_exceptions").unwrap().settings().default_capacity,
            3
        );
    }
}
