use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default = "default_settings_reload_secs")]
    pub settings_reload_secs: u64,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

/// One rate-limited event category.
///
/// A store is either described by explicit limits (`capacity`, `period_ms`,
/// `max_buckets`) or by a `periodic` block that derives its limits from the
/// collection interval of a periodic task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub name: String,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub period_ms: Option<u64>,
    #[serde(default)]
    pub max_buckets: Option<usize>,
    #[serde(default)]
    pub periodic: Option<PeriodicStoreConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicStoreConfig {
    pub collection_interval_ms: u64,
    #[serde(default = "default_periodic_capacity")]
    pub capacity: u32,
    #[serde(default = "default_percent_of_interval")]
    pub percent_of_interval: u32,
}

/// The resolved limits of a store, after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLimits {
    Explicit {
        capacity: u32,
        period_ms: u64,
        max_buckets: usize,
    },
    Periodic(PeriodicStoreConfig),
}

impl StoreConfig {
    /// Resolve the configured limits, rejecting incomplete or zero values.
    pub fn limits(&self) -> anyhow::Result<StoreLimits> {
        if let Some(periodic) = &self.periodic {
            if self.capacity.is_some() || self.period_ms.is_some() || self.max_buckets.is_some() {
                anyhow::bail!(
                    "store '{}' mixes a periodic block with explicit capacity/period_ms/max_buckets",
                    self.name
                );
            }
            if periodic.collection_interval_ms == 0 {
                anyhow::bail!("store '{}': collection_interval_ms must be > 0", self.name);
            }
            if periodic.capacity == 0 {
                anyhow::bail!("store '{}': periodic capacity must be > 0", self.name);
            }
            if periodic.percent_of_interval == 0 {
                anyhow::bail!("store '{}': percent_of_interval must be > 0", self.name);
            }
            if periodic
                .collection_interval_ms
                .saturating_mul(u64::from(periodic.percent_of_interval))
                < 100
            {
                anyhow::bail!(
                    "store '{}': derived period is shorter than one millisecond",
                    self.name
                );
            }
            return Ok(StoreLimits::Periodic(periodic.clone()));
        }

        let capacity = self
            .capacity
            .ok_or_else(|| anyhow::anyhow!("store '{}' is missing capacity", self.name))?;
        let period_ms = self
            .period_ms
            .ok_or_else(|| anyhow::anyhow!("store '{}' is missing period_ms", self.name))?;
        let max_buckets = self.max_buckets.unwrap_or_else(default_max_buckets);

        if capacity == 0 {
            anyhow::bail!("store '{}': capacity must be > 0", self.name);
        }
        if period_ms == 0 {
            anyhow::bail!("store '{}': period_ms must be > 0", self.name);
        }
        if max_buckets == 0 {
            anyhow::bail!("store '{}': max_buckets must be > 0", self.name);
        }

        Ok(StoreLimits::Explicit {
            capacity,
            period_ms,
            max_buckets,
        })
    }
}

/// Store names double as file names for persisted state.
pub fn is_valid_store_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

// Default value helpers
fn default_settings_reload_secs() -> u64 {
    60
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/diagd/rate-limits")
}
fn default_max_buckets() -> usize {
    1
}
fn default_periodic_capacity() -> u32 {
    2
}
fn default_percent_of_interval() -> u32 {
    50
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.settings_reload_secs == 0 {
            anyhow::bail!("settings_reload_secs must be > 0");
        }
        if self.persistence.dir.as_os_str().is_empty() {
            anyhow::bail!("persistence.dir must not be empty");
        }

        let mut seen = HashSet::new();
        for store in &self.stores {
            if store.name.trim().is_empty() {
                anyhow::bail!("store names must not be empty");
            }
            if !is_valid_store_name(&store.name) {
                anyhow::bail!(
                    "store name '{}' may only contain ASCII letters, digits, '_', '-' and '.'",
                    store.name
                );
            }
            if !seen.insert(store.name.as_str()) {
                anyhow::bail!("duplicate store name '{}'", store.name);
            }
            store.limits()?;
        }

        Ok(())
    }

    pub fn store(&self, name: &str) -> Option<&StoreConfig> {
        self.stores.iter().find(|s| s.name == name)
    }
}
