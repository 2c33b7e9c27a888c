//! Persisted store state and the storage backends it is written to.
//!
//! A store's buckets are serialized to a small JSON document. Where the
//! document ends up is up to the [`PersistenceAdapter`]: a directory of files
//! on the device, or memory for tests and ephemeral stores.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use diagd_common::{is_valid_store_name, DiagError, DiagResult};
use serde::{Deserialize, Serialize};

/// Version tag of the persisted document.
pub const STATE_VERSION: u32 = 1;

/// Loads and saves the serialized state of named stores.
pub trait PersistenceAdapter: Send + Sync {
    /// Returns `Ok(None)` when nothing has been saved for `store` yet.
    fn load(&self, store: &str) -> DiagResult<Option<String>>;

    fn save(&self, store: &str, state: &str) -> DiagResult<()>;
}

impl<T: PersistenceAdapter + ?Sized> PersistenceAdapter for Arc<T> {
    fn load(&self, store: &str) -> DiagResult<Option<String>> {
        (**self).load(store)
    }

    fn save(&self, store: &str, state: &str) -> DiagResult<()> {
        (**self).save(store, state)
    }
}

/// One bucket as written to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBucket {
    pub key: String,
    pub capacity: u32,
    pub period_ms: u64,
    pub tokens: u32,
    pub last_refill_ms: u64,
    #[serde(default)]
    pub last_access: u64,
}

/// Everything needed to rebuild a store after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    pub version: u32,
    #[serde(default)]
    pub access_seq: u64,
    #[serde(default)]
    pub buckets: Vec<PersistedBucket>,
}

impl StoreState {
    pub fn new(access_seq: u64, buckets: Vec<PersistedBucket>) -> Self {
        Self {
            version: STATE_VERSION,
            access_seq,
            buckets,
        }
    }

    pub fn encode(&self) -> DiagResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a persisted document, reporting anything unreadable as
    /// [`DiagError::Corrupt`].
    pub fn decode(store: &str, raw: &str) -> DiagResult<Self> {
        let state: Self = serde_json::from_str(raw).map_err(|e| DiagError::Corrupt {
            store: store.to_string(),
            message: e.to_string(),
        })?;
        if state.version != STATE_VERSION {
            return Err(DiagError::Corrupt {
                store: store.to_string(),
                message: format!("unsupported state version {}", state.version),
            });
        }
        Ok(state)
    }
}

/// Stores each store's state as `<dir>/<store>.json`.
///
/// Writes go to a temporary file that is then renamed over the target, so a
/// crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, store: &str) -> DiagResult<PathBuf> {
        validate_store_name(store)?;
        Ok(self.dir.join(format!("{}.json", store)))
    }
}

fn validate_store_name(store: &str) -> DiagResult<()> {
    if is_valid_store_name(store) {
        Ok(())
    } else {
        Err(DiagError::invalid(format!(
            "store name '{}' cannot be used as a file name",
            store
        )))
    }
}

impl PersistenceAdapter for FilePersistence {
    fn load(&self, store: &str) -> DiagResult<Option<String>> {
        let path = self.path_for(store)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DiagError::Persistence {
                store: store.to_string(),
                message: format!("failed to read {}: {}", path.display(), e),
            }),
        }
    }

    fn save(&self, store: &str, state: &str) -> DiagResult<()> {
        let path = self.path_for(store)?;
        let tmp_path = self.dir.join(format!("{}.json.tmp", store));

        let write = || -> std::io::Result<()> {
            fs::create_dir_all(&self.dir)?;
            fs::write(&tmp_path, state)?;
            fs::rename(&tmp_path, &path)
        };

        write().map_err(|e| DiagError::Persistence {
            store: store.to_string(),
            message: format!("failed to write {}: {}", path.display(), e),
        })?;

        tracing::debug!(store, path = %path.display(), bytes = state.len(), "saved rate limit state");
        Ok(())
    }
}

/// Keeps state in process memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    states: DashMap<String, String>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw document last saved for `store`.
    pub fn raw(&self, store: &str) -> Option<String> {
        self.states.get(store).map(|s| s.value().clone())
    }

    /// Overwrite the document for `store`, e.g. to simulate corruption.
    pub fn put_raw(&self, store: &str, raw: impl Into<String>) {
        self.states.insert(store.to_string(), raw.into());
    }
}

impl PersistenceAdapter for MemoryPersistence {
    fn load(&self, store: &str) -> DiagResult<Option<String>> {
        Ok(self.raw(store))
    }

    fn save(&self, store: &str, state: &str) -> DiagResult<()> {
        self.states.insert(store.to_string(), state.to_string());
        Ok(())
    }
}
