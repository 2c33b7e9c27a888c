//! Shared types for the diagd workspace: the error taxonomy and the agent
//! configuration file.

pub mod config;
pub mod error;

pub use config::{
    is_valid_store_name, AgentConfig, PeriodicStoreConfig, PersistenceConfig, StoreConfig,
    StoreLimits,
};
pub use error::{DiagError, DiagResult};
