use anyhow::Result;
use diagd_common::AgentConfig;
use std::path::PathBuf;
use tracing::info;

/// Resolved configuration with the source path for reloading.
pub struct AgentSettings {
    pub config: AgentConfig,
    pub config_path: PathBuf,
}

impl AgentSettings {
    pub fn load(path: &str) -> Result<Self> {
        info!(path = path, "loading configuration");
        let config = AgentConfig::load(path)?;
        Ok(Self {
            config,
            config_path: PathBuf::from(path),
        })
    }

    /// Re-read the file. The previous configuration is kept if the new one
    /// does not parse or validate.
    pub fn reload(&mut self) -> Result<&AgentConfig> {
        let path_str = self.config_path.to_string_lossy().to_string();
        info!(path = %path_str, "reloading configuration");
        self.config = AgentConfig::load(&path_str)?;
        Ok(&self.config)
    }
}
