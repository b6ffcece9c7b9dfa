//! Configuration storage operations

use crate::{config::Config, Result};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

/// Default config directory, `None` when the platform has none.
pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stdrpc"))
}

pub struct ConfigStorage {
    config_path: PathBuf,
}

impl ConfigStorage {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_dir.as_ref().join(CONFIG_FILE),
        }
    }

    /// Use an explicit file instead of `<dir>/config.json`.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn load(&self) -> Result<Config> {
        if !self.config_path.exists() {
            let config = Config::default();
            self.save(&config)?;
            tracing::debug!("created default config at {}", self.config_path.display());
            return Ok(config);
        }

        let content = std::fs::read_to_string(&self.config_path)?;

        // Handle empty file case
        if content.trim().is_empty() {
            let config = Config::default();
            self.save(&config)?;
            return Ok(config);
        }

        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.config_path, content)?;

        Ok(())
    }
}
