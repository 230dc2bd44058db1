//! Configuration: YAML model, loading with validation, and hot reload.

pub mod hot_reload;
pub mod loader;
pub mod model;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;

pub use model::AppConfig;

/// Holds the live configuration shared by the scheduler loops and the reload watcher.
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Loads the file, refusing to start on validation errors.
    pub fn new(config_path: &Path) -> Result<Self> {
        let config = loader::load_and_validate(config_path)?;
        Ok(Self::with_config(config, config_path))
    }

    /// Wraps an already-loaded configuration.
    pub fn with_config(config: AppConfig, config_path: &Path) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.to_path_buf(),
        }
    }

    pub fn get_config(&self) -> Arc<RwLock<AppConfig>> {
        Arc::clone(&self.config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Watches the file and swaps in every edit that passes validation.
    pub fn watch(
        &self,
        events: tokio::sync::mpsc::Sender<hot_reload::ConfigReloadEvent>,
    ) -> Result<()> {
        hot_reload::ConfigWatcher::new(self.get_config(), &self.config_path, events).start()
    }
}
