//! Configuration hot-reload functionality.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, RwLock};

use super::loader::load_and_validate;
use super::model::AppConfig;
use crate::error::ConfigError;

/// Watches the configuration file and swaps in valid edits.
pub struct ConfigWatcher {
    config: Arc<RwLock<AppConfig>>,
    config_path: std::path::PathBuf,
    reload_tx: mpsc::Sender<ConfigReloadEvent>,
}

/// Events emitted by the configuration watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigReloadEvent {
    /// Configuration was successfully reloaded.
    Reloaded,
    /// The edited file was rejected; the previous configuration stays active.
    ValidationFailed { error_count: usize },
}

impl ConfigWatcher {
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        config_path: &Path,
        reload_tx: mpsc::Sender<ConfigReloadEvent>,
    ) -> Self {
        Self {
            config,
            config_path: config_path.to_path_buf(),
            reload_tx,
        }
    }

    /// Starts watching the configuration file for changes.
    pub fn start(self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            Config::default(),
        )?;

        watcher.watch(&self.config_path, RecursiveMode::NonRecursive)?;

        // The watcher stops when dropped, so the handler task owns it.
        tokio::spawn(async move {
            let _watcher = watcher;
            self.handle_changes(rx).await;
        });

        Ok(())
    }

    /// Handles file change events with debouncing.
    async fn handle_changes(self, mut rx: mpsc::UnboundedReceiver<notify::Event>) {
        let debounce_duration = Duration::from_millis(500);
        let mut last_reload = std::time::Instant::now()
            .checked_sub(debounce_duration)
            .unwrap_or_else(std::time::Instant::now);

        while let Some(event) = rx.recv().await {
            if !(event.kind.is_modify() || event.kind.is_create()) {
                continue;
            }

            // Debounce rapid changes
            if last_reload.elapsed() < debounce_duration {
                continue;
            }

            // Wait a bit for the file to be fully written
            tokio::time::sleep(debounce_duration).await;
            while rx.try_recv().is_ok() {}

            let event = match self.try_reload().await {
                Ok(()) => {
                    tracing::info!(path = %self.config_path.display(), "Configuration reloaded");
                    ConfigReloadEvent::Reloaded
                }
                Err(e) => {
                    tracing::error!(error = %e, "Configuration reload failed, keeping current config");
                    let error_count = match e.downcast_ref::<ConfigError>() {
                        Some(ConfigError::ValidationFailed { error_count }) => *error_count,
                        _ => 1,
                    };
                    ConfigReloadEvent::ValidationFailed { error_count }
                }
            };
            let _ = self.reload_tx.send(event).await;

            last_reload = std::time::Instant::now();
        }

        tracing::warn!("Config watcher channel closed");
    }

    async fn try_reload(&self) -> Result<()> {
        let new_config = load_and_validate(&self.config_path)?;

        let mut config = self.config.write().await;
        *config = new_config;

        Ok(())
    }
}
