use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads, so the bridge can consult the
/// configuration from its hot paths without blocking writers.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<BridgeConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store, creating the file with defaults if it does not exist
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = match tokio::fs::read_to_string(path).await {
            Ok(json) => Self::parse(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, writing defaults", path.display());
                let config = BridgeConfig::default();
                Self::save_to_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Store holding `config` without a backing file on disk yet
    pub fn in_memory(path: &Path, config: BridgeConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    fn parse(json: &str) -> Result<BridgeConfig> {
        let config: BridgeConfig =
            serde_json::from_str(json).map_err(|e| BridgeError::Config(e.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &BridgeConfig) -> Result<()> {
        let mut seen = HashSet::new();
        for device in &config.devices {
            if !seen.insert(device.id) {
                return Err(BridgeError::Config(format!(
                    "duplicate device id {}",
                    device.id
                )));
            }
            if device.reserved_size == 0 {
                return Err(BridgeError::Config(format!(
                    "device {} has no reserved memory",
                    device.id
                )));
            }
        }
        if config.channel.listener_queue_depth == 0 {
            return Err(BridgeError::Config("listener queue depth is zero".into()));
        }
        if config.telemetry.enabled && config.telemetry.window_ms == 0 {
            return Err(BridgeError::Config("telemetry window is zero".into()));
        }
        Ok(())
    }

    /// Write configuration atomically via a temporary file
    async fn save_to_file(path: &Path, config: &BridgeConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<BridgeConfig> {
        self.cache.load_full()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set entire configuration
    pub async fn set(&self, config: BridgeConfig) -> Result<()> {
        Self::validate(&config)?;
        Self::save_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "bridge_config".to_string(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write: for concurrent updates the last write wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BridgeConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.json");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());

        let config = store.get();
        assert_eq!(config.channel.retry_attempts, 10);
        assert_eq!(config.channel.event_timeout_ms, 5000);
        assert_eq!(config.devices.len(), 1);

        let mut rx = store.subscribe();
        store
            .update(|c| {
                c.channel.event_timeout_ms = 250;
                c.telemetry.enabled = false;
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().key, "bridge_config");

        let config = store.get();
        assert_eq!(config.channel.event_timeout_ms, 250);

        // Create new store instance and verify persistence
        let store2 = ConfigStore::new(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.channel.event_timeout_ms, 250);
        assert!(!config.telemetry.enabled);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        tokio::fs::write(&path, r#"{"channel":{"retry_attempts":3}}"#)
            .await
            .unwrap();

        let store = ConfigStore::new(&path).await.unwrap();
        let config = store.get();
        assert_eq!(config.channel.retry_attempts, 3);
        assert_eq!(config.channel.retry_interval_ms, 5);
        assert_eq!(config.telemetry.window_ms, 3000);
        assert_eq!(config.devices[0].width, 1920);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_devices() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        tokio::fs::write(&path, r#"{"devices":[{"id":1},{"id":1}]}"#)
            .await
            .unwrap();

        assert!(matches!(
            ConfigStore::new(&path).await,
            Err(BridgeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_zero_limits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        let store = ConfigStore::new(&path).await.unwrap();

        let result = store.update(|c| c.channel.listener_queue_depth = 0).await;
        assert!(matches!(result, Err(BridgeError::Config(_))));
        let result = store.update(|c| c.telemetry.window_ms = 0).await;
        assert!(matches!(result, Err(BridgeError::Config(_))));

        // Rejected updates leave the cached config untouched
        assert_eq!(store.get().channel.listener_queue_depth, 64);
        assert_eq!(store.get().telemetry.window_ms, 3000);
    }
}
