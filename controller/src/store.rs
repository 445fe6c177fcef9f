use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use relaynode_common::{ChannelConfig, RuntimeConfig};

/// JSON files under the data directory: `runtime.json` for configuration and
/// `states.json` for the last known relay states.
#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    states_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("RELAYNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.relaynode"));
        Self::in_dir(data_dir)
    }

    pub fn in_dir(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            states_path: Arc::new(data_dir.join("states.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Missing file means first boot: defaults.
    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        Ok(self.read_json(&self.runtime_path).await?.unwrap_or_default())
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        self.write_json(&self.runtime_path, runtime).await
    }

    /// Sanitized channel table from the stored configuration.
    pub async fn load_channels(&self) -> anyhow::Result<Vec<ChannelConfig>> {
        let mut runtime = self.load_runtime_config().await?;
        runtime.sanitize();
        runtime.validate().context("stored channel table is invalid")?;
        Ok(runtime.channels)
    }

    pub async fn load_channel_states(&self) -> anyhow::Result<Vec<bool>> {
        Ok(self.read_json(&self.states_path).await?.unwrap_or_default())
    }

    pub async fn save_channel_states(&self, states: &[bool]) -> anyhow::Result<()> {
        self.write_json(&self.states_path, states).await
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> anyhow::Result<Option<T>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn write_json<T>(&self, path: &Path, value: &T) -> anyhow::Result<()>
    where
        T: Serialize + ?Sized,
    {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}
