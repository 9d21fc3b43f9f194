// Store Configuration
//
// Where the local store lives and how the reconciler talks to the remote.
// Loaded from JSON; every field has a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid namespace `{0}`")]
    InvalidNamespace(String),

    #[error("remote timeout must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// File stem of the store inside `data_dir`.
    pub namespace: String,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on any single remote port call.
    pub remote_timeout_ms: u64,
    /// Once a record for a key fails in a pass, defer that key's later
    /// records until the next pass.
    pub hold_key_after_failure: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_timeout_ms: 10_000,
            hold_key_after_failure: false,
        }
    }
}

impl SyncConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

impl StoreConfig {
    /// Built-in configuration (used if no config is provided).
    pub fn default_config() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            namespace: "kvledger".into(),
            sync: SyncConfig::default(),
        }
    }

    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ns = &self.namespace;
        if ns.is_empty() || ns.contains(['/', '\\']) || ns.contains("..") {
            return Err(ConfigError::InvalidNamespace(ns.clone()));
        }
        if self.sync.remote_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Path of the store file for this namespace.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.json", self.namespace))
    }
}
