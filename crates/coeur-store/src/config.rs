use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Default shard size budget: 80 MiB.
pub const DEFAULT_MAX_SHARD_BYTES: u64 = 80 * 1024 * 1024;

/// Store settings. Every field has a default, so a partial (or empty) TOML
/// document is valid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the shard files.
    pub dir: PathBuf,
    /// Size budget: once even the least-loaded shard is larger than this, a
    /// new shard is created.
    pub max_shard_bytes: u64,
    /// Posts per page yielded by [`crate::ShardedStore::pages`] when the
    /// caller does not choose.
    pub page_size: u64,
    pub busy_timeout_ms: u64,
    /// Default result cap for title search.
    pub search_limit: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("db"),
            max_shard_bytes: DEFAULT_MAX_SHARD_BYTES,
            page_size: 10_000,
            busy_timeout_ms: 5_000,
            search_limit: 50,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_shard_bytes(mut self, bytes: u64) -> Self {
        self.max_shard_bytes = bytes;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Parse a TOML document. Settings are read from a `[store]` table when
    /// present (a full site `config.toml`), otherwise from the top level.
    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        let mut table: toml::Table = s
            .parse()
            .map_err(|e: toml::de::Error| StoreError::Config(e.to_string()))?;
        let value = match table.remove("store") {
            Some(store) => store,
            None => toml::Value::Table(table),
        };
        let config: Self = value
            .try_into()
            .map_err(|e: toml::de::Error| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> StoreResult<()> {
        if self.max_shard_bytes == 0 {
            return Err(StoreError::Config("max_shard_bytes must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(StoreError::Config("page_size must be positive".into()));
        }
        Ok(())
    }
}
