//! Fetch configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FetchError, Result};

/// Tunables for resolution, chunk collection and assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Relays used for index and manifest lookups, and for chunks when a
    /// manifest names none.
    pub default_relays: Vec<String>,
    /// Interval of the collector's completion checks.
    pub poll_interval_ms: u64,
    /// Collection stops after this long without a new distinct chunk.
    pub inactivity_timeout_ms: u64,
    /// Absolute ceiling on one collection run.
    pub max_wait_ms: u64,
    /// Record ids per fallback lookup.
    pub id_batch_size: usize,
    /// Cap on files kept in the chunk cache; `None` keeps everything.
    pub max_cached_files: Option<usize>,
    /// Treat `file_hash` and `ChunkInfo.hash` as hex SHA-256 digests of the
    /// decoded bytes and check them.
    pub verify_integrity: bool,
    /// Largest file `preview` will fetch.
    pub preview_max_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            default_relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.nostr.band".to_string(),
            ],
            poll_interval_ms: 100,
            inactivity_timeout_ms: 5_000,
            max_wait_ms: 300_000,
            id_batch_size: 200,
            max_cached_files: None,
            verify_integrity: false,
            preview_max_bytes: 10 * 1024 * 1024,
        }
    }
}

impl FetchConfig {
    /// Loads a `.toml` or `.json` config file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FetchError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: FetchConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| FetchError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| FetchError::Config(e.to_string()))?
            }
            _ => {
                return Err(FetchError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the collector cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.default_relays.is_empty() {
            return Err(FetchError::Config("default_relays must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(FetchError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.inactivity_timeout_ms == 0 || self.max_wait_ms == 0 {
            return Err(FetchError::Config("timeouts must be > 0".into()));
        }
        if self.id_batch_size == 0 {
            return Err(FetchError::Config("id_batch_size must be > 0".into()));
        }
        if self.max_cached_files == Some(0) {
            return Err(FetchError::Config("max_cached_files must be > 0".into()));
        }
        Ok(())
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Inactivity window as a `Duration`.
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Absolute ceiling as a `Duration`.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}
