//! Keywarden configuration.

use crate::cache::rows::DEFAULT_CAPACITY;
use crate::KeywardenError;
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default local offset: UTC+7, the zone the gateway's key expiry dates
/// are written in.
pub const DEFAULT_UTC_OFFSET_SECONDS: i32 = 7 * 3600;

/// Configuration for the key ledger and its logs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeywardenConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,

    /// Namespace directory used by [`KeywardenConfig::in_data_dir`].
    pub data_namespace: String,

    /// Lifetime of read-through cache entries. Zero disables the cache.
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,

    /// Most rows the read-through cache holds. Zero disables the cache.
    pub cache_capacity: usize,

    /// Offset of the zone expiry dates are written in, in seconds east of UTC.
    pub utc_offset_seconds: i32,

    /// How long SQLite waits on a locked database before failing.
    #[serde(with = "duration_secs")]
    pub busy_timeout: Duration,

    /// Page size used when a log query does not specify one.
    pub default_page_limit: u32,

    /// Largest page size a log query may request.
    pub max_page_limit: u32,
}

impl Default for KeywardenConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            data_namespace: "keywarden".to_string(),
            cache_ttl: Duration::from_secs(30),
            cache_capacity: DEFAULT_CAPACITY,
            utc_offset_seconds: DEFAULT_UTC_OFFSET_SECONDS,
            busy_timeout: Duration::from_secs(5),
            default_page_limit: 20,
            max_page_limit: 500,
        }
    }
}

impl KeywardenConfig {
    /// Configuration with the database at `<data_dir>/<namespace>/keys.db`.
    pub fn in_data_dir(namespace: &str) -> Result<Self, KeywardenError> {
        let base_dir = dirs::data_dir().ok_or_else(|| {
            KeywardenError::Config("Could not find data directory".to_string())
        })?;
        let dir = base_dir.join(namespace);
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            database_path: Some(dir.join("keys.db")),
            data_namespace: namespace.to_string(),
            ..Self::default()
        })
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), KeywardenError> {
        if self.data_namespace.trim().is_empty() {
            return Err(KeywardenError::Config(
                "data_namespace cannot be empty".to_string(),
            ));
        }
        if self.utc_offset().is_none() {
            return Err(KeywardenError::Config(format!(
                "utc_offset_seconds out of range: {}",
                self.utc_offset_seconds
            )));
        }
        if self.default_page_limit == 0 || self.max_page_limit == 0 {
            return Err(KeywardenError::Config(
                "page limits must be positive".to_string(),
            ));
        }
        if self.default_page_limit > self.max_page_limit {
            return Err(KeywardenError::Config(format!(
                "default_page_limit {} exceeds max_page_limit {}",
                self.default_page_limit, self.max_page_limit
            )));
        }
        if let Some(path) = &self.database_path {
            if path.as_os_str().is_empty() {
                return Err(KeywardenError::Config(
                    "database_path cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The configured local offset, if it is a valid one.
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_seconds)
    }

    /// Clamp a requested page size to the configured bounds.
    pub fn page_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .filter(|limit| *limit > 0)
            .unwrap_or(self.default_page_limit)
            .min(self.max_page_limit)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
