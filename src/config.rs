use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

// =============================================================================
// Time-related constants
// =============================================================================

/// Default interval between two checks of the same resource (1 minute)
pub const DEFAULT_CHECK_INTERVAL_MS: i64 = 60 * 1000;

/// Default interval between two dispatch cycles (10 seconds)
pub const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 10_000;

/// How long a lock lease survives without renewal (5 minutes)
pub const DEFAULT_LOCK_LEASE_TTL_MS: i64 = 5 * 60 * 1000;

/// Shortest lease a lock is granted for. Shorter leases would expire
/// before the holder gets to renew them.
pub const MIN_LOCK_LEASE_TTL_MS: u64 = 50;

/// How long a connection waits on a locked database file before failing
pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Scheduler configuration structure
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub check: CheckConfig,
    pub dispatcher: DispatcherConfig,
    pub database: DatabaseConfig,
}

/// Check-related configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckConfig {
    /// Minimum time between two checks of one resource, in milliseconds
    pub interval: i64,
    /// Lifetime of a checking lock lease, in milliseconds
    pub lease_ttl: i64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL_MS,
            lease_ttl: DEFAULT_LOCK_LEASE_TTL_MS,
        }
    }
}

/// Dispatcher-related configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Time between two dispatch cycles, in milliseconds
    pub interval: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_DISPATCH_INTERVAL_MS,
        }
    }
}

/// Database location
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Explicit database file; falls back to [`db_path`] when unset
    pub path: Option<PathBuf>,
}

impl SchedulerConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Database file to open, honoring an explicit override
    pub fn db_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(db_path)
    }

    pub fn check_interval(&self) -> Duration {
        millis(self.check.interval)
    }

    /// Lease lifetime, never shorter than [`MIN_LOCK_LEASE_TTL_MS`]
    pub fn lock_lease_ttl(&self) -> Duration {
        millis(self.check.lease_ttl).max(Duration::from_millis(MIN_LOCK_LEASE_TTL_MS))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher.interval)
    }
}

/// Negative values are treated as zero
fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Returns the path to the data directory for check-scheduler.
/// Uses $XDG_DATA_HOME/check-scheduler if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/check-scheduler,
/// or ./check-scheduler if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the database file.
pub fn db_path() -> PathBuf {
    data_dir().join("checks.db")
}

/// Returns the directory log files are written to.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("check-scheduler")
}
