//! Configuration types for Riverbed
//!
//! Every section deserializes from TOML with per-field defaults, so a missing
//! file, a missing section, or a missing key all fall back to sane values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for Riverbed
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Controller identity
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Durable metadata store
    #[serde(default)]
    pub store: StoreConfig,
    /// Scale workflow retry policy
    #[serde(default)]
    pub scale: ScaleConfig,
    /// Segment containers hosted by this process
    #[serde(default)]
    pub container: ContainerConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults; a file that exists but does not
    /// parse is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Controller identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Host identifier recorded on scale operations
    #[serde(default = "default_host_id")]
    pub host_id: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host_id: default_host_id(),
        }
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: StoreBackend,
    /// Path of the redb database file (redb backend only)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

/// Metadata store backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Embedded redb database (durable)
    #[default]
    Redb,
    /// In-process hash map (lost on restart)
    Memory,
}

/// Scale workflow retry policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScaleConfig {
    /// Attempts per workflow step before giving up on an unavailable store
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay (milliseconds)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the retry delay (milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor applied to the delay after each attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    /// Polls of the transaction-status collaborator before a seal reports a conflict
    #[serde(default = "default_seal_txn_wait_attempts")]
    pub seal_txn_wait_attempts: u32,
    /// Capacity of the in-process scale event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            seal_txn_wait_attempts: default_seal_txn_wait_attempts(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl ScaleConfig {
    /// Backoff before retry number `attempt` (zero-based), capped at `max_backoff_ms`
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier.max(1)).saturating_pow(attempt);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Segment container configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Number of containers hosted by this process
    #[serde(default = "default_container_count")]
    pub container_count: u32,
    /// Directory holding one operation log per container
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// fsync after every log append
    #[serde(default = "default_sync_on_write")]
    pub sync_on_write: bool,
    /// Write a checkpoint after this many logged operations (0 = never)
    #[serde(default = "default_checkpoint_every_ops")]
    pub checkpoint_every_ops: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            container_count: default_container_count(),
            log_dir: default_log_dir(),
            sync_on_write: default_sync_on_write(),
            checkpoint_every_ops: default_checkpoint_every_ops(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_host_id() -> String {
    "riverbed-controller".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/riverbed/metadata.redb")
}

const fn default_max_attempts() -> u32 {
    10
}

const fn default_initial_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_backoff_multiplier() -> u32 {
    2
}

const fn default_seal_txn_wait_attempts() -> u32 {
    5
}

const fn default_event_queue_capacity() -> usize {
    1024
}

const fn default_container_count() -> u32 {
    4
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/lib/riverbed/containers")
}

const fn default_sync_on_write() -> bool {
    true
}

const fn default_checkpoint_every_ops() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.backend, StoreBackend::Redb);
        assert_eq!(config.scale.max_attempts, 10);
        assert_eq!(config.container.container_count, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [store]
            backend = "memory"

            [scale]
            initial_backoff_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.scale.initial_backoff_ms, 5);
        assert_eq!(config.scale.max_backoff_ms, 10_000);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = Config::from_toml("[scale\nmax_attempts = ").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.controller.host_id, "riverbed-controller");
    }

    #[test]
    fn test_backoff_is_capped() {
        let scale = ScaleConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2,
            ..Default::default()
        };
        assert_eq!(scale.backoff(0), Duration::from_millis(100));
        assert_eq!(scale.backoff(2), Duration::from_millis(400));
        assert_eq!(scale.backoff(10), Duration::from_millis(1_000));
    }
}
