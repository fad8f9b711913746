//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file (or none at all) is valid.

use crate::backup::manifest::Compression;
use crate::utils::errors::{EngineError, Result};
use crate::utils::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier recorded in job leases
    #[serde(default = "default_node_id")]
    pub id: u32,

    #[serde(default = "default_node_name")]
    pub name: String,

    /// Root directory for `nodelocal://` destinations
    #[serde(default = "default_external_io_dir")]
    pub external_io_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Chunks exported concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum time between checkpoint writes; 0 checkpoints after every chunk
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    /// Compression for data files (zstd, none)
    #[serde(default = "default_compression")]
    pub compression: Compression,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum time between low-water mark updates; 0 persists after every span
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// How often orphaned jobs are looked for
    #[serde(default = "default_adopt_interval_secs")]
    pub adopt_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_node_id() -> u32 {
    1
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "backup-node-01".to_string())
}

fn default_external_io_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/extern")
}

fn default_concurrency() -> usize {
    4
}

fn default_checkpoint_interval_ms() -> u64 {
    1_000
}

fn default_compression() -> Compression {
    Compression::Zstd
}

fn default_compression_level() -> i32 {
    3
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_adopt_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            name: default_node_name(),
            external_io_dir: default_external_io_dir(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            compression: default_compression(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_secs(),
            adopt_interval_secs: default_adopt_interval_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            export: ExportConfig::default(),
            import: ImportConfig::default(),
            jobs: JobsConfig::default(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&content).map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.export.concurrency == 0 || self.import.concurrency == 0 {
            return Err(EngineError::Config("concurrency must be at least 1".into()));
        }
        if self.jobs.lease_ttl_secs == 0 {
            return Err(EngineError::Config("jobs.lease_ttl_secs must be at least 1".into()));
        }
        if !(1..=22).contains(&self.export.compression_level) {
            return Err(EngineError::Config(format!(
                "export.compression_level {} outside 1-22",
                self.export.compression_level
            )));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.jobs.lease_ttl_secs)
    }

    pub fn adopt_interval(&self) -> Duration {
        Duration::from_secs(self.jobs.adopt_interval_secs)
    }
}
