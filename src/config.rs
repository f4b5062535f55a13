//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file; every option carries a serde default
//! so a minimal file only needs the cluster paths.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::utils::errors::{EngineError, Result};

/// The three backup types the engine produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            other => Err(EngineError::Param(format!("invalid backup type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster (stanza) name; backups live under `<backup_path>/<name>`
    pub name: String,

    /// Database data directory to back up
    pub db_path: PathBuf,

    /// Backup repository root
    pub backup_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Backup type to take (full, diff, incr)
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,

    /// Use start/stop calls against a running cluster; `false` requires the
    /// cluster to be shut down
    #[serde(default = "default_true")]
    pub online: bool,

    /// Request an immediate checkpoint on backup start
    #[serde(default)]
    pub start_fast: bool,

    /// Compress backed-up files (zstd)
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Record a SHA-256 checksum per file
    #[serde(default = "default_true")]
    pub checksum: bool,

    /// Hard-link unchanged files from the referenced backup instead of
    /// skipping them
    #[serde(default)]
    pub hardlink: bool,

    /// Requested number of copy workers (capped at 32)
    #[serde(default = "default_process_max")]
    pub process_max: usize,

    /// Abort the copy phase after this many seconds
    #[serde(default)]
    pub copy_timeout: Option<u64>,

    /// Seconds to wait for a WAL segment to appear in the archive
    #[serde(default = "default_archive_timeout")]
    pub archive_timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Number of full backups to keep
    #[serde(default)]
    pub full: Option<u32>,

    /// Number of differential backups to keep
    #[serde(default)]
    pub diff: Option<u32>,

    /// Backup type anchoring WAL archive retention
    #[serde(default)]
    pub archive_type: Option<BackupType>,

    /// Number of `archive_type` backups whose WAL is kept
    #[serde(default)]
    pub archive_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_backup_type() -> BackupType {
    BackupType::Full
}

fn default_true() -> bool {
    true
}

fn default_process_max() -> usize {
    4
}

fn default_archive_timeout() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            backup_type: default_backup_type(),
            online: true,
            start_fast: false,
            compress: true,
            checksum: true,
            hardlink: false,
            process_max: default_process_max(),
            copy_timeout: None,
            archive_timeout: default_archive_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

impl RetentionConfig {
    /// Retention counts must be >= 1 when supplied, and a WAL retention type
    /// needs a count to locate the anchor backup.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("retention.full", self.full),
            ("retention.diff", self.diff),
            ("retention.archive_count", self.archive_count),
        ] {
            if let Some(count) = value {
                if count < 1 {
                    return Err(EngineError::Config(format!(
                        "'{name}' must be at least 1, got {count}"
                    )));
                }
            }
        }

        if self.archive_type.is_some() && self.archive_count.is_none() {
            return Err(EngineError::Config(
                "'retention.archive_type' requires 'retention.archive_count'".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.retention.validate()?;
        Ok(config)
    }
}
