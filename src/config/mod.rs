//! Configuration for the rollup engine
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/rollstat/config.toml)
//! 3. Built-in defaults (lowest priority)

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod engine;
mod logging;
mod serialization;


pub use engine::{
    parse_time_of_day, AggregationConfig, FileAggregationConfig, FileRetentionConfig,
    FileSchedulerConfig, RetentionConfig, SchedulerConfig,
};
pub use logging::{FileLogging, LogRotation, LoggingConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable overriding the database path
pub const ENV_DB: &str = "ROLLSTAT_DB";
/// Environment variable overriding the retention horizon in days
pub const ENV_RETENTION_DAYS: &str = "ROLLSTAT_RETENTION_DAYS";
/// Environment variable overriding the log level
pub const ENV_LOG_LEVEL: &str = "ROLLSTAT_LOG_LEVEL";

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// SQLite database holding events and buckets
    pub db_path: PathBuf,

    pub logging: LoggingConfig,

    /// How a day of events folds into a slot
    pub aggregation: AggregationConfig,

    /// Background job fire times
    pub scheduler: SchedulerConfig,

    /// Activity log retention
    pub retention: RetentionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/rollstat.db"),
            logging: LoggingConfig::default(),
            aggregation: AggregationConfig::default(),
            scheduler: SchedulerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure; every key is optional
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub db_path: Option<String>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,

    /// Optional [aggregation] section
    pub aggregation: Option<FileAggregationConfig>,

    /// Optional [scheduler] section
    pub scheduler: Option<FileSchedulerConfig>,

    /// Optional [retention] section
    pub retention: Option<FileRetentionConfig>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/rollstat/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("rollstat").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    ///
    /// Helps users discover the available options; failures are ignored
    /// because the file is optional.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        let _ = Self::write_default(&path);
    }

    /// Write the default template to `path`, replacing any existing file
    pub fn write_default(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, Self::default().to_toml())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Read and parse a config file; a missing file yields all defaults
    ///
    /// An existing file that cannot be read or parsed is an error: a broken
    /// config should fail fast, not silently fall back to defaults.
    pub(crate) fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => {
                Err(e).with_context(|| format!("cannot read config file {}", path.display()))
            }
        }
    }

    /// Load configuration: env vars > config file > defaults
    pub fn load() -> anyhow::Result<Self> {
        let file = match Self::config_path() {
            Some(path) => Self::load_file_config(&path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with an environment lookup
    pub(crate) fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let defaults = Self::default();

        // Database path: env > file > default
        let db_path = env(ENV_DB)
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        // Log level: env > file > default (RUST_LOG still wins at subscriber setup)
        let mut logging = LoggingConfig::from_file(file.logging)?;
        if let Some(level) = env(ENV_LOG_LEVEL) {
            logging.level = level;
        }

        // Retention: env > file > default
        let mut retention = RetentionConfig::from_file(file.retention);
        if let Some(days) = env(ENV_RETENTION_DAYS) {
            retention.retention_days = days
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number of days", ENV_RETENTION_DAYS))?;
        }

        let aggregation = AggregationConfig::from_file(file.aggregation);
        let scheduler = SchedulerConfig::from_file(file.scheduler)?;

        Ok(Self {
            db_path,
            logging,
            aggregation,
            scheduler,
            retention,
        })
    }
}
