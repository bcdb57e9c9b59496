//! Configuration module for watchflow.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`.watchflow/settings.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `WF_` and use double underscores
//! to separate nested levels:
//! - `WF_GENERATOR__CRON_INTERVAL_MS=60000` sets `generator.cron_interval_ms`
//! - `WF_LEDGER__PATH=/var/lib/watchflow` sets `ledger.path`
//! - `WF_WATCHER__STABILITY_THRESHOLD_MS=5000` sets `watcher.stability_threshold_ms`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::generator::{GeneratorOptions, MediaFlow};
use crate::watcher::WatcherOptions;

/// Directory holding the configuration file and, by default, the ledger.
pub const CONFIG_DIR: &str = ".watchflow";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "WF_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Tracked item ledger
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Selective watcher timing
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Workflow generation
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// Known storages
    #[serde(default)]
    pub storages: Vec<StorageConfig>,

    /// Source to destination flows
    #[serde(default)]
    pub flows: Vec<MediaFlow>,

    /// Where emitted workflows go
    #[serde(default)]
    pub workflows: WorkflowsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LedgerConfig {
    /// Directory of the ledger index
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,

    /// Memory budget of the index writer
    #[serde(default = "default_writer_heap_bytes")]
    pub writer_heap_bytes: usize,

    /// How long records linger once their file is no longer observed
    #[serde(default = "default_linger_time_ms")]
    pub linger_time_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Quiet period before a written file counts as changed
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,

    /// Interval of the failed-watch restart sweep
    #[serde(default = "default_restart_interval_ms")]
    pub restart_interval_ms: u64,

    /// Polling granularity of stability checks
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Interval of the reconciliation sweep
    #[serde(default = "default_cron_interval_ms")]
    pub cron_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    LocalFolder,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    pub id: String,

    #[serde(rename = "type", default)]
    pub kind: StorageKind,

    pub base_path: PathBuf,

    /// Watch only selected files instead of the whole folder
    #[serde(default)]
    pub only_selected_files: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct WorkflowsConfig {
    /// JSON lines file for emitted workflows (stdout when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level for all modules
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_ledger_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("ledger")
}
fn default_writer_heap_bytes() -> usize {
    crate::ledger::DEFAULT_WRITER_HEAP_BYTES
}
fn default_linger_time_ms() -> u64 {
    crate::generator::DEFAULT_LINGER_TIME.as_millis() as u64
}
fn default_stability_threshold_ms() -> u64 {
    crate::watcher::DEFAULT_STABILITY_THRESHOLD.as_millis() as u64
}
fn default_restart_interval_ms() -> u64 {
    crate::watcher::DEFAULT_RESTART_INTERVAL.as_millis() as u64
}
fn default_check_interval_ms() -> u64 {
    crate::watcher::DEFAULT_CHECK_INTERVAL.as_millis() as u64
}
fn default_cron_interval_ms() -> u64 {
    crate::generator::DEFAULT_CRON_INTERVAL.as_millis() as u64
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            ledger: LedgerConfig::default(),
            watcher: WatcherConfig::default(),
            generator: GeneratorConfig::default(),
            storages: Vec::new(),
            flows: Vec::new(),
            workflows: WorkflowsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            writer_heap_bytes: default_writer_heap_bytes(),
            linger_time_ms: default_linger_time_ms(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stability_threshold_ms: default_stability_threshold_ms(),
            restart_interval_ms: default_restart_interval_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            cron_interval_ms: default_cron_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl WatcherConfig {
    pub fn options(&self) -> WatcherOptions {
        WatcherOptions {
            stability_threshold: Duration::from_millis(self.stability_threshold_ms),
            restart_interval: Duration::from_millis(self.restart_interval_ms.max(1)),
            check_interval: Duration::from_millis(self.check_interval_ms.max(1)),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        // Try to find the workspace config by looking for .watchflow directory
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        Self::load_from(config_path)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path.as_ref()))
            // Double underscore (__) separates nested levels,
            // single underscore (_) stays within field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str()
                    .to_lowercase()
                    .replace("__", ".")
                    .into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the workspace config by looking for a .watchflow directory
    /// from the current directory up to the root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file in `dir`
    pub fn init_config_file_in(
        dir: impl AsRef<Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = dir.as_ref().join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }

    /// Create a default settings file in the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        Self::init_config_file_in(".", force)
    }

    /// Options for the workflow generator
    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            cron_interval: Duration::from_millis(self.generator.cron_interval_ms.max(1)),
            linger_time: Duration::from_millis(self.ledger.linger_time_ms),
        }
    }

    /// Configuration of the storage with the given id
    pub fn storage(&self, id: &str) -> Option<&StorageConfig> {
        self.storages.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.ledger.path, PathBuf::from(".watchflow/ledger"));
        assert_eq!(settings.watcher.stability_threshold_ms, 2000);
        assert_eq!(settings.watcher.restart_interval_ms, 10_000);
        assert_eq!(settings.generator.cron_interval_ms, 600_000);
        assert_eq!(settings.logging.default, "warn");
        assert!(settings.storages.is_empty());
    }

    #[test]
    fn test_watcher_options() {
        let config = WatcherConfig {
            stability_threshold_ms: 500,
            restart_interval_ms: 1000,
            check_interval_ms: 0,
        };
        let options = config.options();
        assert_eq!(options.stability_threshold, Duration::from_millis(500));
        // Zero would make the poll interval panic
        assert_eq!(options.check_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let mut settings = Settings::default();
        settings.watcher.restart_interval_ms = 0;
        settings.generator.cron_interval_ms = 0;

        assert_eq!(settings.watcher.options().restart_interval, Duration::from_millis(1));
        assert_eq!(settings.generator_options().cron_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(".watchflow/settings.toml");

        let mut settings = Settings::default();
        settings.generator.cron_interval_ms = 60_000;
        settings.storages.push(StorageConfig {
            id: "ingest".to_string(),
            kind: StorageKind::LocalFolder,
            base_path: PathBuf::from("/media/ingest"),
            only_selected_files: false,
        });
        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.generator.cron_interval_ms, 60_000);
        assert_eq!(loaded.storage("ingest").unwrap().base_path, PathBuf::from("/media/ingest"));
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();

        let path = Settings::init_config_file_in(temp_dir.path(), false).unwrap();
        assert!(path.exists());
        assert!(Settings::init_config_file_in(temp_dir.path(), false).is_err());
        assert!(Settings::init_config_file_in(temp_dir.path(), true).is_ok());
    }
}
