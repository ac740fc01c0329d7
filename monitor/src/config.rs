//! Configuration module for Filetrail Monitor.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FILETRAIL_REGISTRY_PATH` | No | `~/.filetrail/tracked_files.json` | Tracked-file registry |
//! | `FILETRAIL_STABILITY_MS` | No | 2000 | Quiet period after the last write before capture |
//! | `FILETRAIL_POLL_INTERVAL_MS` | No | 100 | Interval between size/mtime checks while settling |
//! | `FILETRAIL_HISTORY_SUFFIX` | No | `db` | History store is `<file>.<suffix>` |
//! | `FILETRAIL_EVENT_BUFFER` | No | 1000 | Change notification channel capacity |
//! | `FILETRAIL_ALLOWED_EXTENSIONS` | No | `txt,md,docx` | Comma-separated extensions accepted by add |
//!
//! # Example
//!
//! ```no_run
//! use filetrail_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Registry: {}", config.registry_path.display());
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::store::DEFAULT_HISTORY_SUFFIX;

/// Default quiet period after the last write notification.
pub const DEFAULT_STABILITY_MS: u64 = 2000;

/// Default interval between checks while waiting for a write to settle.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default change notification buffer capacity.
const DEFAULT_EVENT_BUFFER: usize = 1000;

/// Default registry directory name relative to home.
const DEFAULT_REGISTRY_DIR: &str = ".filetrail";

/// Default registry file name.
const DEFAULT_REGISTRY_FILE: &str = "tracked_files.json";

/// Extensions accepted by default when adding a file.
const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["txt", "md", "docx"];

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Configuration for the Filetrail Monitor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the JSON file holding the tracked-file registry.
    pub registry_path: PathBuf,

    /// Quiet period required after the last write notification.
    pub stability_window: Duration,

    /// Interval between size/mtime checks while a write settles.
    pub poll_interval: Duration,

    /// Suffix of each file's history store (`<file>.<suffix>`).
    pub history_suffix: String,

    /// Capacity of the change notification channel.
    pub event_buffer: usize,

    /// Lowercase extensions (without dot) accepted by add.
    pub allowed_extensions: Vec<String>,
}

impl Config {
    /// Creates a configuration with default settings and the given registry.
    #[must_use]
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            stability_window: Duration::from_millis(DEFAULT_STABILITY_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            history_suffix: DEFAULT_HISTORY_SUFFIX.to_string(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| (*ext).to_string())
                .collect(),
        }
    }

    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - a numeric variable is set but is not a positive integer
    /// - `FILETRAIL_HISTORY_SUFFIX` or `FILETRAIL_ALLOWED_EXTENSIONS` is set but empty
    /// - the home directory cannot be determined (needed for the default registry path)
    pub fn from_env() -> Result<Self, ConfigError> {
        let registry_path = match env::var("FILETRAIL_REGISTRY_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs
                    .home_dir()
                    .join(DEFAULT_REGISTRY_DIR)
                    .join(DEFAULT_REGISTRY_FILE)
            }
        };

        let mut config = Self::new(registry_path);

        if let Some(ms) = parse_positive("FILETRAIL_STABILITY_MS")? {
            config.stability_window = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_positive("FILETRAIL_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(size) = parse_positive("FILETRAIL_EVENT_BUFFER")? {
            config.event_buffer = usize::try_from(size).map_err(|_| ConfigError::InvalidValue {
                key: "FILETRAIL_EVENT_BUFFER".to_string(),
                message: format!("{size} is too large"),
            })?;
        }

        if let Ok(val) = env::var("FILETRAIL_HISTORY_SUFFIX") {
            let suffix = val.trim().trim_start_matches('.');
            if suffix.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "FILETRAIL_HISTORY_SUFFIX".to_string(),
                    message: "suffix cannot be empty".to_string(),
                });
            }
            config.history_suffix = suffix.to_string();
        }

        if let Ok(val) = env::var("FILETRAIL_ALLOWED_EXTENSIONS") {
            let extensions: Vec<String> = val
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if extensions.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "FILETRAIL_ALLOWED_EXTENSIONS".to_string(),
                    message: "at least one extension is required".to_string(),
                });
            }
            config.allowed_extensions = extensions;
        }

        Ok(config)
    }

    /// Returns `true` if `path` has one of the allowed extensions (case-insensitive).
    #[must_use]
    pub fn is_allowed(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.allowed_extensions.iter().any(|allowed| *allowed == ext))
    }
}

/// Parses an optional positive integer variable.
fn parse_positive(key: &str) -> Result<Option<u64>, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(None);
    };

    let parsed = val.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected positive integer, got '{val}'"),
    })?;

    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value must be greater than 0".to_string(),
        });
    }

    Ok(Some(parsed))
}
