//! Configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SENTINEL_WATCH_DIR` | No | current directory | Root directory to watch |
//! | `SENTINEL_DEBOUNCE_MS` | No | 100 | Quiet period before a package run fires |
//! | `SENTINEL_MAX_DELAY_MS` | No | 1000 | Longest a run can be held back by continuous changes |
//! | `SENTINEL_NOTIFY_CAPACITY` | No | 256 | Per-subscriber notification ring size |
//! | `SENTINEL_RUN_QUEUE_SIZE` | No | 64 | Pending run requests before new ones are dropped |
//! | `SENTINEL_WATCH_EXTENSIONS` | No | `go` | Comma-separated file extensions to watch |
//! | `SENTINEL_IGNORE_DIRS` | No | `.git,vendor,node_modules` | Comma-separated directory names to skip |
//!
//! # Example
//!
//! ```no_run
//! use sentinel::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Watching {}", config.watch_dir.display());
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::types::DEFAULT_WATCH_EXTENSIONS;
use crate::utils::DEFAULT_DEBOUNCE_MS;

const DEFAULT_MAX_DELAY_MS: u64 = 1000;
const DEFAULT_NOTIFY_CAPACITY: usize = 256;
const DEFAULT_RUN_QUEUE_SIZE: usize = 64;
const DEFAULT_IGNORE_DIRS: &str = ".git,vendor,node_modules";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// The current directory could not be determined for the default root.
    #[error("failed to determine current directory: {0}")]
    NoCurrentDir(#[from] std::io::Error),
}

/// Configuration for Sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root directory to watch for source changes.
    pub watch_dir: PathBuf,

    /// How long a package must be quiet before its run fires.
    pub debounce: Duration,

    /// Upper bound on how long continuous changes can postpone a run.
    pub max_delay: Duration,

    /// Notifications buffered per subscriber before the oldest are dropped.
    pub notify_capacity: usize,

    /// Capacity of the run-request queue to the runner.
    pub run_queue_size: usize,

    /// File extensions (without the dot) that count as source changes.
    pub watch_extensions: Vec<String>,

    /// Directory names skipped anywhere below the root.
    pub ignore_dirs: Vec<String>,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - a numeric variable cannot be parsed, or a size is zero
    /// - `SENTINEL_WATCH_DIR` is unset and the current directory is unavailable
    pub fn from_env() -> Result<Self, ConfigError> {
        let watch_dir = match env::var("SENTINEL_WATCH_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => env::current_dir()?,
        };

        let debounce = Duration::from_millis(parse_var("SENTINEL_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?);

        let max_delay = parse_var("SENTINEL_MAX_DELAY_MS", DEFAULT_MAX_DELAY_MS)?;
        if max_delay == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SENTINEL_MAX_DELAY_MS".to_string(),
                message: "max delay must be greater than 0".to_string(),
            });
        }

        let notify_capacity = parse_size("SENTINEL_NOTIFY_CAPACITY", DEFAULT_NOTIFY_CAPACITY)?;
        let run_queue_size = parse_size("SENTINEL_RUN_QUEUE_SIZE", DEFAULT_RUN_QUEUE_SIZE)?;

        let watch_extensions = parse_list(
            "SENTINEL_WATCH_EXTENSIONS",
            &DEFAULT_WATCH_EXTENSIONS.join(","),
        )
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_string())
            .filter(|ext| !ext.is_empty())
            .collect();
        let ignore_dirs = parse_list("SENTINEL_IGNORE_DIRS", DEFAULT_IGNORE_DIRS);

        Ok(Self {
            watch_dir,
            debounce,
            max_delay: Duration::from_millis(max_delay),
            notify_capacity,
            run_queue_size,
            watch_extensions,
            ignore_dirs,
        })
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(val) => val.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected non-negative integer, got '{val}'"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_size(key: &str, default: usize) -> Result<usize, ConfigError> {
    let size = parse_var(key, default)?;
    if size == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "size must be greater than 0".to_string(),
        });
    }
    Ok(size)
}

/// Splits a comma-separated variable, trimming entries and dropping empty ones.
fn parse_list(key: &str, default: &str) -> Vec<String> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
