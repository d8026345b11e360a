//! Error types for Sentinel.
//!
//! Library code reports failures through the enums in this module. Errors that
//! are local to one event (a malformed result, a failed run) are contained by
//! the dispatcher and never abort ingestion of other events.

use thiserror::Error;

use crate::config::ConfigError;
use crate::watcher::WatcherError;

/// Errors that can occur while running Sentinel.
///
/// This is the crate-level error type, wrapping the module-specific errors
/// so callers can use a single `Result` alias.
#[derive(Error, Debug)]
pub enum SentinelError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An event was rejected at ingestion.
    #[error("rejected event: {0}")]
    Ingest(#[from] IngestError),

    /// File watching error.
    #[error("file watch error: {0}")]
    Watch(#[from] WatcherError),
}

/// Reasons an incoming event is rejected before it touches the tree.
///
/// A rejected event leaves the tree unchanged. The dispatcher logs it and
/// republishes it to subscribers as an informational error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    /// The event or result does not name a package.
    #[error("missing package name")]
    EmptyPackage,

    /// A test-level event or result has an empty test name.
    #[error("missing test name in package {package}")]
    EmptyTest { package: String },

    /// Elapsed time is negative, NaN, or infinite.
    #[error("invalid elapsed time for {path}: {value}")]
    InvalidElapsed { path: String, value: f64 },

    /// Coverage is outside `0..=100` or not a number.
    #[error("coverage for {path} out of range: {value}")]
    InvalidCoverage { path: String, value: f64 },
}

/// A specialized `Result` type for Sentinel operations.
pub type Result<T> = std::result::Result<T, SentinelError>;
