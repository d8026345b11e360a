//! Sentinel - test-watch event aggregation core.
//!
//! This crate turns a stream of file changes and test-runner output into a
//! live package → test tree with pass/fail status, durations, and coverage
//! that a UI can render incrementally.
//!
//! # Overview
//!
//! File changes come in from the [`watcher`], are debounced per package, and
//! trigger run requests for an external test runner. The runner's lifecycle
//! events and results are merged into the [`tree`] by the [`builder`]. The
//! [`dispatcher`] ties these together and tells subscribers when the tree
//! changed, without ever blocking producers.
//!
//! # Modules
//!
//! - [`types`]: Event and result types exchanged between components
//! - [`tree`]: Arena tree with aggregate status, duration, and coverage
//! - [`builder`]: Merges runner events and results into the tree
//! - [`dispatcher`]: Event fan-in, notification fan-out, run triggering
//! - [`watcher`]: File system watcher producing file events
//! - [`render`]: Plain-text tree rendering
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types
//! - [`utils`]: Shared utilities (debouncing)

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod render;
pub mod tree;
pub mod types;
pub mod utils;
pub mod watcher;

pub use builder::TreeBuilder;
pub use config::{Config, ConfigError};
pub use dispatcher::{
    DispatcherConfig, EventDispatcher, Notification, RunScheduler, Subscription, TreeSnapshot,
};
pub use error::{IngestError, Result, SentinelError};
pub use tree::{NodeId, NodePath, NodeView, Outcome, Tree, TreeNode, TreeSummary};
pub use types::{
    EntryKind, ErrorEvent, ErrorKind, FileEvent, FileOperation, RunRequest, RunStatus, RunnerEvent,
    SentinelEvent, TestResult, TriggerReason,
};
pub use utils::{Debounced, Debouncer, DebouncerError, DEFAULT_DEBOUNCE_MS};
pub use watcher::{FileWatcher, WatchFilter, WatcherError};
