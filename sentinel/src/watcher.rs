//! File watcher producing [`FileEvent`]s for a source tree.
//!
//! Watches a root directory recursively with [`notify`] and translates raw
//! file system notifications into [`FileEvent`]s whose paths are relative to
//! the root. Only files with a watched extension are reported, and anything
//! below an ignored directory name is skipped. Removing a directory is
//! reported as a `Removed` event for the directory path itself, so the
//! consumer can prune the whole package.
//!
//! The notify callback runs on notify's own thread. It never blocks: events
//! are handed to the consumer with `try_send`, and are dropped with a warning
//! if the channel is full.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use tokio::sync::mpsc;
//! use sentinel::types::SentinelEvent;
//! use sentinel::watcher::{FileWatcher, WatchFilter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::channel(256);
//!     let filter = WatchFilter::new(["go"], [".git", "vendor"]);
//!     let _watcher = FileWatcher::new(PathBuf::from("."), filter, tx)?;
//!
//!     while let Some(event) = rx.recv().await {
//!         if let SentinelEvent::File(change) = event {
//!             println!("{:?} {}", change.operation, change.path.display());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::path::{Component, Path, PathBuf};

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::types::{ErrorEvent, ErrorKind, FileEvent, FileOperation, SentinelEvent};

/// Errors that can occur during file watching operations.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// Failed to resolve the watch root.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The watch directory does not exist or is inaccessible.
    #[error("watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    /// The consumer's queue is full.
    #[error("event queue full, dropped change to {0}")]
    QueueFull(PathBuf),

    /// The consumer has gone away.
    #[error("failed to send event: channel closed")]
    ChannelClosed,
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Decides which paths count as source changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    extensions: Vec<String>,
    ignore_dirs: Vec<String>,
}

impl WatchFilter {
    /// Creates a filter. An empty extension list accepts any file that has
    /// an extension.
    pub fn new<E, I>(extensions: E, ignore_dirs: I) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
            ignore_dirs: ignore_dirs.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.watch_extensions.clone(), config.ignore_dirs.clone())
    }

    /// Returns `true` if any directory on `relative` is ignored.
    #[must_use]
    pub fn is_ignored(&self, relative: &Path) -> bool {
        relative.components().any(|component| match component {
            Component::Normal(name) => self
                .ignore_dirs
                .iter()
                .any(|ignored| name.to_str() == Some(ignored.as_str())),
            _ => false,
        })
    }

    /// Returns `true` if `relative` names a watched source file.
    #[must_use]
    pub fn matches_file(&self, relative: &Path) -> bool {
        let Some(ext) = relative.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        self.extensions.is_empty() || self.extensions.iter().any(|watched| watched == ext)
    }
}

/// Recursive watcher over a source tree.
///
/// Dropping the watcher stops the watch.
#[derive(Debug)]
pub struct FileWatcher {
    /// Kept alive to maintain the watch subscription.
    #[allow(dead_code)]
    watcher: RecommendedWatcher,

    root: PathBuf,
}

impl FileWatcher {
    /// Starts watching `root` recursively.
    ///
    /// Changes arrive on `sender` as [`SentinelEvent::File`]. Watch failures
    /// reported by notify arrive as [`SentinelEvent::Error`] with
    /// [`ErrorKind::Watch`].
    ///
    /// # Errors
    ///
    /// Returns an error if the root does not exist, cannot be resolved, or
    /// the platform watcher cannot be initialized.
    pub fn new(
        root: PathBuf,
        filter: WatchFilter,
        sender: mpsc::Sender<SentinelEvent>,
    ) -> Result<Self> {
        if !root.is_dir() {
            return Err(WatcherError::DirectoryNotFound(root));
        }
        // Some platforms report canonical paths, so strip against the same.
        let root = root.canonicalize()?;

        let callback_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                handle_notify_event(res, &callback_root, &filter, &sender);
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!(root = %root.display(), "Started recursive file watch");

        Ok(Self { watcher, root })
    }

    /// The canonical root being watched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn handle_notify_event(
    res: std::result::Result<Event, notify::Error>,
    root: &Path,
    filter: &WatchFilter,
    sender: &mpsc::Sender<SentinelEvent>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "File watcher error");
            let report = ErrorEvent::new(ErrorKind::Watch, e.to_string());
            if let Err(e) = forward(sender, report.into(), root) {
                warn!(error = %e, "Failed to report watch error");
            }
            return;
        }
    };

    trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

    for change in map_event(&event.kind, &event.paths, root, filter) {
        let path = change.path.clone();
        if let Err(e) = forward(sender, change.into(), &path) {
            warn!(error = %e, "Failed to queue file event");
        }
    }
}

fn forward(sender: &mpsc::Sender<SentinelEvent>, event: SentinelEvent, path: &Path) -> Result<()> {
    sender.try_send(event).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => WatcherError::QueueFull(path.to_path_buf()),
        mpsc::error::TrySendError::Closed(_) => WatcherError::ChannelClosed,
    })
}

/// Translates one notify event into relative [`FileEvent`]s.
fn map_event(
    kind: &EventKind,
    paths: &[PathBuf],
    root: &Path,
    filter: &WatchFilter,
) -> Vec<FileEvent> {
    let classified: Vec<(&PathBuf, Change)> = match kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => {
            paths.iter().map(|p| (p, Change::File(FileOperation::Created))).collect()
        }
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            paths.iter().map(|p| (p, Change::File(FileOperation::Written))).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().map(|p| (p, Change::Gone)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().map(|p| (p, Change::File(FileOperation::Created))).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => paths
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let change = if i == 0 {
                    Change::Gone
                } else {
                    Change::File(FileOperation::Created)
                };
                (p, change)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|p| {
                let change = if p.exists() {
                    Change::File(FileOperation::Created)
                } else {
                    Change::Gone
                };
                (p, change)
            })
            .collect(),
        EventKind::Remove(RemoveKind::File) => {
            paths.iter().map(|p| (p, Change::File(FileOperation::Removed))).collect()
        }
        EventKind::Remove(RemoveKind::Folder) => {
            paths.iter().map(|p| (p, Change::Directory)).collect()
        }
        EventKind::Remove(_) => paths.iter().map(|p| (p, Change::Gone)).collect(),
        _ => {
            trace!(kind = ?kind, "Ignoring event kind");
            Vec::new()
        }
    };

    classified
        .into_iter()
        .filter_map(|(path, change)| {
            let relative = path.strip_prefix(root).ok()?;
            if relative.as_os_str().is_empty() || filter.is_ignored(relative) {
                return None;
            }

            let event = match change {
                Change::File(operation) if filter.matches_file(relative) => {
                    FileEvent::file(relative, operation)
                }
                Change::File(_) => return None,
                Change::Gone if filter.matches_file(relative) => {
                    FileEvent::file(relative, FileOperation::Removed)
                }
                // Anything else that vanished is treated as a directory, so
                // names like `v1.2` or `gopkg.in` still prune their package.
                Change::Gone | Change::Directory => {
                    FileEvent::directory(relative, FileOperation::Removed)
                }
            };
            debug!(path = %event.path.display(), operation = ?event.operation, "File change");
            Some(event)
        })
        .collect()
}

/// What happened to a single path, before filtering.
enum Change {
    File(FileOperation),
    /// A directory was removed.
    Directory,
    /// Removed or renamed away; file or directory unknown.
    Gone,
}
