//! Event fan-in, notification fan-out, and run triggering.
//!
//! [`EventDispatcher`] is the single entry point for everything that happens
//! to the tree. Producers (the file watcher and the test runner) call
//! [`EventDispatcher::publish`]; consumers call
//! [`EventDispatcher::subscribe`] and pull snapshots when told the tree
//! changed.
//!
//! # Architecture
//!
//! ```text
//! watcher ──FileEvent──┐                         ┌──> Subscription (UI)
//!                      ├─> publish ─> TreeBuilder ├──> Subscription (log)
//! runner ──RunnerEvent─┘      │      (RwLock)     └──> ...
//!                             │
//!                             └─> Debouncer ─> RunTrigger ─> RunRequest queue
//! ```
//!
//! - The tree lives behind one `RwLock`. Every mutation and its ancestor
//!   recomputation happens under the write lock; snapshots take the read lock.
//! - Notifications go out over a bounded broadcast ring. `publish` never
//!   waits for subscribers: a subscriber that falls behind loses its oldest
//!   notifications and is told the tree changed.
//! - Consecutive `TreeChanged` notifications are merged on receipt, so a
//!   subscriber sees at most one per batch it has not yet read.
//! - File changes are debounced per package. A package whose run is still in
//!   flight is marked dirty instead, and runs again once the current run
//!   completes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::builder::TreeBuilder;
use crate::config::Config;
use crate::error::IngestError;
use crate::tree::{NodePath, NodeView, Tree, TreeSummary};
use crate::types::{
    EntryKind, ErrorEvent, ErrorKind, FileEvent, FileOperation, RunRequest, RunStatus, RunnerEvent,
    SentinelEvent, TriggerReason, DEFAULT_WATCH_EXTENSIONS,
};
use crate::utils::debounce::{Debounced, Debouncer, DEFAULT_DEBOUNCE_MS};

/// Default per-subscriber notification ring size.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// Default cap on how long continuous changes can postpone a run.
pub const DEFAULT_MAX_DELAY_MS: u64 = 1000;

/// Something subscribers are told about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// The tree changed; pull a snapshot to see it.
    TreeChanged { revision: u64 },
    /// The tree was discarded and starts empty.
    TreeReset { revision: u64 },
    /// A run was requested for a package.
    RunTriggered { package: String },
    /// An error was reported or an event was rejected.
    Error(ErrorEvent),
}

/// Tuning for an [`EventDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Quiet period before a package's run fires.
    pub debounce: Duration,
    /// Longest continuous changes can hold a run back.
    pub max_delay: Duration,
    /// Notifications buffered per subscriber.
    pub notify_capacity: usize,
    /// Extensions that mark a kind-less file event path as a file.
    pub watch_extensions: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
            watch_extensions: DEFAULT_WATCH_EXTENSIONS
                .iter()
                .map(|ext| (*ext).to_string())
                .collect(),
        }
    }
}

impl From<&Config> for DispatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce,
            max_delay: config.max_delay,
            notify_capacity: config.notify_capacity,
            watch_extensions: config.watch_extensions.clone(),
        }
    }
}

/// A consistent copy of the tree at one revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub revision: u64,
    pub summary: TreeSummary,
    pub nodes: Vec<NodeView>,
}

/// Tracks which packages have a run in flight and which changed meanwhile.
#[derive(Debug, Default)]
pub struct RunScheduler {
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
}

impl RunScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks to run `package`.
    ///
    /// Returns `true` if the run should start now. If a run is already in
    /// flight the package is marked dirty and `false` is returned.
    pub fn request(&mut self, package: &str) -> bool {
        if self.in_flight.contains(package) {
            self.dirty.insert(package.to_string());
            false
        } else {
            self.in_flight.insert(package.to_string());
            true
        }
    }

    /// Records that the run for `package` finished.
    ///
    /// Returns `true` if the package changed during the run and should run
    /// again now; it stays in flight in that case.
    pub fn complete(&mut self, package: &str) -> bool {
        if !self.in_flight.remove(package) {
            return false;
        }
        if self.dirty.remove(package) {
            self.in_flight.insert(package.to_string());
            true
        } else {
            false
        }
    }

    /// Forgets a run that never reached the runner.
    pub fn abandon(&mut self, package: &str) {
        self.in_flight.remove(package);
        self.dirty.remove(package);
    }

    #[must_use]
    pub fn is_in_flight(&self, package: &str) -> bool {
        self.in_flight.contains(package)
    }

    #[must_use]
    pub fn is_dirty(&self, package: &str) -> bool {
        self.dirty.contains(package)
    }
}

/// Sends run requests to the runner, honouring the scheduler.
///
/// Shared between the dispatcher and the task draining the debouncer.
#[derive(Debug)]
struct RunTrigger {
    scheduler: Mutex<RunScheduler>,
    runs: mpsc::Sender<RunRequest>,
    notifications: broadcast::Sender<Notification>,
}

impl RunTrigger {
    fn trigger(&self, package: &str, reason: TriggerReason) {
        let start = self.scheduler.lock().unwrap().request(package);
        if start {
            self.send(package, reason);
        } else {
            debug!(package = %package, "Run in flight, marked dirty");
        }
    }

    fn complete(&self, package: &str) {
        let rerun = self.scheduler.lock().unwrap().complete(package);
        if rerun {
            debug!(package = %package, "Package changed during run, rerunning");
            self.send(package, TriggerReason::Rerun);
        }
    }

    fn send(&self, package: &str, reason: TriggerReason) {
        match self.runs.try_send(RunRequest::new(package, reason)) {
            Ok(()) => {
                info!(package = %package, reason = ?reason, "Run triggered");
                let _ = self.notifications.send(Notification::RunTriggered {
                    package: package.to_string(),
                });
            }
            Err(e) => {
                // The next change to the package triggers it again.
                self.scheduler.lock().unwrap().abandon(package);
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(package = %package, "Run queue full, dropping run request");
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        warn!(package = %package, "Runner gone, dropping run request");
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    builder: RwLock<TreeBuilder>,
    revision: Arc<AtomicU64>,
    notifications: broadcast::Sender<Notification>,
    debouncer: Debouncer<String, FileOperation>,
    trigger: Arc<RunTrigger>,
}

/// Fan-in point for tree events and fan-out point for notifications.
///
/// Cloning is cheap; clones share the same tree and subscribers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl EventDispatcher {
    /// Creates a dispatcher that sends run requests on `runs`.
    ///
    /// Must be called inside a tokio runtime: debouncing runs as a task.
    #[must_use]
    pub fn new(config: DispatcherConfig, runs: mpsc::Sender<RunRequest>) -> Self {
        let (notifications, _) = broadcast::channel(config.notify_capacity.max(1));

        let trigger = Arc::new(RunTrigger {
            scheduler: Mutex::new(RunScheduler::new()),
            runs,
            notifications: notifications.clone(),
        });

        let (fired_tx, fired_rx) = mpsc::channel(config.notify_capacity.max(1));
        let debouncer = Debouncer::with_max_delay(config.debounce, config.max_delay, fired_tx);
        tokio::spawn(drain_debounced(fired_rx, Arc::clone(&trigger)));

        debug!(
            debounce_ms = config.debounce.as_millis(),
            capacity = config.notify_capacity,
            "Created event dispatcher"
        );

        Self {
            inner: Arc::new(Inner {
                builder: RwLock::new(TreeBuilder::with_watch_extensions(
                    config.watch_extensions,
                )),
                revision: Arc::new(AtomicU64::new(0)),
                notifications,
                debouncer,
                trigger,
            }),
        }
    }

    /// Feeds one event into the tree.
    ///
    /// Never blocks on subscribers or the runner. Malformed events are logged,
    /// leave the tree untouched, and are reported to subscribers as
    /// [`Notification::Error`].
    pub fn publish(&self, event: impl Into<SentinelEvent>) {
        match event.into() {
            SentinelEvent::File(event) => self.publish_file(&event),
            SentinelEvent::Runner(event) => self.publish_runner(&event),
            SentinelEvent::Result(result) => {
                let outcome = self.mutate(|builder| builder.apply_result(&result));
                self.settle(outcome);
            }
            SentinelEvent::Error(event) => self.publish_error(event),
        }
    }

    /// Subscribes to notifications from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            rx: self.inner.notifications.subscribe(),
            stash: None,
            dropped: 0,
            revision: Arc::clone(&self.inner.revision),
        };
        debug!(subscriber = %subscription.id, "Subscriber added");
        subscription
    }

    /// Ends a subscription.
    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(
            subscriber = %subscription.id,
            dropped = subscription.dropped,
            "Subscriber removed"
        );
        drop(subscription);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.notifications.receiver_count()
    }

    /// Latest tree revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    /// Discards the tree ahead of a fresh full run.
    pub fn reset(&self) {
        let revision = {
            let mut builder = self.inner.builder.write().unwrap();
            builder.reset();
            self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1
        };
        info!(revision, "Tree reset");
        self.notify(Notification::TreeReset { revision });
    }

    /// Copies the tree under the read lock.
    #[must_use]
    pub fn snapshot(&self) -> TreeSnapshot {
        let builder = self.inner.builder.read().unwrap();
        let tree = builder.tree();
        TreeSnapshot {
            revision: self.revision(),
            summary: tree.summary(),
            nodes: tree.snapshot(),
        }
    }

    /// Runs `f` against the tree under the read lock.
    pub fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        let builder = self.inner.builder.read().unwrap();
        f(builder.tree())
    }

    /// Sets the display expansion of a node. Does not notify.
    pub fn set_expanded(&self, path: &NodePath, expanded: bool) -> bool {
        let mut builder = self.inner.builder.write().unwrap();
        builder.tree_mut().set_expanded(path, expanded)
    }

    /// Requests a run of `package` immediately, bypassing the debounce window.
    pub fn request_run(&self, package: &str) {
        self.inner.trigger.trigger(package, TriggerReason::Manual);
    }

    fn publish_file(&self, event: &FileEvent) {
        let (kind, package) = {
            let builder = self.inner.builder.read().unwrap();
            let extensions = builder.watch_extensions();
            (event.entry_kind(extensions), event.package_for(extensions))
        };

        if event.operation == FileOperation::Removed {
            if kind == EntryKind::Directory {
                // The directory and any package below it are gone: nothing
                // left to run.
                let mut removed = Vec::new();
                let pruned = self.mutate(|builder| {
                    removed = builder.prune_within(&package);
                    Ok(!removed.is_empty())
                });
                self.settle(pruned);

                for stale in removed.into_iter().filter(|stale| *stale != package) {
                    self.inner.debouncer.cancel(stale);
                }
                self.inner.debouncer.cancel(package);
                return;
            }

            let pruned = self.mutate(|builder| Ok(builder.prune(&NodePath::package(&package))));
            self.settle(pruned);
        }

        trace!(package = %package, operation = ?event.operation, "Debouncing file change");
        if let Err(e) = self.inner.debouncer.try_send(package.clone(), event.operation) {
            warn!(package = %package, error = %e, "Dropping file change");
        }
    }

    fn publish_runner(&self, event: &RunnerEvent) {
        let outcome = self.mutate(|builder| builder.apply_runner_event(event));
        let accepted = outcome.is_ok();
        self.settle(outcome);

        if accepted && event.status == RunStatus::Completed && event.is_package_level() {
            self.inner.trigger.complete(&event.package);
        }
    }

    fn publish_error(&self, event: ErrorEvent) {
        warn!(error = %event, "Error reported");
        let changed = self.mutate(|builder| Ok(builder.apply_error(&event)));
        self.settle(changed);

        if event.kind == ErrorKind::RunnerFailure && event.test.is_none() {
            if let Some(package) = &event.package {
                self.inner.trigger.complete(package);
            }
        }
        self.notify(Notification::Error(event));
    }

    /// Applies `f` under the write lock and bumps the revision if it changed
    /// anything. Returns the new revision, if any.
    fn mutate<F>(&self, f: F) -> Result<Option<u64>, IngestError>
    where
        F: FnOnce(&mut TreeBuilder) -> Result<bool, IngestError>,
    {
        let mut builder = self.inner.builder.write().unwrap();
        let changed = f(&mut builder)?;
        Ok(changed.then(|| self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn settle(&self, outcome: Result<Option<u64>, IngestError>) {
        match outcome {
            Ok(Some(revision)) => self.notify(Notification::TreeChanged { revision }),
            Ok(None) => trace!("Event left tree unchanged"),
            Err(e) => {
                warn!(error = %e, "Rejected malformed event");
                self.notify(Notification::Error(ErrorEvent::malformed(&e)));
            }
        }
    }

    fn notify(&self, notification: Notification) {
        // Err only means nobody is subscribed.
        let _ = self.inner.notifications.send(notification);
    }
}

async fn drain_debounced(
    mut fired: mpsc::Receiver<Debounced<String, FileOperation>>,
    trigger: Arc<RunTrigger>,
) {
    while let Some(Debounced { key, coalesced, .. }) = fired.recv().await {
        debug!(package = %key, coalesced, "File changes settled");
        trigger.trigger(&key, TriggerReason::FileChanged);
    }
    debug!("Run trigger task terminated");
}

/// A subscriber's view of the notification stream.
///
/// Consecutive `TreeChanged` notifications are merged into the latest one.
/// When the subscriber falls behind the ring, the lost notifications are
/// counted and replaced by a single `TreeChanged` at the current revision.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    rx: broadcast::Receiver<Notification>,
    stash: Option<Notification>,
    dropped: u64,
    revision: Arc<AtomicU64>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Total notifications lost to lag so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Waits for the next notification. Returns `None` once the dispatcher
    /// is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        let first = match self.stash.take() {
            Some(stashed) => stashed,
            None => loop {
                match self.rx.recv().await {
                    Ok(notification) => break notification,
                    Err(RecvError::Lagged(missed)) => break self.lagged(missed),
                    Err(RecvError::Closed) => return None,
                }
            },
        };
        Some(self.coalesce(first))
    }

    /// Returns the next notification if one is ready.
    pub fn try_recv(&mut self) -> Option<Notification> {
        let first = match self.stash.take() {
            Some(stashed) => stashed,
            None => match self.rx.try_recv() {
                Ok(notification) => notification,
                Err(TryRecvError::Lagged(missed)) => self.lagged(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            },
        };
        Some(self.coalesce(first))
    }

    fn lagged(&mut self, missed: u64) -> Notification {
        self.dropped += missed;
        warn!(
            subscriber = %self.id,
            dropped = missed,
            total_dropped = self.dropped,
            "Subscriber lagged, notifications dropped"
        );
        Notification::TreeChanged {
            revision: self.revision.load(Ordering::SeqCst),
        }
    }

    /// Folds any `TreeChanged` notifications already queued behind `first`.
    fn coalesce(&mut self, first: Notification) -> Notification {
        let Notification::TreeChanged { mut revision } = first else {
            return first;
        };

        loop {
            match self.rx.try_recv() {
                Ok(Notification::TreeChanged { revision: next }) => {
                    revision = revision.max(next);
                }
                Ok(other) => {
                    self.stash = Some(other);
                    break;
                }
                Err(TryRecvError::Lagged(missed)) => {
                    if let Notification::TreeChanged { revision: current } = self.lagged(missed) {
                        revision = revision.max(current);
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        Notification::TreeChanged { revision }
    }
}
