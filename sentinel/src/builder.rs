//! Merges runner output into the tree.
//!
//! [`TreeBuilder`] translates [`RunnerEvent`]s, [`TestResult`]s, and
//! [`ErrorEvent`]s into node mutations. Every merge validates its input first
//! and reports whether the tree actually changed, so repeated events can be
//! recognised and ignored by callers.

use tracing::{debug, trace, warn};

use crate::error::IngestError;
use crate::tree::{NodeId, NodePath, Tree};
use crate::types::{
    package_within, EntryKind, ErrorEvent, ErrorKind, FileEvent, FileOperation, RunStatus,
    RunnerEvent, SentinelEvent, TestResult, DEFAULT_WATCH_EXTENSIONS,
};

/// Owns the tree and applies incoming events to it.
#[derive(Debug)]
pub struct TreeBuilder {
    tree: Tree,
    watch_extensions: Vec<String>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::with_watch_extensions(DEFAULT_WATCH_EXTENSIONS.iter().copied())
    }
}

impl TreeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder that resolves kind-less file events against
    /// `extensions`.
    #[must_use]
    pub fn with_watch_extensions<I>(extensions: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            tree: Tree::new(),
            watch_extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    /// Extensions that mark a kind-less path as a file.
    #[must_use]
    pub fn watch_extensions(&self) -> &[String] {
        &self.watch_extensions
    }

    #[must_use]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Mutable access for display state such as expansion.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Applies any event to the tree.
    ///
    /// File events only matter here when they remove something: the affected
    /// package is pruned. Scheduling runs for changes is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns an [`IngestError`] if the event is malformed. The tree is left
    /// untouched in that case.
    pub fn apply(&mut self, event: &SentinelEvent) -> Result<bool, IngestError> {
        match event {
            SentinelEvent::File(event) => Ok(self.apply_file_event(event)),
            SentinelEvent::Runner(event) => self.apply_runner_event(event),
            SentinelEvent::Result(result) => self.apply_result(result),
            SentinelEvent::Error(event) => Ok(self.apply_error(event)),
        }
    }

    /// Applies a runner lifecycle step.
    ///
    /// `Started` and `Running` mark the addressed node pending. `Completed`
    /// merges the attached results, then ends the run for the addressed node
    /// and records any package-level metadata. A `Completed` event never
    /// removes children, even when it carries no results.
    ///
    /// # Errors
    ///
    /// Returns an [`IngestError`] if the event itself is malformed. Malformed
    /// results inside a `Completed` batch are skipped individually.
    pub fn apply_runner_event(&mut self, event: &RunnerEvent) -> Result<bool, IngestError> {
        event.validate()?;

        let path = match &event.test {
            Some(test) => NodePath::test(&event.package, test),
            None => NodePath::package(&event.package),
        };

        match event.status {
            RunStatus::Started | RunStatus::Running => {
                let id = self.tree.ensure_path(&path);
                let changed = self.tree.mark_pending(id);
                trace!(path = %path, status = ?event.status, changed, "Marked node pending");
                Ok(changed)
            }
            RunStatus::Completed => {
                let mut changed = false;
                let mut fresh = false;
                for result in &event.results {
                    match self.apply_result(result) {
                        Ok(applied) => {
                            changed |= applied;
                            fresh |= result.package == event.package;
                        }
                        Err(e) => {
                            warn!(path = %path, error = %e, "Skipping malformed result");
                        }
                    }
                }

                let nodes = self.tree.len();
                let id = self.tree.ensure_path(&path);
                changed |= self.tree.len() != nodes;
                if fresh && event.is_package_level() {
                    // New results supersede an earlier package-level failure.
                    changed |= self.tree.clear_own_status(id);
                }
                changed |= self
                    .tree
                    .finish_run(id, event.elapsed_seconds, event.coverage);

                debug!(
                    path = %path,
                    results = event.results.len(),
                    changed,
                    "Merged completed run"
                );
                Ok(changed)
            }
        }
    }

    /// Applies one test result, creating its package and test nodes if needed.
    ///
    /// # Errors
    ///
    /// Returns an [`IngestError`] if the result is malformed.
    pub fn apply_result(&mut self, result: &TestResult) -> Result<bool, IngestError> {
        result.validate()?;

        let id = self
            .tree
            .ensure_path(&NodePath::test(&result.package, &result.test));
        let changed = self.tree.apply_result(id, result);

        trace!(
            package = %result.package,
            test = %result.test,
            passed = result.passed,
            changed,
            "Merged result"
        );
        Ok(changed)
    }

    /// Applies an error occurrence.
    ///
    /// Only runner failures that name a package change the tree: the addressed
    /// node and anything still unresolved beneath it become failed. All other
    /// errors are logged and leave the tree alone.
    pub fn apply_error(&mut self, event: &ErrorEvent) -> bool {
        let Some(path) = failure_path(event) else {
            debug!(error = %event, "Error carries no tree path");
            return false;
        };

        let id = self.tree.ensure_path(&path);
        let changed = self.tree.fail(id, &event.message);
        debug!(path = %path, changed, "Resolved pending nodes to failed");
        changed
    }

    /// Removes the package `dir` and every package nested below it.
    ///
    /// Returns the names of the removed packages.
    pub fn prune_within(&mut self, dir: &str) -> Vec<String> {
        let tree = &self.tree;
        let doomed: Vec<String> = tree
            .get(tree.root())
            .map(|root| root.children())
            .unwrap_or_default()
            .iter()
            .filter_map(|&id| tree.get(id))
            .map(|package| package.title().to_string())
            .filter(|title| package_within(title, dir))
            .collect();

        for package in &doomed {
            self.prune(&NodePath::package(package));
        }
        doomed
    }

    /// Removes the subtree at `path`.
    pub fn prune(&mut self, path: &NodePath) -> bool {
        let pruned = self.tree.prune(path);
        if pruned {
            debug!(path = %path, "Pruned subtree");
        }
        pruned
    }

    /// Discards the whole tree and starts again from an empty root.
    pub fn reset(&mut self) {
        debug!(nodes = self.tree.len(), "Resetting tree");
        self.tree = Tree::new();
    }

    /// Looks up the node for a package, if present.
    #[must_use]
    pub fn package(&self, package: &str) -> Option<NodeId> {
        self.tree.find(&NodePath::package(package))
    }

    fn apply_file_event(&mut self, event: &FileEvent) -> bool {
        if event.operation != FileOperation::Removed {
            return false;
        }
        let package = event.package_for(&self.watch_extensions);
        match event.entry_kind(&self.watch_extensions) {
            EntryKind::File => self.prune(&NodePath::package(package)),
            EntryKind::Directory => !self.prune_within(&package).is_empty(),
        }
    }
}

/// The node a runner failure resolves, if it names one.
fn failure_path(event: &ErrorEvent) -> Option<NodePath> {
    if event.kind != ErrorKind::RunnerFailure {
        return None;
    }
    let package = event.package.as_deref().filter(|p| !p.trim().is_empty())?;

    Some(match event.test.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(test) => NodePath::test(package, test),
        None => NodePath::package(package),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Outcome;

    fn outcome(builder: &TreeBuilder, path: &NodePath) -> Outcome {
        let id = builder.tree().find(path).expect("node should exist");
        builder.tree().get(id).unwrap().passed()
    }

    #[test]
    fn started_creates_pending_package() {
        let mut builder = TreeBuilder::new();
        assert!(builder
            .apply_runner_event(&RunnerEvent::started("pkgA"))
            .unwrap());

        let id = builder.package("pkgA").unwrap();
        let node = builder.tree().get(id).unwrap();
        assert!(node.is_running());
        assert_eq!(node.passed(), Outcome::Unresolved);
    }

    #[test]
    fn running_for_test_creates_ancestors() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_runner_event(&RunnerEvent::running("pkgA").with_test("TestX"))
            .unwrap();

        let path = NodePath::test("pkgA", "TestX");
        let id = builder.tree().find(&path).unwrap();
        assert!(builder.tree().get(id).unwrap().is_running());
        assert_eq!(outcome(&builder, &NodePath::package("pkgA")), Outcome::Unresolved);
    }

    #[test]
    fn completed_applies_results_and_clears_running() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_runner_event(&RunnerEvent::started("pkgA"))
            .unwrap();
        builder
            .apply_runner_event(&RunnerEvent::completed(
                "pkgA",
                vec![
                    TestResult::pass("pkgA", "TestOne", 0.1),
                    TestResult::pass("pkgA", "TestTwo", 0.2),
                ],
            ))
            .unwrap();

        let id = builder.package("pkgA").unwrap();
        let node = builder.tree().get(id).unwrap();
        assert!(!node.is_running());
        assert_eq!(node.passed(), Outcome::Passed);
        assert_eq!(node.children().len(), 2);
    }

    #[test]
    fn completed_without_results_keeps_children() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_result(&TestResult::pass("pkgA", "TestOne", 0.1))
            .unwrap();
        builder
            .apply_runner_event(&RunnerEvent::completed("pkgA", Vec::new()).with_coverage(75.0))
            .unwrap();

        let id = builder.package("pkgA").unwrap();
        let node = builder.tree().get(id).unwrap();
        assert_eq!(node.children().len(), 1);
        assert_eq!(node.coverage(), 75.0);
    }

    #[test]
    fn duplicate_completed_is_idempotent() {
        let mut builder = TreeBuilder::new();
        let event = RunnerEvent::completed(
            "pkgA",
            vec![TestResult::fail("pkgA", "TestX", 0.3, "boom")],
        )
        .with_elapsed(0.4);

        assert!(builder.apply_runner_event(&event).unwrap());
        let before = builder.tree().snapshot();

        assert!(!builder.apply_runner_event(&event).unwrap());
        assert_eq!(builder.tree().snapshot(), before);
    }

    #[test]
    fn completed_skips_malformed_results() {
        let mut builder = TreeBuilder::new();
        let changed = builder
            .apply_runner_event(&RunnerEvent::completed(
                "pkgA",
                vec![
                    TestResult::pass("pkgA", "", 0.1),
                    TestResult::pass("pkgA", "TestGood", 0.1),
                    TestResult::pass("pkgA", "TestNegative", -1.0),
                ],
            ))
            .unwrap();

        assert!(changed);
        let id = builder.package("pkgA").unwrap();
        assert_eq!(builder.tree().get(id).unwrap().children().len(), 1);
    }

    #[test]
    fn malformed_event_leaves_tree_untouched() {
        let mut builder = TreeBuilder::new();
        let err = builder
            .apply_runner_event(&RunnerEvent::started(""))
            .unwrap_err();
        assert_eq!(err, IngestError::EmptyPackage);

        let err = builder
            .apply_result(&TestResult::pass("pkgA", "TestX", f64::NAN))
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidElapsed { .. }));

        assert!(builder.tree().is_empty());
    }

    #[test]
    fn runner_failure_resolves_pending_nodes() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_runner_event(&RunnerEvent::started("pkgA"))
            .unwrap();
        builder
            .apply_runner_event(&RunnerEvent::running("pkgA").with_test("TestX"))
            .unwrap();
        builder
            .apply_result(&TestResult::pass("pkgB", "TestY", 0.1))
            .unwrap();

        assert!(builder.apply_error(&ErrorEvent::runner_failure("pkgA", "build failed")));

        let test = NodePath::test("pkgA", "TestX");
        let id = builder.tree().find(&test).unwrap();
        let node = builder.tree().get(id).unwrap();
        assert_eq!(node.passed(), Outcome::Failed);
        assert_eq!(node.error(), "build failed");
        assert_eq!(outcome(&builder, &NodePath::package("pkgB")), Outcome::Passed);
    }

    #[test]
    fn pathless_errors_do_not_touch_tree() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_result(&TestResult::pass("pkgA", "TestX", 0.1))
            .unwrap();

        assert!(!builder.apply_error(&ErrorEvent::new(ErrorKind::RunnerFailure, "crashed")));
        assert!(!builder.apply_error(&ErrorEvent::malformed(&IngestError::EmptyPackage)));

        let mut watch = ErrorEvent::new(ErrorKind::Watch, "inotify limit");
        watch.package = Some("pkgA".to_string());
        assert!(!builder.apply_error(&watch));

        assert_eq!(outcome(&builder, &NodePath::package("pkgA")), Outcome::Passed);
    }

    #[test]
    fn removed_file_event_prunes_package() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_result(&TestResult::pass("pkgA", "TestX", 0.1))
            .unwrap();

        let written = SentinelEvent::File(FileEvent::new("pkgA/a.go", FileOperation::Written));
        assert!(!builder.apply(&written).unwrap());

        let removed = SentinelEvent::File(FileEvent::new("pkgA/a.go", FileOperation::Removed));
        assert!(builder.apply(&removed).unwrap());
        assert!(builder.package("pkgA").is_none());
    }

    #[test]
    fn completed_results_replace_earlier_runner_failure() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_runner_event(&RunnerEvent::started("pkgA"))
            .unwrap();
        builder.apply_error(&ErrorEvent::runner_failure("pkgA", "build failed"));

        assert!(builder
            .apply_runner_event(&RunnerEvent::completed(
                "pkgA",
                vec![TestResult::pass("pkgA", "TestX", 0.01)],
            ))
            .unwrap());

        let id = builder.package("pkgA").unwrap();
        let node = builder.tree().get(id).unwrap();
        assert_eq!(node.passed(), Outcome::Passed);
        assert_eq!(node.error(), "");
    }

    #[test]
    fn empty_completed_keeps_runner_failure() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_result(&TestResult::pass("pkgA", "TestX", 0.01))
            .unwrap();
        builder.apply_error(&ErrorEvent::runner_failure("pkgA", "build failed"));

        builder
            .apply_runner_event(&RunnerEvent::completed("pkgA", Vec::new()))
            .unwrap();
        builder
            .apply_runner_event(&RunnerEvent::completed(
                "pkgA",
                vec![TestResult::pass("pkgB", "TestY", 0.01)],
            ))
            .unwrap();

        let id = builder.package("pkgA").unwrap();
        let node = builder.tree().get(id).unwrap();
        assert_eq!(node.passed(), Outcome::Failed);
        assert_eq!(node.error(), "build failed");
    }

    #[test]
    fn removed_directory_prunes_nested_packages() {
        let mut builder = TreeBuilder::new();
        for result in [
            TestResult::pass("internal", "TestA", 0.1),
            TestResult::pass("internal/api", "TestB", 0.1),
            TestResult::pass("internals", "TestC", 0.1),
        ] {
            builder.apply_result(&result).unwrap();
        }

        let removed = SentinelEvent::File(FileEvent::new("internal", FileOperation::Removed));
        assert!(builder.apply(&removed).unwrap());

        let titles: Vec<String> = builder
            .tree()
            .snapshot()
            .into_iter()
            .map(|node| node.title)
            .collect();
        assert_eq!(titles, vec!["internals".to_string()]);
    }

    #[test]
    fn prune_within_reports_removed_packages() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_result(&TestResult::pass("internal/api", "TestB", 0.1))
            .unwrap();

        assert_eq!(builder.prune_within("internal"), vec!["internal/api".to_string()]);
        assert!(builder.prune_within("internal").is_empty());
    }

    #[test]
    fn removed_dotted_directory_prunes_only_itself() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_result(&TestResult::pass("pkgA", "TestX", 0.1))
            .unwrap();
        builder
            .apply_result(&TestResult::pass("pkgA/v1.2", "TestY", 0.1))
            .unwrap();

        let removed = SentinelEvent::File(FileEvent::new("pkgA/v1.2", FileOperation::Removed));
        assert!(builder.apply(&removed).unwrap());

        assert!(builder.package("pkgA").is_some());
        assert!(builder.package("pkgA/v1.2").is_none());
    }

    #[test]
    fn watch_extensions_decide_kind_less_paths() {
        let mut builder = TreeBuilder::with_watch_extensions(["ts"]);
        assert_eq!(builder.watch_extensions(), ["ts".to_string()]);
        builder
            .apply_result(&TestResult::pass("web", "TestX", 0.1))
            .unwrap();

        let removed = SentinelEvent::File(FileEvent::new("web/app.ts", FileOperation::Removed));
        assert!(builder.apply(&removed).unwrap());
        assert!(builder.package("web").is_none());
    }

    #[test]
    fn reset_discards_everything() {
        let mut builder = TreeBuilder::new();
        builder
            .apply_result(&TestResult::pass("pkgA", "TestX", 0.1))
            .unwrap();
        builder.reset();

        assert!(builder.tree().is_empty());
        assert_eq!(builder.tree().len(), 1);
    }
}
