//! Arena-backed package → test tree.
//!
//! The tree owns every node in a flat arena. Ownership flows strictly from
//! the root to its children through `children` lists; each node also keeps a
//! non-owning `parent` id that is used only to walk upward when aggregates
//! need recomputing.
//!
//! # Aggregates
//!
//! A node with children derives its status, duration, and coverage from its
//! direct children:
//!
//! - status: any failed child makes the node failed, otherwise any unresolved
//!   child makes it unresolved, otherwise it passed
//! - duration: the sum of the children's durations
//! - coverage: the duration-weighted mean over the children that report
//!   coverage, or `0` when none do
//!
//! Every mutation recomputes the touched node and then its ancestors, and
//! nothing else. Each revisited ancestor folds only its direct children.
//!
//! # Example
//!
//! ```
//! use sentinel::tree::{NodePath, Outcome, Tree};
//! use sentinel::types::TestResult;
//!
//! let mut tree = Tree::new();
//! let package = tree.create_or_get_child(tree.root(), "pkgA");
//! let test = tree.create_or_get_child(package, "TestX");
//! tree.apply_result(test, &TestResult::pass("pkgA", "TestX", 0.25));
//!
//! let node = tree.get(package).unwrap();
//! assert_eq!(node.passed(), Outcome::Passed);
//! assert_eq!(node.duration(), 0.25);
//!
//! assert!(tree.prune(&NodePath::package("pkgA")));
//! assert!(tree.find(&NodePath::package("pkgA")).is_none());
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::TestResult;

/// Index of a node in the tree's arena.
///
/// Ids are never reused within one tree, so an id held after its node was
/// pruned simply resolves to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Tri-state result of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// No result yet, or a run is pending.
    #[default]
    Unresolved,
    Passed,
    Failed,
}

impl Outcome {
    /// Maps a test's pass flag to an outcome.
    #[must_use]
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            Self::Passed
        } else {
            Self::Failed
        }
    }

    /// Returns `None` while unresolved, otherwise whether it passed.
    #[must_use]
    pub fn as_passed(self) -> Option<bool> {
        match self {
            Self::Unresolved => None,
            Self::Passed => Some(true),
            Self::Failed => Some(false),
        }
    }

    #[must_use]
    pub fn is_resolved(self) -> bool {
        self != Self::Unresolved
    }

    /// Folds child outcomes into a parent outcome.
    ///
    /// Any failure wins; otherwise any unresolved child keeps the parent
    /// unresolved; otherwise the parent passed. Returns `None` for an empty
    /// iterator.
    ///
    /// ```
    /// use sentinel::tree::Outcome;
    ///
    /// let folded = Outcome::combine([Outcome::Passed, Outcome::Unresolved, Outcome::Failed]);
    /// assert_eq!(folded, Some(Outcome::Failed));
    /// assert_eq!(Outcome::combine([Outcome::Passed, Outcome::Unresolved]), Some(Outcome::Unresolved));
    /// assert_eq!(Outcome::combine([Outcome::Passed]), Some(Outcome::Passed));
    /// assert_eq!(Outcome::combine([]), None);
    /// ```
    pub fn combine<I>(outcomes: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        let mut folded = None;
        for outcome in outcomes {
            folded = Some(match (folded, outcome) {
                (_, Self::Failed) | (Some(Self::Failed), _) => Self::Failed,
                (_, Self::Unresolved) | (Some(Self::Unresolved), _) => Self::Unresolved,
                _ => Self::Passed,
            });
        }
        folded
    }
}

/// Address of a package or test node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePath {
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
}

impl NodePath {
    #[must_use]
    pub fn package(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            test: None,
        }
    }

    #[must_use]
    pub fn test(package: impl Into<String>, test: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            test: Some(test.into()),
        }
    }

    /// Titles from the top-level package down to the addressed node.
    fn segments(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.package.as_str()).chain(self.test.as_deref())
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.test {
            Some(test) => write!(f, "{}.{test}", self.package),
            None => write!(f, "{}", self.package),
        }
    }
}

/// A package or test in the tree.
///
/// Fields are read through accessors; all mutation goes through [`Tree`] so
/// that aggregates stay consistent.
#[derive(Debug, Clone)]
pub struct TreeNode {
    title: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    child_index: HashMap<String, NodeId>,
    level: usize,
    expanded: bool,
    running: bool,

    // State attached directly to this node by results, runs, and errors.
    own_outcome: Outcome,
    own_duration: f64,
    own_coverage: Option<f64>,

    // Derived from the above and from the children.
    passed: Outcome,
    duration: f64,
    coverage: f64,
    reports_coverage: bool,

    error: String,
    output: String,
    source_file: String,
    source_line: u32,
}

impl TreeNode {
    fn new(title: String, parent: Option<NodeId>, level: usize) -> Self {
        Self {
            title,
            parent,
            children: Vec::new(),
            child_index: HashMap::new(),
            level,
            expanded: false,
            running: false,
            own_outcome: Outcome::Unresolved,
            own_duration: 0.0,
            own_coverage: None,
            passed: Outcome::Unresolved,
            duration: 0.0,
            coverage: 0.0,
            reports_coverage: false,
            error: String::new(),
            output: String::new(),
            source_file: String::new(),
            source_line: 0,
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child ids in first-seen order.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Whether a run for this node is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn passed(&self) -> Outcome {
        self.passed
    }

    /// Duration in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Coverage percentage.
    #[must_use]
    pub fn coverage(&self) -> f64 {
        self.coverage
    }

    /// Latest failure message, empty when passed or pending.
    #[must_use]
    pub fn error(&self) -> &str {
        &self.error
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Source location of the test function, if the runner reported one.
    #[must_use]
    pub fn source(&self) -> Option<(&str, u32)> {
        if self.source_file.is_empty() {
            None
        } else {
            Some((&self.source_file, self.source_line))
        }
    }
}

/// Owned, read-only copy of a node and its subtree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub title: String,
    pub level: usize,
    pub expanded: bool,
    pub running: bool,
    pub passed: Outcome,
    pub duration: f64,
    pub coverage: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_file: String,
    pub source_line: u32,
    pub children: Vec<NodeView>,
}

/// Totals over the whole tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSummary {
    pub packages: usize,
    pub tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub duration: f64,
    pub coverage: f64,
}

/// The package → test forest under a single unnamed root.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Option<TreeNode>>,
    root: NodeId,
    live: usize,
}

impl Tree {
    /// Creates a tree holding only the root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(TreeNode::new(String::new(), None, 0))],
            root: NodeId(0),
            live: 1,
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the node for `id`, or `None` if it was pruned.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Number of live nodes, including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if the root has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.node(self.root).children.is_empty()
    }

    /// Looks up a direct child of `parent` by title.
    #[must_use]
    pub fn child(&self, parent: NodeId, title: &str) -> Option<NodeId> {
        self.get(parent)?.child_index.get(title).copied()
    }

    /// Returns the child of `parent` named `title`, creating it if needed.
    ///
    /// New children are appended, so siblings keep first-seen order.
    pub fn create_or_get_child(&mut self, parent: NodeId, title: &str) -> NodeId {
        if let Some(existing) = self.child(parent, title) {
            return existing;
        }

        let id = NodeId(self.nodes.len());
        let level = self.node(parent).level + 1;
        self.nodes
            .push(Some(TreeNode::new(title.to_string(), Some(parent), level)));
        self.live += 1;

        let parent_node = self.node_mut(parent);
        parent_node.children.push(id);
        parent_node.child_index.insert(title.to_string(), id);

        // A new unresolved child can change the parent's status.
        self.recompute_upward(parent);
        id
    }

    /// Resolves `path` to a node, if every segment exists.
    #[must_use]
    pub fn find(&self, path: &NodePath) -> Option<NodeId> {
        path.segments()
            .try_fold(self.root, |parent, title| self.child(parent, title))
    }

    /// Resolves `path`, creating any missing nodes along the way.
    pub fn ensure_path(&mut self, path: &NodePath) -> NodeId {
        let mut id = self.root;
        for title in path.segments() {
            id = self.create_or_get_child(id, title);
        }
        id
    }

    /// Records `result` as the latest state of node `id`.
    ///
    /// Returns `true` if anything visible changed. Applying the same result
    /// twice leaves the tree as it was after the first application.
    pub fn apply_result(&mut self, id: NodeId, result: &TestResult) -> bool {
        let node = self.node_mut(id);
        let before = LeafState::capture(node);

        node.own_outcome = Outcome::from_passed(result.passed);
        node.own_duration = result.elapsed_seconds;
        node.error = if result.passed {
            String::new()
        } else {
            result.error.clone()
        };
        node.output.clone_from(&result.output);
        node.source_file.clone_from(&result.source_file);
        node.source_line = result.source_line;
        node.running = false;

        let changed = LeafState::capture(node) != before;
        if changed {
            self.recompute_upward(id);
        }
        changed
    }

    /// Marks node `id` as pending: unresolved, no error, run in flight.
    ///
    /// Children keep their last results until new ones arrive.
    pub fn mark_pending(&mut self, id: NodeId) -> bool {
        let node = self.node_mut(id);
        let before = LeafState::capture(node);

        node.own_outcome = Outcome::Unresolved;
        node.error.clear();
        node.running = true;

        let changed = LeafState::capture(node) != before;
        if changed {
            self.recompute_upward(id);
        }
        changed
    }

    /// Ends the run for node `id` and its subtree, attaching run metadata.
    pub fn finish_run(&mut self, id: NodeId, elapsed: Option<f64>, coverage: Option<f64>) -> bool {
        let mut changed = false;
        for descendant in self.subtree(id) {
            let node = self.node_mut(descendant);
            changed |= node.running;
            node.running = false;
        }

        let node = self.node_mut(id);
        if let Some(elapsed) = elapsed {
            changed |= node.own_duration != elapsed;
            node.own_duration = elapsed;
        }
        if let Some(coverage) = coverage {
            changed |= node.own_coverage != Some(coverage);
            node.own_coverage = Some(coverage);
        }

        if changed {
            self.recompute_upward(id);
        }
        changed
    }

    /// Drops a container's own status and error so its children decide its
    /// outcome again. Leaves leaves alone: their own status is their result.
    pub fn clear_own_status(&mut self, id: NodeId) -> bool {
        let node = self.node_mut(id);
        if node.children.is_empty() {
            return false;
        }
        let before = LeafState::capture(node);

        node.own_outcome = Outcome::Unresolved;
        node.error.clear();

        let changed = LeafState::capture(node) != before;
        if changed {
            self.recompute_upward(id);
        }
        changed
    }

    /// Resolves node `id` to failed with `message`, along with every node in
    /// its subtree that is still unresolved.
    pub fn fail(&mut self, id: NodeId, message: &str) -> bool {
        let subtree = self.subtree(id);
        let mut changed = false;

        for &descendant in &subtree {
            let node = self.node_mut(descendant);
            if descendant != id && node.passed.is_resolved() {
                continue;
            }
            let before = LeafState::capture(node);
            node.own_outcome = Outcome::Failed;
            node.error = message.to_string();
            node.running = false;
            changed |= LeafState::capture(node) != before;
        }

        if changed {
            // Pre-order reversed visits every child before its parent.
            for &descendant in subtree.iter().rev() {
                self.recompute(descendant);
            }
            if let Some(parent) = self.node(id).parent {
                self.recompute_upward(parent);
            }
        }
        changed
    }

    /// Removes the subtree at `path` and detaches it from its parent.
    ///
    /// Returns `false` if nothing exists at `path`.
    pub fn prune(&mut self, path: &NodePath) -> bool {
        let Some(id) = self.find(path) else {
            return false;
        };
        let Some(parent) = self.node(id).parent else {
            return false;
        };

        let title = self.node(id).title.clone();
        let parent_node = self.node_mut(parent);
        parent_node.children.retain(|child| *child != id);
        parent_node.child_index.remove(&title);

        for removed in self.subtree(id) {
            self.nodes[removed.0] = None;
            self.live -= 1;
        }

        self.recompute_upward(parent);
        true
    }

    /// Sets the UI expansion flag of the node at `path`.
    pub fn set_expanded(&mut self, path: &NodePath, expanded: bool) -> bool {
        match self.find(path) {
            Some(id) => {
                self.node_mut(id).expanded = expanded;
                true
            }
            None => false,
        }
    }

    /// Copies the forest below the root.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NodeView> {
        self.node(self.root)
            .children
            .iter()
            .map(|&child| self.view(child))
            .collect()
    }

    /// Counts packages and tests by outcome.
    #[must_use]
    pub fn summary(&self) -> TreeSummary {
        let root = self.node(self.root);
        let mut summary = TreeSummary {
            packages: root.children.len(),
            duration: root.duration,
            coverage: root.coverage,
            ..TreeSummary::default()
        };

        for &package in &root.children {
            for &test in &self.node(package).children {
                summary.tests += 1;
                match self.node(test).passed {
                    Outcome::Passed => summary.passed += 1,
                    Outcome::Failed => summary.failed += 1,
                    Outcome::Unresolved => summary.unresolved += 1,
                }
            }
        }
        summary
    }

    fn view(&self, id: NodeId) -> NodeView {
        let node = self.node(id);
        NodeView {
            title: node.title.clone(),
            level: node.level,
            expanded: node.expanded,
            running: node.running,
            passed: node.passed,
            duration: node.duration,
            coverage: node.coverage,
            error: node.error.clone(),
            output: node.output.clone(),
            source_file: node.source_file.clone(),
            source_line: node.source_line,
            children: node.children.iter().map(|&child| self.view(child)).collect(),
        }
    }

    /// Ids of `id` and all its descendants, in pre-order.
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            order.push(next);
            stack.extend(self.node(next).children.iter().rev());
        }
        order
    }

    /// Recomputes `id` and then every ancestor up to the root.
    fn recompute_upward(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(next) = current {
            self.recompute(next);
            current = self.node(next).parent;
        }
    }

    /// Recomputes the aggregates of a single node from its own state and its
    /// direct children.
    fn recompute(&mut self, id: NodeId) {
        let node = self.node(id);

        let (passed, duration, coverage, reports_coverage) = if node.children.is_empty() {
            (
                node.own_outcome,
                node.own_duration,
                node.own_coverage.unwrap_or(0.0),
                node.own_coverage.is_some(),
            )
        } else {
            let children: Vec<&TreeNode> =
                node.children.iter().map(|&child| self.node(child)).collect();

            let folded = Outcome::combine(children.iter().map(|child| child.passed))
                .unwrap_or_default();
            let passed = if node.own_outcome == Outcome::Failed {
                Outcome::Failed
            } else {
                folded
            };
            let duration = children.iter().map(|child| child.duration).sum();
            let (coverage, reports_coverage) = match node.own_coverage {
                Some(coverage) => (coverage, true),
                None => weighted_coverage(&children),
            };
            (passed, duration, coverage, reports_coverage)
        };

        let node = self.node_mut(id);
        node.passed = passed;
        node.duration = duration;
        node.coverage = coverage;
        node.reports_coverage = reports_coverage;
    }

    // Ids handed out by this tree always point at live slots unless pruned,
    // and pruned ids are unlinked first. A miss here means the ownership
    // links are corrupt, which is not recoverable.
    fn node(&self, id: NodeId) -> &TreeNode {
        match self.nodes.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("tree invariant violated: {id:?} is not a live node"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        match self.nodes.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("tree invariant violated: {id:?} is not a live node"),
        }
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

/// Duration-weighted coverage over the children that report any.
fn weighted_coverage(children: &[&TreeNode]) -> (f64, bool) {
    let reporting: Vec<(f64, f64)> = children
        .iter()
        .filter(|child| child.reports_coverage)
        .map(|child| (child.coverage, child.duration))
        .collect();

    if reporting.is_empty() {
        return (0.0, false);
    }

    let weight: f64 = reporting.iter().map(|(_, duration)| duration).sum();
    let coverage = if weight > 0.0 {
        reporting
            .iter()
            .map(|(coverage, duration)| coverage * duration)
            .sum::<f64>()
            / weight
    } else {
        reporting.iter().map(|(coverage, _)| coverage).sum::<f64>() / reporting.len() as f64
    };
    (coverage, true)
}

/// The directly-set fields of a node, compared to detect no-op updates.
#[derive(PartialEq)]
struct LeafState {
    outcome: Outcome,
    duration: f64,
    error: String,
    output: String,
    source_file: String,
    source_line: u32,
    running: bool,
}

impl LeafState {
    fn capture(node: &TreeNode) -> Self {
        Self {
            outcome: node.own_outcome,
            duration: node.own_duration,
            error: node.error.clone(),
            output: node.output.clone(),
            source_file: node.source_file.clone(),
            source_line: node.source_line,
            running: node.running,
        }
    }
}
