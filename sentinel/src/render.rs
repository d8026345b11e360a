//! Plain-text rendering of a tree snapshot.
//!
//! Used by the CLI to print the tree to a terminal. Each node is one line:
//!
//! ```text
//! FAIL pkgA                         0.52s  80.0%
//!   ok   TestOne                    0.12s
//!   FAIL TestTwo                    0.40s
//!        expected 1, got 2
//! RUN  pkgB
//! ```
//!
//! Tests are listed below a package when the package failed, when it is
//! expanded, or when rendering verbosely.

use std::fmt::Write;

use crate::dispatcher::TreeSnapshot;
use crate::tree::{NodeView, Outcome, TreeSummary};

/// Column the duration is aligned to.
const TITLE_WIDTH: usize = 32;

/// Longest error line printed under a failed test.
const MAX_ERROR_WIDTH: usize = 100;

/// Renders a snapshot with a summary line on top.
#[must_use]
pub fn render(snapshot: &TreeSnapshot, verbose: bool) -> String {
    let mut out = summary_line(&snapshot.summary);
    out.push('\n');
    out.push_str(&render_nodes(&snapshot.nodes, verbose));
    out
}

/// Renders a forest of nodes, one line each.
#[must_use]
pub fn render_nodes(nodes: &[NodeView], verbose: bool) -> String {
    let mut out = String::new();
    for node in nodes {
        render_node(&mut out, node, verbose);
    }
    out
}

/// One-line totals, e.g. `2 packages, 5 tests: 4 passed, 1 failed (1.20s)`.
#[must_use]
pub fn summary_line(summary: &TreeSummary) -> String {
    let mut line = format!(
        "{} packages, {} tests: {} passed, {} failed",
        summary.packages, summary.tests, summary.passed, summary.failed
    );
    if summary.unresolved > 0 {
        let _ = write!(line, ", {} pending", summary.unresolved);
    }
    let _ = write!(line, " ({:.2}s", summary.duration);
    if summary.coverage > 0.0 {
        let _ = write!(line, ", {:.1}% coverage", summary.coverage);
    }
    line.push(')');
    line
}

fn render_node(out: &mut String, node: &NodeView, verbose: bool) {
    let indent = "  ".repeat(node.level.saturating_sub(1));
    let title_width = TITLE_WIDTH.saturating_sub(indent.len());
    let title = truncate_to_width(&node.title, title_width);

    let _ = write!(out, "{indent}{:<4} {title:<title_width$}", status_label(node));
    if node.passed.is_resolved() || node.duration > 0.0 {
        let _ = write!(out, " {:>6.2}s", node.duration);
    }
    if node.coverage > 0.0 {
        let _ = write!(out, " {:>5.1}%", node.coverage);
    }
    let line_end = out.trim_end().len();
    out.truncate(line_end);
    out.push('\n');

    if node.passed == Outcome::Failed && node.children.is_empty() {
        if let Some(first) = node.error.lines().find(|line| !line.trim().is_empty()) {
            let _ = writeln!(
                out,
                "{indent}     {}",
                truncate_to_width(first.trim(), MAX_ERROR_WIDTH)
            );
        }
    }

    if verbose || node.expanded || node.passed == Outcome::Failed {
        for child in &node.children {
            render_node(out, child, verbose);
        }
    }
}

fn status_label(node: &NodeView) -> &'static str {
    if node.running {
        return "RUN";
    }
    match node.passed {
        Outcome::Passed => "ok",
        Outcome::Failed => "FAIL",
        Outcome::Unresolved => "...",
    }
}

/// Truncates to `max_width` characters, ending in `...` when cut.
fn truncate_to_width(s: &str, max_width: usize) -> String {
    if s.chars().count() <= max_width {
        return s.to_string();
    }
    if max_width < 4 {
        return s.chars().take(max_width).collect();
    }
    let truncated: String = s.chars().take(max_width - 3).collect();
    format!("{truncated}...")
}
