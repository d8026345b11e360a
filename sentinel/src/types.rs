//! Event types for Sentinel.
//!
//! These are the data contracts exchanged between the file watcher, the test
//! runner, the tree builder, and the dispatcher. Every type here is a plain
//! value: it carries no behavior beyond construction and validation. All
//! types serialize to camelCase JSON with snake_case enum values.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Package key used for files that sit directly in the watched root.
pub const ROOT_PACKAGE: &str = ".";

/// The kind of change a [`FileEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Created,
    Written,
    Removed,
}

/// Extensions treated as source files when a [`FileEvent`] does not say
/// whether its path is a file or a directory.
pub const DEFAULT_WATCH_EXTENSIONS: &[&str] = &["go"];

/// Whether a [`FileEvent`] path names a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// A file system change reported by the watcher.
///
/// Paths are relative to the watched root. A file belongs to the package of
/// its parent directory; a directory names a package itself. The watcher
/// always records which one a path is. Events without a `kind` (for example
/// hand-written input) are resolved against the watched extensions: a path
/// whose extension is watched is a file, anything else is a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEvent {
    pub path: PathBuf,
    pub operation: FileOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntryKind>,
}

impl FileEvent {
    /// Creates an event whose kind is inferred from the path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, operation: FileOperation) -> Self {
        Self {
            path: path.into(),
            operation,
            kind: None,
        }
    }

    /// Creates an event for a path known to be a file.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>, operation: FileOperation) -> Self {
        Self {
            kind: Some(EntryKind::File),
            ..Self::new(path, operation)
        }
    }

    /// Creates an event for a path known to be a directory.
    #[must_use]
    pub fn directory(path: impl Into<PathBuf>, operation: FileOperation) -> Self {
        Self {
            kind: Some(EntryKind::Directory),
            ..Self::new(path, operation)
        }
    }

    /// Resolves whether the path is a file or a directory.
    ///
    /// An explicit `kind` wins. Otherwise the path is a file when its
    /// extension is one of `extensions`, or when `extensions` is empty and
    /// it has any extension.
    #[must_use]
    pub fn entry_kind<S: AsRef<str>>(&self, extensions: &[S]) -> EntryKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        let Some(ext) = self.path.extension().and_then(|ext| ext.to_str()) else {
            return EntryKind::Directory;
        };
        if extensions.is_empty() || extensions.iter().any(|watched| watched.as_ref() == ext) {
            EntryKind::File
        } else {
            EntryKind::Directory
        }
    }

    /// Returns `true` if the path names a file under the default extensions.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.entry_kind(DEFAULT_WATCH_EXTENSIONS) == EntryKind::File
    }

    /// Returns the package this change belongs to, under the default
    /// extensions.
    ///
    /// # Examples
    ///
    /// ```
    /// use sentinel::types::{FileEvent, FileOperation};
    ///
    /// let event = FileEvent::new("internal/api/config_test.go", FileOperation::Written);
    /// assert_eq!(event.package(), "internal/api");
    ///
    /// let event = FileEvent::new("internal/api", FileOperation::Removed);
    /// assert_eq!(event.package(), "internal/api");
    ///
    /// let event = FileEvent::new("third_party/gopkg.in", FileOperation::Removed);
    /// assert_eq!(event.package(), "third_party/gopkg.in");
    ///
    /// let event = FileEvent::new("main.go", FileOperation::Written);
    /// assert_eq!(event.package(), ".");
    /// ```
    #[must_use]
    pub fn package(&self) -> String {
        self.package_for(DEFAULT_WATCH_EXTENSIONS)
    }

    /// Returns the package this change belongs to, resolving the path's kind
    /// against `extensions`.
    #[must_use]
    pub fn package_for<S: AsRef<str>>(&self, extensions: &[S]) -> String {
        match self.entry_kind(extensions) {
            EntryKind::File => {
                package_key(self.path.parent().unwrap_or_else(|| Path::new("")))
            }
            EntryKind::Directory => package_key(&self.path),
        }
    }
}

/// Returns `true` if `package` is the package `dir` or nested below it.
///
/// Every package sits below the watched root.
#[must_use]
pub fn package_within(package: &str, dir: &str) -> bool {
    dir == ROOT_PACKAGE
        || package == dir
        || package
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Joins the normal components of `dir` with `/`.
fn package_key(dir: &Path) -> String {
    let parts: Vec<String> = dir
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        ROOT_PACKAGE.to_string()
    } else {
        parts.join("/")
    }
}

/// The outcome of one test execution.
///
/// Identified by `(package, test)`. A later result for the same key replaces
/// the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub package: String,
    pub test: String,
    pub passed: bool,
    #[serde(default)]
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub source_line: u32,
}

impl TestResult {
    /// Creates a passing result.
    #[must_use]
    pub fn pass(package: impl Into<String>, test: impl Into<String>, elapsed_seconds: f64) -> Self {
        Self {
            package: package.into(),
            test: test.into(),
            passed: true,
            elapsed_seconds,
            ..Self::default()
        }
    }

    /// Creates a failing result with an error message.
    #[must_use]
    pub fn fail(
        package: impl Into<String>,
        test: impl Into<String>,
        elapsed_seconds: f64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            test: test.into(),
            passed: false,
            elapsed_seconds,
            error: error.into(),
            ..Self::default()
        }
    }

    /// Checks that the result addresses a node and carries a usable duration.
    ///
    /// # Errors
    ///
    /// Returns an [`IngestError`] for an empty package or test name, or a
    /// negative or non-finite elapsed time.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.package.trim().is_empty() {
            return Err(IngestError::EmptyPackage);
        }
        if self.test.trim().is_empty() {
            return Err(IngestError::EmptyTest {
                package: self.package.clone(),
            });
        }
        validate_elapsed(&format!("{}.{}", self.package, self.test), self.elapsed_seconds)
    }
}

/// Lifecycle step of a test invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Running,
    Completed,
}

/// One lifecycle step reported by the test runner.
///
/// A missing `test` means the event is about the whole package. `Completed`
/// events carry the results of the run (none when the package had no tests
/// or failed to build) plus optional package-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerEvent {
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub results: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    /// Statement coverage percentage (`0..=100`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
}

impl RunnerEvent {
    fn new(package: impl Into<String>, status: RunStatus) -> Self {
        Self {
            package: package.into(),
            test: None,
            status,
            results: Vec::new(),
            elapsed_seconds: None,
            coverage: None,
        }
    }

    /// A package-level `Started` event.
    #[must_use]
    pub fn started(package: impl Into<String>) -> Self {
        Self::new(package, RunStatus::Started)
    }

    /// A package-level `Running` event.
    #[must_use]
    pub fn running(package: impl Into<String>) -> Self {
        Self::new(package, RunStatus::Running)
    }

    /// A package-level `Completed` event carrying `results`.
    #[must_use]
    pub fn completed(package: impl Into<String>, results: Vec<TestResult>) -> Self {
        Self {
            results,
            ..Self::new(package, RunStatus::Completed)
        }
    }

    /// Narrows the event to a single test.
    #[must_use]
    pub fn with_test(mut self, test: impl Into<String>) -> Self {
        self.test = Some(test.into());
        self
    }

    /// Attaches the elapsed time of the whole invocation.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed_seconds: f64) -> Self {
        self.elapsed_seconds = Some(elapsed_seconds);
        self
    }

    /// Attaches a coverage percentage.
    #[must_use]
    pub fn with_coverage(mut self, coverage: f64) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Returns `true` if the event concerns the whole package.
    #[must_use]
    pub fn is_package_level(&self) -> bool {
        self.test.is_none()
    }

    /// Checks the event-level fields. Attached results are validated one by
    /// one when they are merged.
    ///
    /// # Errors
    ///
    /// Returns an [`IngestError`] for an empty package, an empty test name,
    /// a bad elapsed time, or coverage outside `0..=100`.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.package.trim().is_empty() {
            return Err(IngestError::EmptyPackage);
        }
        if matches!(&self.test, Some(test) if test.trim().is_empty()) {
            return Err(IngestError::EmptyTest {
                package: self.package.clone(),
            });
        }
        if let Some(elapsed) = self.elapsed_seconds {
            validate_elapsed(&self.package, elapsed)?;
        }
        if let Some(coverage) = self.coverage {
            if !(0.0..=100.0).contains(&coverage) {
                return Err(IngestError::InvalidCoverage {
                    path: self.package.clone(),
                    value: coverage,
                });
            }
        }
        Ok(())
    }
}

fn validate_elapsed(path: &str, value: f64) -> Result<(), IngestError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(IngestError::InvalidElapsed {
            path: path.to_string(),
            value,
        })
    }
}

/// Category of an [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An event was rejected at ingestion.
    MalformedInput,
    /// The runner failed to produce results for a path.
    RunnerFailure,
    /// The file watcher reported a failure.
    Watch,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedInput => write!(f, "malformed input"),
            Self::RunnerFailure => write!(f, "runner failure"),
            Self::Watch => write!(f, "watch"),
        }
    }
}

/// An informational error occurrence.
///
/// Only runner failures that name a package change the tree; everything else
/// is surfaced to logs and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    /// Creates an error event that is not tied to a tree path.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            package: None,
            test: None,
            timestamp: Utc::now(),
        }
    }

    /// A runner failure for a whole package.
    #[must_use]
    pub fn runner_failure(package: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            package: Some(package.into()),
            ..Self::new(ErrorKind::RunnerFailure, message)
        }
    }

    /// Wraps an ingestion rejection.
    #[must_use]
    pub fn malformed(err: &IngestError) -> Self {
        Self::new(ErrorKind::MalformedInput, err.to_string())
    }

    /// Narrows the error to a single test.
    #[must_use]
    pub fn with_test(mut self, test: impl Into<String>) -> Self {
        self.test = Some(test.into());
        self
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.package, &self.test) {
            (Some(package), Some(test)) => {
                write!(f, "{} in {package}.{test}: {}", self.kind, self.message)
            }
            (Some(package), None) => write!(f, "{} in {package}: {}", self.kind, self.message),
            _ => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Why a run was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// A source file in the package changed.
    FileChanged,
    /// The package changed again while its previous run was in flight.
    Rerun,
    /// Requested explicitly through the dispatcher.
    Manual,
}

/// A request for the external runner to test one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub package: String,
    pub reason: TriggerReason,
    pub requested_at: DateTime<Utc>,
}

impl RunRequest {
    #[must_use]
    pub fn new(package: impl Into<String>, reason: TriggerReason) -> Self {
        Self {
            package: package.into(),
            reason,
            requested_at: Utc::now(),
        }
    }
}

/// Anything that can be published into the dispatcher.
///
/// Serialized with an `event` tag so producers outside the process can stream
/// events as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SentinelEvent {
    File(FileEvent),
    Runner(RunnerEvent),
    Result(TestResult),
    Error(ErrorEvent),
}

impl From<FileEvent> for SentinelEvent {
    fn from(event: FileEvent) -> Self {
        Self::File(event)
    }
}

impl From<RunnerEvent> for SentinelEvent {
    fn from(event: RunnerEvent) -> Self {
        Self::Runner(event)
    }
}

impl From<TestResult> for SentinelEvent {
    fn from(result: TestResult) -> Self {
        Self::Result(result)
    }
}

impl From<ErrorEvent> for SentinelEvent {
    fn from(event: ErrorEvent) -> Self {
        Self::Error(event)
    }
}
