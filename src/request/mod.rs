//! Request data model -- kinds, modes, lifecycle states, summaries, result items.

pub mod filter;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::filter::{ExecutionFilter, FilterError};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {field} value '{value}'")]
pub struct ParseEnumError {
    pub field: &'static str,
    pub value: String,
}

/// What a request asks the host to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    RunAll,
    RunClass,
    RunMethod,
    RunCategory,
    RefreshFull,
    RefreshPaths,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::RunAll => "run-all",
            RequestKind::RunClass => "run-class",
            RequestKind::RunMethod => "run-method",
            RequestKind::RunCategory => "run-category",
            RequestKind::RefreshFull => "refresh-full",
            RequestKind::RefreshPaths => "refresh-paths",
        }
    }

    pub fn is_refresh(&self) -> bool {
        matches!(self, RequestKind::RefreshFull | RequestKind::RefreshPaths)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run-all" => Ok(RequestKind::RunAll),
            "run-class" => Ok(RequestKind::RunClass),
            "run-method" => Ok(RequestKind::RunMethod),
            "run-category" => Ok(RequestKind::RunCategory),
            "refresh-full" => Ok(RequestKind::RefreshFull),
            "refresh-paths" => Ok(RequestKind::RefreshPaths),
            other => Err(ParseEnumError {
                field: "kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Host execution mode the request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetMode {
    EditorMode,
    PlayMode,
    Both,
}

impl TargetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMode::EditorMode => "editor-mode",
            TargetMode::PlayMode => "play-mode",
            TargetMode::Both => "both",
        }
    }

    /// Whether the host's completion callbacks can be trusted in this mode.
    ///
    /// Anything that needs a runtime-mode switch may lose its finish callback
    /// or report a null result.
    pub fn callbacks_reliable(&self) -> bool {
        matches!(self, TargetMode::EditorMode)
    }
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TargetMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "editor-mode" | "edit" => Ok(TargetMode::EditorMode),
            "play-mode" | "play" => Ok(TargetMode::PlayMode),
            "both" => Ok(TargetMode::Both),
            other => Err(ParseEnumError {
                field: "target mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Request lifecycle: `pending -> running -> {completed | failed | cancelled}`,
/// plus `pending -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Running => "running",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "running" => Ok(RequestStatus::Running),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            "cancelled" => Ok(RequestStatus::Cancelled),
            other => Err(ParseEnumError {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Classifier persisted next to a failed request's error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvocationError,
    Timeout,
    ParseError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvocationError => "invocation-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ParseError => "parse-error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invocation-error" => Ok(ErrorKind::InvocationError),
            "timeout" => Ok(ErrorKind::Timeout),
            "parse-error" => Ok(ErrorKind::ParseError),
            "cancelled" => Ok(ErrorKind::Cancelled),
            other => Err(ParseEnumError {
                field: "error kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome of a single executed item (one test case, one refresh).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    Passed,
    Failed,
    Skipped,
    Inconclusive,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Passed => "passed",
            ItemOutcome::Failed => "failed",
            ItemOutcome::Skipped => "skipped",
            ItemOutcome::Inconclusive => "inconclusive",
        }
    }
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ItemOutcome {
    type Err = ParseEnumError;

    /// Case-insensitive; also accepts the runner's `Ignored`/`Error` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passed" | "pass" | "success" => Ok(ItemOutcome::Passed),
            "failed" | "fail" | "failure" | "error" => Ok(ItemOutcome::Failed),
            "skipped" | "skip" | "ignored" => Ok(ItemOutcome::Skipped),
            "inconclusive" => Ok(ItemOutcome::Inconclusive),
            _ => Err(ParseEnumError {
                field: "outcome",
                value: s.to_string(),
            }),
        }
    }
}

/// Summary counters recorded when a request reaches a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_secs: f64,
}

impl Summary {
    /// Count one finished item into the running totals.
    pub fn record(&mut self, outcome: ItemOutcome, duration_secs: f64) {
        self.total += 1;
        match outcome {
            ItemOutcome::Passed => self.passed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Inconclusive => {}
        }
        self.duration_secs += duration_secs;
    }

    pub fn from_items(items: &[NewResultItem]) -> Self {
        let mut summary = Summary::default();
        for item in items {
            summary.record(item.outcome, item.duration_secs);
        }
        summary
    }

    /// True when both summaries carry the same counters and their durations
    /// agree to within `tolerance_secs`.
    pub fn agrees_with(&self, other: &Summary, tolerance_secs: f64) -> bool {
        self.total == other.total
            && self.passed == other.passed
            && self.failed == other.failed
            && self.skipped == other.skipped
            && (self.duration_secs - other.duration_secs).abs() <= tolerance_secs
    }
}

/// A request row as stored.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: i64,
    pub kind: RequestKind,
    pub filter: Option<String>,
    pub target_mode: TargetMode,
    pub status: RequestStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub summary: Summary,
}

/// What a controller submits.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub kind: RequestKind,
    pub filter: Option<String>,
    pub target_mode: TargetMode,
    pub priority: i64,
}

impl NewRequest {
    pub fn new(kind: RequestKind, target_mode: TargetMode) -> Self {
        Self {
            kind,
            filter: None,
            target_mode,
            priority: 0,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// A per-item result, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResultItem {
    pub name: String,
    pub outcome: ItemOutcome,
    pub duration_secs: f64,
    pub message: Option<String>,
    pub stack_trace: Option<String>,
}

/// A persisted per-item result.
#[derive(Debug, Clone, Serialize)]
pub struct ResultItem {
    pub id: i64,
    pub request_id: i64,
    pub name: String,
    pub outcome: ItemOutcome,
    pub duration_secs: f64,
    pub message: Option<String>,
    pub stack_trace: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A failure recorded on a request row.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything written in the running -> terminal transition.
#[derive(Debug, Clone)]
pub struct TerminalRecord {
    pub status: RequestStatus,
    pub summary: Summary,
    pub failure: Option<Failure>,
    pub items: Vec<NewResultItem>,
}

impl TerminalRecord {
    pub fn completed(summary: Summary, items: Vec<NewResultItem>) -> Self {
        Self {
            status: RequestStatus::Completed,
            summary,
            failure: None,
            items,
        }
    }

    pub fn failed(failure: Failure, summary: Summary, items: Vec<NewResultItem>) -> Self {
        Self {
            status: RequestStatus::Failed,
            summary,
            failure: Some(failure),
            items,
        }
    }
}
