//! Shared deterministic types for the executor.
//!
//! These types define stable contracts between components and the persisted
//! representation. String forms (`as_str`/`parse`) are stored in SQLite and
//! returned over the HTTP API, so they must not change.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Exact model output that signals "no changes needed".
pub const NO_CHANGES_SENTINEL: &str = "NO_CHANGES";

/// Lifecycle state of a task.
///
/// `running` is re-entrant across iterations; `completed` and `failed` are
/// terminal and immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(TaskState::Queued),
            "running" => Some(TaskState::Running),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end request to modify a project per a natural-language prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    /// Original change request. Never rewritten after creation.
    pub prompt: String,
    pub source_branch: String,
    pub target_branch: String,
    /// Number of successfully applied iterations.
    pub iteration: u32,
    /// Consecutive `generate_diff` exhaustions, reset on any successful apply.
    pub consecutive_failures: u32,
    /// Consecutive patch-application failures, reset on any successful apply.
    pub apply_failures: u32,
    pub state: TaskState,
    /// Human-readable reason attached to terminal states.
    pub reason: Option<String>,
    pub cancel_requested: bool,
    pub pr_url: Option<String>,
    pub pr_remote_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A registered local working copy of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub remote_url: Option<String>,
    pub created_at: String,
    pub last_synced_at: Option<String>,
}

/// Append-only task log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Store-wide monotonic sequence; readers order by it.
    pub seq: i64,
    pub task_id: String,
    pub timestamp: String,
    pub severity: Severity,
    /// Task state at the moment the event was appended.
    pub phase: TaskState,
    pub message: String,
}

/// Successful result of one `generate_diff` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Sanitized, structurally valid unified diff.
    Diff(String),
    /// The model answered with [`NO_CHANGES_SENTINEL`].
    NoChanges,
}

/// Classified result of a single model attempt inside `generate_diff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Success(String),
    Sentinel,
    /// Sanitization or validation rejected the output.
    ContentError(String),
    /// The model call itself failed or timed out.
    TransportError(String),
}

impl AttemptResult {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptResult::Success(_) => "valid diff",
            AttemptResult::Sentinel => "no changes",
            AttemptResult::ContentError(_) => "content error",
            AttemptResult::TransportError(_) => "transport error",
        }
    }
}

/// Result of the preflight collaborator after a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreflightOutcome {
    Pass,
    Fail,
    /// No preflight command configured.
    Skipped,
}

impl PreflightOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PreflightOutcome::Pass => "pass",
            PreflightOutcome::Fail => "fail",
            PreflightOutcome::Skipped => "skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_strings_round_trip() {
        for state in [
            TaskState::Queued,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("done"), None);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }

    #[test]
    fn task_state_serializes_lowercase() {
        let json = serde_json::to_string(&TaskState::Running).expect("serialize");
        assert_eq!(json, "\"running\"");
    }
}
