//! Shared deterministic types for harness core logic.
//!
//! These types define stable contracts between core components and the wire
//! formats exposed to the UI. They do not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Semantic category of a file path targeted by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathCategory {
    Protected,
    Config,
    Code,
    Test,
    Docs,
    Other,
}

impl PathCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            PathCategory::Protected => "protected",
            PathCategory::Config => "config",
            PathCategory::Code => "code",
            PathCategory::Test => "test",
            PathCategory::Docs => "docs",
            PathCategory::Other => "other",
        }
    }
}

impl fmt::Display for PathCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic kind of an operation, derived from a tool or command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ToolRead,
    ToolWrite,
    ToolEdit,
    ToolBash,
    GitCommit,
    GitPush,
    GitPr,
    GitRelease,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::ToolRead => "tool_read",
            OperationKind::ToolWrite => "tool_write",
            OperationKind::ToolEdit => "tool_edit",
            OperationKind::ToolBash => "tool_bash",
            OperationKind::GitCommit => "git_commit",
            OperationKind::GitPush => "git_push",
            OperationKind::GitPr => "git_pr",
            OperationKind::GitRelease => "git_release",
        }
    }

    /// True for operations that mutate git history or remotes.
    pub fn is_git(self) -> bool {
        matches!(
            self,
            OperationKind::GitCommit
                | OperationKind::GitPush
                | OperationKind::GitPr
                | OperationKind::GitRelease
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a policy lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyBehavior {
    Allow,
    Ask,
    Deny,
}

impl PolicyBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyBehavior::Allow => "allow",
            PolicyBehavior::Ask => "ask",
            PolicyBehavior::Deny => "deny",
        }
    }
}

impl fmt::Display for PolicyBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger workflow topology.
///
/// - `solo`: one operator; `cc:完了` means done.
/// - `2agent`: PM + implementer; `cc:完了` waits in review for PM sign-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowMode {
    #[default]
    #[serde(rename = "solo")]
    Solo,
    #[serde(rename = "2agent")]
    TwoAgent,
}

impl WorkflowMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowMode::Solo => "solo",
            WorkflowMode::TwoAgent => "2agent",
        }
    }

    /// Lenient parse used for query parameters: anything but `2agent` is solo.
    pub fn from_param(raw: Option<&str>) -> Self {
        match raw {
            Some("2agent") => WorkflowMode::TwoAgent,
            _ => WorkflowMode::Solo,
        }
    }
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role performing a ledger transition in two-agent mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Pm,
    Impl,
}

impl ActorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::Pm => "pm",
            ActorRole::Impl => "impl",
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kanban column a ledger task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Plan,
    Work,
    Review,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Plan,
        TaskStatus::Work,
        TaskStatus::Review,
        TaskStatus::Done,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Where a ledger task came from. Doubles as the optimistic-concurrency token
/// for later writes: a writer must present the same line number and content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSource {
    /// 1-based line number.
    pub line_number: usize,
    /// Exact line content as observed at parse time.
    pub original_line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// A single ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<TaskSource>,
}
