//! Shared types for work items and parsed agent output.
//!
//! These define stable contracts between components and must stay
//! deterministic: the store persists them as strings, the parser and
//! pipeline match on them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a work item on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Blocked,
    Review,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "backlog" => Some(TaskStatus::Backlog),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "review" => Some(TaskStatus::Review),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a work item is a user-created epic or an agent-sized task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Epic,
    Task,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Epic => "epic",
            TaskKind::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<TaskKind> {
        match s {
            "epic" => Some(TaskKind::Epic),
            "task" => Some(TaskKind::Task),
            _ => None,
        }
    }

    /// Human label used in event content and CLI output.
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Epic => "Epic",
            TaskKind::Task => "Task",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subtask extracted from planner output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSubtask {
    pub title: String,
    pub description: String,
    /// `high`, `medium`, or `low`; defaults to `medium`.
    pub priority: String,
}

/// Reviewer verdict extracted from free-form review output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Reject => "reject",
        }
    }
}

/// A parsed review: verdict (if any) plus extracted comment bullets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedReview {
    pub verdict: Option<Verdict>,
    pub comments: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Backlog,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Review,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn kind_round_trips_through_strings() {
        assert_eq!(TaskKind::parse("epic"), Some(TaskKind::Epic));
        assert_eq!(TaskKind::parse("task"), Some(TaskKind::Task));
        assert_eq!(TaskKind::parse(""), None);
    }
}
