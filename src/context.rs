//! Builds the prompt an agent receives from task data.
//!
//! This is how information travels between agents: the prompt is a
//! "ticket" assembled from the work item, its parent, the event history
//! (user answers to blockers, review comments, architect specs), and,
//! for reviewers, the current diff. Sections are joined with blank
//! lines in a fixed order.

use std::path::Path;

use anyhow::Result;

use crate::core::types::TaskKind;
use crate::io::git::Git;
use crate::io::store::{Store, WorkItem};

/// Event types worth replaying to the next agent working on a task.
const HISTORY_EVENT_TYPES: &[&str] = &[
    "unblocked",
    "comment",
    "reviewed",
    "completed",
    "architect_spec",
];

/// Diffs beyond this size are cut before being embedded in a prompt.
const MAX_DIFF_BYTES: usize = 8 * 1024;

/// Constructs full prompts for agents working on tasks.
pub struct ContextBuilder<'a> {
    store: &'a Store,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Full prompt for an agent working on a task in the given role.
    pub fn build_prompt(&self, task: &WorkItem, role: &str) -> Result<String> {
        let mut parts = vec![role_header(role), task_section(task)];

        if let Some(parent_id) = task.parent_id {
            if let Some(section) = self.parent_section(parent_id)? {
                parts.push(section);
            }
        }

        if let Some(history) = self.history_section(task.id)? {
            parts.push(history);
        }

        let instructions = role_instructions(role);
        if !instructions.is_empty() {
            parts.push(instructions.to_string());
        }

        Ok(parts.join("\n\n"))
    }

    /// Reviewer prompt: the task context plus the current diff from
    /// `diff_workdir`, so isolated tasks are reviewed against their own
    /// worktree.
    pub fn build_review_prompt(&self, task: &WorkItem, diff_workdir: &Path) -> Result<String> {
        let mut parts = vec![role_header("reviewer"), task_section(task)];

        if let Some(parent_id) = task.parent_id {
            if let Some(section) = self.parent_section(parent_id)? {
                parts.push(section);
            }
        }

        let diff = current_diff(diff_workdir);
        if !diff.is_empty() {
            parts.push(format!("## Changes (git diff)\n```diff\n{diff}\n```"));
        }

        if let Some(history) = self.history_section(task.id)? {
            parts.push(history);
        }

        parts.push(role_instructions("reviewer").to_string());
        Ok(parts.join("\n\n"))
    }

    fn parent_section(&self, parent_id: i64) -> Result<Option<String>> {
        let Ok(parent) = self.store.get(parent_id) else {
            return Ok(None);
        };

        let label = match parent.kind {
            TaskKind::Epic => "Parent Epic",
            TaskKind::Task => "Parent Task",
        };
        let mut section = format!("## {label} (for context)\n**#{}: {}**", parent.id, parent.title);
        if !parent.description.is_empty() {
            section.push('\n');
            section.push_str(&parent.description);
        }
        Ok(Some(section))
    }

    fn history_section(&self, task_id: i64) -> Result<Option<String>> {
        let events = self.store.events(task_id)?;
        let relevant: Vec<_> = events
            .iter()
            .filter(|e| HISTORY_EVENT_TYPES.contains(&e.event_type.as_str()))
            .collect();
        if relevant.is_empty() {
            return Ok(None);
        }

        let mut section = String::from("## History\nPrevious interactions on this task:\n");
        for event in relevant {
            let agent = if event.agent.is_empty() {
                "system"
            } else {
                &event.agent
            };
            section.push_str(&format!(
                "\n- [{agent}] {}: {}",
                event.event_type, event.content
            ));
        }
        Ok(Some(section))
    }
}

/// The diff a reviewer should look at: unstaged changes first, then
/// staged, then the last commit.
fn current_diff(workdir: &Path) -> String {
    let git = Git::new(workdir);
    let sources: [fn(&Git) -> anyhow::Result<String>; 3] = [
        Git::diff_unstaged,
        Git::diff_staged,
        Git::diff_last_commit,
    ];
    for source in sources {
        if let Ok(diff) = source(&git) {
            if !diff.is_empty() {
                return truncate_diff(diff);
            }
        }
    }
    String::new()
}

/// Bound the diff so it cannot blow up the prompt.
fn truncate_diff(diff: String) -> String {
    let total = diff.len();
    if total <= MAX_DIFF_BYTES {
        return diff;
    }
    let mut cut = MAX_DIFF_BYTES;
    while !diff.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n\n... (diff truncated, {total} bytes total)",
        &diff[..cut]
    )
}

fn task_section(task: &WorkItem) -> String {
    let mut section = format!(
        "## Task\n**#{}: {}**\nPriority: {}",
        task.id, task.title, task.priority
    );
    if !task.description.is_empty() {
        section.push_str(&format!("\n\n### Description\n{}", task.description));
    }
    section
}

fn role_header(role: &str) -> String {
    match role {
        "planner" => "# You are a Planner\n\
            Your job is to break this work item into small, actionable subtasks \
            that another agent can implement independently.\n\
            Critical rules:\n\
            - Explore the repository first; base every subtask on code that actually exists.\n\
            - Each subtask must be independently implementable and verifiable.\n\
            - Do not write code."
            .to_string(),
        "architect" => "# You are an Architect\n\
            Your job is to produce a short implementation spec for this task before any code is written.\n\
            Critical rules:\n\
            - Do not write code; describe the change.\n\
            - Name the real files and functions the coder must touch."
            .to_string(),
        "coder" => "# You are a Software Developer\n\
            Your job is to implement the task by editing files in the working directory. \
            Write clean, tested code.\n\
            Critical rules:\n\
            - Actually edit the files; never only describe what you would change.\n\
            - If the history contains an architect spec, follow it."
            .to_string(),
        "reviewer" => "# You are a Code Reviewer\n\
            Your job is to review the changes made for this task. \
            Focus on bugs, security issues, and logic errors. Ignore style nitpicks.\n\
            Critical rules:\n\
            - Rank findings by severity.\n\
            - REJECT only for critical or high severity issues."
            .to_string(),
        other => format!("# You are working as: {other}"),
    }
}

fn role_instructions(role: &str) -> &'static str {
    match role {
        "planner" => {
            "## Response Format\n\
            Break the task into subtasks:\n\n\
            SUBTASKS:\n\
            1. [title] - [description] (priority: high/medium/low)\n\
            2. [title] - [description] (priority: high/medium/low)\n\
            ...\n\n\
            Your entire response must be only the SUBTASKS block.\n\
            If you need clarification from the user, respond with only:\n\
            BLOCKED: [your question]"
        }
        "architect" => {
            "## Response Format\n\
            Respond in this exact format:\n\n\
            SPEC:\n\
            [the files to touch and the change to make in each]\n\n\
            SUMMARY:\n\
            [one-paragraph summary of the approach]\n\n\
            If you need clarification from the user, say:\n\
            BLOCKED: [your question]"
        }
        "coder" => {
            "## Instructions\n\
            - Make the changes needed to complete this task and run the tests.\n\
            - Edit files directly; do not just propose changes.\n\
            - Focus on the specific task; don't refactor unrelated code.\n\
            - Use BLOCKED: [your question] only for genuine ambiguity you cannot \
            resolve from the repository."
        }
        "reviewer" => {
            "## Response Format\n\
            Respond in this exact format:\n\n\
            VERDICT: APPROVE or REJECT\n\n\
            COMMENTS:\n\
            - [SEVERITY] file:line: description of issue\n\n\
            If approving, briefly explain why the changes look good.\n\
            If rejecting, list the critical/high issues that must be fixed."
        }
        _ => "",
    }
}
