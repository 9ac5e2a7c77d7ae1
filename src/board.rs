//! Terminal rendering for the board, status, and event log.
//!
//! All colouring and layout lives here (and in `main.rs`); the core
//! never reads presentation state.

use anyhow::Result;
use chrono::Local;

use crate::core::types::TaskStatus;
use crate::io::store::{Store, WorkItem};

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const BLUE: &str = "\x1b[34m";
pub const MAGENTA: &str = "\x1b[35m";
pub const CYAN: &str = "\x1b[36m";
pub const WHITE: &str = "\x1b[37m";

const COLUMN_WIDTH: usize = 24;

pub fn status_color(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Backlog => WHITE,
        TaskStatus::InProgress => BLUE,
        TaskStatus::Blocked => RED,
        TaskStatus::Review => MAGENTA,
        TaskStatus::Done => GREEN,
        TaskStatus::Failed | TaskStatus::Cancelled => RED,
    }
}

pub fn priority_color(priority: &str) -> &'static str {
    match priority {
        "high" => RED,
        "low" => DIM,
        _ => YELLOW,
    }
}

/// The kanban board: one column per active status.
pub fn render_board(store: &Store) -> Result<String> {
    let items = store.list(None)?;
    if items.is_empty() {
        return Ok(format!(
            "{DIM}Board is empty.{RESET} Create an epic: {CYAN}hive epic create \"description\"{RESET}\n"
        ));
    }

    let columns: [(TaskStatus, &str, &str); 5] = [
        (TaskStatus::Backlog, "BACKLOG", WHITE),
        (TaskStatus::InProgress, "IN PROGRESS", BLUE),
        (TaskStatus::Blocked, "BLOCKED", RED),
        (TaskStatus::Review, "REVIEW", MAGENTA),
        (TaskStatus::Done, "DONE", GREEN),
    ];

    let cells: Vec<Vec<String>> = columns
        .iter()
        .map(|(status, _, _)| {
            items
                .iter()
                .filter(|item| item.status == *status)
                .map(card_label)
                .collect()
        })
        .collect();

    let mut out = String::new();
    for (_, label, color) in &columns {
        out.push_str(&format!("{color}{BOLD}{label:<COLUMN_WIDTH$}{RESET}"));
    }
    out.push('\n');
    for _ in &columns {
        out.push_str(&format!("{}", "─".repeat(COLUMN_WIDTH - 2)));
        out.push_str("  ");
    }
    out.push('\n');

    let rows = cells.iter().map(Vec::len).max().unwrap_or(0);
    for row in 0..rows {
        for cell in &cells {
            match cell.get(row) {
                Some(label) => out.push_str(&format!("{label:<COLUMN_WIDTH$}")),
                None => out.push_str(&" ".repeat(COLUMN_WIDTH)),
            }
        }
        out.push('\n');
    }

    // Failed tasks have no column; list them below the board.
    let failed: Vec<&WorkItem> = items
        .iter()
        .filter(|item| item.status == TaskStatus::Failed)
        .collect();
    if !failed.is_empty() {
        out.push('\n');
        out.push_str(&format!("{BOLD}{RED}✗  Failed tasks{RESET}\n"));
        for task in failed {
            out.push_str(&format!(
                "  {YELLOW}#{}{RESET}: {}{}\n",
                task.id,
                task.title,
                agent_suffix(task)
            ));
        }
    }

    Ok(out)
}

fn agent_suffix(item: &WorkItem) -> String {
    if item.assigned_agent.is_empty() {
        String::new()
    } else {
        format!(" [{}]", item.assigned_agent)
    }
}

fn card_label(item: &WorkItem) -> String {
    let marker = match item.kind {
        crate::core::types::TaskKind::Epic => "E",
        crate::core::types::TaskKind::Task => "",
    };
    let label = format!("{marker}#{} {}", item.id, item.title);
    truncate_pad(&label, COLUMN_WIDTH - 2)
}

fn truncate_pad(s: &str, width: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= width {
        return s.to_string();
    }
    let mut out: String = chars[..width.saturating_sub(1)].iter().collect();
    out.push('…');
    out
}

/// Counts per status plus open blockers needing the user.
pub fn render_status(store: &Store) -> Result<String> {
    let items = store.list(None)?;
    if items.is_empty() {
        return Ok(format!(
            "No tasks. Run: {CYAN}hive epic create \"description\"{RESET}\n"
        ));
    }

    let count = |status: TaskStatus| items.iter().filter(|t| t.status == status).count();

    let mut out = format!("{BOLD}Tasks: {} total{RESET}\n", items.len());
    out.push_str(&format!(
        "  {:<14} {WHITE}{}{RESET}\n",
        "backlog:",
        count(TaskStatus::Backlog)
    ));
    out.push_str(&format!(
        "  {:<14} {BLUE}{}{RESET}\n",
        "in_progress:",
        count(TaskStatus::InProgress)
    ));
    out.push_str(&format!(
        "  {:<14} {RED}{}{RESET}\n",
        "blocked:",
        count(TaskStatus::Blocked)
    ));
    out.push_str(&format!(
        "  {:<14} {MAGENTA}{}{RESET}\n",
        "review:",
        count(TaskStatus::Review)
    ));
    out.push_str(&format!(
        "  {:<14} {GREEN}{}{RESET}\n",
        "done:",
        count(TaskStatus::Done)
    ));
    out.push_str(&format!(
        "  {:<14} {RED}{}{RESET}\n",
        "failed:",
        count(TaskStatus::Failed)
    ));
    out.push_str(&format!(
        "  {:<14} {DIM}{}{RESET}\n",
        "cancelled:",
        count(TaskStatus::Cancelled)
    ));

    let blocked: Vec<_> = items
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .collect();
    if !blocked.is_empty() {
        out.push_str(&format!("\n{RED}{BOLD}Blockers (need your input):{RESET}\n"));
        for task in blocked {
            out.push_str(&format!(
                "  {YELLOW}#{}{RESET}: {}\n",
                task.id, task.blocked_reason
            ));
        }
    }

    let failed: Vec<_> = items
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .collect();
    if !failed.is_empty() {
        out.push_str(&format!("\n{RED}{BOLD}✗  Failed tasks:{RESET}\n"));
        for task in failed {
            out.push_str(&format!(
                "  {YELLOW}#{}{RESET}: {}{}\n",
                task.id,
                task.title,
                agent_suffix(task)
            ));
        }
    }

    Ok(out)
}

/// The full event log for one work item.
pub fn render_log(store: &Store, id: i64) -> Result<String> {
    let events = store.events(id)?;
    if events.is_empty() {
        return Ok(format!("No events for work item #{id}\n"));
    }

    let mut out = format!("Events for work item #{id}:\n\n");
    for event in events {
        let agent = if event.agent.is_empty() {
            String::new()
        } else {
            format!("[{}] ", event.agent)
        };
        out.push_str(&format!(
            "  {}  {agent}{:<14} {}\n",
            event
                .timestamp
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.content
        ));
    }
    Ok(out)
}

/// One list line for an epic or task.
pub fn item_line(item: &WorkItem, progress: Option<(usize, usize)>) -> String {
    let status_col = status_color(item.status);
    let pri_col = priority_color(&item.priority);

    let progress = match progress {
        Some((done, total)) if total > 0 => format!(" [{done}/{total} tasks]"),
        _ => String::new(),
    };
    let branch = if item.git_branch.is_empty() {
        String::new()
    } else {
        format!(" {DIM}({}){RESET}", item.git_branch)
    };
    let agent = if item.assigned_agent.is_empty() {
        String::new()
    } else {
        format!(" {CYAN}[{}]{RESET}", item.assigned_agent)
    };
    let blocked = if item.status == TaskStatus::Blocked {
        format!(" {RED}⚠ {}{RESET}", item.blocked_reason)
    } else {
        String::new()
    };

    format!(
        "{YELLOW}#{:<4}{RESET} {status_col}{:<12}{RESET} {pri_col}{:<6}{RESET} {}{progress}{agent}{blocked}{branch}",
        item.id,
        item.status.to_string(),
        item.priority,
        item.title,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_board_suggests_creating_an_epic() {
        let store = Store::open_in_memory().expect("store");
        let board = render_board(&store).expect("board");
        assert!(board.contains("Board is empty"));
    }

    #[test]
    fn board_places_items_in_their_columns() {
        let store = Store::open_in_memory().expect("store");
        let epic = store.create_epic("Ship auth", "", "high").expect("epic");
        let task = store
            .create_task("Write tests", "", "", Some(epic.id))
            .expect("task");
        store
            .update_status(task.id, TaskStatus::InProgress)
            .expect("status");

        let board = render_board(&store).expect("board");
        assert!(board.contains("BACKLOG"));
        assert!(board.contains("IN PROGRESS"));
        assert!(board.contains("Ship auth"));
        assert!(board.contains("Write tests"));
    }

    #[test]
    fn board_lists_failed_tasks_below_the_columns() {
        let store = Store::open_in_memory().expect("store");
        let task = store
            .create_task("Flaky migration", "", "", None)
            .expect("task");
        store.assign(task.id, "coder", "coder").expect("assign");
        store
            .update_status(task.id, TaskStatus::Failed)
            .expect("failed");

        let board = render_board(&store).expect("board");
        assert!(board.contains("Failed tasks"));
        assert!(board.contains("Flaky migration"));
        assert!(board.contains("[coder]"));
    }

    #[test]
    fn status_lists_open_blockers() {
        let store = Store::open_in_memory().expect("store");
        let task = store.create_task("T", "", "", None).expect("task");
        store.block(task.id, "which port?").expect("block");

        let status = render_status(&store).expect("status");
        assert!(status.contains("Blockers"));
        assert!(status.contains("which port?"));
    }

    #[test]
    fn status_lists_failed_tasks_individually() {
        let store = Store::open_in_memory().expect("store");
        let task = store.create_task("Broken build", "", "", None).expect("task");
        store
            .update_status(task.id, TaskStatus::Failed)
            .expect("failed");

        let status = render_status(&store).expect("status");
        assert!(status.contains("Failed tasks"));
        assert!(status.contains("Broken build"));
    }

    #[test]
    fn log_renders_all_events() {
        let store = Store::open_in_memory().expect("store");
        let task = store.create_task("T", "", "", None).expect("task");
        store
            .add_event(task.id, "coder", "agent_output", "preview text")
            .expect("event");

        let log = render_log(&store, task.id).expect("log");
        assert!(log.contains("created"));
        assert!(log.contains("[coder] agent_output"));
        assert!(log.contains("preview text"));
    }
}
