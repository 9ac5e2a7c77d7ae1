//! Durable state for the board: work items, events, artifacts, reviews,
//! and pipeline runs, backed by SQLite in WAL mode.
//!
//! The connection sits behind a mutex, so the store is `Send + Sync` and
//! serialises its own writes. Every status mutation appends its event in
//! the same transaction: a reader that observes the new status also
//! observes the event. Block/unblock are compound operations that change
//! status, update the reason, and log atomically.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;

use crate::core::status::{can_transition, is_terminal};
use crate::core::types::{TaskKind, TaskStatus, Verdict};

/// A unit of work on the board: a user-created epic or an agent-sized
/// task underneath one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub kind: TaskKind,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_agent: String,
    pub role: String,
    /// high, medium, low.
    pub priority: String,
    /// Non-empty exactly when status is `blocked`.
    pub blocked_reason: String,
    /// Safety branch for epics; immutable once set.
    pub git_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Something that happened to a work item. Append-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: i64,
    pub task_id: i64,
    /// Agent name, `"user"`, or empty for system actions.
    pub agent: String,
    pub event_type: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Metadata for a verbatim agent output saved under `.hive/runs/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: i64,
    pub task_id: i64,
    /// plan, architect, code, review.
    pub kind: String,
    pub file_path: String,
    pub timestamp: DateTime<Utc>,
}

/// Denormalised summary of one reviewer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub id: i64,
    pub task_id: i64,
    pub reviewer_agent: String,
    /// approve or reject.
    pub verdict: String,
    pub comments: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome state of one `hive auto` invocation on an epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Blocked,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "blocked" => Some(RunStatus::Blocked),
            "interrupted" => Some(RunStatus::Interrupted),
            _ => None,
        }
    }
}

/// One record per pipeline invocation, kept for crash resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    pub id: i64,
    pub epic_id: i64,
    pub status: RunStatus,
    pub max_loops: u32,
    pub parallel: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Access to the hive database.
pub struct Store {
    conn: Mutex<Connection>,
}

const ITEM_COLUMNS: &str = "id, parent_id, kind, title, description, status, assigned_agent, \
     role, priority, blocked_reason, git_branch, created_at, updated_at";

impl Store {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(db_path: &Path) -> Result<Store> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database {}", db_path.display()))?;

        // WAL for concurrent readers while the pipeline writes.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .context("set WAL mode")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("set busy timeout")?;

        migrate(&conn).context("migrate")?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        migrate(&conn).context("migrate")?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-operation;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new epic.
    pub fn create_epic(&self, title: &str, description: &str, priority: &str) -> Result<WorkItem> {
        self.create_item(TaskKind::Epic, title, description, priority, None)
    }

    /// Insert a new task, optionally under an epic.
    pub fn create_task(
        &self,
        title: &str,
        description: &str,
        priority: &str,
        parent_id: Option<i64>,
    ) -> Result<WorkItem> {
        self.create_item(TaskKind::Task, title, description, priority, parent_id)
    }

    fn create_item(
        &self,
        kind: TaskKind,
        title: &str,
        description: &str,
        priority: &str,
        parent_id: Option<i64>,
    ) -> Result<WorkItem> {
        let priority = if priority.is_empty() {
            "medium"
        } else {
            priority
        };
        let now = Utc::now();

        let mut conn = self.lock();
        let tx = conn.transaction().context("begin transaction")?;

        if let Some(pid) = parent_id {
            let parent_kind: Option<String> = tx
                .query_row("SELECT kind FROM tasks WHERE id = ?1", params![pid], |row| {
                    row.get(0)
                })
                .ok();
            match parent_kind.as_deref() {
                Some("epic") => {}
                Some(_) => bail!("parent #{pid} is not an epic"),
                None => bail!("parent #{pid} not found"),
            }
        }

        tx.execute(
            "INSERT INTO tasks (kind, title, description, status, priority, parent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                kind.as_str(),
                title,
                description,
                TaskStatus::Backlog.as_str(),
                priority,
                parent_id,
                now,
                now
            ],
        )
        .with_context(|| format!("insert {kind}"))?;
        let id = tx.last_insert_rowid();

        insert_event(
            &tx,
            id,
            "",
            "created",
            &format!("{} created: {title}", kind.label()),
        )?;
        tx.commit().context("commit")?;

        debug!(id, kind = %kind, "created work item");
        Ok(WorkItem {
            id,
            parent_id,
            kind,
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Backlog,
            assigned_agent: String::new(),
            role: String::new(),
            priority: priority.to_string(),
            blocked_reason: String::new(),
            git_branch: String::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a single work item by id.
    pub fn get(&self, id: i64) -> Result<WorkItem> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            map_item,
        )
        .map_err(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => anyhow!("work item #{id} not found"),
            other => anyhow!(other).context("query work item"),
        })
    }

    /// All items (epics and tasks), optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<WorkItem>> {
        match status {
            Some(s) => self.query_items(
                &format!("SELECT {ITEM_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id"),
                params![s.as_str()],
            ),
            None => self.query_items(
                &format!("SELECT {ITEM_COLUMNS} FROM tasks ORDER BY id"),
                params![],
            ),
        }
    }

    /// All epics, optionally filtered by status.
    pub fn list_epics(&self, status: Option<TaskStatus>) -> Result<Vec<WorkItem>> {
        match status {
            Some(s) => self.query_items(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM tasks WHERE kind = 'epic' AND status = ?1 ORDER BY id"
                ),
                params![s.as_str()],
            ),
            None => self.query_items(
                &format!("SELECT {ITEM_COLUMNS} FROM tasks WHERE kind = 'epic' ORDER BY id"),
                params![],
            ),
        }
    }

    /// All items with kind `task`, optionally filtered by status.
    pub fn list_only_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<WorkItem>> {
        match status {
            Some(s) => self.query_items(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM tasks WHERE kind = 'task' AND status = ?1 ORDER BY id"
                ),
                params![s.as_str()],
            ),
            None => self.query_items(
                &format!("SELECT {ITEM_COLUMNS} FROM tasks WHERE kind = 'task' ORDER BY id"),
                params![],
            ),
        }
    }

    /// All children of an epic.
    pub fn list_children(&self, epic_id: i64) -> Result<Vec<WorkItem>> {
        self.query_items(
            &format!("SELECT {ITEM_COLUMNS} FROM tasks WHERE parent_id = ?1 ORDER BY id"),
            params![epic_id],
        )
    }

    fn query_items(
        &self,
        query: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<WorkItem>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(query).context("prepare query")?;
        let rows = stmt.query_map(params, map_item).context("query tasks")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("scan tasks")
    }

    /// Change the status of a work item and log the transition.
    ///
    /// Rejects transitions out of terminal states and transitions into
    /// `blocked` (use [`Store::block`]). Leaving `blocked` clears the
    /// reason in the same statement.
    pub fn update_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin transaction")?;

        let current = current_status(&tx, id)?;
        if !can_transition(current, status) {
            bail!("work item #{id}: invalid status transition {current} -> {status}");
        }

        tx.execute(
            "UPDATE tasks SET status = ?1, blocked_reason = '', updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )
        .context("update task status")?;
        insert_event(&tx, id, "", "status_changed", &format!("Status changed to {status}"))?;
        tx.commit().context("commit")?;
        Ok(())
    }

    /// Bind an agent and role to a task.
    pub fn assign(&self, id: i64, agent: &str, role: &str) -> Result<()> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin transaction")?;
        let changed = tx
            .execute(
                "UPDATE tasks SET assigned_agent = ?1, role = ?2, updated_at = ?3 WHERE id = ?4",
                params![agent, role, now, id],
            )
            .context("assign task")?;
        if changed == 0 {
            bail!("work item #{id} not found");
        }
        insert_event(
            &tx,
            id,
            agent,
            "assigned",
            &format!("Assigned to {agent} (role: {role})"),
        )?;
        tx.commit().context("commit")?;
        Ok(())
    }

    /// Mark a task blocked with the question it needs answered.
    /// Status, reason, and event are written atomically.
    pub fn block(&self, id: i64, reason: &str) -> Result<()> {
        if reason.trim().is_empty() {
            bail!("blocked reason must not be empty");
        }
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin transaction")?;

        let current = current_status(&tx, id)?;
        if is_terminal(current) {
            bail!("work item #{id}: cannot block from terminal status {current}");
        }

        tx.execute(
            "UPDATE tasks SET status = ?1, blocked_reason = ?2, updated_at = ?3 WHERE id = ?4",
            params![TaskStatus::Blocked.as_str(), reason, now, id],
        )
        .context("block task")?;
        insert_event(&tx, id, "", "blocked", reason)?;
        tx.commit().context("commit")?;
        Ok(())
    }

    /// Resolve a blocker with the user's answer, returning the task to
    /// the backlog.
    pub fn unblock(&self, id: i64, answer: &str) -> Result<()> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin transaction")?;

        let current = current_status(&tx, id)?;
        if current != TaskStatus::Blocked {
            bail!("work item #{id} is not blocked (status: {current})");
        }

        tx.execute(
            "UPDATE tasks SET status = ?1, blocked_reason = '', updated_at = ?2 WHERE id = ?3",
            params![TaskStatus::Backlog.as_str(), now, id],
        )
        .context("unblock task")?;
        insert_event(&tx, id, "user", "unblocked", &format!("User answered: {answer}"))?;
        tx.commit().context("commit")?;
        Ok(())
    }

    /// Record the safety branch for an epic. Immutable once set.
    pub fn set_git_branch(&self, id: i64, branch: &str) -> Result<()> {
        let now = Utc::now();
        let conn = self.lock();
        let existing: String = conn
            .query_row(
                "SELECT git_branch FROM tasks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => anyhow!("work item #{id} not found"),
                other => anyhow!(other).context("query git branch"),
            })?;
        if !existing.is_empty() && existing != branch {
            bail!("work item #{id}: git branch already set to {existing}");
        }
        conn.execute(
            "UPDATE tasks SET git_branch = ?1, updated_at = ?2 WHERE id = ?3",
            params![branch, now, id],
        )
        .context("set git branch")?;
        Ok(())
    }

    /// Append an event to a work item's log.
    pub fn add_event(&self, task_id: i64, agent: &str, event_type: &str, content: &str) -> Result<()> {
        let conn = self.lock();
        insert_event(&conn, task_id, agent, event_type, content)
    }

    /// All events for a work item in causal order.
    pub fn events(&self, task_id: i64) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, agent, event_type, content, timestamp
                 FROM events WHERE task_id = ?1 ORDER BY timestamp, id",
            )
            .context("prepare events query")?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(Event {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    agent: row.get(2)?,
                    event_type: row.get(3)?,
                    content: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })
            .context("query events")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("scan events")
    }

    /// Record an artifact file for a task.
    pub fn add_artifact(&self, task_id: i64, kind: &str, file_path: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO artifacts (task_id, type, file_path, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, kind, file_path, Utc::now()],
        )
        .context("insert artifact")?;
        Ok(())
    }

    /// All artifacts recorded for a task.
    pub fn artifacts(&self, task_id: i64) -> Result<Vec<Artifact>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, type, file_path, timestamp
                 FROM artifacts WHERE task_id = ?1 ORDER BY id",
            )
            .context("prepare artifacts query")?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(Artifact {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    kind: row.get(2)?,
                    file_path: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })
            .context("query artifacts")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("scan artifacts")
    }

    /// Record a review verdict and its `reviewed` event atomically.
    pub fn add_review(
        &self,
        task_id: i64,
        reviewer_agent: &str,
        verdict: Verdict,
        comments: &str,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin transaction")?;
        tx.execute(
            "INSERT INTO reviews (task_id, reviewer_agent, verdict, comments, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, reviewer_agent, verdict.as_str(), comments, Utc::now()],
        )
        .context("insert review")?;
        insert_event(
            &tx,
            task_id,
            reviewer_agent,
            "reviewed",
            &format!("Verdict: {}", verdict.as_str()),
        )?;
        tx.commit().context("commit")?;
        Ok(())
    }

    /// All reviews recorded for a task.
    pub fn reviews(&self, task_id: i64) -> Result<Vec<Review>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, reviewer_agent, verdict, comments, timestamp
                 FROM reviews WHERE task_id = ?1 ORDER BY id",
            )
            .context("prepare reviews query")?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(Review {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    reviewer_agent: row.get(2)?,
                    verdict: row.get(3)?,
                    comments: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })
            .context("query reviews")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("scan reviews")
    }

    /// Record a new pipeline run as `running` and return its id.
    pub fn start_run(&self, epic_id: i64, max_loops: u32, parallel: u32) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pipeline_runs (epic_id, status, max_loops, parallel, started_at)
             VALUES (?1, 'running', ?2, ?3, ?4)",
            params![epic_id, max_loops, parallel, Utc::now()],
        )
        .context("start pipeline run")?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark a pipeline run as ended with the given status.
    pub fn end_run(&self, run_id: i64, status: RunStatus) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, ended_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now(), run_id],
        )
        .context("end pipeline run")?;
        Ok(())
    }

    /// Most recent `running` pipeline run for an epic, if any.
    pub fn active_run(&self, epic_id: i64) -> Result<Option<PipelineRun>> {
        let conn = self.lock();
        let run = conn
            .query_row(
                "SELECT id, epic_id, status, max_loops, parallel, started_at, ended_at
                 FROM pipeline_runs
                 WHERE epic_id = ?1 AND status = 'running'
                 ORDER BY id DESC LIMIT 1",
                params![epic_id],
                map_run,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("get active pipeline run")?;
        Ok(run)
    }

    /// All pipeline runs recorded for an epic, oldest first.
    pub fn runs(&self, epic_id: i64) -> Result<Vec<PipelineRun>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, epic_id, status, max_loops, parallel, started_at, ended_at
                 FROM pipeline_runs WHERE epic_id = ?1 ORDER BY id",
            )
            .context("prepare runs query")?;
        let rows = stmt.query_map(params![epic_id], map_run).context("query runs")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("scan pipeline runs")
    }

    /// All pipeline runs still marked `running`: these were interrupted
    /// by a crash.
    pub fn interrupted_runs(&self) -> Result<Vec<PipelineRun>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, epic_id, status, max_loops, parallel, started_at, ended_at
                 FROM pipeline_runs WHERE status = 'running' ORDER BY started_at DESC",
            )
            .context("prepare runs query")?;
        let rows = stmt
            .query_map([], map_run)
            .context("query interrupted runs")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("scan pipeline runs")
    }

    /// Return tasks under an epic that are stuck in `in_progress` or
    /// `review` (likely from a crash) to the backlog. Returns how many
    /// were reset.
    pub fn reset_stale_tasks(&self, epic_id: i64) -> Result<usize> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin transaction")?;

        let stale: Vec<i64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM tasks
                     WHERE parent_id = ?1 AND status IN ('in_progress', 'review') ORDER BY id",
                )
                .context("prepare stale query")?;
            let rows = stmt
                .query_map(params![epic_id], |row| row.get(0))
                .context("query stale tasks")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("scan stale tasks")?
        };

        for id in &stale {
            tx.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![TaskStatus::Backlog.as_str(), now, id],
            )
            .context("reset stale task")?;
            insert_event(
                &tx,
                *id,
                "",
                "status_changed",
                "Status changed to backlog (reset after interrupted run)",
            )?;
        }

        tx.commit().context("commit")?;
        Ok(stale.len())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_id       INTEGER REFERENCES tasks(id),
            kind            TEXT NOT NULL DEFAULT 'task',
            title           TEXT NOT NULL,
            description     TEXT DEFAULT '',
            status          TEXT NOT NULL DEFAULT 'backlog',
            assigned_agent  TEXT DEFAULT '',
            role            TEXT DEFAULT '',
            priority        TEXT DEFAULT 'medium',
            blocked_reason  TEXT DEFAULT '',
            git_branch      TEXT DEFAULT '',
            created_at      DATETIME NOT NULL,
            updated_at      DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id     INTEGER NOT NULL REFERENCES tasks(id),
            agent       TEXT DEFAULT '',
            event_type  TEXT NOT NULL,
            content     TEXT DEFAULT '',
            timestamp   DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id     INTEGER NOT NULL REFERENCES tasks(id),
            type        TEXT NOT NULL,
            file_path   TEXT NOT NULL,
            timestamp   DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reviews (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id         INTEGER NOT NULL REFERENCES tasks(id),
            reviewer_agent  TEXT NOT NULL,
            verdict         TEXT NOT NULL,
            comments        TEXT DEFAULT '',
            timestamp       DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            epic_id     INTEGER NOT NULL REFERENCES tasks(id),
            status      TEXT NOT NULL DEFAULT 'running',
            max_loops   INTEGER NOT NULL DEFAULT 3,
            parallel    INTEGER NOT NULL DEFAULT 1,
            started_at  DATETIME NOT NULL,
            ended_at    DATETIME
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id);",
    )
    .context("create schema")?;

    // Databases from before these columns existed get them added with
    // defaults. No destructive migrations.
    add_column_if_missing(conn, "tasks", "kind", "TEXT NOT NULL DEFAULT 'task'")?;
    add_column_if_missing(conn, "tasks", "git_branch", "TEXT DEFAULT ''")?;

    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, col_def: &str) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .context("table info")?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .context("query table info")?
        .collect::<rusqlite::Result<_>>()
        .context("scan table info")?;

    if existing.iter().any(|name| name == column) {
        return Ok(());
    }

    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {col_def}"))
        .with_context(|| format!("add column {table}.{column}"))?;
    debug!(table, column, "added missing column");
    Ok(())
}

fn insert_event(
    conn: &Connection,
    task_id: i64,
    agent: &str,
    event_type: &str,
    content: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO events (task_id, agent, event_type, content, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task_id, agent, event_type, content, Utc::now()],
    )
    .context("insert event")?;
    Ok(())
}

fn current_status(conn: &Connection, id: i64) -> Result<TaskStatus> {
    let raw: String = conn
        .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .map_err(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => anyhow!("work item #{id} not found"),
            other => anyhow!(other).context("query status"),
        })?;
    TaskStatus::parse(&raw).ok_or_else(|| anyhow!("work item #{id}: unknown status {raw:?}"))
}

fn map_item(row: &Row) -> rusqlite::Result<WorkItem> {
    let kind_raw: String = row.get(2)?;
    let status_raw: String = row.get(5)?;
    let kind = TaskKind::parse(&kind_raw).ok_or_else(|| conversion_error(2, &kind_raw))?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| conversion_error(5, &status_raw))?;

    Ok(WorkItem {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        kind,
        title: row.get(3)?,
        description: row.get(4)?,
        status,
        assigned_agent: row.get(6)?,
        role: row.get(7)?,
        priority: row.get(8)?,
        blocked_reason: row.get(9)?,
        git_branch: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn map_run(row: &Row) -> rusqlite::Result<PipelineRun> {
    let status_raw: String = row.get(2)?;
    let status = RunStatus::parse(&status_raw).ok_or_else(|| conversion_error(2, &status_raw))?;
    Ok(PipelineRun {
        id: row.get(0)?,
        epic_id: row.get(1)?,
        status,
        max_loops: row.get(3)?,
        parallel: row.get(4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
    })
}

fn conversion_error(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("unrecognised value {value:?}").into(),
    )
}
