//! The pipeline executor: drives an epic from planning through review.
//!
//! `auto` runs phases in order: guard against an interrupted run, ensure
//! the safety branch, plan, assign, work (fix loop per task, optionally
//! via the worker pool), then summarise. Blockers are not errors: a
//! `BLOCKED:` question parks the task and the pipeline continues with
//! the rest. Acceptance is always a user action; the pipeline only ever
//! moves an epic to `review`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::agents::{new_runner, Request, Runner};
use crate::context::ContextBuilder;
use crate::core::parser::{parse_blocked, parse_review, parse_subtasks};
use crate::core::status::is_terminal;
use crate::core::types::{TaskKind, TaskStatus, Verdict};
use crate::io::config::{force_auto_accept, AgentConfig, Config};
use crate::io::git::{epic_branch_name, Git};
use crate::io::store::{RunStatus, Store, WorkItem};
use crate::worker::{Pool, PoolConfig};

pub const DEFAULT_MAX_LOOPS: u32 = 3;

/// Cap on the preview of agent output stored as an event.
const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Architect specs beyond this size are cut before entering history.
const MAX_SPEC_BYTES: usize = 4000;

/// How an external runner is obtained for a named agent. The default
/// spawns real subprocess/HTTP runners; tests inject scripted ones.
pub trait RunnerFactory: Sync {
    fn create(&self, name: &str, cfg: &AgentConfig) -> Result<Box<dyn Runner>>;
}

/// Factory producing the real CLI/API runners.
pub struct DefaultRunnerFactory;

impl RunnerFactory for DefaultRunnerFactory {
    fn create(&self, name: &str, cfg: &AgentConfig) -> Result<Box<dyn Runner>> {
        new_runner(name, cfg)
    }
}

/// Terminal outcome of one task's trip through the fix loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Blocked,
    Failed,
}

/// Outcome of a single task in the work phase, with its log lines.
#[derive(Debug)]
pub struct TaskResult {
    pub task_id: i64,
    pub title: String,
    pub outcome: TaskOutcome,
    pub duration: Duration,
    pub log: Vec<String>,
}

/// A named agent and its configuration.
#[derive(Debug, Clone)]
pub struct AgentBinding {
    pub name: String,
    pub cfg: AgentConfig,
}

/// Role-name bindings resolved from the config.
#[derive(Debug, Clone, Default)]
pub struct RoleBindings {
    pub planner: Option<AgentBinding>,
    pub architect: Option<AgentBinding>,
    pub coder: Option<AgentBinding>,
    pub reviewer: Option<AgentBinding>,
}

impl RoleBindings {
    pub fn from_config(cfg: &Config) -> Self {
        let bind = |role: &str| {
            cfg.find_agent_by_role(role)
                .map(|(name, cfg)| AgentBinding { name, cfg })
        };
        Self {
            planner: bind("planner"),
            architect: bind("architect"),
            coder: bind("coder"),
            reviewer: bind("reviewer"),
        }
    }
}

/// Settings for one `auto` invocation.
#[derive(Debug, Clone)]
pub struct AutoOptions {
    pub max_loops: u32,
    pub parallel: u32,
    pub skip_plan: bool,
}

impl Default for AutoOptions {
    fn default() -> Self {
        Self {
            max_loops: DEFAULT_MAX_LOOPS,
            parallel: 1,
            skip_plan: false,
        }
    }
}

/// What `auto` did, for the CLI to render.
#[derive(Debug, Default)]
pub struct PipelineSummary {
    /// A `running` pipeline run already existed for this epic.
    pub stale_run_warning: Option<i64>,
    /// Safety branch the work happened on, if any.
    pub branch: Option<String>,
    /// Planner asked the user a question; nothing was executed.
    pub planner_blocked: Option<String>,
    /// Planner produced no structured subtasks; raw output for the user.
    pub unparsed_plan: Option<String>,
    /// Tasks created by the planner this run.
    pub planned: Vec<WorkItem>,
    pub results: Vec<TaskResult>,
    pub completed: usize,
    pub blocked: usize,
    pub failed: usize,
    /// The epic moved to review (all tasks terminal); acceptance is up
    /// to the user.
    pub epic_in_review: bool,
    /// Diffstat of the safety branch against base, when in review.
    pub diff_stat: Option<String>,
}

/// Marks the pipeline run `interrupted` unless it ended normally, so an
/// early return or panic never leaves a `running` row behind.
struct RunGuard<'a> {
    store: &'a Store,
    run_id: i64,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn new(store: &'a Store, run_id: i64) -> Self {
        Self {
            store,
            run_id,
            finished: false,
        }
    }

    fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.store.end_run(self.run_id, status)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(run_id = self.run_id, "pipeline run did not end cleanly");
            let _ = self.store.end_run(self.run_id, RunStatus::Interrupted);
        }
    }
}

/// Directory holding artifact files for this project.
pub fn runs_dir(workdir: &Path) -> PathBuf {
    workdir.join(".hive").join("runs")
}

/// Run the full pipeline on an epic (or directly on a task).
#[instrument(skip_all, fields(id, max_loops = opts.max_loops, parallel = opts.parallel))]
pub fn run_auto(
    store: &Store,
    cfg: &Config,
    workdir: &Path,
    id: i64,
    opts: &AutoOptions,
    factory: &dyn RunnerFactory,
) -> Result<PipelineSummary> {
    let mut item = store.get(id)?;
    let mut summary = PipelineSummary::default();
    let roles = RoleBindings::from_config(cfg);

    // Phase 0: warn about an interrupted run; the user may continue anyway.
    if item.kind == TaskKind::Epic {
        if let Some(active) = store.active_run(item.id)? {
            warn!(run_id = active.id, "epic has a pipeline run still marked running");
            summary.stale_run_warning = Some(active.id);
        }
    }

    // Phase 1: safety branch.
    let git = Git::new(workdir);
    if item.kind == TaskKind::Epic && git.is_repo() {
        if item.git_branch.is_empty() {
            let branch = epic_branch_name(item.id);
            if !git.has_dirty() && git.create_branch(&branch).is_ok() {
                store.set_git_branch(item.id, &branch)?;
                item.git_branch = branch;
            }
        }
        if !item.git_branch.is_empty() {
            let current = git.current_branch().unwrap_or_default();
            if current != item.git_branch {
                git.create_branch(&item.git_branch)
                    .with_context(|| format!("switch to safety branch {}", item.git_branch))?;
            }
            summary.branch = Some(item.git_branch.clone());
        }
    }

    // Crash-recovery bookkeeping, epics only.
    let mut guard = if item.kind == TaskKind::Epic {
        let run_id = store.start_run(item.id, opts.max_loops, opts.parallel)?;
        Some(RunGuard::new(store, run_id))
    } else {
        None
    };

    // Phase 2: plan.
    let mut tasks: Vec<WorkItem>;
    if opts.skip_plan {
        tasks = store.list_children(item.id)?;
        if tasks.is_empty() {
            tasks = vec![item.clone()];
        }
        info!(count = tasks.len(), "planning skipped, using existing tasks");
    } else if let Some(planner) = &roles.planner {
        match plan(store, workdir, &item, planner, factory)? {
            PlanOutcome::Blocked(question) => {
                summary.planner_blocked = Some(question);
                if let Some(guard) = guard.as_mut() {
                    guard.finish(RunStatus::Blocked)?;
                }
                return Ok(summary);
            }
            PlanOutcome::NoStructure(raw) => {
                summary.unparsed_plan = Some(raw);
                tasks = vec![item.clone()];
            }
            PlanOutcome::Created(created) => {
                summary.planned = created.clone();
                tasks = created;
            }
        }
    } else {
        // No planner bound: fall back to existing children, then to the
        // item's own body as the one task.
        debug!("no planner configured");
        tasks = store.list_children(item.id)?;
        if tasks.is_empty() {
            tasks = vec![item.clone()];
        }
    }

    // Phase 3: assignment.
    if let Some(coder) = &roles.coder {
        for task in &mut tasks {
            if task.assigned_agent.is_empty() {
                store.assign(task.id, &coder.name, "coder")?;
                task.assigned_agent = coder.name.clone();
                task.role = "coder".to_string();
            }
        }
    }

    // Phase 4: work.
    let Some(coder) = roles.coder.clone() else {
        bail!("no coder agent configured. Add an agent with role: coder in .hive/config.yaml");
    };
    let pool = Pool::new(PoolConfig {
        store,
        workdir,
        epic_branch: item.git_branch.clone(),
        max_workers: opts.parallel,
        max_loops: opts.max_loops,
        coder,
        reviewer: roles.reviewer.clone(),
    });
    let results = pool.run(&tasks, factory)?;

    for result in &results {
        match result.outcome {
            TaskOutcome::Done => summary.completed += 1,
            TaskOutcome::Blocked => summary.blocked += 1,
            TaskOutcome::Failed => summary.failed += 1,
        }
    }
    summary.results = results;

    // Phase 5: summary and epic status.
    let end_status = if summary.failed > 0 {
        RunStatus::Failed
    } else if summary.blocked > 0 {
        RunStatus::Blocked
    } else {
        RunStatus::Completed
    };
    if let Some(guard) = guard.as_mut() {
        guard.finish(end_status)?;
    }

    if item.kind == TaskKind::Epic {
        let children = store.list_children(item.id)?;
        let all_terminal = if children.is_empty() {
            summary.failed == 0 && summary.blocked == 0 && summary.completed > 0
        } else {
            children.iter().all(|c| {
                matches!(c.status, TaskStatus::Done | TaskStatus::Cancelled)
            })
        };

        if all_terminal {
            // The user still has to accept or reject; never auto-merge.
            store.update_status(item.id, TaskStatus::Review)?;
            summary.epic_in_review = true;

            if !item.git_branch.is_empty() && git.is_repo() {
                let committed = git
                    .commit_all(&format!("hive: completed epic #{} — {}", item.id, item.title))
                    .unwrap_or(false);
                if committed {
                    debug!("committed remaining changes on safety branch");
                }
                if let Ok(base) = git.base_branch() {
                    if let Ok(stat) = git.diff_stat(&base, &item.git_branch) {
                        if !stat.trim().is_empty() {
                            summary.diff_stat = Some(stat.trim_end().to_string());
                        }
                    }
                }
            }
        }
    }

    Ok(summary)
}

/// What the planner produced.
pub enum PlanOutcome {
    /// Planner asked the user a question; the item is now blocked.
    Blocked(String),
    /// No structured subtasks found; raw output for the user.
    NoStructure(String),
    /// Child tasks created under the epic.
    Created(Vec<WorkItem>),
}

/// Run the planner on an item and create child tasks from its output.
#[instrument(skip_all, fields(id = item.id, planner = %planner.name))]
pub fn plan(
    store: &Store,
    workdir: &Path,
    item: &WorkItem,
    planner: &AgentBinding,
    factory: &dyn RunnerFactory,
) -> Result<PlanOutcome> {
    let ctx = ContextBuilder::new(store);
    let prompt = ctx.build_prompt(item, "planner")?;
    let runner = factory.create(&planner.name, &planner.cfg)?;

    let resp = runner.run(&Request {
        task_id: item.id,
        prompt,
        workdir: workdir.to_path_buf(),
        timeout: planner.cfg.timeout(),
    })?;

    save_artifact(
        store,
        workdir,
        item.id,
        "plan",
        &format!("task-{}-plan.md", item.id),
        &resp.output,
    )?;

    if let Some(question) = parse_blocked(&resp.output) {
        store.block(item.id, &question)?;
        return Ok(PlanOutcome::Blocked(question));
    }

    let parsed = parse_subtasks(&resp.output);
    if parsed.is_empty() {
        info!("planner returned no structured subtasks");
        return Ok(PlanOutcome::NoStructure(resp.output));
    }

    let mut created = Vec::new();
    for sub in &parsed {
        let task = store.create_task(&sub.title, &sub.description, &sub.priority, Some(item.id))?;
        created.push(task);
    }
    store.add_event(
        item.id,
        &planner.name,
        "planned",
        &format!("Auto-created {} subtasks", created.len()),
    )?;
    Ok(PlanOutcome::Created(created))
}

/// One task's bounded code → review → fix iteration.
pub struct FixLoop<'a> {
    pub store: &'a Store,
    pub coder: &'a dyn Runner,
    pub coder_timeout: Duration,
    pub reviewer: Option<(&'a dyn Runner, Duration)>,
    /// Directory the agents work in (repo root or a task worktree).
    pub workdir: &'a Path,
    /// Main project directory holding `.hive/` (artifacts always land here).
    pub project_dir: &'a Path,
    pub max_loops: u32,
    /// Isolated tasks are integrated by cherry-pick later; non-isolated
    /// ones commit on the current branch as soon as they are approved.
    pub isolated: bool,
}

impl FixLoop<'_> {
    /// Run the loop for one task. Log lines accumulate in `log`.
    #[instrument(skip_all, fields(task_id))]
    pub fn run(&self, task_id: i64, log: &mut Vec<String>) -> Result<TaskOutcome> {
        let Some((reviewer, reviewer_timeout)) = self.reviewer else {
            return self.run_coder_once(task_id, log);
        };

        for iteration in 1..=self.max_loops {
            // Re-read so blocker answers and review comments written by
            // other actors reach this iteration's prompt.
            let task = self.store.get(task_id)?;

            // === Coder ===
            self.store.update_status(task_id, TaskStatus::InProgress)?;
            log.push(format!(
                "[{iteration}/{}] {} coding...",
                self.max_loops,
                self.coder.name()
            ));

            let prompt = ContextBuilder::new(self.store).build_prompt(&task, "coder")?;
            let resp = match self.coder.run(&Request {
                task_id,
                prompt,
                workdir: self.workdir.to_path_buf(),
                timeout: self.coder_timeout,
            }) {
                Ok(resp) => resp,
                Err(err) => {
                    self.store.update_status(task_id, TaskStatus::Failed)?;
                    log.push(format!("coder error: {err:#}"));
                    return Ok(TaskOutcome::Failed);
                }
            };

            save_artifact(
                self.store,
                self.project_dir,
                task_id,
                "code",
                &format!("task-{task_id}-code-iter{iteration}.md"),
                &resp.output,
            )?;
            self.store.add_event(
                task_id,
                self.coder.name(),
                "agent_output",
                &preview(&resp.output, OUTPUT_PREVIEW_CHARS),
            )?;
            log.push(format!("  coder finished ({:.1}s)", resp.duration_secs));

            if let Some(question) = parse_blocked(&resp.output) {
                self.store.block(task_id, &question)?;
                log.push(format!("  BLOCKED: {question}"));
                return Ok(TaskOutcome::Blocked);
            }

            if resp.exit_code != 0 {
                self.store.update_status(task_id, TaskStatus::Failed)?;
                match &resp.error {
                    Some(err) => log.push(format!("  exit code {}: {err}", resp.exit_code)),
                    None => log.push(format!("  exit code {}", resp.exit_code)),
                }
                return Ok(TaskOutcome::Failed);
            }

            // === Reviewer ===
            self.store.update_status(task_id, TaskStatus::Review)?;
            log.push(format!("  {} reviewing...", reviewer.name()));

            let review_prompt =
                ContextBuilder::new(self.store).build_review_prompt(&task, self.workdir)?;
            let resp = match reviewer.run(&Request {
                task_id,
                prompt: review_prompt,
                workdir: self.workdir.to_path_buf(),
                timeout: reviewer_timeout,
            }) {
                Ok(resp) => resp,
                Err(err) => {
                    // Counts against max_loops, like a missing verdict.
                    log.push(format!("  reviewer error: {err:#}"));
                    continue;
                }
            };

            save_artifact(
                self.store,
                self.project_dir,
                task_id,
                "review",
                &format!("task-{task_id}-review-iter{iteration}.md"),
                &resp.output,
            )?;

            let review = parse_review(&resp.output);
            match review.verdict {
                Some(Verdict::Approve) => {
                    self.store
                        .add_review(task_id, reviewer.name(), Verdict::Approve, &resp.output)?;
                    self.store
                        .update_status(task_id, self.success_status(&task))?;
                    log.push(format!("  APPROVED ({:.1}s)", resp.duration_secs));

                    if !self.isolated {
                        let git = Git::new(self.workdir);
                        if git.is_repo() {
                            let msg = format!("hive: task #{task_id} — {}", task.title);
                            match git.commit_all(&msg) {
                                Ok(true) => log.push("  committed".to_string()),
                                Ok(false) => {}
                                Err(err) => log.push(format!("  commit failed: {err:#}")),
                            }
                        }
                    }
                    return Ok(TaskOutcome::Done);
                }
                Some(Verdict::Reject) => {
                    self.store
                        .add_review(task_id, reviewer.name(), Verdict::Reject, &resp.output)?;
                    self.store.update_status(task_id, TaskStatus::Backlog)?;
                    log.push(format!("  REJECTED ({:.1}s)", resp.duration_secs));
                    for comment in &review.comments {
                        log.push(format!("    • {comment}"));
                    }
                    // Feed the comments to the next iteration's prompt.
                    let mut bullets = String::new();
                    for comment in &review.comments {
                        bullets.push_str("- ");
                        bullets.push_str(comment);
                        bullets.push('\n');
                    }
                    self.store.add_event(
                        task_id,
                        reviewer.name(),
                        "reviewed",
                        &format!("REJECTED (iter {iteration}):\n{bullets}"),
                    )?;
                }
                None => {
                    log.push(format!("  no verdict ({:.1}s)", resp.duration_secs));
                    self.store
                        .add_event(task_id, reviewer.name(), "reviewed", "No clear verdict")?;
                }
            }
        }

        self.store.update_status(task_id, TaskStatus::Failed)?;
        log.push("max iterations reached".to_string());
        Ok(TaskOutcome::Failed)
    }

    /// Without a reviewer there is nothing to loop over: run the coder
    /// once and trust its exit code.
    fn run_coder_once(&self, task_id: i64, log: &mut Vec<String>) -> Result<TaskOutcome> {
        let task = self.store.get(task_id)?;
        self.store.update_status(task_id, TaskStatus::InProgress)?;
        log.push(format!("{} coding...", self.coder.name()));

        let prompt = ContextBuilder::new(self.store).build_prompt(&task, "coder")?;
        let resp = match self.coder.run(&Request {
            task_id,
            prompt,
            workdir: self.workdir.to_path_buf(),
            timeout: self.coder_timeout,
        }) {
            Ok(resp) => resp,
            Err(err) => {
                self.store.update_status(task_id, TaskStatus::Failed)?;
                log.push(format!("coder error: {err:#}"));
                return Ok(TaskOutcome::Failed);
            }
        };

        save_artifact(
            self.store,
            self.project_dir,
            task_id,
            "code",
            &format!("task-{task_id}-code-iter1.md"),
            &resp.output,
        )?;
        self.store.add_event(
            task_id,
            self.coder.name(),
            "agent_output",
            &preview(&resp.output, OUTPUT_PREVIEW_CHARS),
        )?;

        if let Some(question) = parse_blocked(&resp.output) {
            self.store.block(task_id, &question)?;
            log.push(format!("BLOCKED: {question}"));
            return Ok(TaskOutcome::Blocked);
        }

        if resp.exit_code != 0 {
            self.store.update_status(task_id, TaskStatus::Failed)?;
            log.push(format!("exit code {}", resp.exit_code));
            return Ok(TaskOutcome::Failed);
        }

        self.store
            .update_status(task_id, self.success_status(&task))?;
        log.push(format!("done ({:.1}s)", resp.duration_secs));
        Ok(TaskOutcome::Done)
    }

    /// An epic running as its own single task ends in `review`, never
    /// `done`: acceptance is the user's call.
    fn success_status(&self, task: &WorkItem) -> TaskStatus {
        match task.kind {
            TaskKind::Epic => TaskStatus::Review,
            TaskKind::Task => TaskStatus::Done,
        }
    }
}

/// What the user accepted: branch merged, epic done.
#[derive(Debug)]
pub struct AcceptSummary {
    pub base_branch: Option<String>,
    pub branch: Option<String>,
    pub commits: String,
    pub diff_stat: String,
}

/// Accept an epic: merge its safety branch into base and mark it done.
///
/// Refuses unless every child task is `done` or `cancelled`.
#[instrument(skip_all, fields(epic_id))]
pub fn accept_epic(store: &Store, workdir: &Path, epic_id: i64) -> Result<AcceptSummary> {
    let epic = store.get(epic_id)?;
    if epic.kind != TaskKind::Epic {
        bail!("#{epic_id} is a task, not an epic");
    }

    for child in store.list_children(epic_id)? {
        if !matches!(child.status, TaskStatus::Done | TaskStatus::Cancelled) {
            bail!(
                "cannot accept epic #{epic_id}: task #{} is {} (must be done or cancelled)",
                child.id,
                child.status
            );
        }
    }

    let mut summary = AcceptSummary {
        base_branch: None,
        branch: None,
        commits: String::new(),
        diff_stat: String::new(),
    };

    let git = Git::new(workdir);
    if !epic.git_branch.is_empty() && git.is_repo() {
        let base = git.base_branch().context("detect base branch")?;
        summary.commits = git.log(&base, &epic.git_branch).unwrap_or_default();
        summary.diff_stat = git
            .diff_stat(&base, &epic.git_branch)
            .unwrap_or_default()
            .trim_end()
            .to_string();

        // Capture any straggling changes before the merge.
        if git.has_dirty() {
            git.commit_all(&format!("hive: final changes for epic #{epic_id}"))
                .context("commit pending changes")?;
        }

        git.merge(&base, &epic.git_branch).context("merge failed")?;
        git.delete_branch(&epic.git_branch, false).ok();

        summary.base_branch = Some(base.clone());
        summary.branch = Some(epic.git_branch.clone());

        store.update_status(epic_id, TaskStatus::Done)?;
        store.add_event(
            epic_id,
            "user",
            "accepted",
            &format!("Merged {} into {base}", epic.git_branch),
        )?;
    } else {
        store.update_status(epic_id, TaskStatus::Done)?;
        store.add_event(epic_id, "user", "accepted", "Accepted without a safety branch")?;
    }

    Ok(summary)
}

/// What the user rejected: branch deleted, epic failed.
#[derive(Debug)]
pub struct RejectSummary {
    pub base_branch: Option<String>,
    pub discarded_diff_stat: String,
    pub cascaded: Vec<i64>,
}

/// Reject an epic: discard its safety branch and cascade non-terminal
/// tasks to `failed`.
#[instrument(skip_all, fields(epic_id))]
pub fn reject_epic(store: &Store, workdir: &Path, epic_id: i64) -> Result<RejectSummary> {
    let epic = store.get(epic_id)?;
    if epic.kind != TaskKind::Epic {
        bail!("#{epic_id} is a task, not an epic");
    }

    let mut summary = RejectSummary {
        base_branch: None,
        discarded_diff_stat: String::new(),
        cascaded: Vec::new(),
    };

    let git = Git::new(workdir);
    if !epic.git_branch.is_empty() && git.is_repo() {
        let base = git.base_branch().context("detect base branch")?;
        summary.discarded_diff_stat = git
            .diff_stat(&base, &epic.git_branch)
            .unwrap_or_default()
            .trim_end()
            .to_string();
        git.reject(&base, &epic.git_branch).context("reject failed")?;
        summary.base_branch = Some(base);
    }

    store.update_status(epic_id, TaskStatus::Failed)?;
    store.add_event(
        epic_id,
        "user",
        "rejected",
        &format!("Discarded branch {}", epic.git_branch),
    )?;

    for child in store.list_children(epic_id)? {
        if !is_terminal(child.status) {
            store.update_status(child.id, TaskStatus::Failed)?;
            summary.cascaded.push(child.id);
        }
    }

    Ok(summary)
}

/// How answering a blocker went.
#[derive(Debug)]
pub enum AnswerOutcome {
    /// The user answered "skip": the task is cancelled.
    Cancelled,
    /// The architect blocked again with a new question.
    BlockedAgain(String),
    /// Unblocked, but no coder is configured to continue with.
    NoCoder,
    /// The fix loop ran; its outcome and log.
    Ran(TaskOutcome, Vec<String>),
}

/// Answer a blocked task and auto-continue its pipeline: unblock, run
/// the architect first if no spec exists yet, then the fix loop.
/// `"skip"` as the answer cancels the task instead.
#[instrument(skip_all, fields(task_id))]
pub fn answer_blocker(
    store: &Store,
    cfg: &Config,
    workdir: &Path,
    task_id: i64,
    answer: &str,
    max_loops: u32,
    factory: &dyn RunnerFactory,
) -> Result<AnswerOutcome> {
    let task = store.get(task_id)?;
    if task.status != TaskStatus::Blocked {
        bail!("task #{task_id} is not blocked (status: {})", task.status);
    }

    if answer.trim().eq_ignore_ascii_case("skip") {
        store.update_status(task_id, TaskStatus::Cancelled)?;
        store.add_event(task_id, "user", "cancelled", "User skipped blocked task")?;
        return Ok(AnswerOutcome::Cancelled);
    }

    store.unblock(task_id, answer)?;

    // Get back on the epic's safety branch before any agent runs.
    let git = Git::new(workdir);
    if let Some(parent_id) = task.parent_id {
        if let Ok(epic) = store.get(parent_id) {
            if !epic.git_branch.is_empty() && git.is_repo() {
                let current = git.current_branch().unwrap_or_default();
                if current != epic.git_branch {
                    git.create_branch(&epic.git_branch).ok();
                }
            }
        }
    }

    let mut roles = RoleBindings::from_config(cfg);
    for binding in [&mut roles.architect, &mut roles.coder, &mut roles.reviewer]
        .into_iter()
        .flatten()
    {
        force_auto_accept(&mut binding.cfg);
    }

    let task = store.get(task_id)?;

    // Architect first, unless a spec already exists for this task.
    let has_spec = store
        .events(task_id)?
        .iter()
        .any(|e| e.event_type == "architect_spec");
    if !has_spec {
        if let Some(architect) = &roles.architect {
            let ctx = ContextBuilder::new(store);
            let prompt = ctx.build_prompt(&task, "architect")?;
            let runner = factory.create(&architect.name, &architect.cfg)?;
            let resp = runner.run(&Request {
                task_id,
                prompt,
                workdir: workdir.to_path_buf(),
                timeout: architect.cfg.timeout(),
            })?;

            save_artifact(
                store,
                workdir,
                task_id,
                "architect",
                &format!("task-{task_id}-architect.md"),
                &resp.output,
            )?;

            if let Some(question) = parse_blocked(&resp.output) {
                store.block(task_id, &question)?;
                return Ok(AnswerOutcome::BlockedAgain(question));
            }

            let spec = truncate_spec(&resp.output);
            store.add_event(task_id, &architect.name, "architect_spec", &spec)?;
        }
    }

    let Some(coder) = &roles.coder else {
        return Ok(AnswerOutcome::NoCoder);
    };

    let coder_runner = factory.create(&coder.name, &coder.cfg)?;
    let reviewer_runner = match &roles.reviewer {
        Some(reviewer) => Some((factory.create(&reviewer.name, &reviewer.cfg)?, reviewer.cfg.timeout())),
        None => None,
    };

    let mut log = Vec::new();
    let fix = FixLoop {
        store,
        coder: coder_runner.as_ref(),
        coder_timeout: coder.cfg.timeout(),
        reviewer: reviewer_runner
            .as_ref()
            .map(|(runner, timeout)| (runner.as_ref(), *timeout)),
        workdir,
        project_dir: workdir,
        max_loops,
        isolated: false,
    };
    let outcome = fix.run(task_id, &mut log)?;
    Ok(AnswerOutcome::Ran(outcome, log))
}

/// Details of a resumed run, for the CLI.
#[derive(Debug)]
pub struct ResumeInfo {
    pub run_id: i64,
    pub epic_id: i64,
    pub reset_tasks: usize,
    pub max_loops: u32,
    pub parallel: u32,
}

/// Resume a pipeline interrupted by a crash: mark the old run
/// `interrupted`, return stale tasks to the backlog, and re-enter the
/// work phase with the original settings.
#[instrument(skip_all, fields(run_id))]
pub fn resume_run(
    store: &Store,
    cfg: &Config,
    workdir: &Path,
    run_id: i64,
    factory: &dyn RunnerFactory,
) -> Result<(ResumeInfo, PipelineSummary)> {
    let runs = store.interrupted_runs()?;
    let Some(run) = runs.into_iter().find(|r| r.id == run_id) else {
        bail!("run #{run_id} not found or not in 'running' state (already completed?)");
    };

    let epic = store.get(run.epic_id)?;

    let reset_tasks = store.reset_stale_tasks(epic.id)?;
    store.end_run(run.id, RunStatus::Interrupted)?;
    info!(reset_tasks, "reset stale tasks, re-entering pipeline");

    let opts = AutoOptions {
        max_loops: run.max_loops,
        parallel: run.parallel,
        skip_plan: true,
    };
    let summary = run_auto(store, cfg, workdir, epic.id, &opts, factory)?;

    Ok((
        ResumeInfo {
            run_id: run.id,
            epic_id: epic.id,
            reset_tasks,
            max_loops: run.max_loops,
            parallel: run.parallel,
        },
        summary,
    ))
}

/// Write a verbatim agent output under `.hive/runs/` and record it.
pub fn save_artifact(
    store: &Store,
    project_dir: &Path,
    task_id: i64,
    kind: &str,
    file_name: &str,
    content: &str,
) -> Result<()> {
    let dir = runs_dir(project_dir);
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(file_name);
    fs::write(&path, content).with_context(|| format!("write artifact {}", path.display()))?;
    store.add_artifact(task_id, kind, &path.to_string_lossy())?;
    Ok(())
}

/// First `max_chars` characters with an ellipsis, on a char boundary.
fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{cut}...")
}

fn truncate_spec(spec: &str) -> String {
    if spec.len() <= MAX_SPEC_BYTES {
        return spec.to_string();
    }
    let mut cut = MAX_SPEC_BYTES;
    while !spec.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n\n... (spec truncated)", &spec[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::AgentMode;
    use std::sync::Mutex;

    /// Runner that replays scripted responses in order.
    struct ScriptedRunner {
        name: String,
        outputs: Mutex<Vec<Response>>,
    }

    use crate::agents::Response;

    impl ScriptedRunner {
        fn new(name: &str, outputs: Vec<&str>) -> Self {
            Self {
                name: name.to_string(),
                outputs: Mutex::new(
                    outputs
                        .into_iter()
                        .rev()
                        .map(|o| Response {
                            output: o.to_string(),
                            exit_code: 0,
                            duration_secs: 0.1,
                            error: None,
                        })
                        .collect(),
                ),
            }
        }

        fn with_responses(name: &str, outputs: Vec<Response>) -> Self {
            Self {
                name: name.to_string(),
                outputs: Mutex::new(outputs.into_iter().rev().collect()),
            }
        }
    }

    impl Runner for ScriptedRunner {
        fn run(&self, _req: &Request) -> Result<Response> {
            let mut outputs = self.outputs.lock().expect("lock");
            outputs
                .pop()
                .ok_or_else(|| anyhow::anyhow!("scripted runner {} exhausted", self.name))
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn mode(&self) -> AgentMode {
            AgentMode::Api
        }
    }

    fn fix_loop<'a>(
        store: &'a Store,
        coder: &'a dyn Runner,
        reviewer: Option<&'a dyn Runner>,
        workdir: &'a Path,
    ) -> FixLoop<'a> {
        FixLoop {
            store,
            coder,
            coder_timeout: Duration::from_secs(5),
            reviewer: reviewer.map(|r| (r, Duration::from_secs(5))),
            workdir,
            project_dir: workdir,
            max_loops: 3,
            isolated: false,
        }
    }

    #[test]
    fn approve_on_first_iteration_reaches_done() {
        let store = Store::open_in_memory().expect("store");
        let temp = tempfile::tempdir().expect("tempdir");
        let task = store.create_task("T", "body", "", None).expect("task");

        let coder = ScriptedRunner::new("coder", vec!["edited the files"]);
        let reviewer = ScriptedRunner::new("rev", vec!["VERDICT: APPROVE\n\nCOMMENTS:\n- solid work here"]);

        let mut log = Vec::new();
        let outcome = fix_loop(&store, &coder, Some(&reviewer), temp.path())
            .run(task.id, &mut log)
            .expect("run");
        assert_eq!(outcome, TaskOutcome::Done);
        assert_eq!(store.get(task.id).expect("get").status, TaskStatus::Done);

        // One approve review, one code artifact, one review artifact.
        let reviews = store.reviews(task.id).expect("reviews");
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].verdict, "approve");

        let artifacts = store.artifacts(task.id).expect("artifacts");
        assert_eq!(artifacts.iter().filter(|a| a.kind == "code").count(), 1);
        assert_eq!(artifacts.iter().filter(|a| a.kind == "review").count(), 1);
    }

    #[test]
    fn reject_then_approve_feeds_comments_forward() {
        let store = Store::open_in_memory().expect("store");
        let temp = tempfile::tempdir().expect("tempdir");
        let task = store.create_task("T", "", "", None).expect("task");

        let coder = ScriptedRunner::new("coder", vec!["first attempt", "second attempt"]);
        let reviewer = ScriptedRunner::new(
            "rev",
            vec![
                "VERDICT: REJECT\nCOMMENTS:\n- fix the null check\n- add a test",
                "VERDICT: APPROVE",
            ],
        );

        let mut log = Vec::new();
        let outcome = fix_loop(&store, &coder, Some(&reviewer), temp.path())
            .run(task.id, &mut log)
            .expect("run");
        assert_eq!(outcome, TaskOutcome::Done);

        // The rejection comments are in history for iteration two.
        let events = store.events(task.id).expect("events");
        let reject_event = events
            .iter()
            .find(|e| e.content.contains("REJECTED (iter 1)"))
            .expect("reject event");
        assert!(reject_event.content.contains("- fix the null check"));
        assert!(reject_event.content.contains("- add a test"));

        let artifacts = store.artifacts(task.id).expect("artifacts");
        assert_eq!(artifacts.iter().filter(|a| a.kind == "code").count(), 2);
        assert_eq!(artifacts.iter().filter(|a| a.kind == "review").count(), 2);

        let reviews = store.reviews(task.id).expect("reviews");
        assert_eq!(reviews.len(), 2);
    }

    #[test]
    fn coder_blocker_parks_the_task() {
        let store = Store::open_in_memory().expect("store");
        let temp = tempfile::tempdir().expect("tempdir");
        let task = store.create_task("T", "", "", None).expect("task");

        let coder = ScriptedRunner::new("coder", vec!["BLOCKED: REST or GraphQL?"]);
        let reviewer = ScriptedRunner::new("rev", vec![]);

        let mut log = Vec::new();
        let outcome = fix_loop(&store, &coder, Some(&reviewer), temp.path())
            .run(task.id, &mut log)
            .expect("run");
        assert_eq!(outcome, TaskOutcome::Blocked);

        let blocked = store.get(task.id).expect("get");
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert_eq!(blocked.blocked_reason, "REST or GraphQL?");
    }

    #[test]
    fn nonzero_exit_fails_the_task() {
        let store = Store::open_in_memory().expect("store");
        let temp = tempfile::tempdir().expect("tempdir");
        let task = store.create_task("T", "", "", None).expect("task");

        let coder = ScriptedRunner::with_responses(
            "coder",
            vec![Response {
                output: "partial".to_string(),
                exit_code: -1,
                duration_secs: 0.1,
                error: Some("agent coder timed out after 5s".to_string()),
            }],
        );
        let reviewer = ScriptedRunner::new("rev", vec![]);

        let mut log = Vec::new();
        let outcome = fix_loop(&store, &coder, Some(&reviewer), temp.path())
            .run(task.id, &mut log)
            .expect("run");
        assert_eq!(outcome, TaskOutcome::Failed);
        assert_eq!(store.get(task.id).expect("get").status, TaskStatus::Failed);
        assert!(log.iter().any(|l| l.contains("timed out")));
    }

    #[test]
    fn missing_verdicts_exhaust_max_loops() {
        let store = Store::open_in_memory().expect("store");
        let temp = tempfile::tempdir().expect("tempdir");
        let task = store.create_task("T", "", "", None).expect("task");

        let coder = ScriptedRunner::new("coder", vec!["try 1", "try 2", "try 3"]);
        let reviewer = ScriptedRunner::new(
            "rev",
            vec!["thinking about it", "hmm, not sure", "no conclusion"],
        );

        let mut log = Vec::new();
        let outcome = fix_loop(&store, &coder, Some(&reviewer), temp.path())
            .run(task.id, &mut log)
            .expect("run");
        assert_eq!(outcome, TaskOutcome::Failed);
        assert_eq!(store.get(task.id).expect("get").status, TaskStatus::Failed);
        assert!(log.iter().any(|l| l.contains("max iterations")));
    }

    #[test]
    fn no_reviewer_trusts_the_coder_exit_code() {
        let store = Store::open_in_memory().expect("store");
        let temp = tempfile::tempdir().expect("tempdir");
        let task = store.create_task("T", "", "", None).expect("task");

        let coder = ScriptedRunner::new("coder", vec!["did the thing"]);
        let mut log = Vec::new();
        let outcome = fix_loop(&store, &coder, None, temp.path())
            .run(task.id, &mut log)
            .expect("run");
        assert_eq!(outcome, TaskOutcome::Done);
        assert_eq!(store.get(task.id).expect("get").status, TaskStatus::Done);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let s = "é".repeat(300);
        let p = preview(&s, 200);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), 203);
        assert_eq!(preview("short", 200), "short");
    }
}
