//! Parallel task execution for the pipeline's work phase.
//!
//! Up to `max_workers` tasks run concurrently, each owning a thread for
//! its whole fix loop. Subprocess coders get a dedicated git worktree on
//! a branch derived from the epic branch; approved work is integrated
//! back by cherry-pick under a pool-wide lock, so two workers can never
//! rewrite the epic branch at the same time. API agents don't touch the
//! filesystem and need no isolation.

use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::agents::Runner;
use crate::core::types::TaskStatus;
use crate::io::config::AgentMode;
use crate::io::git::{task_branch_name, worktree_path, Git};
use crate::io::store::{Store, WorkItem};
use crate::pipeline::{AgentBinding, FixLoop, RunnerFactory, TaskOutcome, TaskResult};

/// Configuration for a worker pool.
pub struct PoolConfig<'a> {
    pub store: &'a Store,
    /// Main working directory (holds `.hive/` and the epic branch).
    pub workdir: &'a Path,
    /// Epic safety branch; empty disables worktree isolation.
    pub epic_branch: String,
    pub max_workers: u32,
    pub max_loops: u32,
    pub coder: AgentBinding,
    pub reviewer: Option<AgentBinding>,
}

/// Executes a set of tasks, in parallel when asked to.
pub struct Pool<'a> {
    store: &'a Store,
    workdir: &'a Path,
    epic_branch: String,
    max_workers: u32,
    max_loops: u32,
    coder: AgentBinding,
    reviewer: Option<AgentBinding>,
    use_worktree: bool,
    /// Serialises cherry-picks into the epic branch.
    merge_lock: Mutex<()>,
}

impl<'a> Pool<'a> {
    pub fn new(cfg: PoolConfig<'a>) -> Pool<'a> {
        // Worktrees only help subprocess agents, and only inside a repo
        // with a safety branch to derive task branches from.
        let use_worktree = !cfg.epic_branch.is_empty()
            && cfg.coder.cfg.mode == AgentMode::Cli
            && Git::new(cfg.workdir).is_repo();

        Pool {
            store: cfg.store,
            workdir: cfg.workdir,
            epic_branch: cfg.epic_branch,
            max_workers: cfg.max_workers,
            max_loops: cfg.max_loops,
            coder: cfg.coder,
            reviewer: cfg.reviewer,
            use_worktree,
            merge_lock: Mutex::new(()),
        }
    }

    /// Run all tasks, up to `max_workers` at a time, and return one
    /// result per task in input order.
    #[instrument(skip_all, fields(tasks = tasks.len(), max_workers = self.max_workers))]
    pub fn run(&self, tasks: &[WorkItem], factory: &dyn RunnerFactory) -> Result<Vec<TaskResult>> {
        let coder_runner = factory.create(&self.coder.name, &self.coder.cfg)?;
        let reviewer_runner = match &self.reviewer {
            Some(reviewer) => Some((
                factory.create(&reviewer.name, &reviewer.cfg)?,
                reviewer.cfg.timeout(),
            )),
            None => None,
        };
        let reviewer_ref = reviewer_runner
            .as_ref()
            .map(|(runner, timeout)| (runner.as_ref(), *timeout));

        if self.max_workers <= 1 || tasks.len() <= 1 {
            return Ok(self.run_sequential(tasks, coder_runner.as_ref(), reviewer_ref));
        }
        Ok(self.run_parallel(tasks, coder_runner.as_ref(), reviewer_ref))
    }

    fn run_sequential(
        &self,
        tasks: &[WorkItem],
        coder: &dyn Runner,
        reviewer: Option<(&dyn Runner, Duration)>,
    ) -> Vec<TaskResult> {
        tasks
            .iter()
            .map(|task| match self.skip_result(task) {
                Some(skipped) => skipped,
                None => self.execute_task(task, coder, reviewer),
            })
            .collect()
    }

    fn run_parallel(
        &self,
        tasks: &[WorkItem],
        coder: &dyn Runner,
        reviewer: Option<(&dyn Runner, Duration)>,
    ) -> Vec<TaskResult> {
        // Fixed-size semaphore guarding worker slots: a bounded channel
        // holding one unit per in-flight task. Sending acquires a slot
        // (blocks while all are taken), receiving releases one.
        let (sem_send, sem_recv) = sync_channel::<()>(self.max_workers as usize);
        let sem_recv = Mutex::new(sem_recv);

        let mut results: Vec<Option<TaskResult>> = Vec::new();
        results.resize_with(tasks.len(), || None);

        thread::scope(|scope| {
            let mut handles = Vec::new();
            for (idx, task) in tasks.iter().enumerate() {
                if let Some(skipped) = self.skip_result(task) {
                    results[idx] = Some(skipped);
                    continue;
                }

                // Acquire before spawning so at most max_workers tasks
                // are in flight. The receiver outlives the loop, so the
                // send cannot fail.
                let _ = sem_send.send(());
                let sem_recv = &sem_recv;
                let handle = scope.spawn(move || {
                    let _slot = SlotGuard(sem_recv);
                    self.execute_task(task, coder, reviewer)
                });
                handles.push((idx, handle));
            }

            for (idx, handle) in handles {
                results[idx] = Some(match handle.join() {
                    Ok(result) => result,
                    Err(_) => TaskResult {
                        task_id: tasks[idx].id,
                        title: tasks[idx].title.clone(),
                        outcome: TaskOutcome::Failed,
                        duration: Duration::ZERO,
                        log: vec!["worker thread panicked".to_string()],
                    },
                });
            }
        });

        results.into_iter().flatten().collect()
    }

    /// Tasks that must not execute are surfaced as finished results with
    /// the reason, and still count toward the summary.
    fn skip_result(&self, task: &WorkItem) -> Option<TaskResult> {
        let (outcome, reason) = match task.status {
            TaskStatus::Done => (TaskOutcome::Done, "Already done".to_string()),
            TaskStatus::Cancelled => (TaskOutcome::Done, "Cancelled, skipping".to_string()),
            TaskStatus::Blocked => (
                TaskOutcome::Blocked,
                format!("Blocked: {}", task.blocked_reason),
            ),
            _ if task.assigned_agent.is_empty() => {
                (TaskOutcome::Failed, "No agent assigned".to_string())
            }
            _ => return None,
        };
        Some(TaskResult {
            task_id: task.id,
            title: task.title.clone(),
            outcome,
            duration: Duration::ZERO,
            log: vec![reason],
        })
    }

    /// Run one task's fix loop, in a worktree when isolation is on, and
    /// integrate approved changes back into the epic branch.
    fn execute_task(
        &self,
        task: &WorkItem,
        coder: &dyn Runner,
        reviewer: Option<(&dyn Runner, Duration)>,
    ) -> TaskResult {
        let start = Instant::now();
        let mut log = Vec::new();

        let (taskdir, isolated) = if self.use_worktree {
            let wt_path = worktree_path(self.workdir, task.id);
            let branch = task_branch_name(&self.epic_branch, task.id);
            // Worktree setup mutates shared repository state (refs,
            // .git/worktrees), so it runs under the same lock as
            // integration.
            let _guard = self
                .merge_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match Git::new(self.workdir).add_worktree(&wt_path, &branch, &self.epic_branch) {
                Ok(()) => {
                    debug!(task_id = task.id, worktree = %wt_path.display(), "worktree created");
                    (wt_path, true)
                }
                Err(err) => {
                    warn!(task_id = task.id, "worktree setup failed, falling back to main workdir");
                    log.push(format!("worktree setup failed, using main workdir: {err:#}"));
                    (self.workdir.to_path_buf(), false)
                }
            }
        } else {
            (self.workdir.to_path_buf(), false)
        };

        let fix = FixLoop {
            store: self.store,
            coder,
            coder_timeout: self.coder.cfg.timeout(),
            reviewer,
            workdir: &taskdir,
            project_dir: self.workdir,
            max_loops: self.max_loops,
            isolated,
        };
        let outcome = match fix.run(task.id, &mut log) {
            Ok(outcome) => outcome,
            Err(err) => {
                log.push(format!("pipeline error: {err:#}"));
                TaskOutcome::Failed
            }
        };

        if isolated {
            if outcome == TaskOutcome::Done {
                // Integration is serialised: one cherry-pick against the
                // epic branch at a time.
                let _guard = self
                    .merge_lock
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let git = Git::new(self.workdir);
                match git.merge_worktree_changes(&taskdir, task.id, &task.title) {
                    Ok(true) => {
                        info!(task_id = task.id, "merged into epic branch");
                        log.push("merged into epic branch".to_string());
                    }
                    Ok(false) => log.push("no changes to merge".to_string()),
                    // The code was written; only integration failed.
                    // The task stays done and the user gets told.
                    Err(err) => log.push(format!("merge failed: {err:#}")),
                }
            }

            let _guard = self
                .merge_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let git = Git::new(self.workdir);
            if let Err(err) = git.remove_worktree(&taskdir) {
                debug!(task_id = task.id, error = %err, "worktree remove failed");
            }
            let _ = std::fs::remove_dir_all(&taskdir);
            let _ = git.prune_worktrees();
        }

        TaskResult {
            task_id: task.id,
            title: task.title.clone(),
            outcome,
            duration: start.elapsed(),
            log,
        }
    }
}

/// A held worker slot; its unit stays in the semaphore channel until
/// this drops, panics included.
struct SlotGuard<'a>(&'a Mutex<Receiver<()>>);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let receiver = self
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One unit per in-flight task, ours included, so this never
        // finds the channel empty.
        let _ = receiver.try_recv();
    }
}
