//! Git safety net for agent work.
//!
//! Every epic gets its own branch; all task work inside that epic lands
//! on it. The user reviews the total diff and accepts (merge) or rejects
//! (delete branch) at the epic level. Parallel tasks additionally get a
//! worktree each so subprocess agents cannot trample one another's
//! files. We keep a small, explicit wrapper around `git` subprocess
//! calls rather than a library binding.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, instrument, warn};

/// Safety branch name for an epic: `hive/epic-{id}`.
pub fn epic_branch_name(epic_id: i64) -> String {
    format!("hive/epic-{epic_id}")
}

/// Path of the dedicated worktree for a task.
pub fn worktree_path(base_dir: &Path, task_id: i64) -> PathBuf {
    base_dir
        .join(".hive")
        .join("worktrees")
        .join(format!("task-{task_id}"))
}

/// Branch a parallel task works on inside its worktree, derived from the
/// epic branch. The epic branch itself stays checked out in the main
/// working directory, so worktrees cannot check it out again.
pub fn task_branch_name(epic_branch: &str, task_id: i64) -> String {
    format!("{epic_branch}-task-{task_id}")
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Whether the working directory is inside a git repository.
    pub fn is_repo(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => {
                out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true"
            }
            Err(_) => false,
        }
    }

    /// Name of the currently checked-out branch.
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Detect the base branch: prefer `main`, then `master`, else the
    /// current branch.
    pub fn base_branch(&self) -> Result<String> {
        for name in ["main", "master"] {
            let ok = self
                .run(&["rev-parse", "--verify", name])
                .map(|out| out.status.success())
                .unwrap_or(false);
            if ok {
                return Ok(name.to_string());
            }
        }
        self.current_branch()
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.run(&["rev-parse", "--verify", branch])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Whether the working tree has uncommitted changes (including
    /// untracked files).
    pub fn has_dirty(&self) -> bool {
        match self.run(&["status", "--porcelain"]) {
            Ok(out) => !String::from_utf8_lossy(&out.stdout).trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Create a branch from the current HEAD and switch to it.
    /// Idempotent: if the branch already exists, just check it out.
    #[instrument(skip_all, fields(branch))]
    pub fn create_branch(&self, branch: &str) -> Result<()> {
        if self.branch_exists(branch) {
            debug!(branch, "branch exists, checking out");
            return self.checkout(branch);
        }
        debug!(branch, "creating and checking out branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Switch to an existing branch.
    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage everything and commit with the given message.
    ///
    /// Returns `false` (and does nothing) when the working tree is clean.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.run_checked(&["add", "-A"])?;

        let staged = self.run(&["diff", "--cached", "--quiet"])?;
        if staged.status.success() {
            debug!("nothing staged, skipping commit");
            return Ok(false);
        }

        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Diff between the base branch and the given branch (everything the
    /// epic introduced).
    pub fn diff(&self, base_branch: &str, branch: &str) -> Result<String> {
        self.run_capture(&["diff", &format!("{base_branch}...{branch}")])
    }

    /// Summary of changes: files changed, insertions, deletions.
    pub fn diff_stat(&self, base_branch: &str, branch: &str) -> Result<String> {
        self.run_capture(&["diff", "--stat", &format!("{base_branch}...{branch}")])
    }

    /// Unstaged changes in the working tree.
    pub fn diff_unstaged(&self) -> Result<String> {
        self.run_capture(&["diff"])
    }

    /// Staged-but-uncommitted changes.
    pub fn diff_staged(&self) -> Result<String> {
        self.run_capture(&["diff", "--cached"])
    }

    /// Changes introduced by the last commit.
    pub fn diff_last_commit(&self) -> Result<String> {
        self.run_capture(&["diff", "HEAD~1"])
    }

    /// One-line commit log of `branch` since it diverged from `base_branch`.
    pub fn log(&self, base_branch: &str, branch: &str) -> Result<String> {
        let out = self.run_capture(&["log", "--oneline", &format!("{base_branch}..{branch}")])?;
        Ok(out.trim().to_string())
    }

    /// Merge `branch` into `base_branch` with a merge commit. The
    /// "accept" action.
    #[instrument(skip_all, fields(base_branch, branch))]
    pub fn merge(&self, base_branch: &str, branch: &str) -> Result<()> {
        self.checkout(base_branch)?;
        self.run_checked(&["merge", branch, "--no-ff", "-m", &format!("Merge {branch}")])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, branch])?;
        Ok(())
    }

    /// Check out the base branch and force-delete `branch`, discarding
    /// all agent work. The "reject" action.
    #[instrument(skip_all, fields(base_branch, branch))]
    pub fn reject(&self, base_branch: &str, branch: &str) -> Result<()> {
        self.checkout(base_branch)?;
        self.delete_branch(branch, true)
    }

    /// Create a worktree at `path` on a new branch `branch` starting at
    /// `start_point`. Worktrees are independent working directories
    /// sharing the same repository, so multiple CLI agents can work in
    /// parallel without file conflicts.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub fn add_worktree(&self, path: &Path, branch: &str, start_point: &str) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("worktree path is not valid UTF-8: {}", path.display()))?;
        self.run_checked(&["worktree", "add", "-b", branch, path_str, start_point])?;
        Ok(())
    }

    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("worktree path is not valid UTF-8: {}", path.display()))?;
        self.run_checked(&["worktree", "remove", path_str, "--force"])?;
        Ok(())
    }

    /// Commit whatever a finished task left in its worktree, then
    /// cherry-pick that commit onto the epic branch in the main working
    /// directory. Returns `false` when the worktree had nothing to
    /// commit.
    #[instrument(skip_all, fields(worktree = %worktree_path.display(), task_id))]
    pub fn merge_worktree_changes(
        &self,
        worktree_path: &Path,
        task_id: i64,
        task_title: &str,
    ) -> Result<bool> {
        let wt = Git::new(worktree_path);

        let msg = format!("hive: task #{task_id} — {task_title}");
        let committed = wt.commit_all(&msg).context("commit in worktree")?;
        if !committed {
            debug!("worktree clean, nothing to integrate");
            return Ok(false);
        }

        let commit = wt
            .run_capture(&["rev-parse", "HEAD"])
            .context("resolve worktree commit")?;
        let commit = commit.trim();

        self.run_checked(&["cherry-pick", commit])
            .context("cherry-pick into epic branch")?;
        Ok(true)
    }

    pub fn list_worktrees(&self) -> Result<Vec<PathBuf>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    /// Remove stale worktree references.
    pub fn prune_worktrees(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = %args.join(" "), stderr = %stderr.trim(), "git command failed");
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
