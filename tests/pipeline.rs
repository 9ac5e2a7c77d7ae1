//! End-to-end pipeline scenarios with scripted runners.
//!
//! These drive `run_auto` and friends against a real store and, where a
//! scenario needs one, a real throwaway git repository, replacing only
//! the agent invocations with scripted runners.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use hive::agents::{Request, Response, Runner};
use hive::core::types::TaskStatus;
use hive::io::config::{AgentConfig, AgentMode, Config};
use hive::io::git::{epic_branch_name, Git};
use hive::io::store::{RunStatus, Store};
use hive::pipeline::{
    accept_epic, answer_blocker, reject_epic, resume_run, run_auto, AnswerOutcome, AutoOptions,
    RunnerFactory, TaskOutcome,
};

/// Shared queues of scripted responses, keyed by agent name.
#[derive(Clone, Default)]
struct Scripts {
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl Scripts {
    fn push(&self, agent: &str, output: &str) {
        self.queues
            .lock()
            .expect("lock")
            .entry(agent.to_string())
            .or_default()
            .push_back(output.to_string());
    }

    fn pop(&self, agent: &str) -> Option<String> {
        self.queues
            .lock()
            .expect("lock")
            .get_mut(agent)
            .and_then(VecDeque::pop_front)
    }
}

/// Replays scripted outputs for its agent, in order.
struct ScriptedRunner {
    name: String,
    mode: AgentMode,
    scripts: Scripts,
}

impl Runner for ScriptedRunner {
    fn run(&self, _req: &Request) -> Result<Response> {
        let output = self
            .scripts
            .pop(&self.name)
            .ok_or_else(|| anyhow::anyhow!("scripted runner {} exhausted", self.name))?;
        Ok(Response {
            output,
            exit_code: 0,
            duration_secs: 0.01,
            error: None,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> AgentMode {
        self.mode
    }
}

/// A coder that actually writes a file into its working directory, for
/// worktree-isolation scenarios.
struct FileWriterRunner {
    name: String,
}

impl Runner for FileWriterRunner {
    fn run(&self, req: &Request) -> Result<Response> {
        let file = req.workdir.join(format!("task-{}.txt", req.task_id));
        fs::write(&file, format!("work for task {}\n", req.task_id))?;
        Ok(Response {
            output: format!("implemented task {} in {}", req.task_id, file.display()),
            exit_code: 0,
            duration_secs: 0.01,
            error: None,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> AgentMode {
        AgentMode::Cli
    }
}

struct ScriptedFactory {
    scripts: Scripts,
    /// Agents whose runner writes files instead of replaying a script.
    file_writers: Vec<String>,
}

impl RunnerFactory for ScriptedFactory {
    fn create(&self, name: &str, cfg: &AgentConfig) -> Result<Box<dyn Runner>> {
        if self.file_writers.iter().any(|w| w == name) {
            return Ok(Box::new(FileWriterRunner {
                name: name.to_string(),
            }));
        }
        Ok(Box::new(ScriptedRunner {
            name: name.to_string(),
            mode: cfg.mode,
            scripts: self.scripts.clone(),
        }))
    }
}

fn agent(role: &str, mode: AgentMode) -> AgentConfig {
    AgentConfig {
        role: role.to_string(),
        mode,
        cmd: if mode == AgentMode::Cli {
            "true".to_string()
        } else {
            String::new()
        },
        args: Vec::new(),
        provider: if mode == AgentMode::Api {
            "openai".to_string()
        } else {
            String::new()
        },
        model: String::new(),
        api_key_env: "HIVE_TEST_KEY".to_string(),
        timeout_sec: 5,
        auto_accept: false,
    }
}

/// planner/coder/reviewer bound as API agents (no worktree isolation).
fn api_config() -> Config {
    let mut cfg = Config::default();
    cfg.agents
        .insert("planner-agent".to_string(), agent("planner", AgentMode::Api));
    cfg.agents
        .insert("coder-agent".to_string(), agent("coder", AgentMode::Api));
    cfg.agents
        .insert("reviewer-agent".to_string(), agent("reviewer", AgentMode::Api));
    cfg
}

/// Same bindings with a CLI-mode coder, enabling worktrees.
fn cli_coder_config() -> Config {
    let mut cfg = api_config();
    cfg.agents
        .insert("coder-agent".to_string(), agent("coder", AgentMode::Cli));
    cfg
}

fn factory(scripts: &Scripts) -> ScriptedFactory {
    ScriptedFactory {
        scripts: scripts.clone(),
        file_writers: Vec::new(),
    }
}

/// Workspace with a store but no git repository.
fn plain_workspace() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Store::open(&temp.path().join("hive.db")).expect("store");
    (temp, store)
}

/// Workspace inside a real git repository with `.hive/` ignored.
fn git_workspace() -> (tempfile::TempDir, Store, Git) {
    let temp = tempfile::tempdir().expect("tempdir");
    let git = Git::new(temp.path());
    run_git(temp.path(), &["init", "-q"]);
    run_git(temp.path(), &["config", "user.email", "hive@test"]);
    run_git(temp.path(), &["config", "user.name", "hive"]);
    run_git(temp.path(), &["checkout", "-q", "-b", "main"]);
    fs::write(temp.path().join(".gitignore"), ".hive/\nhive.db*\n").expect("gitignore");
    fs::write(temp.path().join("README.md"), "seed\n").expect("seed");
    assert!(git.commit_all("initial").expect("commit"));

    let hive_dir = temp.path().join(".hive");
    fs::create_dir_all(&hive_dir).expect("create .hive");
    let store = Store::open(&hive_dir.join("hive.db")).expect("store");
    (temp, store, git)
}

fn run_git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git");
    assert!(status.success(), "git {args:?} failed");
}

#[test]
fn plan_happy_path_creates_assigns_and_completes_tasks() {
    let (temp, store) = plain_workspace();
    let cfg = api_config();
    let scripts = Scripts::default();

    scripts.push(
        "planner-agent",
        "SUBTASKS:\n\
         1. Setup auth middleware - Configure JWT verification (priority: high)\n\
         2. Create login endpoint - POST /auth/login (priority: high)\n",
    );
    scripts.push("coder-agent", "added the middleware");
    scripts.push("reviewer-agent", "VERDICT: APPROVE");
    scripts.push("coder-agent", "added the endpoint");
    scripts.push("reviewer-agent", "VERDICT: APPROVE");

    let epic = store.create_epic("Add JWT auth", "", "high").expect("epic");
    let summary = run_auto(
        &store,
        &cfg,
        temp.path(),
        epic.id,
        &AutoOptions::default(),
        &factory(&scripts),
    )
    .expect("auto");

    let children = store.list_children(epic.id).expect("children");
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].title, "Setup auth middleware");
    assert_eq!(children[0].description, "Configure JWT verification");
    assert_eq!(children[0].priority, "high");
    assert_eq!(children[1].title, "Create login endpoint");
    assert_eq!(children[1].description, "POST /auth/login");

    for child in &children {
        assert_eq!(child.assigned_agent, "coder-agent");
        assert_eq!(child.status, TaskStatus::Done);
    }

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.blocked, 0);
    assert_eq!(summary.failed, 0);

    // The epic waits for the user; it is never auto-accepted.
    assert!(summary.epic_in_review);
    assert_eq!(store.get(epic.id).expect("epic").status, TaskStatus::Review);

    let runs = store.runs(epic.id).expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
}

#[test]
fn approve_first_iteration_records_one_review_and_two_artifacts() {
    let (temp, store) = plain_workspace();
    let cfg = api_config();
    let scripts = Scripts::default();

    let epic = store.create_epic("E", "", "medium").expect("epic");
    let task = store
        .create_task("Wire up config", "read YAML", "medium", Some(epic.id))
        .expect("task");

    scripts.push("coder-agent", "done, files edited, exit clean");
    scripts.push("reviewer-agent", "VERDICT: APPROVE\n\nCOMMENTS:\n- clean separation of concerns");

    let opts = AutoOptions {
        skip_plan: true,
        ..AutoOptions::default()
    };
    run_auto(&store, &cfg, temp.path(), epic.id, &opts, &factory(&scripts)).expect("auto");

    assert_eq!(store.get(task.id).expect("task").status, TaskStatus::Done);

    let reviews = store.reviews(task.id).expect("reviews");
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].verdict, "approve");
    assert!(reviews.iter().all(|r| r.verdict != "reject"));

    let artifacts = store.artifacts(task.id).expect("artifacts");
    assert_eq!(artifacts.iter().filter(|a| a.kind == "code").count(), 1);
    assert_eq!(artifacts.iter().filter(|a| a.kind == "review").count(), 1);

    let reviewed_events: Vec<_> = store
        .events(task.id)
        .expect("events")
        .into_iter()
        .filter(|e| e.event_type == "reviewed")
        .collect();
    assert_eq!(reviewed_events.len(), 1);
    assert!(reviewed_events[0].content.contains("approve"));

    // The artifact files exist on disk under .hive/runs/.
    for artifact in &artifacts {
        assert!(Path::new(&artifact.file_path).exists(), "{}", artifact.file_path);
    }
}

#[test]
fn reject_then_approve_passes_comments_to_second_iteration() {
    let (temp, store) = plain_workspace();
    let cfg = api_config();
    let scripts = Scripts::default();

    let epic = store.create_epic("E", "", "medium").expect("epic");
    let task = store
        .create_task("Harden handler", "", "medium", Some(epic.id))
        .expect("task");

    scripts.push("coder-agent", "first pass");
    scripts.push(
        "reviewer-agent",
        "VERDICT: REJECT\nCOMMENTS:\n- missing bounds check on offset\n- add a regression test",
    );
    scripts.push("coder-agent", "second pass with fixes");
    scripts.push("reviewer-agent", "VERDICT: APPROVE");

    let opts = AutoOptions {
        skip_plan: true,
        ..AutoOptions::default()
    };
    let summary =
        run_auto(&store, &cfg, temp.path(), epic.id, &opts, &factory(&scripts)).expect("auto");

    assert_eq!(summary.completed, 1);
    assert_eq!(store.get(task.id).expect("task").status, TaskStatus::Done);

    // Two code artifacts, two review artifacts, and the reject comments
    // reached history so the second coder prompt carried them.
    let artifacts = store.artifacts(task.id).expect("artifacts");
    assert_eq!(artifacts.iter().filter(|a| a.kind == "code").count(), 2);
    assert_eq!(artifacts.iter().filter(|a| a.kind == "review").count(), 2);

    let events = store.events(task.id).expect("events");
    let reject = events
        .iter()
        .find(|e| e.content.contains("REJECTED (iter 1)"))
        .expect("reject event");
    assert!(reject.content.contains("- missing bounds check on offset"));
    assert!(reject.content.contains("- add a regression test"));

    let reviews = store.reviews(task.id).expect("reviews");
    assert_eq!(reviews.len(), 2);
}

#[test]
fn coder_blocker_parks_task_and_answer_resumes_it() {
    let (temp, store) = plain_workspace();
    let cfg = api_config();
    let scripts = Scripts::default();

    let epic = store.create_epic("API design", "", "medium").expect("epic");
    let blocked_task = store
        .create_task("Choose transport", "", "medium", Some(epic.id))
        .expect("task");
    let other_task = store
        .create_task("Write helpers", "", "medium", Some(epic.id))
        .expect("task");

    // First task blocks; the pipeline continues with the second.
    scripts.push("coder-agent", "BLOCKED: REST or GraphQL?");
    scripts.push("coder-agent", "helpers written");
    scripts.push("reviewer-agent", "VERDICT: APPROVE");

    let opts = AutoOptions {
        skip_plan: true,
        ..AutoOptions::default()
    };
    let summary =
        run_auto(&store, &cfg, temp.path(), epic.id, &opts, &factory(&scripts)).expect("auto");

    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.completed, 1);

    let parked = store.get(blocked_task.id).expect("task");
    assert_eq!(parked.status, TaskStatus::Blocked);
    assert_eq!(parked.blocked_reason, "REST or GraphQL?");
    assert_eq!(
        store.get(other_task.id).expect("other").status,
        TaskStatus::Done
    );

    let runs = store.runs(epic.id).expect("runs");
    assert_eq!(runs.last().expect("run").status, RunStatus::Blocked);

    // Answer the blocker; the fix loop resumes the task immediately.
    scripts.push("coder-agent", "implemented REST transport");
    scripts.push("reviewer-agent", "VERDICT: APPROVE");

    let outcome = answer_blocker(
        &store,
        &cfg,
        temp.path(),
        blocked_task.id,
        "REST",
        3,
        &factory(&scripts),
    )
    .expect("answer");

    match outcome {
        AnswerOutcome::Ran(TaskOutcome::Done, _) => {}
        other => panic!("unexpected answer outcome: {other:?}"),
    }

    let resumed = store.get(blocked_task.id).expect("task");
    assert_eq!(resumed.status, TaskStatus::Done);
    assert_eq!(resumed.blocked_reason, "");

    let events = store.events(blocked_task.id).expect("events");
    assert!(events
        .iter()
        .any(|e| e.event_type == "unblocked" && e.content.contains("REST")));
}

#[test]
fn answer_skip_cancels_the_task() {
    let (temp, store) = plain_workspace();
    let cfg = api_config();

    let task = store.create_task("T", "", "", None).expect("task");
    store.block(task.id, "still needed?").expect("block");

    let outcome = answer_blocker(
        &store,
        &cfg,
        temp.path(),
        task.id,
        "skip",
        3,
        &factory(&Scripts::default()),
    )
    .expect("answer");

    assert!(matches!(outcome, AnswerOutcome::Cancelled));
    let cancelled = store.get(task.id).expect("task");
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.blocked_reason, "");
}

#[test]
fn resume_marks_old_run_interrupted_and_reruns_stale_tasks() {
    let (temp, store) = plain_workspace();
    let cfg = api_config();
    let scripts = Scripts::default();

    let epic = store.create_epic("E", "", "medium").expect("epic");
    let stuck = store
        .create_task("Stuck task", "", "medium", Some(epic.id))
        .expect("task");
    store.assign(stuck.id, "coder-agent", "coder").expect("assign");

    // Simulate a crash: a run left `running` with a task mid-flight.
    let old_run = store.start_run(epic.id, 2, 1).expect("run");
    store
        .update_status(stuck.id, TaskStatus::InProgress)
        .expect("in progress");

    scripts.push("coder-agent", "finished after restart");
    scripts.push("reviewer-agent", "VERDICT: APPROVE");

    let (info, summary) = resume_run(&store, &cfg, temp.path(), old_run, &factory(&scripts))
        .expect("resume");

    assert_eq!(info.reset_tasks, 1);
    assert_eq!(info.max_loops, 2);
    assert_eq!(info.parallel, 1);
    assert_eq!(summary.completed, 1);

    // No task under the epic is left in_progress or review.
    for child in store.list_children(epic.id).expect("children") {
        assert!(!matches!(
            child.status,
            TaskStatus::InProgress | TaskStatus::Review
        ));
    }

    let runs = store.runs(epic.id).expect("runs");
    assert_eq!(runs[0].status, RunStatus::Interrupted);
    assert_eq!(runs.last().expect("run").status, RunStatus::Completed);
    assert_eq!(store.get(stuck.id).expect("task").status, TaskStatus::Done);
}

#[test]
fn accept_refuses_while_tasks_are_unfinished() {
    let (temp, store) = plain_workspace();
    let epic = store.create_epic("E", "", "medium").expect("epic");
    store
        .create_task("open task", "", "", Some(epic.id))
        .expect("task");

    let err = accept_epic(&store, temp.path(), epic.id).unwrap_err();
    assert!(err.to_string().contains("cannot accept epic"));
    // Nothing changed.
    assert_eq!(store.get(epic.id).expect("epic").status, TaskStatus::Backlog);
}

#[test]
fn accept_merges_the_safety_branch_and_finishes_the_epic() {
    let (temp, store, git) = git_workspace();

    let epic = store.create_epic("Feature", "", "medium").expect("epic");
    let branch = epic_branch_name(epic.id);
    git.create_branch(&branch).expect("branch");
    store.set_git_branch(epic.id, &branch).expect("set branch");

    let task = store
        .create_task("Implement", "", "", Some(epic.id))
        .expect("task");
    fs::write(temp.path().join("feature.txt"), "agent work\n").expect("write");
    git.commit_all("hive: task work").expect("commit");
    store.update_status(task.id, TaskStatus::Done).expect("done");

    let summary = accept_epic(&store, temp.path(), epic.id).expect("accept");
    assert_eq!(summary.base_branch.as_deref(), Some("main"));

    assert_eq!(git.current_branch().expect("branch"), "main");
    assert!(!git.branch_exists(&branch));
    assert!(temp.path().join("feature.txt").exists());

    let epic = store.get(epic.id).expect("epic");
    assert_eq!(epic.status, TaskStatus::Done);
    assert!(store
        .events(epic.id)
        .expect("events")
        .iter()
        .any(|e| e.event_type == "accepted"));
}

#[test]
fn reject_discards_the_branch_and_cascades_failure() {
    let (temp, store, git) = git_workspace();

    let epic = store.create_epic("Doomed", "", "medium").expect("epic");
    let branch = epic_branch_name(epic.id);
    git.create_branch(&branch).expect("branch");
    store.set_git_branch(epic.id, &branch).expect("set branch");

    let done_task = store
        .create_task("finished", "", "", Some(epic.id))
        .expect("task");
    store
        .update_status(done_task.id, TaskStatus::Done)
        .expect("done");
    let open_task = store
        .create_task("unfinished", "", "", Some(epic.id))
        .expect("task");

    // Two commits of agent work on the safety branch.
    fs::write(temp.path().join("one.txt"), "1\n").expect("write");
    git.commit_all("hive: task #1").expect("commit");
    fs::write(temp.path().join("two.txt"), "2\n").expect("write");
    git.commit_all("hive: task #2").expect("commit");

    let summary = reject_epic(&store, temp.path(), epic.id).expect("reject");
    assert_eq!(summary.base_branch.as_deref(), Some("main"));
    assert_eq!(summary.cascaded, vec![open_task.id]);

    assert_eq!(git.current_branch().expect("branch"), "main");
    assert!(!git.branch_exists(&branch));
    assert!(!temp.path().join("one.txt").exists());

    assert_eq!(store.get(epic.id).expect("epic").status, TaskStatus::Failed);
    assert_eq!(
        store.get(open_task.id).expect("task").status,
        TaskStatus::Failed
    );
    // Terminal tasks are left alone.
    assert_eq!(
        store.get(done_task.id).expect("task").status,
        TaskStatus::Done
    );
}

#[test]
fn parallel_worktree_tasks_land_one_commit_each_on_the_epic_branch() {
    let (temp, store, git) = git_workspace();
    let cfg = cli_coder_config();
    let scripts = Scripts::default();

    let epic = store.create_epic("Parallel epic", "", "medium").expect("epic");
    let mut task_ids = Vec::new();
    for i in 0..3 {
        let task = store
            .create_task(&format!("Parallel task {i}"), "", "medium", Some(epic.id))
            .expect("task");
        task_ids.push(task.id);
    }
    // Reviewer approves everything; the coder is a file writer.
    for _ in 0..3 {
        scripts.push("reviewer-agent", "VERDICT: APPROVE");
    }

    let factory = ScriptedFactory {
        scripts: scripts.clone(),
        file_writers: vec!["coder-agent".to_string()],
    };
    let opts = AutoOptions {
        skip_plan: true,
        parallel: 3,
        ..AutoOptions::default()
    };
    let summary = run_auto(&store, &cfg, temp.path(), epic.id, &opts, &factory).expect("auto");

    assert_eq!(summary.completed, 3, "results: {:?}", summary.results);

    // One cherry-picked commit per task on the epic branch, and every
    // task's file is present in the main working directory.
    let branch = epic_branch_name(epic.id);
    let log = git.log("main", &branch).expect("log");
    let task_commits = log
        .lines()
        .filter(|line| line.contains("hive: task #"))
        .count();
    assert_eq!(task_commits, 3, "log:\n{log}");

    for id in &task_ids {
        assert!(
            temp.path().join(format!("task-{id}.txt")).exists(),
            "task {id} file missing after integration"
        );
    }

    // Worktrees were cleaned up.
    let worktrees = git.list_worktrees().expect("worktrees");
    assert_eq!(worktrees.len(), 1, "only the main worktree remains");
    for id in &task_ids {
        assert!(!temp
            .path()
            .join(".hive")
            .join("worktrees")
            .join(format!("task-{id}"))
            .exists());
    }

    assert!(summary.epic_in_review);
    assert_eq!(store.get(epic.id).expect("epic").status, TaskStatus::Review);
}
