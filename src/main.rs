//! hive — a kanban board for AI coding agents.
//!
//! You are the PM. Agents play typed roles (planner, architect, coder,
//! reviewer) and advance epics through a pipeline while their changes
//! stay quarantined on per-epic git branches. You answer their
//! questions and accept or reject the net diff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use hive::agents::{new_runner, Request};
use hive::board::{
    item_line, priority_color, render_board, render_log, render_status, status_color, BOLD, CYAN,
    DIM, GREEN, RED, RESET, YELLOW,
};
use hive::context::ContextBuilder;
use hive::core::parser::{parse_blocked, parse_review};
use hive::core::types::{TaskKind, TaskStatus, Verdict};
use hive::io::config::{force_auto_accept, load_config, save_config, AgentMode, Config};
use hive::io::git::{epic_branch_name, Git};
use hive::io::store::Store;
use hive::pipeline::{
    accept_epic, answer_blocker, plan, reject_epic, resume_run, run_auto, save_artifact,
    AgentBinding, AnswerOutcome, AutoOptions, DefaultRunnerFactory, PipelineSummary, PlanOutcome,
    TaskOutcome, TaskResult, DEFAULT_MAX_LOOPS,
};

const HIVE_DIR: &str = ".hive";

#[derive(Parser)]
#[command(
    name = "hive",
    version,
    about = "Kanban for AI agents — you are the PM, agents are your workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize hive in the current directory.
    Init,
    /// Create and manage epics.
    Epic {
        #[command(subcommand)]
        command: EpicCommand,
    },
    /// Create and manage tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Break an epic into tasks using the planner agent.
    Plan {
        id: i64,
        /// Override the planner agent name.
        #[arg(short, long)]
        agent: Option<String>,
    },
    /// Run the full autonomous pipeline on an epic or task.
    Auto {
        id: i64,
        /// Maximum fix-review iterations per task.
        #[arg(long, default_value_t = DEFAULT_MAX_LOOPS)]
        max_loops: u32,
        /// Skip planning, run directly on existing tasks.
        #[arg(long)]
        skip_plan: bool,
        /// Number of tasks to run in parallel (uses git worktrees).
        #[arg(long, default_value_t = 1)]
        parallel: u32,
    },
    /// Run an agent once on a task.
    Run {
        /// Task id; defaults to the highest-priority assigned backlog task.
        id: Option<i64>,
        /// Override which agent to use.
        #[arg(short, long)]
        agent: Option<String>,
        /// Show the prompt that would be sent without executing.
        #[arg(long)]
        dry: bool,
    },
    /// Run the code -> review -> fix loop on a task.
    Fix {
        id: i64,
        #[arg(long, default_value_t = DEFAULT_MAX_LOOPS)]
        max_loops: u32,
        /// Override the coder agent name.
        #[arg(long)]
        coder: Option<String>,
        /// Override the reviewer agent name.
        #[arg(long)]
        reviewer: Option<String>,
    },
    /// Run the reviewer once on a task and apply its verdict.
    Review {
        id: i64,
        /// Override the reviewer agent name.
        #[arg(short, long)]
        agent: Option<String>,
    },
    /// Answer a blocker and auto-continue the pipeline ("skip" cancels).
    Answer {
        id: i64,
        /// The answer text (or "skip").
        #[arg(required = true)]
        answer: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_MAX_LOOPS)]
        max_loops: u32,
    },
    /// Resume an interrupted pipeline run.
    Resume {
        /// Run id; lists interrupted runs when omitted.
        run_id: Option<i64>,
    },
    /// Show the kanban board.
    Board,
    /// Quick status overview.
    Status,
    /// Show the event log for a work item.
    Log { id: i64 },
    /// Self-refreshing board view.
    Ui,
}

#[derive(Subcommand)]
enum EpicCommand {
    /// Create a new epic (and its safety branch, in a git repo).
    Create {
        #[arg(required = true)]
        title: Vec<String>,
        /// Priority: high, medium, low.
        #[arg(short, long, default_value = "medium")]
        priority: String,
        /// Epic description / acceptance criteria.
        #[arg(short, long, default_value = "")]
        desc: String,
    },
    /// List epics, optionally filtered by status.
    List { status: Option<String> },
    /// Show epic details and its tasks.
    Show { id: i64 },
    /// Accept an epic: merge its safety branch into the base branch.
    Accept { id: i64 },
    /// Reject an epic: discard all agent work on it.
    Reject { id: i64 },
    /// Show the total diff for an epic.
    Diff { id: i64 },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a new task.
    Create {
        #[arg(required = true)]
        title: Vec<String>,
        #[arg(short, long, default_value = "medium")]
        priority: String,
        #[arg(short, long, default_value = "")]
        desc: String,
        /// Parent epic id.
        #[arg(long)]
        parent: Option<i64>,
    },
    /// List tasks, optionally filtered by status.
    List { status: Option<String> },
    /// Show task details.
    Show { id: i64 },
    /// Assign an agent to a task.
    Assign {
        id: i64,
        agent: String,
        #[arg(short, long, default_value = "coder")]
        role: String,
    },
    /// Mark a task as blocked.
    Block {
        id: i64,
        #[arg(required = true)]
        reason: Vec<String>,
    },
    /// Mark a task as done.
    Done { id: i64 },
    /// Cancel a task: the pipeline will skip it.
    Cancel { id: i64 },
}

fn main() {
    hive::logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let workdir = std::env::current_dir().context("get working directory")?;

    match cli.command {
        Command::Init => cmd_init(&workdir),
        Command::Epic { command } => cmd_epic(&workdir, command),
        Command::Task { command } => cmd_task(&workdir, command),
        Command::Plan { id, agent } => cmd_plan(&workdir, id, agent),
        Command::Auto {
            id,
            max_loops,
            skip_plan,
            parallel,
        } => cmd_auto(&workdir, id, max_loops, skip_plan, parallel),
        Command::Run { id, agent, dry } => cmd_run(&workdir, id, agent, dry),
        Command::Fix {
            id,
            max_loops,
            coder,
            reviewer,
        } => cmd_fix(&workdir, id, max_loops, coder, reviewer),
        Command::Review { id, agent } => cmd_review(&workdir, id, agent),
        Command::Answer {
            id,
            answer,
            max_loops,
        } => cmd_answer(&workdir, id, &answer.join(" "), max_loops),
        Command::Resume { run_id } => cmd_resume(&workdir, run_id),
        Command::Board => {
            let store = must_store(&workdir)?;
            print!("{}", render_board(&store)?);
            Ok(())
        }
        Command::Status => {
            let store = must_store(&workdir)?;
            print!("{}", render_status(&store)?);
            Ok(())
        }
        Command::Log { id } => {
            let store = must_store(&workdir)?;
            print!("{}", render_log(&store, id)?);
            Ok(())
        }
        Command::Ui => cmd_ui(&workdir),
    }
}

fn hive_path(workdir: &Path, parts: &[&str]) -> PathBuf {
    let mut path = workdir.join(HIVE_DIR);
    for part in parts {
        path = path.join(part);
    }
    path
}

fn must_store(workdir: &Path) -> Result<Store> {
    let db_path = hive_path(workdir, &["hive.db"]);
    if !db_path.exists() {
        bail!("hive not initialized. Run: hive init");
    }
    Store::open(&db_path)
}

fn must_config(workdir: &Path) -> Result<Config> {
    load_config(&hive_path(workdir, &["config.yaml"])).context("load config")
}

fn cmd_init(workdir: &Path) -> Result<()> {
    let hive_dir = workdir.join(HIVE_DIR);
    if hive_dir.exists() {
        bail!("hive already initialized in this directory (.hive/ exists)");
    }

    std::fs::create_dir_all(hive_dir.join("runs")).context("create .hive/runs")?;
    save_config(&hive_path(workdir, &["config.yaml"]), &Config::default())
        .context("write config")?;
    Store::open(&hive_path(workdir, &["hive.db"])).context("create database")?;

    println!("Initialized hive in .hive/");
    println!();
    println!("Next steps:");
    println!("  1. Edit .hive/config.yaml to add your agents");
    println!("  2. Run: hive epic create \"your goal\"");
    println!("  3. Run: hive auto <epic-id>");
    Ok(())
}

fn cmd_epic(workdir: &Path, command: EpicCommand) -> Result<()> {
    let store = must_store(workdir)?;
    match command {
        EpicCommand::Create {
            title,
            priority,
            desc,
        } => {
            let title = title.join(" ");
            let epic = store.create_epic(&title, &desc, &priority)?;
            println!(
                "Created epic {YELLOW}#{}{RESET}: {} [{}]",
                epic.id, epic.title, epic.priority
            );

            let git = Git::new(workdir);
            if git.is_repo() {
                let branch = epic_branch_name(epic.id);
                if git.has_dirty() {
                    println!();
                    println!("{YELLOW}⚠  Uncommitted changes detected.{RESET}");
                    println!("  Commit or stash them before starting work on this epic.");
                    println!(
                        "  Safety branch {CYAN}{branch}{RESET} will be created by {CYAN}hive auto {}{RESET}",
                        epic.id
                    );
                } else if git.create_branch(&branch).is_ok() {
                    store.set_git_branch(epic.id, &branch)?;
                    println!(
                        "  Branch: {CYAN}{branch}{RESET} (safety net — all agent work happens here)"
                    );
                }
            }

            println!();
            println!("Next: {CYAN}hive auto {}{RESET} to run the full pipeline", epic.id);
            Ok(())
        }
        EpicCommand::List { status } => {
            let status = parse_status_filter(status.as_deref())?;
            let epics = store.list_epics(status)?;
            if epics.is_empty() {
                println!("No epics found. Create one: hive epic create \"description\"");
                return Ok(());
            }
            for epic in epics {
                let children = store.list_children(epic.id)?;
                let done = children
                    .iter()
                    .filter(|t| t.status == TaskStatus::Done)
                    .count();
                println!("{}", item_line(&epic, Some((done, children.len()))));
            }
            Ok(())
        }
        EpicCommand::Show { id } => cmd_epic_show(workdir, &store, id),
        EpicCommand::Accept { id } => {
            let summary = accept_epic(&store, workdir, id)?;
            if let (Some(base), Some(branch)) = (&summary.base_branch, &summary.branch) {
                println!("{BOLD}═══ Accept Epic #{id} ═══{RESET}");
                println!();
                if !summary.commits.is_empty() {
                    println!("  {BOLD}Commits:{RESET}");
                    for line in summary.commits.lines() {
                        println!("    {line}");
                    }
                    println!();
                }
                if !summary.diff_stat.is_empty() {
                    println!("  {BOLD}Changes:{RESET}");
                    for line in summary.diff_stat.lines() {
                        println!("    {}", line.trim_end());
                    }
                    println!();
                }
                println!("  {GREEN}{BOLD}✓ Merged {branch} into {base}{RESET}");
            }
            println!("  {GREEN}{BOLD}✓ Epic #{id} done{RESET}");
            Ok(())
        }
        EpicCommand::Reject { id } => {
            let summary = reject_epic(&store, workdir, id)?;
            if !summary.discarded_diff_stat.is_empty() {
                println!("  {RED}Discarding changes:{RESET}");
                for line in summary.discarded_diff_stat.lines() {
                    println!("    {}", line.trim_end());
                }
            }
            println!("  {RED}{BOLD}✗ Discarded all agent work on epic #{id}{RESET}");
            if let Some(base) = summary.base_branch {
                println!("  Back on {CYAN}{base}{RESET}");
            }
            if !summary.cascaded.is_empty() {
                let ids: Vec<String> = summary.cascaded.iter().map(|i| format!("#{i}")).collect();
                println!("  Cascaded to failed: {}", ids.join(", "));
            }
            Ok(())
        }
        EpicCommand::Diff { id } => {
            let epic = store.get(id)?;
            if epic.git_branch.is_empty() {
                bail!("epic #{id} has no safety branch");
            }
            let git = Git::new(workdir);
            let base = git.base_branch().context("detect base branch")?;
            let stat = git.diff_stat(&base, &epic.git_branch).unwrap_or_default();
            if !stat.trim().is_empty() {
                println!("{BOLD}═══ Epic #{id}: {} ═══{RESET}", epic.title);
                println!();
                println!("{DIM}{}{RESET}", stat.trim_end());
                println!();
            }
            let diff = git.diff(&base, &epic.git_branch)?;
            if diff.is_empty() {
                println!("No changes.");
            } else {
                print!("{diff}");
            }
            Ok(())
        }
    }
}

fn cmd_epic_show(workdir: &Path, store: &Store, id: i64) -> Result<()> {
    let epic = store.get(id)?;
    if epic.kind != TaskKind::Epic {
        bail!("#{id} is a task, not an epic. Use 'hive task show {id}'");
    }

    println!("{BOLD}Epic #{}{RESET}", epic.id);
    println!("  Title:    {}", epic.title);
    println!(
        "  Status:   {}{}{RESET}",
        status_color(epic.status),
        epic.status
    );
    println!(
        "  Priority: {}{}{RESET}",
        priority_color(&epic.priority),
        epic.priority
    );
    if !epic.description.is_empty() {
        println!("  Desc:     {}", epic.description);
    }
    if !epic.git_branch.is_empty() {
        println!("  Branch:   {CYAN}{}{RESET}", epic.git_branch);
    }
    println!("  Created:  {}", epic.created_at.format("%Y-%m-%d %H:%M"));

    let tasks = store.list_children(epic.id)?;
    if tasks.is_empty() {
        println!();
        println!("  No tasks yet. Run: {CYAN}hive plan {}{RESET}", epic.id);
    } else {
        println!();
        println!("  {BOLD}Tasks ({}):{RESET}", tasks.len());
        for task in tasks {
            println!("    {}", item_line(&task, None));
        }
    }

    if !epic.git_branch.is_empty() {
        let git = Git::new(workdir);
        if let Ok(base) = git.base_branch() {
            if let Ok(stat) = git.diff_stat(&base, &epic.git_branch) {
                if !stat.trim().is_empty() {
                    println!();
                    println!("  {BOLD}Changes:{RESET}");
                    for line in stat.trim_end().lines() {
                        println!("    {}", line.trim_end());
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_task(workdir: &Path, command: TaskCommand) -> Result<()> {
    let store = must_store(workdir)?;
    match command {
        TaskCommand::Create {
            title,
            priority,
            desc,
            parent,
        } => {
            let task = store.create_task(&title.join(" "), &desc, &priority, parent)?;
            println!(
                "Created task {YELLOW}#{}{RESET}: {} [{}]",
                task.id, task.title, task.priority
            );
            Ok(())
        }
        TaskCommand::List { status } => {
            let status = parse_status_filter(status.as_deref())?;
            let tasks = store.list_only_tasks(status)?;
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            for task in tasks {
                println!("{}", item_line(&task, None));
            }
            Ok(())
        }
        TaskCommand::Show { id } => {
            let task = store.get(id)?;
            println!("{BOLD}{} #{}{RESET}", task.kind.label(), task.id);
            println!("  Title:    {}", task.title);
            println!(
                "  Status:   {}{}{RESET}",
                status_color(task.status),
                task.status
            );
            println!(
                "  Priority: {}{}{RESET}",
                priority_color(&task.priority),
                task.priority
            );
            if let Some(parent_id) = task.parent_id {
                println!("  Epic:     #{parent_id}");
            }
            if !task.description.is_empty() {
                println!("  Desc:     {}", task.description);
            }
            if !task.assigned_agent.is_empty() {
                println!(
                    "  Agent:    {CYAN}{}{RESET} (role: {})",
                    task.assigned_agent, task.role
                );
            }
            if task.status == TaskStatus::Blocked {
                println!("  {RED}Blocked:  {}{RESET}", task.blocked_reason);
                println!("  Answer:   {CYAN}hive answer {} \"...\"{RESET}", task.id);
            }
            let artifacts = store.artifacts(id)?;
            if !artifacts.is_empty() {
                println!();
                println!("  {BOLD}Artifacts:{RESET}");
                for artifact in artifacts {
                    println!("    {DIM}{:<10}{RESET} {}", artifact.kind, artifact.file_path);
                }
            }
            Ok(())
        }
        TaskCommand::Assign { id, agent, role } => {
            store.assign(id, &agent, &role)?;
            println!("Assigned #{id} to {CYAN}{agent}{RESET} (role: {role})");
            Ok(())
        }
        TaskCommand::Block { id, reason } => {
            store.block(id, &reason.join(" "))?;
            println!("Blocked #{id}");
            Ok(())
        }
        TaskCommand::Done { id } => {
            store.update_status(id, TaskStatus::Done)?;
            println!("{GREEN}✓{RESET} Task #{id} done");
            Ok(())
        }
        TaskCommand::Cancel { id } => {
            store.update_status(id, TaskStatus::Cancelled)?;
            store.add_event(id, "user", "cancelled", "Cancelled by user")?;
            println!("Cancelled task #{id} — the pipeline will skip it.");
            Ok(())
        }
    }
}

fn cmd_plan(workdir: &Path, id: i64, agent_override: Option<String>) -> Result<()> {
    let store = must_store(workdir)?;
    let cfg = must_config(workdir)?;
    let item = store.get(id)?;

    // Plan on the epic's safety branch so the planner sees its state.
    let git = Git::new(workdir);
    if item.kind == TaskKind::Epic && git.is_repo() {
        if item.git_branch.is_empty() {
            if !git.has_dirty() {
                let branch = epic_branch_name(item.id);
                if git.create_branch(&branch).is_ok() {
                    store.set_git_branch(item.id, &branch)?;
                    println!("  Created safety branch {CYAN}{branch}{RESET}");
                }
            }
        } else {
            git.create_branch(&item.git_branch)
                .with_context(|| format!("switch to safety branch {}", item.git_branch))?;
        }
    }

    let planner = resolve_agent(&cfg, agent_override.as_deref(), "planner")?;
    println!(
        "Planning {} #{}: {}",
        item.kind.as_str(),
        item.id,
        item.title
    );
    println!("  Planner: {CYAN}{}{RESET}", planner.name);
    println!();

    let item = store.get(id)?;
    match plan(&store, workdir, &item, &planner, &DefaultRunnerFactory)? {
        PlanOutcome::Blocked(question) => {
            println!("{RED}{BOLD}⚠  Planner needs your input:{RESET} {question}");
            println!("   → {CYAN}hive answer {id} \"your answer\"{RESET}");
        }
        PlanOutcome::NoStructure(raw) => {
            println!("Planner didn't return structured subtasks.");
            println!("Raw output:");
            println!("{raw}");
        }
        PlanOutcome::Created(tasks) => {
            println!("{BOLD}Created {} tasks:{RESET}", tasks.len());
            println!();
            for task in &tasks {
                let pri = priority_color(&task.priority);
                print!("  {YELLOW}#{}{RESET} {pri}{}{RESET}", task.id, task.title);
                if !task.description.is_empty() {
                    print!(" {DIM}— {}{RESET}", task.description);
                }
                println!(" [{}]", task.priority);
            }
            println!();
            println!("Next: {CYAN}hive auto {id}{RESET} to run the full pipeline");
        }
    }
    Ok(())
}

fn cmd_auto(workdir: &Path, id: i64, max_loops: u32, skip_plan: bool, parallel: u32) -> Result<()> {
    let store = must_store(workdir)?;
    let cfg = must_config(workdir)?;

    println!("{BOLD}═══ hive auto — full pipeline ═══{RESET}");
    println!();

    let opts = AutoOptions {
        max_loops,
        parallel,
        skip_plan,
    };
    let summary = run_auto(&store, &cfg, workdir, id, &opts, &DefaultRunnerFactory)?;

    if let Some(run_id) = summary.stale_run_warning {
        println!(
            "  {YELLOW}⚠ WARNING: a previous pipeline run (#{run_id}) never finished.{RESET}"
        );
        println!("  → Use {CYAN}hive resume {run_id}{RESET} to cleanly recover next time.");
        println!();
    }
    print_summary(id, &summary);
    Ok(())
}

fn print_summary(id: i64, summary: &PipelineSummary) {
    if let Some(branch) = &summary.branch {
        println!("  Branch: {CYAN}{branch}{RESET}");
    }
    if let Some(question) = &summary.planner_blocked {
        println!("  {RED}{BOLD}⚠ Planner needs your input:{RESET} {question}");
        println!("  → {CYAN}hive answer {id} \"...\" && hive auto {id}{RESET}");
        return;
    }
    if let Some(raw) = &summary.unparsed_plan {
        println!("  Planner didn't return structured subtasks; ran the coder on the item itself.");
        println!("{DIM}{raw}{RESET}");
    }
    if !summary.planned.is_empty() {
        println!("  Planned {} tasks:", summary.planned.len());
        for task in &summary.planned {
            println!("    {YELLOW}#{}{RESET} {} [{}]", task.id, task.title, task.priority);
        }
    }

    println!();
    for result in &summary.results {
        print_task_result(result);
    }

    println!();
    println!("{BOLD}═══ Pipeline complete ═══{RESET}");
    println!("  Total tasks: {}", summary.results.len());
    if summary.completed > 0 {
        println!("  {GREEN}✓ Completed: {}{RESET}", summary.completed);
    }
    if summary.blocked > 0 {
        println!(
            "  {YELLOW}⚠ Blocked:   {}{RESET} (answer blockers, then re-run with --skip-plan)",
            summary.blocked
        );
    }
    if summary.failed > 0 {
        println!("  {RED}✗ Failed:    {}{RESET}", summary.failed);
    }

    if summary.epic_in_review {
        println!();
        println!("  {GREEN}{BOLD}All tasks complete!{RESET}");
        if let Some(stat) = &summary.diff_stat {
            println!();
            println!("  {BOLD}Changes:{RESET}");
            for line in stat.lines() {
                println!("    {}", line.trim_end());
            }
        }
        println!();
        println!("  Review and accept: {CYAN}hive epic accept {id}{RESET}");
        println!("  Or reject:         {CYAN}hive epic reject {id}{RESET}");
        println!("  View full diff:    {CYAN}hive epic diff {id}{RESET}");
    }
}

fn print_task_result(result: &TaskResult) {
    let (icon, color) = match result.outcome {
        TaskOutcome::Done => ("✓", GREEN),
        TaskOutcome::Blocked => ("⚠", YELLOW),
        TaskOutcome::Failed => ("✗", RED),
    };
    print!(
        "  {color}{icon}{RESET} {YELLOW}#{}{RESET} {}",
        result.task_id, result.title
    );
    if !result.duration.is_zero() {
        print!(" {DIM}({:.1}s){RESET}", result.duration.as_secs_f64());
    }
    println!();
    for line in &result.log {
        println!("    {DIM}{line}{RESET}");
    }
}

fn cmd_run(workdir: &Path, id: Option<i64>, agent_override: Option<String>, dry: bool) -> Result<()> {
    let store = must_store(workdir)?;
    let cfg = must_config(workdir)?;

    let task = match id {
        Some(id) => store.get(id)?,
        None => next_assigned_backlog_task(&store)?,
    };

    let agent_name = agent_override
        .or_else(|| {
            if task.assigned_agent.is_empty() {
                None
            } else {
                Some(task.assigned_agent.clone())
            }
        })
        .ok_or_else(|| {
            anyhow!(
                "task #{} has no assigned agent. Use: hive task assign {} <agent>",
                task.id,
                task.id
            )
        })?;
    let agent_cfg = cfg
        .agents
        .get(&agent_name)
        .ok_or_else(|| anyhow!("agent {agent_name:?} not found in config"))?
        .clone();

    let role = if task.role.is_empty() {
        agent_cfg.role.clone()
    } else {
        task.role.clone()
    };

    let ctx = ContextBuilder::new(&store);
    let prompt = if role == "reviewer" {
        ctx.build_review_prompt(&task, workdir)?
    } else {
        ctx.build_prompt(&task, &role)?
    };

    if dry {
        println!(
            "=== DRY RUN: Task #{} -> Agent: {agent_name} (role: {role}) ===",
            task.id
        );
        println!();
        println!("{prompt}");
        println!();
        println!("=== END PROMPT ({} chars) ===", prompt.chars().count());
        return Ok(());
    }

    let runner = new_runner(&agent_name, &agent_cfg)?;
    store.update_status(task.id, TaskStatus::InProgress)?;

    let mode = match agent_cfg.mode {
        AgentMode::Cli => "cli",
        AgentMode::Api => "api",
    };
    println!("Running task #{}: {}", task.id, task.title);
    println!("  Agent: {agent_name} ({mode} mode)");
    println!("  Role:  {role}");
    println!();

    let resp = match runner.run(&Request {
        task_id: task.id,
        prompt,
        workdir: workdir.to_path_buf(),
        timeout: agent_cfg.timeout(),
    }) {
        Ok(resp) => resp,
        Err(err) => {
            store.update_status(task.id, TaskStatus::Failed)?;
            return Err(err.context("agent execution failed"));
        }
    };

    let artifact_kind = match role.as_str() {
        "reviewer" => "review",
        "planner" => "plan",
        "architect" => "architect",
        _ => "code",
    };
    save_artifact(
        &store,
        workdir,
        task.id,
        artifact_kind,
        &format!("task-{}-{agent_name}-output.md", task.id),
        &resp.output,
    )?;
    let output_preview: String = resp.output.chars().take(500).collect();
    store.add_event(task.id, &agent_name, "agent_output", &output_preview)?;

    println!(
        "--- Agent output ({:.1}s, exit code {}) ---",
        resp.duration_secs, resp.exit_code
    );
    println!();
    println!("{}", resp.output);
    println!();

    if let Some(question) = parse_blocked(&resp.output) {
        store.block(task.id, &question)?;
        println!("Agent raised a blocker: {question}");
        println!("Answer with: {CYAN}hive answer {} \"your answer\"{RESET}", task.id);
        return Ok(());
    }

    if resp.exit_code != 0 {
        store.update_status(task.id, TaskStatus::Failed)?;
        println!("{RED}Task #{} failed (exit code {}){RESET}", task.id, resp.exit_code);
        if let Some(err) = resp.error {
            println!("Error: {err}");
        }
        return Ok(());
    }

    if role == "reviewer" {
        let review = parse_review(&resp.output);
        match review.verdict {
            Some(Verdict::Approve) => {
                store.add_review(task.id, &agent_name, Verdict::Approve, &resp.output)?;
                store.update_status(task.id, TaskStatus::Done)?;
                println!("Review: {GREEN}APPROVED{RESET}. Task done.");
            }
            Some(Verdict::Reject) => {
                store.add_review(task.id, &agent_name, Verdict::Reject, &resp.output)?;
                store.update_status(task.id, TaskStatus::Backlog)?;
                println!("Review: {RED}REJECTED{RESET}. Task moved back to backlog for fixes.");
            }
            None => {
                store.update_status(task.id, TaskStatus::Review)?;
                println!("Review complete. Check output for verdict.");
            }
        }
    } else {
        store.update_status(task.id, TaskStatus::Done)?;
        println!("{GREEN}✓{RESET} Task #{} completed.", task.id);
    }
    Ok(())
}

fn cmd_fix(
    workdir: &Path,
    id: i64,
    max_loops: u32,
    coder_override: Option<String>,
    reviewer_override: Option<String>,
) -> Result<()> {
    let store = must_store(workdir)?;
    let cfg = must_config(workdir)?;
    let task = store.get(id)?;

    let coder_name = coder_override.or_else(|| {
        if task.assigned_agent.is_empty() {
            None
        } else {
            Some(task.assigned_agent.clone())
        }
    });
    let mut coder = match coder_name {
        Some(name) => named_agent(&cfg, &name)?,
        None => resolve_agent(&cfg, None, "coder")
            .context("no coder agent found. Assign one or use --coder")?,
    };
    let mut reviewer = resolve_agent(&cfg, reviewer_override.as_deref(), "reviewer")
        .context("no reviewer agent configured. Add an agent with role: reviewer")?;

    // Pipeline invocations must never hang on a permission prompt.
    force_auto_accept(&mut coder.cfg);
    force_auto_accept(&mut reviewer.cfg);

    println!("{BOLD}═══ Fix loop: task #{id} ═══{RESET}");
    println!("  Task:     {}", task.title);
    println!("  Coder:    {CYAN}{}{RESET}", coder.name);
    println!("  Reviewer: {CYAN}{}{RESET}", reviewer.name);
    println!("  Max loops: {max_loops}");
    println!();

    let coder_runner = new_runner(&coder.name, &coder.cfg)?;
    let reviewer_runner = new_runner(&reviewer.name, &reviewer.cfg)?;

    let fix = hive::pipeline::FixLoop {
        store: &store,
        coder: coder_runner.as_ref(),
        coder_timeout: coder.cfg.timeout(),
        reviewer: Some((reviewer_runner.as_ref(), reviewer.cfg.timeout())),
        workdir,
        project_dir: workdir,
        max_loops,
        isolated: false,
    };
    let mut log = Vec::new();
    let outcome = fix.run(id, &mut log)?;

    for line in &log {
        println!("  {line}");
    }
    println!();
    match outcome {
        TaskOutcome::Done => println!("{GREEN}{BOLD}✓ Task #{id} approved{RESET}"),
        TaskOutcome::Blocked => {
            println!("{YELLOW}⚠ Blocked — answer with {CYAN}hive answer {id} \"...\"{RESET}");
        }
        TaskOutcome::Failed => println!("{RED}✗ Task #{id} failed{RESET}"),
    }
    Ok(())
}

fn cmd_review(workdir: &Path, id: i64, agent_override: Option<String>) -> Result<()> {
    let store = must_store(workdir)?;
    let cfg = must_config(workdir)?;
    let task = store.get(id)?;

    let reviewer = resolve_agent(&cfg, agent_override.as_deref(), "reviewer")
        .context("no reviewer agent configured. Add an agent with role: reviewer")?;

    let ctx = ContextBuilder::new(&store);
    let prompt = ctx.build_review_prompt(&task, workdir)?;
    let runner = new_runner(&reviewer.name, &reviewer.cfg)?;

    println!("Reviewing task #{id}: {}", task.title);
    println!("  Reviewer: {CYAN}{}{RESET}", reviewer.name);
    println!();

    store.update_status(id, TaskStatus::Review)?;
    let resp = runner.run(&Request {
        task_id: id,
        prompt,
        workdir: workdir.to_path_buf(),
        timeout: reviewer.cfg.timeout(),
    })?;

    save_artifact(
        &store,
        workdir,
        id,
        "review",
        &format!("task-{id}-review.md"),
        &resp.output,
    )?;

    let review = parse_review(&resp.output);
    match review.verdict {
        Some(Verdict::Approve) => {
            store.add_review(id, &reviewer.name, Verdict::Approve, &resp.output)?;
            store.update_status(id, TaskStatus::Done)?;
            println!("{GREEN}{BOLD}✓ APPROVED{RESET}");
            for comment in &review.comments {
                println!("  {DIM}• {comment}{RESET}");
            }
        }
        Some(Verdict::Reject) => {
            store.add_review(id, &reviewer.name, Verdict::Reject, &resp.output)?;
            store.update_status(id, TaskStatus::Backlog)?;
            let mut bullets = String::new();
            for comment in &review.comments {
                bullets.push_str("- ");
                bullets.push_str(comment);
                bullets.push('\n');
            }
            store.add_event(id, &reviewer.name, "reviewed", &format!("REJECTED:\n{bullets}"))?;
            println!("{RED}✗ REJECTED{RESET}");
            for comment in &review.comments {
                println!("  {RED}• {comment}{RESET}");
            }
        }
        None => {
            println!("{YELLOW}? No clear verdict{RESET}");
            println!();
            println!("{}", resp.output);
        }
    }
    Ok(())
}

fn cmd_answer(workdir: &Path, id: i64, answer: &str, max_loops: u32) -> Result<()> {
    let store = must_store(workdir)?;
    let task = store.get(id)?;

    // Config is only needed past the unblock, and "skip" needs none.
    let cfg = must_config(workdir)?;

    println!("Answering blocker on task #{id}");
    if !task.blocked_reason.is_empty() {
        println!("  Question: {}", task.blocked_reason);
        println!("  Answer:   {answer}");
        println!();
    }

    match answer_blocker(
        &store,
        &cfg,
        workdir,
        id,
        answer,
        max_loops,
        &DefaultRunnerFactory,
    )? {
        AnswerOutcome::Cancelled => {
            println!("Cancelled task #{id} — the pipeline will skip it.");
        }
        AnswerOutcome::BlockedAgain(question) => {
            println!("{YELLOW}⚠ Blocked again:{RESET} {question}");
            println!("  → {CYAN}hive answer {id} \"...\"{RESET}");
        }
        AnswerOutcome::NoCoder => {
            println!("{YELLOW}⚠ Unblocked, but no coder agent is configured.{RESET}");
        }
        AnswerOutcome::Ran(outcome, log) => {
            for line in &log {
                println!("  {line}");
            }
            println!();
            match outcome {
                TaskOutcome::Done => println!("{GREEN}{BOLD}✓ Task #{id} approved{RESET}"),
                TaskOutcome::Blocked => println!("  Coder blocked again — answer and re-run."),
                TaskOutcome::Failed => {
                    println!("  Task failed after {max_loops} iterations.");
                }
            }
        }
    }
    Ok(())
}

fn cmd_resume(workdir: &Path, run_id: Option<i64>) -> Result<()> {
    let store = must_store(workdir)?;

    let Some(run_id) = run_id else {
        let runs = store.interrupted_runs()?;
        if runs.is_empty() {
            println!("{GREEN}✓ No interrupted pipelines found.{RESET}");
            return Ok(());
        }
        println!("{BOLD}═══ Interrupted pipeline runs ═══{RESET}");
        println!();
        for run in runs {
            let title = store
                .get(run.epic_id)
                .map(|e| e.title)
                .unwrap_or_else(|_| format!("(epic #{})", run.epic_id));
            println!(
                "  {YELLOW}Run #{}{RESET}  {CYAN}E#{}{RESET} {title}",
                run.id, run.epic_id
            );
            println!(
                "    Started:  {}",
                run.started_at.format("%Y-%m-%d %H:%M:%S")
            );
            println!(
                "    Settings: max-loops={} parallel={}",
                run.max_loops, run.parallel
            );
        }
        println!();
        println!("  Resume with: {CYAN}hive resume <run-id>{RESET}");
        return Ok(());
    };

    let cfg = must_config(workdir)?;
    println!("{BOLD}═══ hive resume — crash recovery ═══{RESET}");
    println!();

    let (info, summary) = resume_run(&store, &cfg, workdir, run_id, &DefaultRunnerFactory)?;
    if info.reset_tasks > 0 {
        println!(
            "  {YELLOW}↺ Reset {} stale task(s) back to backlog{RESET}",
            info.reset_tasks
        );
    } else {
        println!("  {GREEN}✓ No stale tasks to reset{RESET}");
    }
    println!("  {DIM}✓ Marked run #{} as interrupted{RESET}", info.run_id);
    println!(
        "  Resuming with: max-loops={} parallel={} --skip-plan",
        info.max_loops, info.parallel
    );
    println!();
    print_summary(info.epic_id, &summary);
    Ok(())
}

fn cmd_ui(workdir: &Path) -> Result<()> {
    loop {
        let store = must_store(workdir)?;
        // Clear screen and home the cursor.
        print!("\x1b[2J\x1b[H");
        print!("{}", render_board(&store)?);
        println!();
        print!("{}", render_status(&store)?);
        println!();
        println!("{DIM}Refreshing every 2s — Ctrl+C to exit{RESET}");
        drop(store);
        std::thread::sleep(Duration::from_secs(2));
    }
}

/// The highest-priority backlog task with an assigned agent.
fn next_assigned_backlog_task(store: &Store) -> Result<hive::io::store::WorkItem> {
    let tasks = store.list(Some(TaskStatus::Backlog))?;
    let rank = |priority: &str| match priority {
        "high" => 0,
        "low" => 2,
        _ => 1,
    };
    tasks
        .into_iter()
        .filter(|t| !t.assigned_agent.is_empty())
        .min_by_key(|t| (rank(&t.priority), t.id))
        .ok_or_else(|| anyhow!("no assigned backlog tasks found. Create and assign a task first"))
}

/// An agent by explicit name, or the first one bound to `role`.
fn resolve_agent(cfg: &Config, name: Option<&str>, role: &str) -> Result<AgentBinding> {
    match name {
        Some(name) => named_agent(cfg, name),
        None => cfg
            .find_agent_by_role(role)
            .map(|(name, cfg)| AgentBinding { name, cfg })
            .ok_or_else(|| {
                anyhow!("no {role} agent configured. Add an agent with role: {role} in .hive/config.yaml")
            }),
    }
}

fn named_agent(cfg: &Config, name: &str) -> Result<AgentBinding> {
    let agent = cfg
        .agents
        .get(name)
        .ok_or_else(|| anyhow!("agent {name:?} not found in config"))?;
    Ok(AgentBinding {
        name: name.to_string(),
        cfg: agent.clone(),
    })
}

fn parse_status_filter(status: Option<&str>) -> Result<Option<TaskStatus>> {
    match status {
        None => Ok(None),
        Some(raw) => TaskStatus::parse(raw)
            .map(Some)
            .ok_or_else(|| anyhow!("unknown status {raw:?}")),
    }
}
