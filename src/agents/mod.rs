//! The Runner contract: how the core invokes an external agent.
//!
//! The [`Runner`] trait decouples the pipeline from the invocation
//! backend (local CLI subprocess or provider HTTP API). Tests use
//! scripted runners that return predetermined outputs without spawning
//! anything. An invocation is text in, text out: the core never
//! interprets the prompt and never parses the output here.

pub mod api;
pub mod cli;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::io::config::{AgentConfig, AgentMode};

/// Everything an agent needs to work on a task.
#[derive(Debug, Clone)]
pub struct Request {
    /// Task id, for tracking only.
    pub task_id: i64,
    /// The full prompt with context.
    pub prompt: String,
    /// Working directory (repo root or a task worktree).
    pub workdir: PathBuf,
    /// Deadline for the invocation.
    pub timeout: Duration,
}

/// What came back from an agent.
#[derive(Debug, Clone)]
pub struct Response {
    /// The agent's text output.
    pub output: String,
    /// 0 = success; provider HTTP status for API errors; -1 for
    /// timeouts and signals.
    pub exit_code: i32,
    /// Wall-clock execution time in seconds.
    pub duration_secs: f64,
    /// Present when the invocation failed; the output may still hold
    /// partial text worth keeping.
    pub error: Option<String>,
}

/// Uniform interface over agent invocation backends.
///
/// `Send + Sync` so the worker pool can share one runner across task
/// threads. An `Err` means the agent could not be invoked at all;
/// failures of a started invocation come back as a `Response` with a
/// non-zero exit code and an error string.
pub trait Runner: Send + Sync {
    fn run(&self, req: &Request) -> Result<Response>;

    /// Configured agent name.
    fn name(&self) -> &str;

    fn mode(&self) -> AgentMode;
}

/// Create the runner matching the agent's configured mode.
pub fn new_runner(name: &str, cfg: &AgentConfig) -> Result<Box<dyn Runner>> {
    match cfg.mode {
        AgentMode::Cli => Ok(Box::new(cli::CliRunner::new(name, cfg.clone()))),
        AgentMode::Api => Ok(Box::new(api::ApiRunner::new(name, cfg.clone())?)),
    }
}
