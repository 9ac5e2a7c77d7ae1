//! Subprocess runner: spawns an external CLI agent (claude, gemini,
//! codex, ...) with the prompt as the final argument.

use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::agents::{Request, Response, Runner};
use crate::io::config::{AgentConfig, AgentMode};
use crate::io::process::run_command_with_timeout;

/// Bound on captured agent output held in memory.
const OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Keep at most this much stderr when reporting a failure.
const STDERR_TAIL_BYTES: usize = 2_000;

pub struct CliRunner {
    name: String,
    cfg: AgentConfig,
}

impl CliRunner {
    pub fn new(name: impl Into<String>, cfg: AgentConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
        }
    }
}

impl Runner for CliRunner {
    /// Spawn the agent process with the prompt.
    ///
    /// The full command is `cmd <effective-args…> <prompt>`; the agent
    /// runs in the request's working directory so it can read and edit
    /// the project files. On deadline expiry the process is killed and
    /// the response carries exit code -1 with a timeout error.
    #[instrument(skip_all, fields(agent = %self.name, timeout_secs = req.timeout.as_secs()))]
    fn run(&self, req: &Request) -> Result<Response> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.cfg.cmd);
        cmd.args(self.cfg.effective_args())
            .arg(&req.prompt)
            .current_dir(&req.workdir);

        info!(workdir = %req.workdir.display(), "spawning cli agent");
        let out = run_command_with_timeout(cmd, req.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn agent {}", self.name))?;
        let duration_secs = start.elapsed().as_secs_f64();

        if out.timed_out {
            warn!("cli agent timed out");
            return Ok(Response {
                output: out.stdout_lossy(),
                exit_code: -1,
                duration_secs,
                error: Some(format!(
                    "agent {} timed out after {}s",
                    self.name,
                    req.timeout.as_secs()
                )),
            });
        }

        let exit_code = out.status.code().unwrap_or(-1);
        let error = if exit_code != 0 {
            let stderr = out.stderr_lossy();
            let tail = stderr_tail(&stderr);
            warn!(exit_code, "cli agent failed");
            if tail.is_empty() {
                Some(format!("agent {} exited with code {exit_code}", self.name))
            } else {
                Some(format!(
                    "agent {} exited with code {exit_code}: {tail}",
                    self.name
                ))
            }
        } else {
            debug!("cli agent completed");
            None
        };

        Ok(Response {
            output: out.stdout_lossy(),
            exit_code,
            duration_secs,
            error,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> AgentMode {
        AgentMode::Cli
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn agent(cmd: &str, args: &[&str]) -> CliRunner {
        CliRunner::new(
            "test-agent",
            AgentConfig {
                role: "coder".to_string(),
                mode: AgentMode::Cli,
                cmd: cmd.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                provider: String::new(),
                model: String::new(),
                api_key_env: String::new(),
                timeout_sec: 0,
                auto_accept: false,
            },
        )
    }

    fn request(prompt: &str, timeout: Duration) -> Request {
        Request {
            task_id: 1,
            prompt: prompt.to_string(),
            workdir: PathBuf::from("."),
            timeout,
        }
    }

    #[test]
    fn prompt_is_passed_as_final_argument() {
        // `echo` prints its args, so the prompt comes back on stdout.
        let runner = agent("echo", &["prefix"]);
        let resp = runner
            .run(&request("the prompt", Duration::from_secs(5)))
            .expect("run");
        assert_eq!(resp.exit_code, 0);
        assert!(resp.error.is_none());
        assert_eq!(resp.output.trim(), "prefix the prompt");
    }

    #[test]
    fn nonzero_exit_carries_stderr_in_error() {
        // The appended prompt lands in `$0`, which the script ignores.
        let runner = agent("sh", &["-c", "echo oops >&2; exit 2"]);
        let resp = runner
            .run(&request("ignored", Duration::from_secs(5)))
            .expect("run");
        assert_eq!(resp.exit_code, 2);
        let err = resp.error.expect("error");
        assert!(err.contains("exited with code 2"));
        assert!(err.contains("oops"));
    }

    #[test]
    fn timeout_reports_exit_code_minus_one() {
        let runner = agent("sleep", &["30"]);
        let resp = runner
            .run(&request("ignored", Duration::from_millis(100)))
            .expect("run");
        assert_eq!(resp.exit_code, -1);
        assert!(resp.error.expect("error").contains("timed out"));
    }

    #[test]
    fn missing_command_is_an_invocation_error() {
        let runner = agent("definitely-not-a-real-command-xyz", &[]);
        assert!(runner
            .run(&request("ignored", Duration::from_secs(1)))
            .is_err());
    }
}
