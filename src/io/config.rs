//! Project configuration stored under `.hive/config.yaml`.
//!
//! The file is edited by humans and must stay stable: unknown agents are
//! a user error surfaced at load time, not at first use.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// How an agent is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Spawn a local CLI tool (claude, gemini, codex, ...).
    Cli,
    /// Call a model provider's HTTP API directly.
    Api,
}

/// A single AI agent and how to connect to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// planner, architect, coder, reviewer, ...
    pub role: String,
    pub mode: AgentMode,
    /// CLI command to spawn (cli mode).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// API provider: openai, anthropic, google (api mode).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key_env: String,
    /// Timeout in seconds (0 = default 300).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout_sec: u64,
    /// Skip interactive permission prompts on known CLI tools.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_accept: bool,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl AgentConfig {
    /// Effective deadline for one invocation of this agent.
    pub fn timeout(&self) -> Duration {
        if self.timeout_sec > 0 {
            Duration::from_secs(self.timeout_sec)
        } else {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        }
    }

    /// Final args for a CLI agent, injecting non-interactive and
    /// auto-accept flags for known tools.
    ///
    /// Known tools and their flags:
    ///   - claude: `--print`, plus `--dangerously-skip-permissions` under auto-accept
    ///   - gemini: `--yolo` under auto-accept
    ///   - codex:  `--full-auto` under auto-accept
    ///
    /// Flags already present in `args` are never duplicated.
    pub fn effective_args(&self) -> Vec<String> {
        if self.mode != AgentMode::Cli {
            return self.args.clone();
        }

        let mut args = self.args.clone();
        match self.cmd.as_str() {
            "claude" => {
                if !contains_any(&args, &["-p", "--print"]) {
                    args.insert(0, "--print".to_string());
                }
                if self.auto_accept
                    && !contains_any(&args, &["--dangerously-skip-permissions", "--permission-mode"])
                {
                    args.insert(0, "--dangerously-skip-permissions".to_string());
                }
            }
            "gemini" => {
                if self.auto_accept && !contains_any(&args, &["-y", "--yolo"]) {
                    args.insert(0, "--yolo".to_string());
                }
            }
            "codex" => {
                if self.auto_accept && !contains_any(&args, &["--full-auto", "--approval-mode"]) {
                    args.insert(0, "--full-auto".to_string());
                }
            }
            _ => {}
        }
        args
    }
}

/// Root configuration for a hive project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            agents: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        for (name, agent) in &self.agents {
            if agent.role.trim().is_empty() {
                bail!("agent {name:?}: role is required");
            }
            if agent.mode == AgentMode::Cli && agent.cmd.trim().is_empty() {
                bail!("agent {name:?}: cmd is required for cli mode");
            }
            if agent.mode == AgentMode::Api && agent.provider.trim().is_empty() {
                bail!("agent {name:?}: provider is required for api mode");
            }
        }
        Ok(())
    }

    /// All agents with the given role, in deterministic (name) order.
    pub fn agents_by_role(&self, role: &str) -> Vec<(&str, &AgentConfig)> {
        self.agents
            .iter()
            .filter(|(_, a)| a.role == role)
            .map(|(n, a)| (n.as_str(), a))
            .collect()
    }

    /// First agent with the given role, in name order.
    pub fn find_agent_by_role(&self, role: &str) -> Option<(String, AgentConfig)> {
        self.agents
            .iter()
            .find(|(_, a)| a.role == role)
            .map(|(n, a)| (n.clone(), a.clone()))
    }
}

/// Force non-interactive execution for CLI agents so pipeline
/// invocations never hang on a permission prompt.
pub fn force_auto_accept(agent: &mut AgentConfig) {
    if agent.mode == AgentMode::Cli {
        agent.auto_accept = true;
    }
}

/// Load and validate the config file at the given path.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("parse config {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Write the config to the given path.
pub fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let buf = serde_yaml::to_string(cfg).context("serialize config yaml")?;
    fs::write(path, buf).with_context(|| format!("write config {}", path.display()))?;
    Ok(())
}

fn contains_any(slice: &[String], targets: &[&str]) -> bool {
    slice.iter().any(|s| targets.contains(&s.as_str()))
}
