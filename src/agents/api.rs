//! HTTP runner: calls a model provider's chat API directly.
//!
//! API agents never touch the filesystem, so they need no worktree
//! isolation; the working directory in the request is ignored.

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::agents::{Request, Response, Runner};
use crate::io::config::{AgentConfig, AgentMode};

const MAX_TOKENS: u32 = 4096;

#[derive(Debug)]
pub struct ApiRunner {
    name: String,
    cfg: AgentConfig,
    api_key: String,
    client: Client,
}

impl ApiRunner {
    /// Create a runner for the configured provider. Fails when the API
    /// key environment variable is missing or empty.
    pub fn new(name: impl Into<String>, cfg: AgentConfig) -> Result<Self> {
        let name = name.into();
        let api_key = std::env::var(&cfg.api_key_env).unwrap_or_default();
        if api_key.is_empty() {
            bail!(
                "agent {name}: environment variable {:?} is not set",
                cfg.api_key_env
            );
        }

        let client = Client::builder()
            .build()
            .context("build http client")?;

        Ok(Self {
            name,
            cfg,
            api_key,
            client,
        })
    }

    fn run_openai(&self, req: &Request, start: Instant) -> Result<Response> {
        let body = json!({
            "model": self.cfg.model,
            "messages": [{"role": "user", "content": req.prompt}],
            "max_tokens": MAX_TOKENS,
        });

        let http_resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(req.timeout)
            .json(&body)
            .send();

        let (status, text) = match read_response(http_resp) {
            Ok(pair) => pair,
            Err(err) => return Ok(transport_failure(start, err)),
        };
        if status != 200 {
            return Ok(http_failure(start, status, text));
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            #[serde(default)]
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            #[serde(default)]
            content: String,
        }

        let parsed: ChatResponse = serde_json::from_str(&text).context("parse openai response")?;
        let output = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(success(start, output))
    }

    fn run_anthropic(&self, req: &Request, start: Instant) -> Result<Response> {
        let body = json!({
            "model": self.cfg.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": req.prompt}],
        });

        let http_resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(req.timeout)
            .json(&body)
            .send();

        let (status, text) = match read_response(http_resp) {
            Ok(pair) => pair,
            Err(err) => return Ok(transport_failure(start, err)),
        };
        if status != 200 {
            return Ok(http_failure(start, status, text));
        }

        #[derive(Deserialize)]
        struct MessagesResponse {
            #[serde(default)]
            content: Vec<ContentBlock>,
        }
        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(default)]
            text: String,
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&text).context("parse anthropic response")?;
        let output = parsed
            .content
            .into_iter()
            .next()
            .map(|b| b.text)
            .unwrap_or_default();
        Ok(success(start, output))
    }

    fn run_google(&self, req: &Request, start: Instant) -> Result<Response> {
        let model = if self.cfg.model.is_empty() {
            "gemini-2.5-pro"
        } else {
            &self.cfg.model
        };
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent?key={}",
            self.api_key
        );

        let body = json!({
            "contents": [{"parts": [{"text": req.prompt}]}],
        });

        let http_resp = self.client.post(url).timeout(req.timeout).json(&body).send();

        let (status, text) = match read_response(http_resp) {
            Ok(pair) => pair,
            Err(err) => return Ok(transport_failure(start, err)),
        };
        if status != 200 {
            return Ok(http_failure(start, status, text));
        }

        #[derive(Deserialize)]
        struct GenerateResponse {
            #[serde(default)]
            candidates: Vec<Candidate>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: CandidateContent,
        }
        #[derive(Deserialize)]
        struct CandidateContent {
            #[serde(default)]
            parts: Vec<Part>,
        }
        #[derive(Deserialize)]
        struct Part {
            #[serde(default)]
            text: String,
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).context("parse google response")?;
        let output = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();
        Ok(success(start, output))
    }
}

impl Runner for ApiRunner {
    #[instrument(skip_all, fields(agent = %self.name, provider = %self.cfg.provider))]
    fn run(&self, req: &Request) -> Result<Response> {
        let start = Instant::now();
        info!("calling provider api");
        match self.cfg.provider.as_str() {
            "openai" => self.run_openai(req, start),
            "anthropic" => self.run_anthropic(req, start),
            "google" => self.run_google(req, start),
            other => Err(anyhow!("unsupported API provider: {other}")),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> AgentMode {
        AgentMode::Api
    }
}

fn read_response(
    resp: reqwest::Result<reqwest::blocking::Response>,
) -> std::result::Result<(u16, String), String> {
    match resp {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let text = resp.text().map_err(|err| format!("read response: {err}"))?;
            Ok((status, text))
        }
        Err(err) => Err(format!("API call failed: {err}")),
    }
}

fn success(start: Instant, output: String) -> Response {
    Response {
        output,
        exit_code: 0,
        duration_secs: start.elapsed().as_secs_f64(),
        error: None,
    }
}

/// Network-level failure: no HTTP status to report.
fn transport_failure(start: Instant, err: String) -> Response {
    warn!(error = %err, "provider unreachable");
    Response {
        output: String::new(),
        exit_code: -1,
        duration_secs: start.elapsed().as_secs_f64(),
        error: Some(err),
    }
}

/// Non-200 from the provider: the status code lands in `exit_code`.
fn http_failure(start: Instant, status: u16, body: String) -> Response {
    warn!(status, "provider returned error status");
    Response {
        error: Some(format!("API returned status {status}: {body}")),
        output: body,
        exit_code: i32::from(status),
        duration_secs: start.elapsed().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_agent(provider: &str, key_env: &str) -> AgentConfig {
        AgentConfig {
            role: "reviewer".to_string(),
            mode: AgentMode::Api,
            cmd: String::new(),
            args: Vec::new(),
            provider: provider.to_string(),
            model: "test-model".to_string(),
            api_key_env: key_env.to_string(),
            timeout_sec: 0,
            auto_accept: false,
        }
    }

    #[test]
    fn missing_api_key_fails_at_construction() {
        let cfg = api_agent("openai", "HIVE_TEST_UNSET_KEY");
        std::env::remove_var("HIVE_TEST_UNSET_KEY");
        let err = ApiRunner::new("gpt", cfg).unwrap_err();
        assert!(err.to_string().contains("HIVE_TEST_UNSET_KEY"));
    }

    #[test]
    fn unsupported_provider_is_rejected_at_run_time() {
        std::env::set_var("HIVE_TEST_KEY_A", "secret");
        let runner =
            ApiRunner::new("mystery", api_agent("mystery-cloud", "HIVE_TEST_KEY_A")).expect("new");
        let err = runner
            .run(&Request {
                task_id: 1,
                prompt: "hi".to_string(),
                workdir: std::path::PathBuf::from("."),
                timeout: std::time::Duration::from_secs(1),
            })
            .unwrap_err();
        assert!(err.to_string().contains("unsupported API provider"));
    }

    #[test]
    fn openai_payload_extracts_first_choice() {
        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let payload = r#"{"choices":[{"message":{"role":"assistant","content":"VERDICT: APPROVE"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(payload).expect("parse");
        assert_eq!(parsed.choices[0].message.content, "VERDICT: APPROVE");
    }

    #[test]
    fn anthropic_payload_extracts_first_block() {
        #[derive(Deserialize)]
        struct MessagesResponse {
            content: Vec<Block>,
        }
        #[derive(Deserialize)]
        struct Block {
            text: String,
        }

        let payload = r#"{"content":[{"type":"text","text":"SUBTASKS:\n1. First task - body"}]}"#;
        let parsed: MessagesResponse = serde_json::from_str(payload).expect("parse");
        assert!(parsed.content[0].text.starts_with("SUBTASKS:"));
    }
}
