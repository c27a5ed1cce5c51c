//! Language-model providers.
//!
//! A provider turns system instructions plus user content into free text. The
//! reply is untrusted: callers hand it to the sanitizer/validator pair and
//! nothing else. Any error (HTTP failure, non-zero exit, timeout) is a
//! transport failure the patch generator retries within its attempt budget.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::io::config::{ModelConfig, ModelProviderKind};
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One model invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
}

pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Invoke the model once and return its raw text reply.
    fn complete(&self, request: &ModelRequest) -> Result<String>;
}

/// Build the provider selected by config.
///
/// A missing API key is a configuration error reported here, before any task
/// starts.
pub fn build_provider(config: &ModelConfig, timeout: Duration) -> Result<Arc<dyn ModelProvider>> {
    match config.provider {
        ModelProviderKind::Anthropic => {
            let api_key = std::env::var(&config.api_key_env)
                .with_context(|| format!("{} not set", config.api_key_env))?;
            if api_key.trim().is_empty() {
                bail!("{} is empty", config.api_key_env);
            }
            Ok(Arc::new(AnthropicModel::new(config, api_key, timeout)?))
        }
        ModelProviderKind::Command => Ok(Arc::new(CommandModel::new(
            config.command.clone(),
            timeout,
        )?)),
    }
}

/// Anthropic Messages API backend.
pub struct AnthropicModel {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicModel {
    pub fn new(config: &ModelConfig, api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/messages", config.api_base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

impl ModelProvider for AnthropicModel {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, request: &ModelRequest) -> Result<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &request.system,
            messages: vec![Message {
                role: "user",
                content: &request.user,
            }],
        };

        info!(prompt_len = request.user.len(), "invoking Anthropic Messages API");
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .context("send Anthropic API request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("Anthropic API error ({status}): {}", text.trim());
        }
        let parsed: MessagesResponse = response.json().context("parse Anthropic response")?;
        response_text(parsed)
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

fn response_text(resp: MessagesResponse) -> Result<String> {
    let text = resp
        .content
        .iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        bail!(
            "Anthropic response had no text content (stop_reason: {})",
            resp.stop_reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(text)
}

/// Runs a command with the prompt on stdin and treats stdout as the reply.
///
/// The system instructions come first, then a blank line, then the user
/// content.
pub struct CommandModel {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandModel {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("model command must not be empty");
        }
        Ok(Self { argv, timeout })
    }
}

impl ModelProvider for CommandModel {
    fn name(&self) -> &str {
        "command"
    }

    #[instrument(skip_all, fields(program = %self.argv[0]))]
    fn complete(&self, request: &ModelRequest) -> Result<String> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        let input = format!("{}\n\n{}", request.system.trim_end(), request.user);
        let out = run_command_with_timeout(
            cmd,
            Some(input.as_bytes()),
            self.timeout,
            DEFAULT_OUTPUT_LIMIT_BYTES,
        )?;
        if out.timed_out {
            return Err(anyhow!(
                "model command timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !out.status.success() {
            return Err(anyhow!(
                "model command exited with {:?}: {}",
                out.status.code(),
                out.stderr_text().trim()
            ));
        }
        Ok(out.stdout_text())
    }
}
