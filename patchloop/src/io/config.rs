//! Executor configuration stored under `<data_dir>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::transitions::Ceilings;
use crate::io::git::Author;

/// Executor configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that work for a local setup with the Anthropic API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Where project working copies are cloned/initialized.
    /// Defaults to `<data_dir>/workspaces` when unset.
    pub workspace_dir: Option<PathBuf>,

    /// Number of worker threads draining the queue.
    pub workers: usize,

    /// Idle sleep between queue polls in `work --watch` and the server.
    pub poll_interval_ms: u64,

    /// What happens to applied commits when a task is cancelled.
    pub cancel_policy: CancelPolicy,

    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
    pub branch: BranchConfig,
    pub commit: CommitConfig,
    pub model: ModelConfig,
    pub hosting: HostingConfig,
    pub preflight: PreflightConfig,
    pub prompt: PromptConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Leave applied commits on the task branch.
    #[default]
    Keep,
    /// Reset the task branch to the source tip.
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_consecutive_failures: u32,
    pub max_apply_failures: u32,
    pub max_iterations: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let ceilings = Ceilings::default();
        Self {
            max_consecutive_failures: ceilings.max_consecutive_failures,
            max_apply_failures: ceilings.max_apply_failures,
            max_iterations: ceilings.max_iterations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub model_timeout_secs: u64,
    pub git_timeout_secs: u64,
    pub preflight_timeout_secs: u64,
    pub hosting_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            model_timeout_secs: 300,
            git_timeout_secs: 120,
            preflight_timeout_secs: 30 * 60,
            hosting_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BranchConfig {
    /// Reset a divergent target branch instead of failing with a conflict.
    pub force: bool,
    /// Prefix for generated target branch names.
    pub prefix: String,
    /// Source branch used when a submission does not name one.
    pub default_source: String,
    /// Git remote used for push and pull requests.
    pub remote: String,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            force: false,
            prefix: "patchloop/".to_string(),
            default_source: "main".to_string(),
            remote: "origin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommitConfig {
    pub author_name: String,
    pub author_email: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            author_name: "patchloop".to_string(),
            author_email: "patchloop@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelProviderKind {
    /// Anthropic Messages API over HTTPS.
    #[default]
    Anthropic,
    /// Any command reading the prompt on stdin and printing the reply.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProviderKind,
    pub model: String,
    pub api_base: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    /// Argv for the `command` provider.
    pub command: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProviderKind::Anthropic,
            model: "claude-sonnet-4-5".to_string(),
            api_base: "https://api.anthropic.com".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tokens: 8192,
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostingConfig {
    pub api_base: String,
    /// Environment variable holding the bearer token.
    pub token_env: String,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PreflightConfig {
    /// Command run in the working copy after each successful apply
    /// (e.g. `["cargo", "test"]`). Empty disables preflight.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Upper bound on the rendered user prompt.
    pub budget_bytes: usize,
    /// Files larger than this are listed but not inlined.
    pub max_file_bytes: usize,
    /// Upper bound on the number of inlined files.
    pub max_files: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 120_000,
            max_file_bytes: 20_000,
            max_files: 40,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workspace_dir: None,
            workers: 2,
            poll_interval_ms: 1_000,
            cancel_policy: CancelPolicy::Keep,
            limits: LimitsConfig::default(),
            timeouts: TimeoutConfig::default(),
            branch: BranchConfig::default(),
            commit: CommitConfig::default(),
            model: ModelConfig::default(),
            hosting: HostingConfig::default(),
            preflight: PreflightConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be > 0"));
        }
        if self.limits.max_consecutive_failures == 0 {
            return Err(anyhow!("limits.max_consecutive_failures must be > 0"));
        }
        if self.limits.max_apply_failures == 0 {
            return Err(anyhow!("limits.max_apply_failures must be > 0"));
        }
        if self.limits.max_iterations == 0 {
            return Err(anyhow!("limits.max_iterations must be > 0"));
        }
        if self.timeouts.model_timeout_secs == 0
            || self.timeouts.git_timeout_secs == 0
            || self.timeouts.preflight_timeout_secs == 0
            || self.timeouts.hosting_timeout_secs == 0
        {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.branch.default_source.trim().is_empty() {
            return Err(anyhow!("branch.default_source must not be empty"));
        }
        if self.branch.remote.trim().is_empty() {
            return Err(anyhow!("branch.remote must not be empty"));
        }
        if self.model.provider == ModelProviderKind::Command
            && self.model.command.first().is_none_or(|p| p.trim().is_empty())
        {
            return Err(anyhow!(
                "model.command must be a non-empty array when provider = \"command\""
            ));
        }
        if self.prompt.budget_bytes < 1_000 {
            return Err(anyhow!("prompt.budget_bytes must be >= 1000"));
        }
        Ok(())
    }

    pub fn ceilings(&self) -> Ceilings {
        Ceilings {
            max_consecutive_failures: self.limits.max_consecutive_failures,
            max_apply_failures: self.limits.max_apply_failures,
            max_iterations: self.limits.max_iterations,
        }
    }

    pub fn author(&self) -> Author {
        Author {
            name: self.commit.author_name.clone(),
            email: self.commit.author_email.clone(),
        }
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.git_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.model_timeout_secs)
    }

    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.preflight_timeout_secs)
    }

    pub fn hosting_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.hosting_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Workspace root, falling back to `<data_dir>/workspaces`.
    pub fn workspace_root(&self, data_dir: &Path) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("workspaces"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ExecutorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ExecutorConfig> {
    if !path.exists() {
        let cfg = ExecutorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ExecutorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ExecutorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
