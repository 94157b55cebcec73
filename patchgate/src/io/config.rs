//! Tool configuration stored under `.patchgate/config.toml`.
//!
//! Resolved once per process: file values, then environment overrides, then
//! validation. Secrets (API key, GitHub token) are only ever read from the
//! environment and never serialized.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::branch_name::validate_branch_name;

pub const CONFIG_RELATIVE_PATH: &str = ".patchgate/config.toml";
pub const DEFAULT_STORE_DIR: &str = ".patchgate/store";

/// Tool configuration (TOML).
///
/// Missing fields default to values that work for a plain GitHub-hosted repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    /// Record directory, relative to the repository root unless absolute.
    pub store_dir: PathBuf,

    /// Remote that promoted branches are pushed to.
    pub remote: String,

    /// Prefix for generated branch names.
    pub branch_prefix: String,

    /// Advisory wall-clock budget for one task run.
    pub time_budget_secs: u64,

    pub context: ContextConfig,
    pub qa: QaConfig,
    pub model: ModelConfig,
    pub github: GitHubConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Upper bound on files handed to the diff generator.
    pub max_files: usize,
    /// Per-file snippet bound in bytes.
    pub snippet_bytes: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_files: 50,
            snippet_bytes: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QaConfig {
    pub timeout_secs: u64,
    /// Truncate each of stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Replaces the detected lint command (e.g. `["cargo", "clippy"]`).
    pub lint_command: Option<Vec<String>>,
    /// Replaces the detected test command.
    pub test_command: Option<Vec<String>>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15 * 60,
            output_limit_bytes: 100_000,
            lint_command: None,
            test_command: None,
        }
    }
}

impl QaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    Openai,
    AzureOpenai,
    Http,
}

impl FromStr for ModelProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ModelProvider::Openai),
            "azure_openai" | "azure-openai" | "azure" => Ok(ModelProvider::AzureOpenai),
            "http" => Ok(ModelProvider::Http),
            other => Err(anyhow!(
                "unknown model provider '{other}' (expected openai, azure_openai or http)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub name: String,
    /// Required for `azure_openai` and `http`; optional override for `openai`.
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Openai,
            name: "gpt-4o-mini".to_string(),
            endpoint: None,
            timeout_secs: 120,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_base_url: String,
    /// `owner/name`.
    pub repo: Option<String>,
    /// Base branch for pull requests.
    pub default_branch: String,
    pub timeout_secs: u64,
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            repo: None,
            default_branch: "main".to_string(),
            timeout_secs: 30,
            token: None,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            remote: "origin".to_string(),
            branch_prefix: "patchgate/".to_string(),
            time_budget_secs: 600,
            context: ContextConfig::default(),
            qa: QaConfig::default(),
            model: ModelConfig::default(),
            github: GitHubConfig::default(),
        }
    }
}

impl ToolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.store_dir.as_os_str().is_empty() {
            return Err(anyhow!("store_dir must not be empty"));
        }
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must not be empty"));
        }
        validate_branch_name(&format!("{}x", self.branch_prefix))
            .context("branch_prefix must form valid branch names")?;
        if self.context.max_files == 0 {
            return Err(anyhow!("context.max_files must be > 0"));
        }
        if self.context.snippet_bytes == 0 {
            return Err(anyhow!("context.snippet_bytes must be > 0"));
        }
        if self.qa.timeout_secs == 0 {
            return Err(anyhow!("qa.timeout_secs must be > 0"));
        }
        if self.qa.output_limit_bytes == 0 {
            return Err(anyhow!("qa.output_limit_bytes must be > 0"));
        }
        for (name, command) in [
            ("qa.lint_command", &self.qa.lint_command),
            ("qa.test_command", &self.qa.test_command),
        ] {
            if let Some(command) = command
                && command.first().is_none_or(|program| program.trim().is_empty())
            {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        if self.model.name.trim().is_empty() {
            return Err(anyhow!("model.name must not be empty"));
        }
        if self.model.timeout_secs == 0 || self.github.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs and github.timeout_secs must be > 0"));
        }
        if self.github.default_branch.trim().is_empty() {
            return Err(anyhow!("github.default_branch must not be empty"));
        }
        Ok(())
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = get("PATCHGATE_STORE_DIR") {
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(provider) = get("MODEL_PROVIDER") {
            self.model.provider = provider.parse().context("parse MODEL_PROVIDER")?;
        }
        if let Some(name) = get("MODEL_NAME") {
            self.model.name = name;
        }
        if let Some(endpoint) = get("MODEL_ENDPOINT") {
            self.model.endpoint = Some(endpoint);
        }
        if let Some(key) = get("API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(token) = get("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(repo) = get("GITHUB_REPO") {
            self.github.repo = Some(repo);
        }
        if let Some(branch) = get("DEFAULT_BRANCH") {
            self.github.default_branch = branch;
        }
        Ok(())
    }

    /// Absolute store directory for the repository at `root`.
    pub fn store_path(&self, root: &Path) -> PathBuf {
        if self.store_dir.is_absolute() {
            self.store_dir.clone()
        } else {
            root.join(&self.store_dir)
        }
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ToolConfig::default()`.
pub fn load_config(path: &Path) -> Result<ToolConfig> {
    if !path.exists() {
        let cfg = ToolConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ToolConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Resolve the effective config for `root`: file, environment, validation.
pub fn resolve_config(
    root: &Path,
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ToolConfig> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.join(CONFIG_RELATIVE_PATH));
    let mut cfg = load_config(&path)?;
    cfg.apply_env(lookup)?;
    cfg.validate()
        .with_context(|| format!("validate config {}", path.display()))?;
    debug!(path = %path.display(), provider = ?cfg.model.provider, "resolved config");
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ToolConfig) -> Result<()> {
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
