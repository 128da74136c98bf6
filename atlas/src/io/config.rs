//! Atlas configuration stored in `atlas.toml` at the repository root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::safety::SafetyConfig;
use crate::io::process::{CommandSpec, DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_STEP_TIMEOUT, RunControl};

pub const CONFIG_FILE_NAME: &str = "atlas.toml";

/// Atlas configuration (TOML).
///
/// Edited by humans; missing sections fall back to conservative defaults
/// (no auto-apply, no push, confirmation required, LLM disabled).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AtlasConfig {
    pub safety: SafetyConfig,
    pub limits: LimitsConfig,
    pub workspace: WorkspaceConfig,
    pub logs: LogsConfig,
    pub llm: LlmConfig,
    /// Build/test commands per target repository, keyed by name.
    pub target_repos: BTreeMap<String, TargetRepoConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Wall-clock limit for each build/test/git step.
    pub step_timeout_secs: u64,
    /// Per-step transcript cap; the live stream is not capped.
    pub output_limit_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: DEFAULT_STEP_TIMEOUT.as_secs(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl LimitsConfig {
    pub fn run_control(&self) -> RunControl {
        RunControl::new(
            Duration::from_secs(self.step_timeout_secs),
            self.output_limit_bytes,
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent directory for verification worktrees. Defaults to
    /// `<tmp>/atlas-worktrees`.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogsConfig {
    /// JSONL log directory. Defaults to `<git-common-dir>/atlas/logs`.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    /// Ollama-compatible chat endpoint.
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Proposals below this confidence are flagged in the transcript.
    pub low_confidence_threshold: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:11434/api/chat".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 300,
            low_confidence_threshold: 0.6,
        }
    }
}

/// A configured command: either a shell line or an explicit argv.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run as `sh -c <line>`.
    Shell(String),
    /// Run directly, first element is the program.
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn to_spec(&self) -> CommandSpec {
        match self {
            Self::Shell(line) => CommandSpec::shell(line),
            Self::Argv(argv) => {
                let (program, args) = argv.split_first().map_or(("", &[][..]), |(p, a)| (p.as_str(), a));
                CommandSpec::new(program).args(args.iter().cloned())
            }
        }
    }

    /// Display label used in step names (`Test: pytest -q`).
    pub fn label(&self) -> String {
        match self {
            Self::Shell(line) => line.trim().to_string(),
            Self::Argv(argv) => argv.join(" "),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Self::Shell(line) => line.trim().is_empty(),
            Self::Argv(argv) => argv.first().is_none_or(|program| program.trim().is_empty()),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        Self::Shell(line.to_string())
    }
}

/// Build and test commands for one repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetRepoConfig {
    pub build_command: Option<CommandLine>,
    /// Run in order, each as its own step.
    pub test_commands: Vec<CommandLine>,
}

impl AtlasConfig {
    pub fn validate(&self) -> Result<()> {
        if self.limits.step_timeout_secs == 0 {
            return Err(anyhow!("limits.step_timeout_secs must be > 0"));
        }
        if self.limits.output_limit_bytes == 0 {
            return Err(anyhow!("limits.output_limit_bytes must be > 0"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.llm.low_confidence_threshold) {
            return Err(anyhow!("llm.low_confidence_threshold must be within 0.0..=1.0"));
        }
        for (name, repo) in &self.target_repos {
            if repo.build_command.as_ref().is_some_and(CommandLine::is_blank) {
                return Err(anyhow!("target_repos.{name}.build_command must not be empty"));
            }
            if repo.test_commands.iter().any(CommandLine::is_blank) {
                return Err(anyhow!("target_repos.{name}.test_commands must not contain empty commands"));
            }
        }
        Ok(())
    }

    /// Pick the target repository by name. Without a name, succeeds only when
    /// exactly one repository is configured.
    pub fn select_target(&self, name: Option<&str>) -> Result<(&str, &TargetRepoConfig)> {
        match name {
            Some(name) => self
                .target_repos
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| {
                    anyhow!(
                        "unknown target repo '{name}' (configured: {})",
                        self.target_names()
                    )
                }),
            None => {
                let mut repos = self.target_repos.iter();
                match (repos.next(), repos.next()) {
                    (Some((k, v)), None) => Ok((k.as_str(), v)),
                    (None, _) => Err(anyhow!("no target repos configured (add [target_repos.<name>])")),
                    (Some(_), Some(_)) => Err(anyhow!(
                        "several target repos configured, pass --target (configured: {})",
                        self.target_names()
                    )),
                }
            }
        }
    }

    fn target_names(&self) -> String {
        self.target_repos.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AtlasConfig::default()`.
pub fn load_config(path: &Path) -> Result<AtlasConfig> {
    if !path.exists() {
        let cfg = AtlasConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AtlasConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
