//! Pipeline configuration stored under `.blendgraph/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;

/// Pipeline configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// pipeline ships with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Hard ceiling on node executions per invocation.
    pub max_steps: u32,

    /// Directory holding checkpoints, schemas and run artifacts.
    pub state_dir: PathBuf,

    pub brain: BrainConfig,
    pub planner: PlannerConfig,
    pub retriever: RetrieverConfig,
    pub coding: CodingConfig,
    pub critic: CriticConfig,
    pub verification: VerificationConfig,
    pub user: UserConfig,
    pub blender: BlenderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            state_dir: PathBuf::from(".blendgraph"),
            brain: BrainConfig::default(),
            planner: PlannerConfig::default(),
            retriever: RetrieverConfig::default(),
            coding: CodingConfig::default(),
            critic: CriticConfig::default(),
            verification: VerificationConfig::default(),
            user: UserConfig::default(),
            blender: BlenderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrainConfig {
    /// Agent command. `{schema}` and `{output}` are replaced per call; the
    /// prompt is written to stdin.
    pub command: Vec<String>,

    /// Flag placed before each attached image path.
    pub image_flag: String,

    pub timeout_secs: u64,

    /// Truncate brain stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Reinvocations allowed when a reply is not valid structured output.
    pub structured_output_attempts: u32,

    pub prompt_budget_bytes: usize,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            command: [
                "codex",
                "exec",
                "--skip-git-repo-check",
                "--output-schema",
                "{schema}",
                "--output-last-message",
                "{output}",
                "-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            image_flag: "--image".to_string(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            structured_output_attempts: 3,
            prompt_budget_bytes: 60_000,
        }
    }
}

impl BrainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_subtasks: usize,

    /// Acceptance criterion for the critic. Defaults to the task itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validating_prompt: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_subtasks: 5,
            validating_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrieverConfig {
    /// JSON corpus of reference documents.
    pub docs_path: PathBuf,
    pub top_k: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            docs_path: PathBuf::from("docs/blender_api.json"),
            top_k: 1,
        }
    }
}

/// Where the coding agent goes after finishing a batch requested by verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterVerification {
    #[default]
    Verification,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodingConfig {
    /// Consecutive failed executions tolerated before the run aborts.
    pub fix_attempts: u32,
    pub after_verification: AfterVerification,
}

impl Default for CodingConfig {
    fn default() -> Self {
        Self {
            fix_attempts: 3,
            after_verification: AfterVerification::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CriticConfig {
    pub n_rendered_images: usize,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            n_rendered_images: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Critique-resolution loops before control passes to the user regardless.
    pub attempts: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { attempts: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserConfig {
    /// Suspend for follow-up input. When false the run ends at the user node.
    pub interactive: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self { interactive: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlenderConfig {
    /// Script runner. `{script}` is replaced with the script path.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,

    /// Stderr content that means "no error".
    pub no_error_sentinel: String,
}

impl Default for BlenderConfig {
    fn default() -> Self {
        Self {
            command: ["blender", "--background", "--python", "{script}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
            no_error_sentinel: "None".to_string(),
        }
    }
}

impl BlenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        validate_command("brain.command", &self.brain.command)?;
        validate_command("blender.command", &self.blender.command)?;
        if self.brain.timeout_secs == 0 {
            return Err(anyhow!("brain.timeout_secs must be > 0"));
        }
        if self.brain.output_limit_bytes == 0 {
            return Err(anyhow!("brain.output_limit_bytes must be > 0"));
        }
        if self.brain.structured_output_attempts == 0 {
            return Err(anyhow!("brain.structured_output_attempts must be > 0"));
        }
        if self.brain.prompt_budget_bytes == 0 {
            return Err(anyhow!("brain.prompt_budget_bytes must be > 0"));
        }
        if self.planner.max_subtasks == 0 {
            return Err(anyhow!("planner.max_subtasks must be > 0"));
        }
        if self.retriever.top_k == 0 {
            return Err(anyhow!("retriever.top_k must be > 0"));
        }
        if self.critic.n_rendered_images == 0 {
            return Err(anyhow!("critic.n_rendered_images must be > 0"));
        }
        if self.blender.timeout_secs == 0 {
            return Err(anyhow!("blender.timeout_secs must be > 0"));
        }
        if self.blender.output_limit_bytes == 0 {
            return Err(anyhow!("blender.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

fn validate_command(name: &str, command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("{name} must be a non-empty array")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf)
}
