//! Scaffolding for the `.blendgraph/` state directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{PipelineConfig, write_config};

/// Canonical paths within a state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub schemas_dir: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            config_path: state_dir.join("config.toml"),
            gitignore_path: state_dir.join(".gitignore"),
            checkpoints_dir: state_dir.join("checkpoints"),
            runs_dir: state_dir.join("runs"),
            schemas_dir: state_dir.join("schemas"),
            state_dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config.
    pub force: bool,
}

/// Create the state directory with a default config.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_state_dir(state_dir: &Path, options: &InitOptions) -> Result<StatePaths> {
    let paths = StatePaths::new(state_dir);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    for dir in [&paths.state_dir, &paths.checkpoints_dir, &paths.runs_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    let config = PipelineConfig {
        state_dir: paths.state_dir.clone(),
        ..PipelineConfig::default()
    };
    write_config(&paths.config_path, &config)?;
    fs::write(&paths.gitignore_path, STATE_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    Ok(paths)
}

const STATE_GITIGNORE: &str = "checkpoints/\nruns/\nschemas/\n";
