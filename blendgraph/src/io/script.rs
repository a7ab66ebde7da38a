//! Script execution in the modeling application.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::atomic::write_atomic;
use crate::io::config::BlenderConfig;
use crate::io::process::{ProcessLimits, run_command_with_timeout, substitute_args};

/// What the executor observed while running a script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed.
    pub return_code: Option<i32>,
}

impl ExecutionReport {
    pub fn success() -> Self {
        Self {
            return_code: Some(0),
            ..Self::default()
        }
    }

    pub fn error(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            return_code: Some(1),
        }
    }

    /// Error text if the run failed.
    ///
    /// Non-empty stderr is a failure unless it equals `no_error_sentinel`.
    pub fn failure(&self, no_error_sentinel: &str) -> Option<String> {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() && stderr != no_error_sentinel {
            return Some(stderr.to_string());
        }
        match self.return_code {
            Some(0) => None,
            Some(code) => Some(format!("script exited with status {code}")),
            None => Some("script was killed before finishing".to_string()),
        }
    }
}

pub trait ScriptExecutor {
    fn execute(&self, script_path: &Path) -> Result<ExecutionReport>;
}

/// Write `script` to `path` atomically, then execute it.
pub fn write_and_execute(
    executor: &dyn ScriptExecutor,
    path: &Path,
    script: &str,
) -> Result<ExecutionReport> {
    write_atomic(path, script)?;
    executor.execute(path)
}

/// Runs scripts with `blender --background --python <script>`.
pub struct BlenderExecutor {
    config: BlenderConfig,
}

impl BlenderExecutor {
    pub fn new(config: BlenderConfig) -> Self {
        Self { config }
    }
}

impl ScriptExecutor for BlenderExecutor {
    #[instrument(skip_all, fields(script = %script_path.display()))]
    fn execute(&self, script_path: &Path) -> Result<ExecutionReport> {
        let script = script_path.display().to_string();
        let args = substitute_args(&self.config.command, &[("script", script.as_str())]);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("blender.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(rest);
        if let Some(dir) = script_path.parent() {
            cmd.current_dir(dir);
        }

        info!("executing script");
        let output = run_command_with_timeout(
            cmd,
            None,
            ProcessLimits {
                timeout: self.config.timeout(),
                output_limit_bytes: self.config.output_limit_bytes,
            },
        )
        .context("run blender")?;

        let mut stderr = output.stderr_text();
        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "script timed out");
            stderr.push_str(&format!(
                "\nscript timed out after {}s",
                self.config.timeout_secs
            ));
        }
        let report = ExecutionReport {
            stdout: output.stdout_text(),
            stderr,
            return_code: output.status.code(),
        };
        debug!(return_code = ?report.return_code, "script finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_stderr_is_not_a_failure() {
        let report = ExecutionReport {
            stdout: "ok".to_string(),
            stderr: "None\n".to_string(),
            return_code: Some(0),
        };
        assert_eq!(report.failure("None"), None);
    }

    #[test]
    fn stderr_or_exit_code_is_a_failure() {
        let report = ExecutionReport::error("NameError: leg_radius");
        assert_eq!(
            report.failure("None").as_deref(),
            Some("NameError: leg_radius")
        );

        let silent = ExecutionReport {
            return_code: Some(2),
            ..ExecutionReport::default()
        };
        assert!(silent.failure("None").expect("failure").contains("status 2"));
    }

    #[cfg(unix)]
    #[test]
    fn blender_executor_runs_configured_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = BlenderConfig {
            command: vec!["sh".to_string(), "{script}".to_string()],
            ..BlenderConfig::default()
        };
        let executor = BlenderExecutor::new(config);
        let path = temp.path().join("script.py");

        let report =
            write_and_execute(&executor, &path, "echo built\necho 'NameError: x' >&2\nexit 1\n")
                .expect("execute");

        assert_eq!(report.stdout.trim(), "built");
        assert_eq!(report.failure("None").as_deref(), Some("NameError: x"));
        assert_eq!(report.return_code, Some(1));
    }
}
