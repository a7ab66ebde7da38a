//! Brain abstraction for structured model calls.
//!
//! The [`Brain`] trait decouples agents from the model backend (by default
//! `codex exec` with an output schema). Tests use scripted brains that return
//! queued replies without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::structured::{BrainResponse, ToolCall};
use crate::io::config::BrainConfig;
use crate::io::process::{ProcessLimits, run_command_with_timeout, substitute_args};

/// Parameters for one brain invocation.
#[derive(Debug, Clone)]
pub struct BrainRequest {
    /// Name of the bound output schema; replies are reported as a tool call
    /// with this name.
    pub schema: String,
    /// JSON Schema file that constrains the reply.
    pub schema_path: PathBuf,
    pub prompt: String,
    /// Rendered images attached to the prompt, in order.
    pub images: Vec<PathBuf>,
    /// Directory for reply files and logs.
    pub work_dir: PathBuf,
}

pub trait Brain {
    fn invoke(&self, request: &BrainRequest) -> Result<BrainResponse>;
}

/// Brain backed by an external agent command.
///
/// The command writes its final JSON message to `{output}`. A parseable JSON
/// object becomes a single tool call; a missing or malformed file yields a
/// reply without tool calls so the caller can retry.
///
/// Reply and log files are numbered after those already in the run's `brain/`
/// directory, so a resumed run never overwrites an earlier invocation.
pub struct CommandBrain {
    config: BrainConfig,
}

impl CommandBrain {
    pub fn new(config: BrainConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, request: &BrainRequest, output: &str) -> Result<Command> {
        let schema = request.schema_path.display().to_string();
        let mut args = substitute_args(
            &self.config.command,
            &[("schema", schema.as_str()), ("output", output)],
        );
        let image_args: Vec<String> = request
            .images
            .iter()
            .flat_map(|image| [self.config.image_flag.clone(), image.display().to_string()])
            .collect();
        // Images go before a trailing stdin marker.
        let insert_at = if args.last().is_some_and(|a| a == "-") {
            args.len() - 1
        } else {
            args.len()
        };
        args.splice(insert_at..insert_at, image_args);

        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("brain.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(rest).current_dir(&request.work_dir);
        Ok(cmd)
    }
}

impl Brain for CommandBrain {
    #[instrument(skip_all, fields(schema = %request.schema, images = request.images.len()))]
    fn invoke(&self, request: &BrainRequest) -> Result<BrainResponse> {
        if !request.schema_path.exists() {
            return Err(anyhow!(
                "missing output schema {}",
                request.schema_path.display()
            ));
        }
        let brain_dir = request.work_dir.join("brain");
        fs::create_dir_all(&brain_dir)
            .with_context(|| format!("create brain dir {}", brain_dir.display()))?;
        let seq = next_seq(&brain_dir)?;
        let output_path = brain_dir.join(format!("{seq:03}-{}.json", request.schema));
        let log_path = brain_dir.join(format!("{seq:03}-{}.log", request.schema));

        let cmd = self.build_command(request, &output_path.display().to_string())?;
        info!(seq, "invoking brain");
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            ProcessLimits {
                timeout: self.config.timeout(),
                output_limit_bytes: self.config.output_limit_bytes,
            },
        )
        .context("run brain command")?;
        fs::write(&log_path, output.render_log("brain"))
            .with_context(|| format!("write brain log {}", log_path.display()))?;

        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "brain timed out");
            return Err(anyhow!(
                "brain timed out after {}s",
                self.config.timeout_secs
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "brain command failed");
            return Err(anyhow!(
                "brain command failed with status {:?}",
                output.status.code()
            ));
        }

        let response = read_reply(&output_path, &request.schema);
        debug!(tool_calls = response.tool_calls.len(), "brain replied");
        Ok(response)
    }
}

/// One past the highest `NNN-` prefix in `dir`.
fn next_seq(dir: &Path) -> Result<u32> {
    let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
    let mut last = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let name = entry.file_name();
        let seq = name
            .to_str()
            .and_then(|n| n.split_once('-'))
            .and_then(|(prefix, _)| prefix.parse::<u32>().ok());
        if let Some(seq) = seq {
            last = last.max(seq);
        }
    }
    Ok(last + 1)
}

fn read_reply(path: &Path, schema: &str) -> BrainResponse {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "brain wrote no reply");
            return BrainResponse::default();
        }
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(args)) => BrainResponse {
            tool_calls: vec![ToolCall {
                name: schema.to_string(),
                args,
            }],
        },
        Ok(_) => {
            warn!(path = %path.display(), "brain reply is not a JSON object");
            BrainResponse::default()
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "brain reply is not JSON");
            BrainResponse::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, images: Vec<PathBuf>) -> BrainRequest {
        BrainRequest {
            schema: "planner".to_string(),
            schema_path: dir.join("planner.schema.json"),
            prompt: "prompt".to_string(),
            images,
            work_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn image_flags_precede_stdin_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = CommandBrain::new(BrainConfig::default());
        let req = request(
            temp.path(),
            vec![PathBuf::from("a.png"), PathBuf::from("b.png")],
        );

        let cmd = brain.build_command(&req, "out.json").expect("command");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(cmd.get_program(), "codex");
        assert_eq!(args.last().map(String::as_str), Some("-"));
        let n = args.len();
        assert_eq!(args[n - 5..n - 1], ["--image", "a.png", "--image", "b.png"]);
        assert!(args.contains(&"out.json".to_string()));
    }

    #[test]
    fn malformed_reply_has_no_tool_calls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("reply.json");

        assert!(read_reply(&path, "planner").tool_calls.is_empty());

        fs::write(&path, "not json").expect("write");
        assert!(read_reply(&path, "planner").tool_calls.is_empty());

        fs::write(&path, r#"{"subtasks": ["legs"]}"#).expect("write");
        let reply = read_reply(&path, "planner");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "planner");
    }

    #[cfg(unix)]
    #[test]
    fn command_brain_reads_reply_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), Vec::new());
        fs::write(&req.schema_path, "{}").expect("schema");
        let config = BrainConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > /dev/null; printf '{"subtasks":["legs","seat"]}' > "$0""#.to_string(),
                "{output}".to_string(),
            ],
            ..BrainConfig::default()
        };

        let reply = CommandBrain::new(config).invoke(&req).expect("invoke");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].args["subtasks"][1], "seat");
    }

    #[test]
    fn numbering_continues_after_existing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(next_seq(temp.path()).expect("empty"), 1);

        fs::write(temp.path().join("001-planner.json"), "{}").expect("write");
        fs::write(temp.path().join("007-coding.log"), "").expect("write");
        fs::write(temp.path().join("notes.txt"), "").expect("write");
        assert_eq!(next_seq(temp.path()).expect("seq"), 8);
    }

    /// A second brain, as after a resume, does not reuse the first one's files.
    #[cfg(unix)]
    #[test]
    fn fresh_brain_keeps_earlier_invocation_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), Vec::new());
        fs::write(&req.schema_path, "{}").expect("schema");
        let config = BrainConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > /dev/null; printf '{"subtasks":["legs"]}' > "$0""#.to_string(),
                "{output}".to_string(),
            ],
            ..BrainConfig::default()
        };

        CommandBrain::new(config.clone()).invoke(&req).expect("first");
        CommandBrain::new(config).invoke(&req).expect("second");

        let brain_dir = temp.path().join("brain");
        assert!(brain_dir.join("001-planner.log").exists());
        assert!(brain_dir.join("002-planner.log").exists());
        assert!(brain_dir.join("002-planner.json").exists());
    }
}
