//! Run artifacts under `.blendgraph/runs/<run_id>/`.
//!
//! Always written, independent of `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::outcome::RunStatus;
use crate::core::state::{Message, Role};

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub renders_dir: PathBuf,
    pub steps_path: PathBuf,
    pub result_path: PathBuf,
    pub script_path: PathBuf,
    pub conversation_path: PathBuf,
}

impl RunPaths {
    pub fn new(state_dir: &Path, run_id: &str) -> Self {
        let dir = state_dir.join("runs").join(run_id);
        Self {
            scripts_dir: dir.join("scripts"),
            renders_dir: dir.join("renders"),
            steps_path: dir.join("steps.jsonl"),
            result_path: dir.join("result.json"),
            script_path: dir.join("final_script.py"),
            conversation_path: dir.join("conversation.md"),
            dir,
        }
    }
}

/// Outcome of one `start`/`resume` call. `status` is `None` while suspended.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary<'a> {
    pub run_id: &'a str,
    pub status: Option<RunStatus>,
    pub message: &'a str,
    pub rendered_images: &'a [PathBuf],
    #[serde(skip)]
    pub script: &'a str,
    #[serde(skip)]
    pub messages: &'a [Message],
}

pub fn write_summary(paths: &RunPaths, summary: &RunSummary<'_>) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(&paths.result_path, summary)?;
    write_text(&paths.script_path, summary.script)?;
    write_text(&paths.conversation_path, &render_conversation(summary.messages))?;
    Ok(())
}

/// Append one JSON line to `path`.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

pub fn render_conversation(messages: &[Message]) -> String {
    let mut buf = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match &message.agent {
            Some(agent) => buf.push_str(&format!("## {role} ({agent})\n\n")),
            None => buf.push_str(&format!("## {role}\n\n")),
        }
        buf.push_str(message.content.trim_end());
        buf.push_str("\n\n");
    }
    buf
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
