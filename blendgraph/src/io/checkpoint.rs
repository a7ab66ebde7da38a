//! Checkpoints for suspended runs (`.blendgraph/checkpoints/<run_id>.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::route::NodeId;
use crate::core::state::SharedState;
use crate::io::atomic::write_atomic;

/// Full snapshot of a suspended run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Node re-entered with the resume input.
    pub resume_at: NodeId,
    /// Steps taken across the run up to the suspension.
    pub steps_taken: u32,
    pub state: SharedState,
}

pub trait CheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn load(&self, run_id: &str) -> Result<Checkpoint>;
    /// Forget a run. Removing an unknown run is not an error.
    fn remove(&self, run_id: &str) -> Result<()>;
}

/// One JSON file per run, written atomically.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{run_id}.json")))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.run_id)?;
        debug!(path = %path.display(), resume_at = %checkpoint.resume_at, "writing checkpoint");
        let mut buf = serde_json::to_string_pretty(checkpoint).context("serialize checkpoint")?;
        buf.push('\n');
        write_atomic(&path, buf)
    }

    fn load(&self, run_id: &str) -> Result<Checkpoint> {
        let path = self.path_for(run_id)?;
        debug!(path = %path.display(), "loading checkpoint");
        if !path.exists() {
            bail!("no suspended run {run_id} (missing {})", path.display());
        }
        load_checkpoint(&path)
    }

    fn remove(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id)?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("remove checkpoint {}", path.display()))?;
        }
        Ok(())
    }
}

fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse checkpoint {}", path.display()))
}

fn validate_run_id(run_id: &str) -> Result<()> {
    let ok = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        bail!("invalid run id {run_id:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{Caller, Message, Queries};

    fn sample() -> Checkpoint {
        let mut state = SharedState::new("create a 3D chair");
        state.current_script = "import bpy\n".to_string();
        state.queries = Queries::Subtasks(vec!["legs".to_string()]);
        state.caller = Some(Caller::Verification);
        state.messages.push(Message::system("started"));
        Checkpoint {
            run_id: "run-1".to_string(),
            resume_at: NodeId::User,
            steps_taken: 12,
            state,
        }
    }

    #[test]
    fn checkpoint_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(temp.path());

        store.save(&sample()).expect("save");
        let loaded = store.load("run-1").expect("load");
        assert_eq!(loaded, sample());

        store.remove("run-1").expect("remove");
        assert!(store.load("run-1").is_err());
        store.remove("run-1").expect("second remove is a no-op");
    }

    #[test]
    fn rejects_path_like_run_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(temp.path());
        let err = store.load("../escape").unwrap_err();
        assert!(err.to_string().contains("invalid run id"));
    }
}
