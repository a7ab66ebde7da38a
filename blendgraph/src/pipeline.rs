//! Run lifecycle: start, suspend, resume, finish.
//!
//! A run walks the compiled graph until it finishes or suspends at the user
//! node. Suspension persists a [`Checkpoint`]; finishing removes it. Every
//! call leaves `result.json`, `final_script.py`, `conversation.md` and one
//! `steps.jsonl` line per node execution under the run directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::agents::NodeContext;
use crate::coordinator::Coordinator;
use crate::core::outcome::RunStatus;
use crate::graph::{CompiledGraph, GraphOutcome, StepRecord};
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::run_log::{RunPaths, RunSummary, append_jsonl, render_conversation, write_summary};

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub message: String,
    pub script: String,
    /// Markdown transcript of every recorded exchange.
    pub conversation: String,
    pub rendered_images: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunHandle {
    Finished(RunReport),
    /// Waiting for a follow-up; pass `run_id` to [`Pipeline::resume`].
    Suspended {
        run_id: String,
        script: String,
        rendered_images: Vec<PathBuf>,
    },
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        match self {
            RunHandle::Finished(report) => &report.run_id,
            RunHandle::Suspended { run_id, .. } => run_id,
        }
    }
}

pub struct Pipeline<S: CheckpointStore> {
    graph: CompiledGraph,
    store: S,
    state_dir: PathBuf,
}

impl<S: CheckpointStore> Pipeline<S> {
    pub fn new(coordinator: &Coordinator, store: S) -> Result<Self> {
        Ok(Self {
            graph: coordinator.build_graph()?,
            store,
            state_dir: coordinator.config().state_dir.clone(),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[instrument(skip_all)]
    pub fn start(&mut self, task: &str) -> Result<RunHandle> {
        let run_id = Uuid::new_v4().to_string();
        let paths = RunPaths::new(&self.state_dir, &run_id);
        info!(run_id = %run_id, "starting run");
        let mut ctx = NodeContext::new(run_id.clone(), paths.clone());
        let outcome = self
            .graph
            .invoke(task, &mut ctx, step_logger(&paths))
            .with_context(|| format!("run {run_id}"))?;
        self.settle(&run_id, &paths, outcome)
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    pub fn resume(&mut self, run_id: &str, follow_up: &str) -> Result<RunHandle> {
        let checkpoint = self.store.load(run_id)?;
        let paths = RunPaths::new(&self.state_dir, run_id);
        info!(resume_at = %checkpoint.resume_at, steps = checkpoint.steps_taken, "resuming run");
        let mut ctx = NodeContext::new(run_id, paths.clone());
        let outcome = self
            .graph
            .resume(
                checkpoint.state,
                checkpoint.resume_at,
                follow_up,
                checkpoint.steps_taken,
                &mut ctx,
                step_logger(&paths),
            )
            .with_context(|| format!("resume run {run_id}"))?;
        self.settle(run_id, &paths, outcome)
    }

    fn settle(&self, run_id: &str, paths: &RunPaths, outcome: GraphOutcome) -> Result<RunHandle> {
        match outcome {
            GraphOutcome::Finished {
                status,
                state,
                steps,
            } => {
                self.store.remove(run_id)?;
                write_summary(
                    paths,
                    &RunSummary {
                        run_id,
                        status: Some(status),
                        message: &state.msg,
                        rendered_images: &state.rendered_images,
                        script: &state.current_script,
                        messages: &state.messages,
                    },
                )?;
                info!(status = %status, steps, "run finished");
                Ok(RunHandle::Finished(RunReport {
                    run_id: run_id.to_string(),
                    status,
                    conversation: render_conversation(&state.messages),
                    message: state.msg,
                    script: state.current_script,
                    rendered_images: state.rendered_images,
                }))
            }
            GraphOutcome::Suspended { at, state, steps } => {
                write_summary(
                    paths,
                    &RunSummary {
                        run_id,
                        status: None,
                        message: "Waiting for a follow-up",
                        rendered_images: &state.rendered_images,
                        script: &state.current_script,
                        messages: &state.messages,
                    },
                )?;
                let checkpoint = Checkpoint {
                    run_id: run_id.to_string(),
                    resume_at: at,
                    steps_taken: steps,
                    state,
                };
                self.store.save(&checkpoint)?;
                info!(at = %at, steps, "run suspended");
                Ok(RunHandle::Suspended {
                    run_id: run_id.to_string(),
                    script: checkpoint.state.current_script,
                    rendered_images: checkpoint.state.rendered_images,
                })
            }
        }
    }
}

/// Observer appending each step to `steps.jsonl`. Log failures never stop a run.
fn step_logger(paths: &RunPaths) -> impl FnMut(&StepRecord) + '_ {
    move |record| {
        if let Err(err) = append_jsonl(&paths.steps_path, record) {
            warn!(err = %err, "failed to record step");
        }
    }
}
