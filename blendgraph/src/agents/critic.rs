//! Critic agent: renders the current script and critiques each view.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::{Agent, AgentSpec, BindingOptions, BrainBinding, CRITIC_SCHEMA, NodeContext};
use crate::core::outcome::{Halt, HaltReason};
use crate::core::route::{NodeId, Route, Step};
use crate::core::state::{Caller, CodingTask, CriticSolution, Queries, SharedState, StateUpdate};
use crate::io::brain::Brain;
use crate::io::render::Renderer;

#[derive(Debug, Deserialize)]
struct CriticOutput {
    critic_solution_list: Vec<CriticSolution>,
}

/// Render step shared by the critic and verification agents.
#[derive(Clone)]
pub struct RenderPass {
    renderer: Rc<dyn Renderer>,
    n_images: usize,
}

impl RenderPass {
    pub fn new(renderer: Rc<dyn Renderer>, n_images: usize) -> Self {
        Self { renderer, n_images }
    }

    /// Render `script` into this step's render directory.
    ///
    /// Returns at most `n_images` paths, sorted.
    #[instrument(skip_all, fields(node = %node, step = ctx.step))]
    pub fn render(&self, script: &str, ctx: &NodeContext, node: NodeId) -> Result<Vec<PathBuf>> {
        let out_dir = ctx.step_dir(&ctx.paths.renders_dir, node);
        let mut images = self
            .renderer
            .render(script, &out_dir)
            .with_context(|| format!("render for {node}"))?;
        images.sort();
        images.truncate(self.n_images);
        info!(count = images.len(), "rendered views");
        Ok(images)
    }
}

pub struct CriticAgent {
    spec: AgentSpec,
    brain: BrainBinding,
    render: RenderPass,
}

impl CriticAgent {
    pub fn new(
        brain: Option<Rc<dyn Brain>>,
        options: &BindingOptions,
        render: RenderPass,
    ) -> Result<Self> {
        let spec = AgentSpec {
            id: NodeId::Critic,
            incoming: vec![NodeId::Coding.into()],
            outgoing: vec![NodeId::Coding.into(), NodeId::User.into()],
            schemas: vec![CRITIC_SCHEMA],
        };
        let brain = BrainBinding::bind(&spec, brain, options)?;
        Ok(Self {
            spec,
            brain,
            render,
        })
    }
}

impl Agent for CriticAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn call(&mut self, state: &SharedState, ctx: &mut NodeContext) -> Result<Step> {
        let images = self.render.render(&state.current_script, ctx, NodeId::Critic)?;
        if images.is_empty() {
            warn!("critic rendered no images");
            return Ok(Step::Halt(Halt::new(
                HaltReason::NoRender {
                    node: NodeId::Critic,
                },
                StateUpdate::default(),
            )));
        }

        let prompt = self
            .brain
            .prompts()
            .build_critic(&state.validating_prompt, &state.current_script)?;
        let mut messages = Vec::new();
        let mut critics_solutions = BTreeMap::new();
        for (idx, image) in images.iter().enumerate() {
            let output: CriticOutput = self.brain.ask(
                ctx,
                CRITIC_SCHEMA.name,
                &prompt,
                std::slice::from_ref(image),
                &mut messages,
            )?;
            critics_solutions.insert(idx, output.critic_solution_list);
        }
        let flattened: Vec<CriticSolution> = critics_solutions
            .values()
            .flatten()
            .filter(|item| !item.solution.trim().is_empty())
            .cloned()
            .collect();
        info!(
            images = images.len(),
            solutions = flattened.len(),
            "critique finished"
        );

        let update = StateUpdate {
            critics_solutions: Some(critics_solutions),
            rendered_images: Some(images),
            messages,
            ..StateUpdate::default()
        };
        if flattened.is_empty() {
            return Ok(Step::Route(Route::goto(
                NodeId::User,
                update.with_msg("Critic found nothing to improve"),
            )));
        }
        Ok(Step::Route(Route::goto(
            NodeId::Coding,
            StateUpdate {
                queries: Some(Queries::Improvements(flattened)),
                coding_task: Some(CodingTask::Improve),
                caller: Some(Caller::Critic),
                is_sub_call: Some(false),
                has_docs: Some(false),
                ..update
            },
        )))
    }
}
