//! Builds agents from configuration and wires them into a graph.

use std::rc::Rc;

use anyhow::Result;

use crate::agents::coding::{CodingAgent, CodingSettings};
use crate::agents::critic::{CriticAgent, RenderPass};
use crate::agents::planner::PlannerAgent;
use crate::agents::retriever::RetrieverAgent;
use crate::agents::user::UserAgent;
use crate::agents::verification::VerificationAgent;
use crate::agents::{Agent, BindingOptions};
use crate::core::route::NodeId;
use crate::graph::{CompiledGraph, GraphBuilder};
use crate::io::brain::Brain;
use crate::io::config::PipelineConfig;
use crate::io::docs::DocumentStore;
use crate::io::render::Renderer;
use crate::io::script::ScriptExecutor;

/// External systems the agents talk to.
#[derive(Clone)]
pub struct Collaborators {
    /// `None` is only valid for graphs without model-backed agents.
    pub brain: Option<Rc<dyn Brain>>,
    pub docs: Rc<dyn DocumentStore>,
    pub executor: Rc<dyn ScriptExecutor>,
    pub renderer: Rc<dyn Renderer>,
}

pub struct Coordinator {
    config: PipelineConfig,
    collaborators: Collaborators,
}

impl Coordinator {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn binding_options(&self) -> BindingOptions {
        BindingOptions {
            schema_dir: self.config.state_dir.join("schemas"),
            structured_output_attempts: self.config.brain.structured_output_attempts,
            prompt_budget_bytes: self.config.brain.prompt_budget_bytes,
        }
    }

    fn render_pass(&self) -> RenderPass {
        RenderPass::new(
            self.collaborators.renderer.clone(),
            self.config.critic.n_rendered_images,
        )
    }

    pub fn build_agent(&self, kind: NodeId) -> Result<Box<dyn Agent>> {
        let cfg = &self.config;
        let brain = self.collaborators.brain.clone();
        let options = self.binding_options();
        Ok(match kind {
            NodeId::Planner => Box::new(PlannerAgent::new(
                brain,
                &options,
                cfg.planner.max_subtasks,
                cfg.planner.validating_prompt.clone(),
            )?),
            NodeId::Retriever => Box::new(RetrieverAgent::new(
                brain,
                &options,
                self.collaborators.docs.clone(),
                cfg.retriever.top_k,
            )?),
            NodeId::Coding => Box::new(CodingAgent::new(
                brain,
                &options,
                self.collaborators.executor.clone(),
                CodingSettings {
                    fix_ceiling: cfg.coding.fix_attempts,
                    after_verification: cfg.coding.after_verification,
                    no_error_sentinel: cfg.blender.no_error_sentinel.clone(),
                },
            )?),
            NodeId::Critic => Box::new(CriticAgent::new(brain, &options, self.render_pass())?),
            NodeId::Verification => Box::new(VerificationAgent::new(
                brain,
                &options,
                self.render_pass(),
                cfg.verification.attempts,
            )?),
            NodeId::User => Box::new(UserAgent::new(cfg.user.interactive)),
        })
    }

    /// Build and compile the full six-node graph.
    pub fn build_graph(&self) -> Result<CompiledGraph> {
        let mut builder = GraphBuilder::new();
        for kind in NodeId::ALL {
            builder = builder.add_node(self.build_agent(kind)?);
        }
        builder.compile(self.config.max_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedKit;

    fn config(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            state_dir: dir.to_path_buf(),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn builds_the_full_graph() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kit = ScriptedKit::new();
        let graph = Coordinator::new(config(temp.path()), kit.collaborators())
            .build_graph()
            .expect("graph");
        assert_eq!(graph.entry(), NodeId::Planner);
        assert_eq!(graph.max_steps(), 200);
        assert!(temp.path().join("schemas/verification.schema.json").exists());
    }

    #[test]
    fn model_agents_need_a_brain() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kit = ScriptedKit::new();
        let collaborators = Collaborators {
            brain: None,
            ..kit.collaborators()
        };
        let coordinator = Coordinator::new(config(temp.path()), collaborators);

        assert!(coordinator.build_agent(NodeId::User).is_ok());
        let err = coordinator
            .build_agent(NodeId::Critic)
            .err()
            .expect("no brain");
        assert!(err.to_string().contains("critic needs a brain"));
    }
}
