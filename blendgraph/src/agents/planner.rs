//! Planner agent: splits the task into ordered subtasks.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use super::{Agent, AgentSpec, BindingOptions, BrainBinding, NodeContext, PLANNER_SCHEMA};
use crate::core::route::{Endpoint, NodeId, Route, Step};
use crate::core::state::{Caller, CodingTask, Queries, SharedState, StateUpdate};
use crate::io::brain::Brain;

#[derive(Debug, Deserialize)]
struct PlannerOutput {
    subtasks: Vec<String>,
}

pub struct PlannerAgent {
    spec: AgentSpec,
    brain: BrainBinding,
    max_subtasks: usize,
    validating_prompt: Option<String>,
}

impl PlannerAgent {
    pub fn new(
        brain: Option<Rc<dyn Brain>>,
        options: &BindingOptions,
        max_subtasks: usize,
        validating_prompt: Option<String>,
    ) -> Result<Self> {
        let spec = AgentSpec {
            id: NodeId::Planner,
            incoming: vec![Endpoint::Start],
            outgoing: vec![NodeId::Coding.into()],
            schemas: vec![PLANNER_SCHEMA],
        };
        let brain = BrainBinding::bind(&spec, brain, options)?;
        Ok(Self {
            spec,
            brain,
            max_subtasks,
            validating_prompt,
        })
    }

    fn normalize(&self, task: &str, raw: Vec<String>) -> Vec<String> {
        let mut subtasks: Vec<String> = raw
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if subtasks.len() > self.max_subtasks {
            warn!(
                got = subtasks.len(),
                max = self.max_subtasks,
                "truncating plan"
            );
            subtasks.truncate(self.max_subtasks);
        }
        if subtasks.is_empty() {
            warn!("empty plan, treating the task as a single subtask");
            subtasks.push(task.to_string());
        }
        subtasks
    }
}

impl Agent for PlannerAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn call(&mut self, state: &SharedState, ctx: &mut NodeContext) -> Result<Step> {
        let prompt = self
            .brain
            .prompts()
            .build_planner(state.task(), self.max_subtasks)?;
        let mut messages = Vec::new();
        let output: PlannerOutput =
            self.brain
                .ask(ctx, PLANNER_SCHEMA.name, &prompt, &[], &mut messages)?;
        let subtasks = self.normalize(state.task(), output.subtasks);
        info!(count = subtasks.len(), "planned subtasks");

        let validating_prompt = self
            .validating_prompt
            .clone()
            .unwrap_or_else(|| state.task().to_string());
        Ok(Step::Route(Route::goto(
            NodeId::Coding,
            StateUpdate {
                queries: Some(Queries::Subtasks(subtasks)),
                coding_task: Some(CodingTask::Generate),
                is_sub_call: Some(false),
                caller: Some(Caller::Planner),
                has_docs: Some(false),
                retrieved_docs: Some(BTreeMap::new()),
                previous_scripts: Some(Vec::new()),
                validating_prompt: Some(validating_prompt),
                messages,
                ..StateUpdate::default()
            },
        )))
    }
}
