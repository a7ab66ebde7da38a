//! Graph assembly and the routing loop.
//!
//! Nodes are registered with [`GraphBuilder::add_node`]; [`GraphBuilder::compile`]
//! checks that the declared edges agree with each other. The compiled graph
//! then walks one node at a time, enforcing:
//!
//! - every transition follows a declared edge,
//! - a detour delegate routes back to the node that sent it,
//! - only the retriever marks `is_sub_call`,
//! - retriever and coding are never entered with empty queries,
//! - at most `max_steps` node executions per invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agents::{Agent, NodeContext};
use crate::core::budget::StepBudget;
use crate::core::outcome::{Halt, HaltReason, RunStatus};
use crate::core::route::{Dispatch, Endpoint, NodeId, Route, Step};
use crate::core::state::{Caller, CodingTask, SharedState};

/// How control left a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Handoff { to: Endpoint },
    Fork { to: Endpoint },
    Detour { to: Endpoint },
    Suspend,
    Halt { status: RunStatus },
}

/// One node execution, as reported to the step observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    /// Steps across the whole run, this one included.
    pub index: u32,
    pub node: NodeId,
    pub came_from: Endpoint,
    pub coding_task: CodingTask,
    pub queries: usize,
    pub is_sub_call: bool,
    pub caller: Option<Caller>,
    pub transition: Transition,
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphOutcome {
    Finished {
        status: RunStatus,
        state: SharedState,
        steps: u32,
    },
    /// Waiting for external input at `at`.
    Suspended {
        at: NodeId,
        state: SharedState,
        steps: u32,
    },
}

/// A transition the graph refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRejected {
    pub from: NodeId,
    pub to: Endpoint,
    pub reason: String,
}

impl fmt::Display for TransitionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} rejected: {}", self.from, self.to, self.reason)
    }
}

impl std::error::Error for TransitionRejected {}

#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Box<dyn Agent>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(mut self, agent: Box<dyn Agent>) -> Self {
        self.nodes.push(agent);
        self
    }

    /// Validate the declared edges and produce a runnable graph.
    pub fn compile(self, max_steps: u32) -> Result<CompiledGraph> {
        let mut nodes = BTreeMap::new();
        for agent in self.nodes {
            let id = agent.spec().id;
            if nodes.insert(id, agent).is_some() {
                bail!("node {id} registered twice");
            }
        }

        let registered: BTreeSet<NodeId> = nodes.keys().copied().collect();
        let mut entries = Vec::new();
        for (&id, agent) in &nodes {
            let spec = agent.spec();
            for &to in &spec.outgoing {
                match to {
                    Endpoint::Start => bail!("{id} declares an edge into {to}"),
                    Endpoint::End => {}
                    Endpoint::Node(target) => {
                        let Some(target_agent) = nodes.get(&target) else {
                            bail!("{id} routes to unregistered node {target}");
                        };
                        if !target_agent.spec().incoming.contains(&Endpoint::Node(id)) {
                            bail!("{id} -> {target} is not accepted by {target}");
                        }
                    }
                }
            }
            for &from in &spec.incoming {
                match from {
                    Endpoint::End => bail!("{id} declares an edge out of {from}"),
                    Endpoint::Start => entries.push(id),
                    Endpoint::Node(source) => {
                        if !registered.contains(&source) {
                            bail!("{id} expects unregistered node {source}");
                        }
                    }
                }
            }
        }

        let entry = match entries.as_slice() {
            [entry] => *entry,
            [] => bail!("no node accepts {}", Endpoint::Start),
            many => bail!("{} nodes accept {}", many.len(), Endpoint::Start),
        };
        if max_steps == 0 {
            bail!("max_steps must be at least 1");
        }
        info!(nodes = nodes.len(), entry = %entry, max_steps, "graph compiled");
        Ok(CompiledGraph {
            nodes,
            entry,
            max_steps,
        })
    }
}

pub struct CompiledGraph {
    nodes: BTreeMap<NodeId, Box<dyn Agent>>,
    entry: NodeId,
    max_steps: u32,
}

/// Where the walk starts.
struct Cursor {
    node: NodeId,
    state: SharedState,
    input: Option<String>,
    steps_offset: u32,
}

impl CompiledGraph {
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Start a fresh run for `task`.
    pub fn invoke<F: FnMut(&StepRecord)>(
        &mut self,
        task: &str,
        ctx: &mut NodeContext,
        on_step: F,
    ) -> Result<GraphOutcome> {
        let cursor = Cursor {
            node: self.entry,
            state: SharedState::new(task),
            input: None,
            steps_offset: 0,
        };
        self.drive(cursor, ctx, on_step)
    }

    /// Continue a suspended run at `at`, delivering `input` to that node.
    pub fn resume<F: FnMut(&StepRecord)>(
        &mut self,
        state: SharedState,
        at: NodeId,
        input: &str,
        steps_offset: u32,
        ctx: &mut NodeContext,
        on_step: F,
    ) -> Result<GraphOutcome> {
        if !self.nodes.contains_key(&at) {
            bail!("cannot resume at unregistered node {at}");
        }
        let cursor = Cursor {
            node: at,
            state,
            input: Some(input.to_string()),
            steps_offset,
        };
        self.drive(cursor, ctx, on_step)
    }

    fn drive<F: FnMut(&StepRecord)>(
        &mut self,
        cursor: Cursor,
        ctx: &mut NodeContext,
        mut on_step: F,
    ) -> Result<GraphOutcome> {
        let Cursor {
            node: mut current,
            mut state,
            input,
            steps_offset,
        } = cursor;
        let mut came_from = Endpoint::Start;
        let mut budget = StepBudget::new(self.max_steps);
        // Private state for a forked delegate; consumed by its single call.
        let mut fork_view: Option<SharedState> = None;
        // (origin, delegate) pairs awaiting the delegate's return.
        let mut detours: Vec<(NodeId, NodeId)> = Vec::new();
        ctx.resume_input = input;

        loop {
            if !budget.try_take() {
                let halt = Halt::new(
                    HaltReason::StepCeiling {
                        limit: budget.limit(),
                    },
                    Default::default(),
                );
                warn!(limit = budget.limit(), node = %current, "step ceiling reached");
                state.apply(halt.update);
                return Ok(GraphOutcome::Finished {
                    status: RunStatus::AbortedStepCeiling,
                    state,
                    steps: steps_offset + budget.taken(),
                });
            }
            let steps = steps_offset + budget.taken();

            let view = fork_view.take();
            let input_state = view.as_ref().unwrap_or(&state);
            if matches!(current, NodeId::Retriever | NodeId::Coding)
                && input_state.queries.is_empty()
            {
                bail!("{current} entered from {came_from} with empty queries");
            }

            ctx.came_from = came_from;
            ctx.step = steps;
            debug!(node = %current, from = %came_from, step = steps, "entering node");
            let agent = self
                .nodes
                .get_mut(&current)
                .with_context(|| format!("node {current} is not registered"))?;
            let mut record = StepRecord {
                index: steps,
                node: current,
                came_from,
                coding_task: input_state.coding_task,
                queries: input_state.queries.len(),
                is_sub_call: input_state.is_sub_call,
                caller: input_state.caller,
                transition: Transition::Suspend,
            };
            let step = match agent.call(input_state, ctx) {
                Ok(step) => step,
                Err(err) => {
                    // The state up to the failing node is still reported.
                    let status = RunStatus::AbortedAgentError;
                    warn!(node = %current, step = steps, err = %format!("{err:#}"), "node failed");
                    record.transition = Transition::Halt { status };
                    on_step(&record);
                    state.msg = format!("{current} failed at step {steps}: {err:#}");
                    return Ok(GraphOutcome::Finished {
                        status,
                        state,
                        steps,
                    });
                }
            };
            ctx.resume_input = None;

            let (route, detour) = match step {
                Step::Route(route) => (route, false),
                Step::Detour(route) => (route, true),
                Step::Suspend(update) => {
                    state.apply(update);
                    on_step(&record);
                    info!(node = %current, "run suspended");
                    return Ok(GraphOutcome::Suspended {
                        at: current,
                        state,
                        steps,
                    });
                }
                Step::Halt(halt) => {
                    let status = halt.status();
                    warn!(node = %current, status = %status, "run halted");
                    state.apply(halt.update);
                    record.transition = Transition::Halt { status };
                    on_step(&record);
                    return Ok(GraphOutcome::Finished {
                        status,
                        state,
                        steps,
                    });
                }
            };

            self.check_route(current, &route, &mut detours)?;
            record.transition = match (detour, route.dispatch) {
                (true, _) => Transition::Detour { to: route.goto },
                (false, Dispatch::Handoff) => Transition::Handoff { to: route.goto },
                (false, Dispatch::Fork) => Transition::Fork { to: route.goto },
            };
            on_step(&record);

            let Route {
                update,
                goto,
                dispatch,
            } = route;
            let next = match goto {
                Endpoint::Node(next) => next,
                Endpoint::End => {
                    state.apply(update);
                    if state.msg.is_empty() {
                        state.msg = "Successful".to_string();
                    }
                    info!(steps, "run finished");
                    return Ok(GraphOutcome::Finished {
                        status: RunStatus::Success,
                        state,
                        steps,
                    });
                }
                Endpoint::Start => bail!("{current} routed back to {goto}"),
            };
            if detour {
                detours.push((current, next));
            }
            match dispatch {
                Dispatch::Handoff => state.apply(update),
                Dispatch::Fork => {
                    let mut private = state.clone();
                    state.apply(update.messages_only());
                    private.apply(update);
                    fork_view = Some(private);
                }
            }
            came_from = Endpoint::Node(current);
            current = next;
        }
    }

    fn check_route(
        &self,
        from: NodeId,
        route: &Route,
        detours: &mut Vec<(NodeId, NodeId)>,
    ) -> Result<()> {
        let reject = |reason: String| TransitionRejected {
            from,
            to: route.goto,
            reason,
        };
        let spec = self
            .nodes
            .get(&from)
            .with_context(|| format!("node {from} is not registered"))?
            .spec();
        if !spec.outgoing.contains(&route.goto) {
            return Err(reject(format!("{from} declares no edge to {}", route.goto)).into());
        }
        if let Endpoint::Node(target) = route.goto {
            let accepts = self
                .nodes
                .get(&target)
                .is_some_and(|agent| agent.spec().incoming.contains(&Endpoint::Node(from)));
            if !accepts {
                return Err(reject(format!("{target} does not accept {from}")).into());
            }
        }
        if route.update.is_sub_call == Some(true) && from != NodeId::Retriever {
            return Err(reject("only the retriever may mark a sub-call".to_string()).into());
        }
        if let Some(&(origin, delegate)) = detours.last()
            && delegate == from
        {
            if route.goto != Endpoint::Node(origin) {
                return Err(reject(format!("detour delegate must return to {origin}")).into());
            }
            detours.pop();
        }
        Ok(())
    }
}
