//! Coding agent: writes, executes and repairs the script.
//!
//! A batch starts on a fresh call (from the planner, critic, verification or
//! user). The agent keeps its own copy of the batch bookkeeping; re-entries
//! from the retriever or from itself only contribute `retrieved_docs`.
//!
//! Per batch:
//! 1. Without docs, fork one retriever pass over all queries.
//! 2. For each query, in order: ask the brain for the code, write it, execute
//!    it. Generate replies are per-subtask fragments; the executed script is
//!    every accepted fragment so far followed by the new one. Improve replies
//!    replace the whole script.
//! 3. On an execution error, detour through the retriever with the error as the
//!    only query, then regenerate from the failing script. More than
//!    `fix_ceiling` consecutive failures halt the run.
//! 4. After the last query, route on the batch caller.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{Result, bail};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{Agent, AgentSpec, BindingOptions, BrainBinding, CODING_SCHEMA, NodeContext};
use crate::core::outcome::{Halt, HaltReason};
use crate::core::route::{Endpoint, NodeId, Route, Step};
use crate::core::state::{Caller, CodingTask, Message, Queries, SharedState, StateUpdate};
use crate::io::brain::Brain;
use crate::io::config::AfterVerification;
use crate::io::prompt::{FixInputs, GenerateInputs, ImproveInputs, PromptPack};
use crate::io::script::{ScriptExecutor, write_and_execute};

#[derive(Debug, Deserialize)]
struct CodingOutput {
    script: String,
}

/// Settings for [`CodingAgent`].
#[derive(Debug, Clone)]
pub struct CodingSettings {
    pub fix_ceiling: u32,
    pub after_verification: AfterVerification,
    pub no_error_sentinel: String,
}

/// Authoritative bookkeeping for one generate/improve session.
#[derive(Debug, Clone)]
struct CodingBatch {
    task: CodingTask,
    queries: Queries,
    caller: Caller,
    docs: BTreeMap<usize, String>,
    current_script: String,
    /// Accepted generate fragments, oldest first.
    previous_scripts: Vec<String>,
    query_offset: usize,
    num_queries: usize,
    pending_fix: Option<PendingFix>,
}

#[derive(Debug, Clone)]
struct PendingFix {
    /// The brain's failing reply: a fragment when generating.
    script: String,
    error: String,
    docs: BTreeMap<usize, String>,
}

pub struct CodingAgent {
    spec: AgentSpec,
    brain: BrainBinding,
    executor: Rc<dyn ScriptExecutor>,
    settings: CodingSettings,
    batch: Option<CodingBatch>,
    /// Consecutive failed executions; reset by any success.
    fix_attempts: u32,
}

impl CodingAgent {
    pub fn new(
        brain: Option<Rc<dyn Brain>>,
        options: &BindingOptions,
        executor: Rc<dyn ScriptExecutor>,
        settings: CodingSettings,
    ) -> Result<Self> {
        let spec = AgentSpec {
            id: NodeId::Coding,
            incoming: vec![
                NodeId::Planner.into(),
                NodeId::Retriever.into(),
                NodeId::Coding.into(),
                NodeId::Critic.into(),
                NodeId::Verification.into(),
                NodeId::User.into(),
            ],
            outgoing: vec![
                NodeId::Retriever.into(),
                NodeId::Coding.into(),
                NodeId::Critic.into(),
                NodeId::Verification.into(),
                NodeId::User.into(),
            ],
            schemas: vec![CODING_SCHEMA],
        };
        let brain = BrainBinding::bind(&spec, brain, options)?;
        Ok(Self {
            spec,
            brain,
            executor,
            settings,
            batch: None,
            fix_attempts: 0,
        })
    }

    pub fn fix_attempts(&self) -> u32 {
        self.fix_attempts
    }

    fn start_batch(&mut self, state: &SharedState) -> Result<()> {
        let caller = match state.caller {
            Some(Caller::Retriever) | None => {
                bail!("coding called without an external caller")
            }
            Some(caller) => caller,
        };
        match (state.coding_task, &state.queries) {
            (CodingTask::Generate, Queries::Subtasks(_))
            | (CodingTask::Improve, Queries::Improvements(_) | Queries::FollowUp(_)) => {}
            (CodingTask::Fix, _) => bail!("fix is only reachable as an internal detour"),
            (task, queries) => bail!(
                "coding task {} does not accept {} queries",
                task.as_str(),
                queries_kind(queries)
            ),
        }
        let docs = if state.has_docs {
            state.retrieved_docs.clone()
        } else {
            BTreeMap::new()
        };
        info!(
            task = state.coding_task.as_str(),
            caller = %caller,
            queries = state.queries.len(),
            "starting coding batch"
        );
        self.fix_attempts = 0;
        self.batch = Some(CodingBatch {
            task: state.coding_task,
            queries: state.queries.clone(),
            caller,
            docs,
            current_script: state.current_script.clone(),
            previous_scripts: Vec::new(),
            query_offset: 0,
            // Improve applies every solution in a single call.
            num_queries: match state.coding_task {
                CodingTask::Generate => state.queries.len(),
                _ => 1,
            },
            pending_fix: None,
        });
        Ok(())
    }

    fn prompt_for(&self, task: &str, batch: &CodingBatch) -> Result<PromptPack> {
        let prompts = self.brain.prompts();
        if let Some(fix) = &batch.pending_fix {
            let docs = join_docs(&fix.docs);
            let previous = (batch.task == CodingTask::Generate)
                .then(|| batch.previous_scripts.join("\n\n"));
            return prompts.build_fix(&FixInputs {
                script: &fix.script,
                error: &fix.error,
                docs: docs.as_deref(),
                previous: previous.as_deref(),
            });
        }
        match &batch.queries {
            Queries::Subtasks(subtasks) => {
                let subtask = subtasks
                    .get(batch.query_offset)
                    .map(String::as_str)
                    .unwrap_or_default();
                prompts.build_generate(&GenerateInputs {
                    task,
                    subtask,
                    docs: batch.docs.get(&batch.query_offset).map(String::as_str),
                    previous_scripts: &batch.previous_scripts,
                })
            }
            Queries::Improvements(items) => {
                let docs = join_docs(&batch.docs);
                prompts.build_improve(&ImproveInputs {
                    task,
                    script: &batch.current_script,
                    solutions: items,
                    follow_up: None,
                    docs: docs.as_deref(),
                })
            }
            Queries::FollowUp(text) => {
                let docs = join_docs(&batch.docs);
                prompts.build_improve(&ImproveInputs {
                    task,
                    script: &batch.current_script,
                    solutions: &[],
                    follow_up: Some(text),
                    docs: docs.as_deref(),
                })
            }
            Queries::Fix(_) => bail!("fix queries never start a batch"),
        }
    }

    /// Produce and execute one script for the current query (or pending fix).
    #[instrument(skip_all, fields(step = ctx.step))]
    fn work(&mut self, task: &str, ctx: &NodeContext) -> Result<Step> {
        let Some(mut batch) = self.batch.take() else {
            bail!("coding continuation without an active batch");
        };
        let prompt = self.prompt_for(task, &batch)?;
        let mut messages = Vec::new();
        let output: CodingOutput =
            self.brain
                .ask(ctx, CODING_SCHEMA.name, &prompt, &[], &mut messages)?;

        let path = ctx
            .paths
            .scripts_dir
            .join(format!("{:03}-coding.py", ctx.step));
        let generating = batch.task == CodingTask::Generate;
        let script = if generating {
            compose_script(&batch.previous_scripts, &output.script)
        } else {
            output.script.clone()
        };
        let report = write_and_execute(self.executor.as_ref(), &path, &script)?;

        if let Some(error) = report.failure(&self.settings.no_error_sentinel) {
            self.fix_attempts += 1;
            warn!(
                fix_attempts = self.fix_attempts,
                ceiling = self.settings.fix_ceiling,
                offset = batch.query_offset,
                "script failed to execute"
            );
            messages.push(Message::system(format!("Execution error: {error}")));
            if self.fix_attempts > self.settings.fix_ceiling {
                let ceiling = self.settings.fix_ceiling;
                self.fix_attempts = 0;
                return Ok(Step::Halt(Halt::new(
                    HaltReason::FixCeiling { ceiling },
                    StateUpdate {
                        messages,
                        ..StateUpdate::default()
                    },
                )));
            }
            let caller = batch.caller;
            batch.pending_fix = Some(PendingFix {
                script: output.script,
                error: error.clone(),
                docs: BTreeMap::new(),
            });
            self.batch = Some(batch);
            return Ok(Step::Detour(Route::fork(
                NodeId::Retriever,
                StateUpdate {
                    coding_task: Some(CodingTask::Fix),
                    queries: Some(Queries::Fix(error)),
                    has_docs: Some(false),
                    is_sub_call: Some(false),
                    caller: Some(caller),
                    messages,
                    ..StateUpdate::default()
                },
            )));
        }

        self.fix_attempts = 0;
        batch.pending_fix = None;
        batch.current_script = script;
        if generating {
            batch.previous_scripts.push(output.script);
        }
        batch.query_offset += 1;
        debug!(
            offset = batch.query_offset,
            total = batch.num_queries,
            "script executed"
        );
        messages.push(Message::system(format!(
            "Script executed ({}/{})",
            batch.query_offset, batch.num_queries
        )));

        let mut update = StateUpdate {
            current_script: Some(batch.current_script.clone()),
            previous_scripts: generating.then(|| batch.previous_scripts.clone()),
            queries: Some(batch.queries.clone()),
            coding_task: Some(batch.task),
            is_sub_call: Some(false),
            caller: Some(batch.caller),
            messages,
            ..StateUpdate::default()
        };

        if batch.query_offset < batch.num_queries {
            update.has_docs = Some(true);
            self.batch = Some(batch);
            return Ok(Step::Route(Route::goto(NodeId::Coding, update)));
        }

        let next = self.destination(batch.caller)?;
        info!(caller = %batch.caller, next = %next, "coding batch finished");
        update.has_docs = Some(false);
        update.retrieved_docs = Some(BTreeMap::new());
        Ok(Step::Route(Route::goto(next, update)))
    }

    fn destination(&self, caller: Caller) -> Result<NodeId> {
        Ok(match caller {
            Caller::Planner => NodeId::Critic,
            Caller::Critic | Caller::User => NodeId::Verification,
            Caller::Verification => match self.settings.after_verification {
                AfterVerification::Verification => NodeId::Verification,
                AfterVerification::User => NodeId::User,
            },
            Caller::Retriever => bail!("retriever cannot own a coding batch"),
        })
    }
}

impl Agent for CodingAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn call(&mut self, state: &SharedState, ctx: &mut NodeContext) -> Result<Step> {
        let from_retriever = ctx.came_from == Endpoint::Node(NodeId::Retriever);
        let continuation = self.batch.is_some()
            && ((from_retriever && state.is_sub_call)
                || ctx.came_from == Endpoint::Node(NodeId::Coding));

        if continuation {
            if from_retriever && let Some(batch) = self.batch.as_mut() {
                match batch.pending_fix.as_mut() {
                    Some(fix) => fix.docs = state.retrieved_docs.clone(),
                    None => batch.docs = state.retrieved_docs.clone(),
                }
            }
        } else {
            self.start_batch(state)?;
            if !state.has_docs {
                // One retrieval pass for the whole batch.
                return Ok(Step::Route(Route::fork(
                    NodeId::Retriever,
                    StateUpdate {
                        queries: Some(state.queries.clone()),
                        coding_task: Some(state.coding_task),
                        has_docs: Some(false),
                        is_sub_call: Some(false),
                        ..StateUpdate::default()
                    },
                )));
            }
        }
        self.work(state.task(), ctx)
    }
}

/// Accepted fragments followed by `fragment`, as one runnable script.
fn compose_script(previous: &[String], fragment: &str) -> String {
    previous
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(fragment))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn join_docs(docs: &BTreeMap<usize, String>) -> Option<String> {
    let joined = docs.values().cloned().collect::<Vec<_>>().join("\n\n");
    (!joined.trim().is_empty()).then_some(joined)
}

fn queries_kind(queries: &Queries) -> &'static str {
    match queries {
        Queries::Subtasks(_) => "subtask",
        Queries::Fix(_) => "fix",
        Queries::Improvements(_) => "improvement",
        Queries::FollowUp(_) => "follow-up",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedBrain, ScriptedExecutor, test_context};
    use std::path::Path;

    struct Harness {
        brain: Rc<ScriptedBrain>,
        executor: Rc<ScriptedExecutor>,
        agent: CodingAgent,
    }

    fn harness(dir: &Path, fix_ceiling: u32) -> Harness {
        let brain = Rc::new(ScriptedBrain::new());
        let executor = Rc::new(ScriptedExecutor::new());
        let options = BindingOptions {
            schema_dir: dir.join("schemas"),
            structured_output_attempts: 3,
            prompt_budget_bytes: 20_000,
        };
        let agent = CodingAgent::new(
            Some(brain.clone()),
            &options,
            executor.clone(),
            CodingSettings {
                fix_ceiling,
                after_verification: AfterVerification::Verification,
                no_error_sentinel: "None".to_string(),
            },
        )
        .expect("coding agent");
        Harness {
            brain,
            executor,
            agent,
        }
    }

    fn planned_state(subtasks: &[&str]) -> SharedState {
        let mut state = SharedState::new("create a 3D chair");
        state.queries = Queries::Subtasks(subtasks.iter().map(|s| s.to_string()).collect());
        state.coding_task = CodingTask::Generate;
        state.caller = Some(Caller::Planner);
        state
    }

    /// Simulate the retriever handing back to coding.
    fn returned_from_retriever(state: &mut SharedState, docs: &[(usize, &str)]) {
        state.retrieved_docs = docs.iter().map(|(i, d)| (*i, d.to_string())).collect();
        state.is_sub_call = true;
        state.has_docs = true;
        state.caller = Some(Caller::Retriever);
    }

    fn route(step: Step) -> Route {
        match step {
            Step::Route(route) => route,
            other => panic!("expected route, got {other:?}"),
        }
    }

    #[test]
    fn fresh_batch_without_docs_forks_retriever() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut h = harness(temp.path(), 3);
        let mut ctx = test_context(temp.path());
        ctx.came_from = NodeId::Planner.into();

        let route = route(
            h.agent
                .call(&planned_state(&["legs", "seat"]), &mut ctx)
                .expect("call"),
        );

        assert_eq!(route.goto, Endpoint::Node(NodeId::Retriever));
        assert_eq!(route.dispatch, crate::core::route::Dispatch::Fork);
        assert_eq!(route.update.queries.expect("queries").len(), 2);
        assert_eq!(h.brain.calls("coding"), 0);
    }

    /// Each subtask is generated in order; the last one routes on the caller.
    #[test]
    fn generates_each_subtask_then_routes_to_critic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut h = harness(temp.path(), 3);
        h.brain.push_script("legs()");
        h.brain.push_script("seat()");
        let mut state = planned_state(&["legs", "seat"]);
        let mut ctx = test_context(temp.path());
        ctx.came_from = NodeId::Planner.into();
        h.agent.call(&state, &mut ctx).expect("fork");

        returned_from_retriever(&mut state, &[(0, "cylinder docs"), (1, "cube docs")]);
        ctx.came_from = NodeId::Retriever.into();
        let first = route(h.agent.call(&state, &mut ctx).expect("first"));
        assert_eq!(first.goto, Endpoint::Node(NodeId::Coding));
        assert_eq!(first.update.caller, Some(Caller::Planner));
        assert!(h.brain.requests()[0].prompt.contains("cylinder docs"));
        state.apply(first.update);

        ctx.came_from = NodeId::Coding.into();
        let second = route(h.agent.call(&state, &mut ctx).expect("second"));
        assert_eq!(second.goto, Endpoint::Node(NodeId::Critic));
        assert_eq!(
            second.update.current_script.as_deref(),
            Some("legs()\n\nseat()")
        );
        assert_eq!(
            second.update.previous_scripts,
            Some(vec!["legs()".to_string(), "seat()".to_string()])
        );
        assert!(h.brain.requests()[1].prompt.contains("cube docs"));
        assert_eq!(h.executor.executed(), vec!["legs()", "legs()\n\nseat()"]);
    }

    /// An execution error detours through the retriever and the next call
    /// repairs the failing script with the fix docs.
    #[test]
    fn execution_error_detours_then_fixes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut h = harness(temp.path(), 3);
        h.brain.push_script("legs(radius)");
        h.brain.push_script("radius = 1\nlegs(radius)");
        h.executor.push_error("NameError: name 'radius' is not defined");
        let mut state = planned_state(&["legs"]);
        state.has_docs = true;
        let mut ctx = test_context(temp.path());
        ctx.came_from = NodeId::Planner.into();

        let step = h.agent.call(&state, &mut ctx).expect("generate");
        let Step::Detour(detour) = step else {
            panic!("expected detour");
        };
        assert_eq!(detour.goto, Endpoint::Node(NodeId::Retriever));
        assert_eq!(detour.update.coding_task, Some(CodingTask::Fix));
        assert_eq!(
            detour.update.queries,
            Some(Queries::Fix(
                "NameError: name 'radius' is not defined".to_string()
            ))
        );
        assert_eq!(h.agent.fix_attempts(), 1);

        returned_from_retriever(&mut state, &[(0, "declare variables first")]);
        ctx.came_from = NodeId::Retriever.into();
        let fixed = route(h.agent.call(&state, &mut ctx).expect("fix"));

        let fix_prompt = &h.brain.requests()[1].prompt;
        assert!(fix_prompt.contains("NameError"));
        assert!(fix_prompt.contains("legs(radius)"));
        assert!(fix_prompt.contains("declare variables first"));
        assert_eq!(fixed.goto, Endpoint::Node(NodeId::Critic));
        assert_eq!(h.agent.fix_attempts(), 0);
    }

    /// Later subtasks see each earlier fragment exactly once.
    #[test]
    fn earlier_fragments_are_not_repeated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut h = harness(temp.path(), 3);
        for script in ["make_legs()", "make_seat()", "make_back()"] {
            h.brain.push_script(script);
        }
        let mut state = planned_state(&["legs", "seat", "back"]);
        state.has_docs = true;
        let mut ctx = test_context(temp.path());
        ctx.came_from = NodeId::Planner.into();

        let mut last = route(h.agent.call(&state, &mut ctx).expect("legs"));
        ctx.came_from = NodeId::Coding.into();
        for _ in 0..2 {
            state.apply(last.update);
            last = route(h.agent.call(&state, &mut ctx).expect("next"));
        }

        let third = &h.brain.requests()[2].prompt;
        assert_eq!(third.matches("make_legs()").count(), 1);
        assert!(third.contains("<previous>\nmake_legs()\n\nmake_seat()\n</previous>"));
        assert_eq!(
            last.update.current_script.as_deref(),
            Some("make_legs()\n\nmake_seat()\n\nmake_back()")
        );
    }

    /// A fix during generate repairs the fragment with earlier code as context.
    #[test]
    fn generate_fix_repairs_only_the_fragment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut h = harness(temp.path(), 3);
        h.brain.push_script("legs()");
        h.brain.push_script("seat(radius)");
        h.brain.push_script("radius = 1\nseat(radius)");
        h.executor.push_success();
        h.executor.push_error("NameError: radius");
        let mut state = planned_state(&["legs", "seat"]);
        state.has_docs = true;
        let mut ctx = test_context(temp.path());
        ctx.came_from = NodeId::Planner.into();

        let first = route(h.agent.call(&state, &mut ctx).expect("legs"));
        state.apply(first.update);
        ctx.came_from = NodeId::Coding.into();
        assert!(matches!(
            h.agent.call(&state, &mut ctx).expect("seat"),
            Step::Detour(_)
        ));
        returned_from_retriever(&mut state, &[]);
        ctx.came_from = NodeId::Retriever.into();
        let fixed = route(h.agent.call(&state, &mut ctx).expect("fix"));

        let fix_prompt = &h.brain.requests()[2].prompt;
        assert!(fix_prompt.contains("<previous>\nlegs()\n</previous>"));
        assert!(fix_prompt.contains("<script>\nseat(radius)\n</script>"));
        assert_eq!(
            fixed.update.previous_scripts,
            Some(vec!["legs()".to_string(), "radius = 1\nseat(radius)".to_string()])
        );
        assert_eq!(
            h.executor.executed().last().map(String::as_str),
            Some("legs()\n\nradius = 1\nseat(radius)")
        );
    }

    #[test]
    fn halts_past_the_fix_ceiling() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut h = harness(temp.path(), 1);
        h.brain.push_script("broken()");
        h.brain.push_script("still_broken()");
        h.executor.push_error("RuntimeError: one");
        h.executor.push_error("RuntimeError: two");
        let mut state = planned_state(&["legs"]);
        state.has_docs = true;
        state.current_script = "kept()".to_string();
        let mut ctx = test_context(temp.path());
        ctx.came_from = NodeId::Planner.into();

        let first = h.agent.call(&state, &mut ctx).expect("first");
        assert!(matches!(first, Step::Detour(_)));

        returned_from_retriever(&mut state, &[]);
        ctx.came_from = NodeId::Retriever.into();
        let Step::Halt(halt) = h.agent.call(&state, &mut ctx).expect("second") else {
            panic!("expected halt");
        };
        assert_eq!(halt.reason, HaltReason::FixCeiling { ceiling: 1 });
        assert!(halt.update.current_script.is_none());
        assert!(halt.update.msg.expect("msg").contains("ceiling of 1"));
    }

    #[test]
    fn improve_applies_all_solutions_in_one_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut h = harness(temp.path(), 3);
        h.brain.push_script("chair(legs=4)");
        let mut state = SharedState::new("chair");
        state.current_script = "chair(legs=3)".to_string();
        state.coding_task = CodingTask::Improve;
        state.caller = Some(Caller::Critic);
        state.has_docs = true;
        state.queries = Queries::Improvements(vec![
            crate::core::state::CriticSolution {
                critic: "three legs".to_string(),
                solution: "use four legs".to_string(),
            },
            crate::core::state::CriticSolution {
                critic: "seat too thin".to_string(),
                solution: "thicken the seat".to_string(),
            },
        ]);
        let mut ctx = test_context(temp.path());
        ctx.came_from = NodeId::Critic.into();

        let route = route(h.agent.call(&state, &mut ctx).expect("improve"));

        assert_eq!(h.brain.calls("coding"), 1);
        let prompt = &h.brain.requests()[0].prompt;
        assert!(prompt.contains("use four legs") && prompt.contains("thicken the seat"));
        assert_eq!(route.goto, Endpoint::Node(NodeId::Verification));
        assert!(route.update.previous_scripts.is_none());
    }

    #[test]
    fn rejects_fix_as_a_fresh_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut h = harness(temp.path(), 3);
        let mut state = SharedState::new("chair");
        state.coding_task = CodingTask::Fix;
        state.queries = Queries::Fix("boom".to_string());
        state.caller = Some(Caller::Critic);
        let mut ctx = test_context(temp.path());
        ctx.came_from = NodeId::Critic.into();

        let err = h.agent.call(&state, &mut ctx).unwrap_err();
        assert!(err.to_string().contains("internal detour"));
    }
}
