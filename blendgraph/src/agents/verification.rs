//! Verification agent: re-renders the improved script and checks whether the
//! earlier critiques (or the user's follow-up) are resolved.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::critic::RenderPass;
use super::{Agent, AgentSpec, BindingOptions, BrainBinding, NodeContext, VERIFICATION_SCHEMA};
use crate::core::outcome::{Halt, HaltReason};
use crate::core::route::{NodeId, Route, Step};
use crate::core::state::{
    Caller, CodingTask, CriticSolution, Message, Queries, SharedState, StateUpdate,
};
use crate::io::brain::Brain;

#[derive(Debug, Deserialize)]
struct VerificationOutput {
    verdict: Verdict,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    satisfied: bool,
    remaining_critic: String,
    solution: String,
}

impl Verdict {
    /// The critique still open, if any. Blank fields fall back to `original`.
    fn remaining(self, original: &CriticSolution) -> Option<CriticSolution> {
        if self.satisfied {
            return None;
        }
        let critic = if self.remaining_critic.trim().is_empty() {
            original.critic.clone()
        } else {
            self.remaining_critic
        };
        let solution = if self.solution.trim().is_empty() {
            warn!(critic = %critic, "unsatisfied verdict without a solution, keeping the earlier one");
            original.solution.clone()
        } else {
            self.solution
        };
        Some(CriticSolution { critic, solution })
    }
}

pub struct VerificationAgent {
    spec: AgentSpec,
    brain: BrainBinding,
    render: RenderPass,
    ceiling: u32,
    /// Consecutive unsatisfied rounds sent back to coding.
    tries: u32,
}

impl VerificationAgent {
    pub fn new(
        brain: Option<Rc<dyn Brain>>,
        options: &BindingOptions,
        render: RenderPass,
        ceiling: u32,
    ) -> Result<Self> {
        let spec = AgentSpec {
            id: NodeId::Verification,
            incoming: vec![NodeId::Coding.into()],
            outgoing: vec![NodeId::Coding.into(), NodeId::User.into()],
            schemas: vec![VERIFICATION_SCHEMA],
        };
        let brain = BrainBinding::bind(&spec, brain, options)?;
        Ok(Self {
            spec,
            brain,
            render,
            ceiling,
            tries: 0,
        })
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    fn check_prompt(
        &self,
        prompt: &str,
        before: &[PathBuf],
        after: &[PathBuf],
        ctx: &NodeContext,
        messages: &mut Vec<Message>,
    ) -> Result<BTreeMap<usize, Vec<CriticSolution>>> {
        let pack = self.brain.prompts().build_verify_prompt(prompt)?;
        let images: Vec<PathBuf> = before.iter().chain(after).cloned().collect();
        let output: VerificationOutput =
            self.brain
                .ask(ctx, VERIFICATION_SCHEMA.name, &pack, &images, messages)?;
        let request = CriticSolution {
            critic: "Follow-up request is not met yet".to_string(),
            solution: prompt.to_string(),
        };
        let mut remaining = BTreeMap::new();
        if let Some(item) = output.verdict.remaining(&request) {
            remaining.insert(0, vec![item]);
        }
        Ok(remaining)
    }

    fn check_critiques(
        &self,
        critiques: &BTreeMap<usize, Vec<CriticSolution>>,
        before: &[PathBuf],
        after: &[PathBuf],
        ctx: &NodeContext,
        messages: &mut Vec<Message>,
    ) -> Result<BTreeMap<usize, Vec<CriticSolution>>> {
        let mut remaining = BTreeMap::new();
        for (&idx, items) in critiques {
            let Some(after_image) = after.get(idx) else {
                // The view is gone; its critiques cannot be judged yet.
                debug!(idx, "no matching view, carrying critiques forward");
                if !items.is_empty() {
                    remaining.insert(idx, items.clone());
                }
                continue;
            };
            let images: Vec<PathBuf> = before
                .get(idx)
                .into_iter()
                .chain(std::iter::once(after_image))
                .cloned()
                .collect();
            let mut unresolved = Vec::new();
            for item in items {
                let pack = self.brain.prompts().build_verify_critic(item)?;
                let output: VerificationOutput =
                    self.brain
                        .ask(ctx, VERIFICATION_SCHEMA.name, &pack, &images, messages)?;
                unresolved.extend(output.verdict.remaining(item));
            }
            if !unresolved.is_empty() {
                remaining.insert(idx, unresolved);
            }
        }
        Ok(remaining)
    }
}

impl Agent for VerificationAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn call(&mut self, state: &SharedState, ctx: &mut NodeContext) -> Result<Step> {
        let after = self
            .render
            .render(&state.current_script, ctx, NodeId::Verification)?;
        if after.is_empty() {
            warn!("verification rendered no images");
            return Ok(Step::Halt(Halt::new(
                HaltReason::NoRender {
                    node: NodeId::Verification,
                },
                StateUpdate::default(),
            )));
        }
        let before = &state.rendered_images;

        let mut messages = Vec::new();
        let remaining = match state.additional_prompt.as_deref() {
            Some(prompt) => self.check_prompt(prompt, before, &after, ctx, &mut messages)?,
            None => self.check_critiques(
                &state.critics_solutions,
                before,
                &after,
                ctx,
                &mut messages,
            )?,
        };
        let flattened: Vec<CriticSolution> = remaining.values().flatten().cloned().collect();
        info!(
            unresolved = flattened.len(),
            tries = self.tries,
            ceiling = self.ceiling,
            "verification finished"
        );

        let update = StateUpdate {
            critics_solutions: Some(remaining),
            rendered_images: Some(after),
            messages,
            ..StateUpdate::default()
        };
        if !flattened.is_empty() && self.tries < self.ceiling {
            self.tries += 1;
            return Ok(Step::Route(Route::goto(
                NodeId::Coding,
                StateUpdate {
                    queries: Some(Queries::Improvements(flattened)),
                    coding_task: Some(CodingTask::Improve),
                    caller: Some(Caller::Verification),
                    is_sub_call: Some(false),
                    has_docs: Some(false),
                    ..update
                },
            )));
        }

        let msg = if flattened.is_empty() {
            "Verification satisfied".to_string()
        } else {
            format!(
                "Verification gave up with {} unresolved critiques after {} retries",
                flattened.len(),
                self.tries
            )
        };
        self.tries = 0;
        Ok(Step::Route(Route::goto(NodeId::User, update.with_msg(msg))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::route::Endpoint;
    use crate::test_support::{ScriptedBrain, ScriptedRenderer, test_context};
    use std::path::Path;

    fn verifier(brain: Rc<ScriptedBrain>, dir: &Path, images: usize, ceiling: u32) -> VerificationAgent {
        let options = BindingOptions {
            schema_dir: dir.join("schemas"),
            structured_output_attempts: 3,
            prompt_budget_bytes: 10_000,
        };
        let renderer = Rc::new(ScriptedRenderer::new(images));
        VerificationAgent::new(
            Some(brain),
            &options,
            RenderPass::new(renderer, 4),
            ceiling,
        )
        .expect("verification")
    }

    fn item(critic: &str, solution: &str) -> CriticSolution {
        CriticSolution {
            critic: critic.to_string(),
            solution: solution.to_string(),
        }
    }

    fn critiqued_state(dir: &Path) -> SharedState {
        let mut state = SharedState::new("chair");
        state.current_script = "chair(legs=4)".to_string();
        state.rendered_images = vec![dir.join("before_A.png"), dir.join("before_B.png")];
        state.critics_solutions = BTreeMap::from([
            (0, vec![item("legs too short", "lengthen legs")]),
            (1, vec![item("no backrest", "add a backrest")]),
        ]);
        state
    }

    fn route(step: Step) -> Route {
        match step {
            Step::Route(route) => route,
            other => panic!("expected route, got {other:?}"),
        }
    }

    /// Each critique is judged against its own before/after pair; unresolved
    /// ones go back to coding.
    #[test]
    fn unresolved_critiques_return_to_coding() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        brain.push_verdict(true, "", "");
        brain.push_verdict(false, "backrest too low", "raise the backrest");
        let mut agent = verifier(brain.clone(), temp.path(), 2, 3);

        let route = route(
            agent
                .call(&critiqued_state(temp.path()), &mut test_context(temp.path()))
                .expect("call"),
        );

        assert_eq!(route.goto, Endpoint::Node(NodeId::Coding));
        assert_eq!(
            route.update.queries,
            Some(Queries::Improvements(vec![item(
                "backrest too low",
                "raise the backrest"
            )]))
        );
        assert_eq!(route.update.caller, Some(Caller::Verification));
        assert_eq!(agent.tries(), 1);

        let requests = brain.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].images[0].ends_with("before_B.png"));
        assert!(requests[1].images[1].ends_with("render_B.png"));
    }

    #[test]
    fn satisfied_routes_to_user_and_resets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        brain.push_verdict(true, "", "");
        brain.push_verdict(true, "", "");
        let mut agent = verifier(brain, temp.path(), 2, 3);

        let route = route(
            agent
                .call(&critiqued_state(temp.path()), &mut test_context(temp.path()))
                .expect("call"),
        );
        assert_eq!(route.goto, Endpoint::Node(NodeId::User));
        assert_eq!(route.update.critics_solutions, Some(BTreeMap::new()));
        assert_eq!(agent.tries(), 0);
    }

    /// A satisfied check routes to the user whatever the retry count was.
    #[test]
    fn satisfied_after_a_retry_resets_the_counter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        brain.push_verdict(false, "still short", "lengthen more");
        brain.push_verdict(true, "", "");
        brain.push_verdict(true, "", "");
        brain.push_verdict(true, "", "");
        let mut agent = verifier(brain, temp.path(), 2, 3);
        let state = critiqued_state(temp.path());

        route(agent.call(&state, &mut test_context(temp.path())).expect("first"));
        assert_eq!(agent.tries(), 1);

        let second = route(agent.call(&state, &mut test_context(temp.path())).expect("second"));
        assert_eq!(second.goto, Endpoint::Node(NodeId::User));
        assert_eq!(agent.tries(), 0);
    }

    /// At the ceiling, unresolved items no longer loop back.
    #[test]
    fn gives_up_at_the_ceiling() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        for _ in 0..2 {
            brain.push_verdict(false, "still short", "lengthen more");
            brain.push_verdict(true, "", "");
        }
        let mut agent = verifier(brain, temp.path(), 2, 1);
        let state = critiqued_state(temp.path());

        let first = route(agent.call(&state, &mut test_context(temp.path())).expect("first"));
        assert_eq!(first.goto, Endpoint::Node(NodeId::Coding));

        let second = route(agent.call(&state, &mut test_context(temp.path())).expect("second"));
        assert_eq!(second.goto, Endpoint::Node(NodeId::User));
        assert!(second.update.msg.expect("msg").contains("unresolved"));
        assert_eq!(agent.tries(), 0);
    }

    /// An unsatisfied verdict with blank fields keeps the original critique.
    #[test]
    fn blank_unsatisfied_verdict_keeps_the_critique() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        brain.push_verdict(false, "", "");
        brain.push_verdict(false, "backrest still missing", " ");
        let mut agent = verifier(brain, temp.path(), 2, 3);

        let route = route(
            agent
                .call(&critiqued_state(temp.path()), &mut test_context(temp.path()))
                .expect("call"),
        );

        assert_eq!(route.goto, Endpoint::Node(NodeId::Coding));
        assert_eq!(
            route.update.queries,
            Some(Queries::Improvements(vec![
                item("legs too short", "lengthen legs"),
                item("backrest still missing", "add a backrest"),
            ]))
        );
    }

    /// Views without an after image keep their critiques without a brain call.
    #[test]
    fn missing_after_view_carries_critiques_forward() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        brain.push_verdict(true, "", "");
        let mut agent = verifier(brain.clone(), temp.path(), 1, 3);

        let route = route(
            agent
                .call(&critiqued_state(temp.path()), &mut test_context(temp.path()))
                .expect("call"),
        );
        assert_eq!(brain.calls("verification"), 1);
        assert_eq!(
            route.update.queries,
            Some(Queries::Improvements(vec![item("no backrest", "add a backrest")]))
        );
    }

    /// Follow-up mode sends every before image followed by every after image.
    #[test]
    fn prompt_mode_compares_all_views_at_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        brain.push_verdict(false, "still brown", "paint the chair red");
        let mut agent = verifier(brain.clone(), temp.path(), 2, 3);
        let mut state = critiqued_state(temp.path());
        state.additional_prompt = Some("make it red".to_string());

        let route = route(
            agent
                .call(&state, &mut test_context(temp.path()))
                .expect("call"),
        );

        let requests = brain.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("make it red"));
        let names: Vec<String> = requests[0]
            .images
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["before_A.png", "before_B.png", "render_A.png", "render_B.png"]
        );
        assert_eq!(
            route.update.queries,
            Some(Queries::Improvements(vec![item(
                "still brown",
                "paint the chair red"
            )]))
        );
    }

    #[test]
    fn no_images_halts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        let mut agent = verifier(brain, temp.path(), 0, 3);

        let step = agent
            .call(&critiqued_state(temp.path()), &mut test_context(temp.path()))
            .expect("call");
        assert!(matches!(
            step,
            Step::Halt(Halt {
                reason: HaltReason::NoRender {
                    node: NodeId::Verification
                },
                ..
            })
        ));
    }
}
