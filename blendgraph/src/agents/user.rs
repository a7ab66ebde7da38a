//! User agent: the human-in-the-loop boundary.
//!
//! Without input the run suspends (or ends, when not interactive). On resume
//! the follow-up either terminates the run or becomes the next improvement.

use anyhow::Result;
use tracing::info;

use super::{Agent, AgentSpec, NodeContext};
use crate::core::outcome::{Halt, HaltReason};
use crate::core::route::{Endpoint, NodeId, Route, Step};
use crate::core::state::{Caller, CodingTask, Message, Queries, SharedState, StateUpdate};

const QUIT_WORDS: [&str; 2] = ["q", "quit"];

pub struct UserAgent {
    spec: AgentSpec,
    interactive: bool,
}

impl UserAgent {
    pub fn new(interactive: bool) -> Self {
        Self {
            spec: AgentSpec {
                id: NodeId::User,
                incoming: vec![
                    NodeId::Coding.into(),
                    NodeId::Critic.into(),
                    NodeId::Verification.into(),
                ],
                outgoing: vec![NodeId::Coding.into(), Endpoint::End],
                schemas: Vec::new(),
            },
            interactive,
        }
    }
}

impl Agent for UserAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn call(&mut self, state: &SharedState, ctx: &mut NodeContext) -> Result<Step> {
        let Some(input) = ctx.resume_input.take() else {
            if self.interactive {
                info!("waiting for user follow-up");
                return Ok(Step::Suspend(StateUpdate::default()));
            }
            // Keep whatever status the last agent reported.
            let update = if state.msg.is_empty() {
                StateUpdate::default().with_msg("Successful")
            } else {
                StateUpdate::default()
            };
            return Ok(Step::Route(Route::end(update)));
        };

        let input = input.trim();
        if QUIT_WORDS.iter().any(|w| input.eq_ignore_ascii_case(w)) {
            return Ok(Step::Halt(Halt::new(
                HaltReason::UserTerminated,
                StateUpdate::default().with_messages(vec![Message::human(input)]),
            )));
        }
        if input.is_empty() {
            return Ok(Step::Suspend(StateUpdate::default()));
        }

        info!(chars = input.len(), "follow-up received");
        Ok(Step::Route(Route::goto(
            NodeId::Coding,
            StateUpdate {
                queries: Some(Queries::FollowUp(input.to_string())),
                coding_task: Some(CodingTask::Improve),
                caller: Some(Caller::User),
                is_sub_call: Some(false),
                has_docs: Some(false),
                additional_prompt: Some(Some(input.to_string())),
                messages: vec![Message::human(input)],
                ..StateUpdate::default()
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_context;

    fn call_on(state: &SharedState, interactive: bool, input: Option<&str>) -> Step {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = test_context(temp.path());
        ctx.resume_input = input.map(str::to_string);
        UserAgent::new(interactive)
            .call(state, &mut ctx)
            .expect("call")
    }

    fn call_with(interactive: bool, input: Option<&str>) -> Step {
        call_on(&SharedState::new("chair"), interactive, input)
    }

    #[test]
    fn accepts_coding_after_verification() {
        let agent = UserAgent::new(true);
        assert!(agent.spec().incoming.contains(&NodeId::Coding.into()));
    }

    #[test]
    fn suspends_without_input() {
        assert!(matches!(call_with(true, None), Step::Suspend(_)));
    }

    #[test]
    fn non_interactive_ends_the_run() {
        let Step::Route(route) = call_with(false, None) else {
            panic!("expected route");
        };
        assert_eq!(route.goto, Endpoint::End);
        assert_eq!(route.update.msg.as_deref(), Some("Successful"));
    }

    #[test]
    fn non_interactive_keeps_an_earlier_status() {
        let mut state = SharedState::new("chair");
        state.msg = "Verification gave up with 2 unresolved critiques".to_string();
        let Step::Route(route) = call_on(&state, false, None) else {
            panic!("expected route");
        };
        assert_eq!(route.goto, Endpoint::End);
        assert_eq!(route.update.msg, None);
    }

    #[test]
    fn quit_words_terminate() {
        for input in ["q", " QUIT ", "Quit"] {
            let Step::Halt(halt) = call_with(true, Some(input)) else {
                panic!("expected halt for {input:?}");
            };
            assert_eq!(halt.reason, HaltReason::UserTerminated);
        }
    }

    #[test]
    fn follow_up_routes_to_coding() {
        let Step::Route(route) = call_with(true, Some("  make it red ")) else {
            panic!("expected route");
        };
        assert_eq!(route.goto, Endpoint::Node(NodeId::Coding));
        assert_eq!(
            route.update.queries,
            Some(Queries::FollowUp("make it red".to_string()))
        );
        assert_eq!(route.update.caller, Some(Caller::User));
        assert_eq!(
            route.update.additional_prompt,
            Some(Some("make it red".to_string()))
        );
    }

    #[test]
    fn blank_input_suspends_again() {
        assert!(matches!(call_with(true, Some("   ")), Step::Suspend(_)));
    }
}
