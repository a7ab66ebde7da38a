//! Retriever agent: looks up reference documents per query and summarizes them.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Agent, AgentSpec, BindingOptions, BrainBinding, NodeContext, RETRIEVER_SCHEMA};
use crate::core::route::{NodeId, Route, Step};
use crate::core::state::{Caller, SharedState, StateUpdate};
use crate::io::brain::Brain;
use crate::io::docs::DocumentStore;

#[derive(Debug, Deserialize)]
struct RetrieverOutput {
    summary: String,
}

pub struct RetrieverAgent {
    spec: AgentSpec,
    brain: BrainBinding,
    store: Rc<dyn DocumentStore>,
    top_k: usize,
}

impl RetrieverAgent {
    pub fn new(
        brain: Option<Rc<dyn Brain>>,
        options: &BindingOptions,
        store: Rc<dyn DocumentStore>,
        top_k: usize,
    ) -> Result<Self> {
        let spec = AgentSpec {
            id: NodeId::Retriever,
            incoming: vec![NodeId::Coding.into()],
            outgoing: vec![NodeId::Coding.into()],
            schemas: vec![RETRIEVER_SCHEMA],
        };
        let brain = BrainBinding::bind(&spec, brain, options)?;
        Ok(Self {
            spec,
            brain,
            store,
            top_k,
        })
    }
}

impl Agent for RetrieverAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn call(&mut self, state: &SharedState, ctx: &mut NodeContext) -> Result<Step> {
        let mut messages = Vec::new();
        let mut docs = BTreeMap::new();
        for (idx, query) in state.queries.texts().iter().enumerate() {
            // Lookups are independent: a failure only loses this query's context.
            let found = match self.store.similarity_search(query, self.top_k) {
                Ok(found) => found,
                Err(err) => {
                    warn!(idx, err = %err, "document lookup failed");
                    continue;
                }
            };
            if found.is_empty() {
                debug!(idx, "no documents for query");
                continue;
            }
            let passages: Vec<String> = found.into_iter().map(|d| d.content).collect();
            let prompt = self.brain.prompts().build_retriever(query, &passages)?;
            let output: RetrieverOutput =
                self.brain
                    .ask(ctx, RETRIEVER_SCHEMA.name, &prompt, &[], &mut messages)?;
            docs.insert(idx, output.summary);
        }
        info!(
            coding_task = state.coding_task.as_str(),
            queries = state.queries.len(),
            summarized = docs.len(),
            "retrieval finished"
        );

        Ok(Step::Route(Route::goto(
            NodeId::Coding,
            StateUpdate {
                retrieved_docs: Some(docs),
                is_sub_call: Some(true),
                has_docs: Some(true),
                caller: Some(Caller::Retriever),
                messages,
                ..StateUpdate::default()
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::route::Endpoint;
    use crate::core::state::Queries;
    use crate::test_support::{MemoryDocStore, ScriptedBrain, test_context};

    fn retriever(brain: Rc<ScriptedBrain>, store: MemoryDocStore, dir: &std::path::Path) -> RetrieverAgent {
        let options = BindingOptions {
            schema_dir: dir.join("schemas"),
            structured_output_attempts: 3,
            prompt_budget_bytes: 10_000,
        };
        RetrieverAgent::new(Some(brain), &options, Rc::new(store), 1).expect("retriever")
    }

    /// A failing lookup and an empty result do not stop the remaining queries.
    #[test]
    fn tolerates_failed_and_empty_lookups() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        brain.push_summary("use primitive_cube_add");
        let store = MemoryDocStore::new()
            .failing_on("legs")
            .with_doc("seat", "bpy.ops.mesh.primitive_cube_add(size=2)");
        let mut agent = retriever(brain.clone(), store, temp.path());
        let mut state = SharedState::new("chair");
        state.queries = Queries::Subtasks(vec![
            "legs".to_string(),
            "seat".to_string(),
            "back".to_string(),
        ]);

        let step = agent
            .call(&state, &mut test_context(temp.path()))
            .expect("call");
        let Step::Route(route) = step else {
            panic!("expected route");
        };

        assert_eq!(route.goto, Endpoint::Node(NodeId::Coding));
        let docs = route.update.retrieved_docs.expect("docs");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[&1], "use primitive_cube_add");
        assert_eq!(route.update.is_sub_call, Some(true));
        assert_eq!(route.update.has_docs, Some(true));
        assert_eq!(route.update.caller, Some(Caller::Retriever));
        assert_eq!(brain.calls("retriever"), 1);
    }

    #[test]
    fn fix_query_is_the_error_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        let brain = Rc::new(ScriptedBrain::new());
        brain.push_summary("define leg_radius before use");
        let store = MemoryDocStore::new().with_doc("NameError: leg_radius", "variables");
        let mut agent = retriever(brain, store, temp.path());
        let mut state = SharedState::new("chair");
        state.queries = Queries::Fix("NameError: leg_radius".to_string());

        let Step::Route(route) = agent
            .call(&state, &mut test_context(temp.path()))
            .expect("call")
        else {
            panic!("expected route");
        };
        assert_eq!(
            route.update.retrieved_docs.expect("docs")[&0],
            "define leg_radius before use"
        );
    }
}
