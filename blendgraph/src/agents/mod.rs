//! Agent nodes and the contract they share.
//!
//! Every agent declares an [`AgentSpec`] (its edges and the output schemas it
//! needs) and is called with the shared state plus a [`NodeContext`]. Agents
//! that talk to a model hold a [`BrainBinding`], created at construction.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::route::{Endpoint, NodeId, Step};
use crate::core::state::{Message, SharedState};
use crate::core::structured::{NotReturnStructuredOutput, single_call_args};
use crate::io::brain::{Brain, BrainRequest};
use crate::io::prompt::{PromptBuilder, PromptPack};
use crate::io::run_log::RunPaths;

pub mod coding;
pub mod critic;
pub mod planner;
pub mod retriever;
pub mod user;
pub mod verification;

/// Structured-output schema bundled with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSchema {
    pub name: &'static str,
    pub contents: &'static str,
}

pub const PLANNER_SCHEMA: OutputSchema = OutputSchema {
    name: "planner",
    contents: include_str!("../../schemas/planner.schema.json"),
};
pub const RETRIEVER_SCHEMA: OutputSchema = OutputSchema {
    name: "retriever",
    contents: include_str!("../../schemas/retriever.schema.json"),
};
pub const CODING_SCHEMA: OutputSchema = OutputSchema {
    name: "coding",
    contents: include_str!("../../schemas/coding.schema.json"),
};
pub const CRITIC_SCHEMA: OutputSchema = OutputSchema {
    name: "critic",
    contents: include_str!("../../schemas/critic.schema.json"),
};
pub const VERIFICATION_SCHEMA: OutputSchema = OutputSchema {
    name: "verification",
    contents: include_str!("../../schemas/verification.schema.json"),
};

/// Static description of a node: identity, edges, schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub id: NodeId,
    pub incoming: Vec<Endpoint>,
    pub outgoing: Vec<Endpoint>,
    pub schemas: Vec<OutputSchema>,
}

/// Per-call runtime information supplied by the graph.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub paths: RunPaths,
    /// Node that transferred control here, or `Start` on entry and resume.
    pub came_from: Endpoint,
    /// External input delivered on resume. Consumed by the node that suspended.
    pub resume_input: Option<String>,
    /// Steps taken across the whole run, this one included.
    pub step: u32,
}

impl NodeContext {
    pub fn new(run_id: impl Into<String>, paths: RunPaths) -> Self {
        Self {
            run_id: run_id.into(),
            paths,
            came_from: Endpoint::Start,
            resume_input: None,
            step: 0,
        }
    }

    /// Per-step directory for an agent's files, e.g. `renders/007-critic`.
    pub fn step_dir(&self, base: &Path, node: NodeId) -> PathBuf {
        base.join(format!("{:03}-{node}", self.step))
    }
}

pub trait Agent {
    fn spec(&self) -> &AgentSpec;

    fn call(&mut self, state: &SharedState, ctx: &mut NodeContext) -> Result<Step>;
}

/// Raised when a brain keeps replying without valid structured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredOutputExhausted {
    pub agent: NodeId,
    pub schema: String,
    pub attempts: u32,
    pub last: NotReturnStructuredOutput,
}

impl fmt::Display for StructuredOutputExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} gave up after {} attempts: {}",
            self.agent, self.attempts, self.last
        )
    }
}

impl std::error::Error for StructuredOutputExhausted {}

struct BoundSchema {
    path: PathBuf,
    validator: Validator,
}

/// A brain bound to an agent's output schemas.
pub struct BrainBinding {
    agent: NodeId,
    brain: Rc<dyn Brain>,
    schemas: BTreeMap<&'static str, BoundSchema>,
    attempts: u32,
    prompts: PromptBuilder,
}

/// Settings shared by every binding.
#[derive(Debug, Clone)]
pub struct BindingOptions {
    pub schema_dir: PathBuf,
    pub structured_output_attempts: u32,
    pub prompt_budget_bytes: usize,
}

impl BrainBinding {
    /// Write and compile the schemas `spec` declares.
    ///
    /// Fails when the agent needs a brain and none is configured.
    pub fn bind(
        spec: &AgentSpec,
        brain: Option<Rc<dyn Brain>>,
        options: &BindingOptions,
    ) -> Result<Self> {
        let brain =
            brain.ok_or_else(|| anyhow!("{} needs a brain but none is configured", spec.id))?;
        let mut schemas = BTreeMap::new();
        for schema in &spec.schemas {
            let path = options
                .schema_dir
                .join(format!("{}.schema.json", schema.name));
            write_output_schema(&path, schema.contents)?;
            let json: Value = serde_json::from_str(schema.contents)
                .with_context(|| format!("parse {} schema", schema.name))?;
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&json)
                .with_context(|| format!("compile {} schema", schema.name))?;
            schemas.insert(schema.name, BoundSchema { path, validator });
        }
        Ok(Self {
            agent: spec.id,
            brain,
            schemas,
            attempts: options.structured_output_attempts,
            prompts: PromptBuilder::new(options.prompt_budget_bytes),
        })
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    /// Invoke the brain until it returns one valid structured field.
    ///
    /// Each malformed reply triggers a reinvocation; after the attempt
    /// ceiling the call fails with [`StructuredOutputExhausted`]. The
    /// successful exchange is appended to `audit`.
    #[instrument(skip_all, fields(agent = %self.agent, schema))]
    pub fn ask<T: DeserializeOwned>(
        &self,
        ctx: &NodeContext,
        schema: &str,
        prompt: &PromptPack,
        images: &[PathBuf],
        audit: &mut Vec<Message>,
    ) -> Result<T> {
        let bound = self
            .schemas
            .get(schema)
            .ok_or_else(|| anyhow!("{} has no bound schema {schema}", self.agent))?;
        let request = BrainRequest {
            schema: schema.to_string(),
            schema_path: bound.path.clone(),
            prompt: prompt.render(),
            images: images.to_vec(),
            work_dir: ctx.paths.dir.clone(),
        };

        let mut last = None;
        for attempt in 1..=self.attempts {
            let response = self.brain.invoke(&request)?;
            match decode::<T>(&response, schema, &bound.validator) {
                Ok((value, raw)) => {
                    debug!(attempt, "structured output accepted");
                    audit.push(Message::prompt(self.agent.as_str(), request.prompt.clone()));
                    audit.push(Message::reply(self.agent.as_str(), raw));
                    return Ok(value);
                }
                Err(err) => {
                    warn!(attempt, err = %err, "reinvoking brain");
                    last = Some(err);
                }
            }
        }
        let last = last.unwrap_or_else(|| NotReturnStructuredOutput {
            schema: schema.to_string(),
            reason: "no attempts allowed".to_string(),
        });
        Err(StructuredOutputExhausted {
            agent: self.agent,
            schema: schema.to_string(),
            attempts: self.attempts,
            last,
        }
        .into())
    }
}

fn decode<T: DeserializeOwned>(
    response: &crate::core::structured::BrainResponse,
    schema: &str,
    validator: &Validator,
) -> Result<(T, String), NotReturnStructuredOutput> {
    let args = Value::Object(single_call_args(response, schema)?.clone());
    let fail = |reason: String| NotReturnStructuredOutput {
        schema: schema.to_string(),
        reason,
    };
    let errors: Vec<String> = validator.iter_errors(&args).map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        return Err(fail(format!("schema violations: {}", errors.join("; "))));
    }
    let raw = args.to_string();
    let value = serde_json::from_value(args).map_err(|e| fail(e.to_string()))?;
    Ok((value, raw))
}

pub(crate) fn write_output_schema(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write schema {}", path.display()))
}
