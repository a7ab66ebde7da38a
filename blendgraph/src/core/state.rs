//! Shared state threaded through every graph node.
//!
//! [`SharedState`] is the single record a run carries. Nodes never mutate it
//! directly; they emit a [`StateUpdate`] that the graph merges field by field.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Sub-protocol the coding agent runs on its next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingTask {
    #[default]
    Generate,
    Improve,
    Fix,
}

impl CodingTask {
    pub fn as_str(self) -> &'static str {
        match self {
            CodingTask::Generate => "generate",
            CodingTask::Improve => "improve",
            CodingTask::Fix => "fix",
        }
    }
}

/// Node that handed work to the coding agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caller {
    Planner,
    Retriever,
    Critic,
    Verification,
    User,
}

impl Caller {
    pub fn as_str(self) -> &'static str {
        match self {
            Caller::Planner => "planner",
            Caller::Retriever => "retriever",
            Caller::Critic => "critic",
            Caller::Verification => "verification",
            Caller::User => "user",
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One critique of a rendered image and the change proposed to resolve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticSolution {
    pub critic: String,
    pub solution: String,
}

/// Work list handed to the retriever and the coding agent.
///
/// The variant is paired with [`CodingTask`]: subtasks drive `generate`,
/// improvements and follow-ups drive `improve`, an execution error drives `fix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum Queries {
    Subtasks(Vec<String>),
    Fix(String),
    Improvements(Vec<CriticSolution>),
    FollowUp(String),
}

impl Default for Queries {
    fn default() -> Self {
        Queries::Subtasks(Vec::new())
    }
}

impl Queries {
    pub fn len(&self) -> usize {
        match self {
            Queries::Subtasks(items) => items.len(),
            Queries::Improvements(items) => items.len(),
            Queries::Fix(_) | Queries::FollowUp(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Queries::Subtasks(items) => items.iter().all(|s| s.trim().is_empty()),
            Queries::Improvements(items) => items.is_empty(),
            Queries::Fix(text) | Queries::FollowUp(text) => text.trim().is_empty(),
        }
    }

    /// Plain-text form of each query, used for document lookups and prompts.
    pub fn texts(&self) -> Vec<String> {
        match self {
            Queries::Subtasks(items) => items.clone(),
            Queries::Improvements(items) => items.iter().map(|s| s.solution.clone()).collect(),
            Queries::Fix(text) | Queries::FollowUp(text) => vec![text.clone()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            agent: None,
            content: content.into(),
        }
    }

    /// Text sent to a brain on behalf of `agent`.
    pub fn prompt(agent: &str, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            agent: Some(agent.to_string()),
            content: content.into(),
        }
    }

    /// Structured reply received by `agent`.
    pub fn reply(agent: &str, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            agent: Some(agent.to_string()),
            content: content.into(),
        }
    }

    /// Input typed by the human at the user node.
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            agent: None,
            content: content.into(),
        }
    }
}

/// The record every node reads. Serializable so suspended runs can be
/// checkpointed and rebuilt in another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedState {
    task: String,
    pub queries: Queries,
    pub coding_task: CodingTask,
    pub has_docs: bool,
    pub retrieved_docs: BTreeMap<usize, String>,
    pub current_script: String,
    pub previous_scripts: Vec<String>,
    pub is_sub_call: bool,
    pub caller: Option<Caller>,
    pub critics_solutions: BTreeMap<usize, Vec<CriticSolution>>,
    pub rendered_images: Vec<PathBuf>,
    pub validating_prompt: String,
    pub additional_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub msg: String,
}

impl SharedState {
    pub fn new(task: impl Into<String>) -> Self {
        let task = task.into();
        Self {
            validating_prompt: task.clone(),
            task,
            queries: Queries::default(),
            coding_task: CodingTask::Generate,
            has_docs: false,
            retrieved_docs: BTreeMap::new(),
            current_script: String::new(),
            previous_scripts: Vec::new(),
            is_sub_call: false,
            caller: None,
            critics_solutions: BTreeMap::new(),
            rendered_images: Vec::new(),
            additional_prompt: None,
            messages: Vec::new(),
            msg: String::new(),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Field-level upsert: fields absent from `update` keep their value,
    /// messages are appended.
    pub fn apply(&mut self, update: StateUpdate) {
        let StateUpdate {
            queries,
            coding_task,
            has_docs,
            retrieved_docs,
            current_script,
            previous_scripts,
            is_sub_call,
            caller,
            critics_solutions,
            rendered_images,
            validating_prompt,
            additional_prompt,
            messages,
            msg,
        } = update;

        if let Some(v) = queries {
            self.queries = v;
        }
        if let Some(v) = coding_task {
            self.coding_task = v;
        }
        if let Some(v) = has_docs {
            self.has_docs = v;
        }
        if let Some(v) = retrieved_docs {
            self.retrieved_docs = v;
        }
        if let Some(v) = current_script {
            self.current_script = v;
        }
        if let Some(v) = previous_scripts {
            self.previous_scripts = v;
        }
        if let Some(v) = is_sub_call {
            self.is_sub_call = v;
        }
        if let Some(v) = caller {
            self.caller = Some(v);
        }
        if let Some(v) = critics_solutions {
            self.critics_solutions = v;
        }
        if let Some(v) = rendered_images {
            self.rendered_images = v;
        }
        if let Some(v) = validating_prompt {
            self.validating_prompt = v;
        }
        if let Some(v) = additional_prompt {
            self.additional_prompt = v;
        }
        if let Some(v) = msg {
            self.msg = v;
        }
        self.messages.extend(messages);
    }
}

/// Partial state emitted by a node. `None` leaves a field untouched.
///
/// `task` has no counterpart here: it is fixed when the state is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub queries: Option<Queries>,
    pub coding_task: Option<CodingTask>,
    pub has_docs: Option<bool>,
    pub retrieved_docs: Option<BTreeMap<usize, String>>,
    pub current_script: Option<String>,
    pub previous_scripts: Option<Vec<String>>,
    pub is_sub_call: Option<bool>,
    pub caller: Option<Caller>,
    pub critics_solutions: Option<BTreeMap<usize, Vec<CriticSolution>>>,
    pub rendered_images: Option<Vec<PathBuf>>,
    pub validating_prompt: Option<String>,
    /// `Some(None)` clears the follow-up prompt.
    pub additional_prompt: Option<Option<String>>,
    pub messages: Vec<Message>,
    pub msg: Option<String>,
}

impl StateUpdate {
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    /// Keep only the audit-trail part of the update.
    pub fn messages_only(&self) -> StateUpdate {
        StateUpdate {
            messages: self.messages.clone(),
            ..StateUpdate::default()
        }
    }
}
