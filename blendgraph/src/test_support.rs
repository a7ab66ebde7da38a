//! Scripted collaborators for deterministic pipeline tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};

use crate::agents::NodeContext;
use crate::coordinator::Collaborators;
use crate::core::structured::BrainResponse;
use crate::io::brain::{Brain, BrainRequest};
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::docs::{Document, DocumentStore};
use crate::io::render::Renderer;
use crate::io::run_log::RunPaths;
use crate::io::script::{ExecutionReport, ScriptExecutor};

/// Temporary directory for a test workspace.
pub fn temp_workspace() -> tempfile::TempDir {
    tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

/// Node context rooted at `dir` for direct agent calls.
pub fn test_context(dir: &Path) -> NodeContext {
    NodeContext::new("test-run", RunPaths::new(dir, "test-run"))
}

/// Brain returning queued replies per schema and recording every request.
#[derive(Default)]
pub struct ScriptedBrain {
    replies: RefCell<BTreeMap<String, VecDeque<BrainResponse>>>,
    requests: RefCell<Vec<BrainRequest>>,
}

impl ScriptedBrain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a structured reply for `schema`.
    pub fn push(&self, schema: &str, args: Value) {
        let Value::Object(map) = args else {
            panic!("scripted reply for {schema} must be a JSON object");
        };
        self.queue(schema, BrainResponse::single(schema, map));
    }

    /// Queue a reply without any tool call.
    pub fn push_malformed(&self, schema: &str) {
        self.queue(schema, BrainResponse::default());
    }

    pub fn push_plan(&self, subtasks: &[&str]) {
        self.push("planner", json!({ "subtasks": subtasks }));
    }

    pub fn push_summary(&self, summary: &str) {
        self.push("retriever", json!({ "summary": summary }));
    }

    pub fn push_script(&self, script: &str) {
        self.push("coding", json!({ "script": script }));
    }

    /// Queue one critic reply with `(critic, solution)` pairs.
    pub fn push_critique(&self, pairs: &[(&str, &str)]) {
        let list: Vec<Value> = pairs
            .iter()
            .map(|(critic, solution)| json!({ "critic": critic, "solution": solution }))
            .collect();
        self.push("critic", json!({ "critic_solution_list": list }));
    }

    pub fn push_verdict(&self, satisfied: bool, remaining_critic: &str, solution: &str) {
        self.push(
            "verification",
            json!({ "verdict": {
                "satisfied": satisfied,
                "remaining_critic": remaining_critic,
                "solution": solution,
            }}),
        );
    }

    pub fn requests(&self) -> Vec<BrainRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self, schema: &str) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.schema == schema)
            .count()
    }

    /// Replies queued but never consumed.
    pub fn pending(&self) -> usize {
        self.replies.borrow().values().map(VecDeque::len).sum()
    }

    fn queue(&self, schema: &str, response: BrainResponse) {
        self.replies
            .borrow_mut()
            .entry(schema.to_string())
            .or_default()
            .push_back(response);
    }
}

impl Brain for ScriptedBrain {
    fn invoke(&self, request: &BrainRequest) -> Result<BrainResponse> {
        self.requests.borrow_mut().push(request.clone());
        self.replies
            .borrow_mut()
            .get_mut(&request.schema)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted reply for {}", request.schema))
    }
}

/// Executor returning queued reports (success once the queue is empty).
#[derive(Default)]
pub struct ScriptedExecutor {
    reports: RefCell<VecDeque<ExecutionReport>>,
    executed: RefCell<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_error(&self, stderr: &str) {
        self.reports
            .borrow_mut()
            .push_back(ExecutionReport::error(stderr));
    }

    pub fn push_success(&self) {
        self.reports
            .borrow_mut()
            .push_back(ExecutionReport::success());
    }

    /// Contents of every executed script, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.borrow().clone()
    }
}

impl ScriptExecutor for ScriptedExecutor {
    fn execute(&self, script_path: &Path) -> Result<ExecutionReport> {
        let script = fs::read_to_string(script_path)?;
        self.executed.borrow_mut().push(script);
        Ok(self
            .reports
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(ExecutionReport::success))
    }
}

/// Renderer writing placeholder PNGs. Each call takes the next queued count,
/// falling back to the default.
pub struct ScriptedRenderer {
    default_images: usize,
    counts: RefCell<VecDeque<usize>>,
    scripts: RefCell<Vec<String>>,
}

impl ScriptedRenderer {
    pub fn new(default_images: usize) -> Self {
        Self {
            default_images,
            counts: RefCell::new(VecDeque::new()),
            scripts: RefCell::new(Vec::new()),
        }
    }

    pub fn push_images(&self, count: usize) {
        self.counts.borrow_mut().push_back(count);
    }

    pub fn rendered_scripts(&self) -> Vec<String> {
        self.scripts.borrow().clone()
    }
}

impl Renderer for ScriptedRenderer {
    fn render(&self, script: &str, out_dir: &Path) -> Result<Vec<PathBuf>> {
        self.scripts.borrow_mut().push(script.to_string());
        let count = self
            .counts
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.default_images);
        fs::create_dir_all(out_dir)?;
        // Written in reverse so callers cannot rely on directory order.
        let mut images: Vec<PathBuf> = (0..count)
            .rev()
            .map(|i| out_dir.join(format!("render_{}.png", char::from(b'A' + i as u8))))
            .collect();
        for image in &images {
            fs::write(image, b"png")?;
        }
        images.sort();
        Ok(images)
    }
}

/// Document store answering exact queries, with optional failing queries.
#[derive(Default)]
pub struct MemoryDocStore {
    docs: BTreeMap<String, Vec<Document>>,
    failing: BTreeSet<String>,
    lookups: RefCell<Vec<String>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_doc(mut self, query: &str, content: &str) -> Self {
        self.docs
            .entry(query.to_string())
            .or_default()
            .push(Document {
                content: content.to_string(),
                metadata: Default::default(),
            });
        self
    }

    pub fn failing_on(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.borrow().clone()
    }
}

impl DocumentStore for MemoryDocStore {
    fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Document>> {
        self.lookups.borrow_mut().push(query.to_string());
        if self.failing.contains(query) {
            bail!("lookup failed for {query}");
        }
        Ok(self
            .docs
            .get(query)
            .map(|docs| docs.iter().take(k).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RefCell<BTreeMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.checkpoints.borrow().contains_key(run_id)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .borrow_mut()
            .insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Checkpoint> {
        self.checkpoints
            .borrow()
            .get(run_id)
            .cloned()
            .ok_or_else(|| anyhow!("no suspended run {run_id}"))
    }

    fn remove(&self, run_id: &str) -> Result<()> {
        self.checkpoints.borrow_mut().remove(run_id);
        Ok(())
    }
}

/// Scripted collaborators kept alongside the handles tests inspect.
pub struct ScriptedKit {
    pub brain: Rc<ScriptedBrain>,
    pub executor: Rc<ScriptedExecutor>,
    pub renderer: Rc<ScriptedRenderer>,
    pub docs: Rc<MemoryDocStore>,
}

impl ScriptedKit {
    pub fn new() -> Self {
        Self::with_docs(MemoryDocStore::new())
    }

    pub fn with_docs(docs: MemoryDocStore) -> Self {
        Self {
            brain: Rc::new(ScriptedBrain::new()),
            executor: Rc::new(ScriptedExecutor::new()),
            renderer: Rc::new(ScriptedRenderer::new(2)),
            docs: Rc::new(docs),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            brain: Some(self.brain.clone()),
            docs: self.docs.clone(),
            executor: self.executor.clone(),
            renderer: self.renderer.clone(),
        }
    }
}

impl Default for ScriptedKit {
    fn default() -> Self {
        Self::new()
    }
}
