//! Multi-agent pipeline that writes Blender scripts from a text request.
//!
//! A planner splits the request into subtasks, a coding agent writes and
//! executes the script (with a retriever supplying reference docs and repairing
//! failures), and critic/verification agents inspect rendered views until the
//! result holds up. The user node can suspend the run for follow-ups.
//!
//! - **[`core`]**: Pure data and routing types. No I/O.
//! - **[`io`]**: Side effects: config, subprocesses, files, checkpoints.
//!   Collaborators sit behind traits so tests can script them.
//!
//! [`agents`] implement the nodes, [`graph`] walks them, [`coordinator`]
//! builds them from config, and [`pipeline`] owns the run lifecycle.

pub mod agents;
pub mod coordinator;
pub mod core;
pub mod exit_codes;
pub mod graph;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
