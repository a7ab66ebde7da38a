//! Stable exit codes for blendgraph CLI commands.

use crate::core::outcome::RunStatus;

/// Command succeeded, or the run finished successfully.
pub const OK: i32 = 0;
/// Invalid config, unknown run id, or any other error.
pub const INVALID: i32 = 1;
/// The run is suspended and waits for `blendgraph resume`.
pub const SUSPENDED: i32 = 2;
/// The user ended the run with `q`/`quit`.
pub const TERMINATED: i32 = 3;
/// A script kept failing past the fix ceiling.
pub const FIX_CEILING: i32 = 4;
/// A render produced no images.
pub const NO_RENDER: i32 = 5;
/// The run exceeded `max_steps`.
pub const STEP_CEILING: i32 = 6;
/// An agent failed; the report carries the error.
pub const AGENT_ERROR: i32 = 7;

pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => OK,
        RunStatus::TerminatedByUser => TERMINATED,
        RunStatus::AbortedFixCeiling => FIX_CEILING,
        RunStatus::AbortedNoRender => NO_RENDER,
        RunStatus::AbortedStepCeiling => STEP_CEILING,
        RunStatus::AbortedAgentError => AGENT_ERROR,
    }
}
