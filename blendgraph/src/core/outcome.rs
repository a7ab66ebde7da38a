//! Terminal statuses and the halt conditions that produce them.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::route::NodeId;
use super::state::StateUpdate;

/// Final status of a run, surfaced to the CLI and run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    TerminatedByUser,
    AbortedFixCeiling,
    AbortedNoRender,
    AbortedStepCeiling,
    /// A node returned an error, e.g. structured output ran out of retries.
    AbortedAgentError,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::TerminatedByUser => "terminated_by_user",
            RunStatus::AbortedFixCeiling => "aborted_fix_ceiling",
            RunStatus::AbortedNoRender => "aborted_no_render",
            RunStatus::AbortedStepCeiling => "aborted_step_ceiling",
            RunStatus::AbortedAgentError => "aborted_agent_error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped before reaching the end marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    UserTerminated,
    FixCeiling { ceiling: u32 },
    NoRender { node: NodeId },
    StepCeiling { limit: u32 },
}

impl HaltReason {
    pub fn status(self) -> RunStatus {
        match self {
            HaltReason::UserTerminated => RunStatus::TerminatedByUser,
            HaltReason::FixCeiling { .. } => RunStatus::AbortedFixCeiling,
            HaltReason::NoRender { .. } => RunStatus::AbortedNoRender,
            HaltReason::StepCeiling { .. } => RunStatus::AbortedStepCeiling,
        }
    }

    pub fn message(self) -> String {
        match self {
            HaltReason::UserTerminated => "Terminated by user".to_string(),
            HaltReason::FixCeiling { ceiling } => {
                format!("Exceeded the fix attempt ceiling of {ceiling}; script still fails to execute")
            }
            HaltReason::NoRender { node } => {
                format!("{node} rendered no images; nothing to inspect")
            }
            HaltReason::StepCeiling { limit } => {
                format!("Run exceeded the step ceiling of {limit} transitions")
            }
        }
    }
}

/// Fatal condition carrying the last coherent state fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Halt {
    pub reason: HaltReason,
    pub update: StateUpdate,
}

impl Halt {
    /// Build a halt whose update carries the reason's message in `msg`.
    pub fn new(reason: HaltReason, update: StateUpdate) -> Self {
        Self {
            reason,
            update: update.with_msg(reason.message()),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.reason.status()
    }
}
