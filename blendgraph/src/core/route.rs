//! Routing directives produced by nodes and consumed by the graph.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::outcome::Halt;
use super::state::StateUpdate;

/// Registered graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Planner,
    Retriever,
    Coding,
    Critic,
    Verification,
    User,
}

impl NodeId {
    pub const ALL: [NodeId; 6] = [
        NodeId::Planner,
        NodeId::Retriever,
        NodeId::Coding,
        NodeId::Critic,
        NodeId::Verification,
        NodeId::User,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeId::Planner => "planner",
            NodeId::Retriever => "retriever",
            NodeId::Coding => "coding",
            NodeId::Critic => "critic",
            NodeId::Verification => "verification",
            NodeId::User => "user",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge endpoint: a registered node or one of the two virtual markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Start,
    Node(NodeId),
    End,
}

impl From<NodeId> for Endpoint {
    fn from(node: NodeId) -> Self {
        Endpoint::Node(node)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Start => f.write_str("__start__"),
            Endpoint::Node(node) => node.fmt(f),
            Endpoint::End => f.write_str("__end__"),
        }
    }
}

/// How the graph delivers a [`Route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Merge the update into global state, then continue at the destination.
    Handoff,
    /// The destination runs on a private copy of global state overlaid with
    /// the update. Only the update's messages reach global state.
    Fork,
}

/// "Merge this update, then transfer control to this endpoint."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub update: StateUpdate,
    pub goto: Endpoint,
    pub dispatch: Dispatch,
}

impl Route {
    pub fn goto(node: NodeId, update: StateUpdate) -> Self {
        Self {
            update,
            goto: Endpoint::Node(node),
            dispatch: Dispatch::Handoff,
        }
    }

    pub fn fork(node: NodeId, update: StateUpdate) -> Self {
        Self {
            update,
            goto: Endpoint::Node(node),
            dispatch: Dispatch::Fork,
        }
    }

    pub fn end(update: StateUpdate) -> Self {
        Self {
            update,
            goto: Endpoint::End,
            dispatch: Dispatch::Handoff,
        }
    }
}

/// Result of one node call.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Ordinary transition.
    Route(Route),
    /// Delegate recoverable work; the delegate must route back to the caller.
    Detour(Route),
    /// Pause the run until external input arrives. The node is re-entered on resume.
    Suspend(StateUpdate),
    /// Unwind the run with a terminal status.
    Halt(Halt),
}
