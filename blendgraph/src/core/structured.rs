//! Structured-output extraction from brain responses.
//!
//! A brain reply counts as structured only when it carries exactly one tool
//! call whose arguments hold exactly one top-level field. Anything else is a
//! [`NotReturnStructuredOutput`] condition the caller may retry.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One tool call reported by a brain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: Map<String, Value>,
}

/// Raw reply from a brain invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrainResponse {
    pub tool_calls: Vec<ToolCall>,
}

impl BrainResponse {
    pub fn single(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            tool_calls: vec![ToolCall {
                name: name.into(),
                args,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotReturnStructuredOutput {
    pub schema: String,
    pub reason: String,
}

impl fmt::Display for NotReturnStructuredOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "brain did not return structured output for {}: {}",
            self.schema, self.reason
        )
    }
}

impl std::error::Error for NotReturnStructuredOutput {}

/// Return the arguments of the single tool call in `response`.
pub fn single_call_args<'a>(
    response: &'a BrainResponse,
    schema: &str,
) -> Result<&'a Map<String, Value>, NotReturnStructuredOutput> {
    let fail = |reason: String| NotReturnStructuredOutput {
        schema: schema.to_string(),
        reason,
    };
    let call = match response.tool_calls.as_slice() {
        [call] => call,
        calls => return Err(fail(format!("expected 1 tool call, got {}", calls.len()))),
    };
    if call.name != schema {
        return Err(fail(format!("unexpected tool call {}", call.name)));
    }
    if call.args.len() != 1 {
        return Err(fail(format!(
            "expected 1 top-level field, got {}",
            call.args.len()
        )));
    }
    Ok(&call.args)
}
