//! Agent execution boundary
//!
//! The runner reaches the remote agent platform only through
//! [`AgentBackend`]. Concrete platforms are adapters implementing it.

use async_trait::async_trait;
use relay_core::agent::Agent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::RunStatus;

/// A tool call the agent is waiting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    /// Platform-assigned call id, echoed back with the result
    pub id: String,
    /// Name of the tool being called
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Free-text input for a sub-agent call
    ///
    /// Uses the `input` (or `message`) argument when present, a bare string
    /// argument as-is, and the JSON text of anything else.
    pub fn input_text(&self) -> String {
        match &self.arguments {
            Value::String(text) => text.clone(),
            Value::Object(map) => map
                .get("input")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.arguments.to_string()),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Result of a tool call, sent back to the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

impl ToolOutput {
    pub fn new(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: output.into(),
        }
    }
}

/// Handle returned when the platform accepts a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHandle {
    /// Platform-assigned run id
    pub id: String,
    pub status: RunStatus,
}

/// Snapshot of a run as reported by the platform
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRun {
    pub status: RunStatus,
    /// Final text, present once completed
    pub output: Option<String>,
    /// Failure reason, present once failed
    pub error: Option<String>,
    /// Pending tool calls, present while requiring action
    pub tool_calls: Vec<ToolCallRequest>,
}

impl RemoteRun {
    pub fn with_status(status: RunStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::with_status(RunStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(RunStatus::Failed)
        }
    }

    pub fn requires_action(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::with_status(RunStatus::RequiresAction)
        }
    }
}

/// Capability interface of the remote agent platform
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Start a run of `agent` on the given thread
    async fn create_run(&self, agent: &Agent, thread_id: &str, input: &str) -> Result<RunHandle>;

    /// Fetch the current state of a run
    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RemoteRun>;

    /// Deliver the result of one tool call
    async fn submit_tool_result(
        &self,
        thread_id: &str,
        run_id: &str,
        tool_call_id: &str,
        output: &str,
    ) -> Result<()>;
}
