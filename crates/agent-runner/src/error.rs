//! Error types for agent-runner

use thiserror::Error;
use uuid::Uuid;

use crate::event::RunStatus;
use crate::run::Run;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors that can occur while running agents and pipelines
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Network failure or timeout talking to the agent platform; retryable
    #[error("Transient backend error: {message}")]
    Transient { message: String },

    /// The agent platform rejected a request
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// A run ended as failed, cancelled or expired
    #[error("Run {run_id} ({agent}) ended as {status}: {message}")]
    TerminalFailure {
        run_id: Uuid,
        agent: String,
        status: RunStatus,
        message: String,
    },

    /// Operation not allowed in the run's current status
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidState {
        run_id: Uuid,
        status: RunStatus,
        expected: RunStatus,
    },

    /// Resume was called without an output for a pending tool call
    #[error("Missing output for tool call {tool_call_id} of run {run_id}")]
    MissingToolOutput { run_id: Uuid, tool_call_id: String },

    /// The agent called a tool it never declared
    #[error("Run {run_id} ({agent}) called undeclared tool '{tool}'")]
    UnknownTool {
        run_id: Uuid,
        agent: String,
        tool: String,
    },

    /// A function tool handler failed
    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// Agent-to-agent delegation went deeper than allowed
    #[error("Delegation to '{agent}' at depth {depth} exceeds the limit of {limit}")]
    DelegationDepthExceeded { agent: String, depth: u32, limit: u32 },

    /// A pipeline stage's run did not complete
    #[error("Pipeline '{pipeline}' stage {stage_index} failed: {cause}")]
    StageFailed {
        pipeline: String,
        stage_index: usize,
        #[source]
        cause: Box<RunnerError>,
    },

    /// The pipeline's overall deadline passed
    #[error("Pipeline '{pipeline}' exceeded its {deadline_ms} ms deadline at stage {stage_index}")]
    PipelineTimeout {
        pipeline: String,
        stage_index: usize,
        deadline_ms: u64,
    },

    /// Registry or pipeline definition problem
    #[error(transparent)]
    Validation(#[from] relay_core::Error),
}

impl RunnerError {
    /// Create a Transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a Backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a ToolFailed error
    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Describe a run that ended without completing
    pub fn terminal(run: &Run) -> Self {
        Self::TerminalFailure {
            run_id: run.id,
            agent: run.agent_name.clone(),
            status: run.status,
            message: run
                .error
                .clone()
                .unwrap_or_else(|| format!("run ended as {}", run.status)),
        }
    }

    /// Whether the caller may retry the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Id of the run this error is attributed to, if any
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::TerminalFailure { run_id, .. }
            | Self::InvalidState { run_id, .. }
            | Self::MissingToolOutput { run_id, .. }
            | Self::UnknownTool { run_id, .. } => Some(*run_id),
            Self::StageFailed { cause, .. } => cause.run_id(),
            _ => None,
        }
    }
}
