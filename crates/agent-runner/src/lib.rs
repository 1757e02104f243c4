//! Agent Runner - run state machine and pipeline executor
//!
//! This crate drives agent runs on a remote agent platform: it submits runs,
//! polls them with backoff, serves their tool calls (including delegation to
//! other agents) and composes them into pipelines.

mod backend;
mod client;
mod error;
mod event;
mod pipeline;
mod poller;
mod run;
mod thread;
mod tool;

#[cfg(any(test, feature = "scripted"))]
pub mod scripted;

pub use backend::{AgentBackend, RemoteRun, RunHandle, ToolCallRequest, ToolOutput};
pub use client::{HttpAgentBackend, HttpBackendConfig};
pub use error::{Result, RunnerError};
pub use event::{EventLog, RunEvent, RunEventRecord, RunStatus};
pub use pipeline::{ExecutorConfig, PipelineExecutor, PipelineResult, StageResult};
pub use poller::{BackoffPolicy, CancelOnDrop, CancellationToken, PollConfig, Poller};
pub use run::{Run, RunMachine};
pub use thread::{Message, MessageRole, RunRecord, Thread};
pub use tool::{NoFunctionTools, ToolInvoker, ToolRouter};
