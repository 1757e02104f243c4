//! In-memory agent backend driven by per-agent scripts
//!
//! Used by tests here and in dependent crates (behind the `scripted`
//! feature). Each run of an agent walks its script one step per
//! `get_run`; every backend call is recorded for later assertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use relay_core::agent::Agent;
use serde_json::Value;

use crate::backend::{AgentBackend, RemoteRun, RunHandle, ToolCallRequest, ToolOutput};
use crate::error::{Result, RunnerError};
use crate::event::RunStatus;

/// What the scripted agent sees when it produces its final text
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    /// Input the run was created with
    pub input: String,
    /// Tool outputs submitted so far, in submission order
    pub tool_outputs: Vec<ToolOutput>,
}

type Responder = Arc<dyn Fn(&ScriptContext) -> String + Send + Sync>;

#[derive(Clone)]
enum ScriptStep {
    Report(RunStatus),
    Transient(String),
    CallTools(Vec<(String, Value)>),
    Complete(Responder),
    Fail(String),
}

/// Steps one run of an agent goes through
///
/// Status and transient steps advance on each poll. A tool-call step holds
/// until every call has a submitted output. Completion and failure are
/// final. When the steps run out the last one repeats.
#[derive(Clone, Default)]
pub struct AgentScript {
    steps: Vec<ScriptStep>,
}

impl AgentScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete immediately, echoing the input
    pub fn echo() -> Self {
        Self::new().then_respond_with(|ctx| ctx.input.clone())
    }

    /// Complete immediately with `text`
    pub fn reply(text: impl Into<String>) -> Self {
        Self::new().then_reply(text)
    }

    /// Fail immediately with `message`
    pub fn fail(message: impl Into<String>) -> Self {
        Self::new().then_fail(message)
    }

    pub fn then_status(mut self, status: RunStatus) -> Self {
        self.steps.push(ScriptStep::Report(status));
        self
    }

    pub fn then_transient(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Transient(message.into()));
        self
    }

    pub fn then_call_tool(self, name: impl Into<String>, arguments: Value) -> Self {
        self.then_call_tools(vec![(name.into(), arguments)])
    }

    /// Request several tool calls at once
    pub fn then_call_tools(mut self, calls: Vec<(String, Value)>) -> Self {
        self.steps.push(ScriptStep::CallTools(calls));
        self
    }

    pub fn then_reply(self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.then_respond_with(move |_| text.clone())
    }

    pub fn then_respond_with<F>(mut self, responder: F) -> Self
    where
        F: Fn(&ScriptContext) -> String + Send + Sync + 'static,
    {
        self.steps.push(ScriptStep::Complete(Arc::new(responder)));
        self
    }

    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Fail(message.into()));
        self
    }
}

/// A call made against the scripted backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    CreateRun {
        agent: String,
        thread_id: String,
        input: String,
    },
    GetRun {
        run_id: String,
    },
    SubmitToolResult {
        run_id: String,
        tool_call_id: String,
        output: String,
    },
}

struct ScriptedRun {
    script: AgentScript,
    cursor: usize,
    context: ScriptContext,
    pending: Vec<ToolCallRequest>,
}

#[derive(Default)]
struct ScriptedState {
    scripts: HashMap<String, AgentScript>,
    runs: HashMap<String, ScriptedRun>,
    calls: Vec<BackendCall>,
    next_run: u64,
    next_call: u64,
    submits: usize,
    failing_submits: Vec<usize>,
}

/// Scripted [`AgentBackend`]
#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptedState>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script every run of the agent named `agent`
    pub fn with_agent(self, agent: impl Into<String>, script: AgentScript) -> Self {
        self.on_agent(agent, script);
        self
    }

    pub fn on_agent(&self, agent: impl Into<String>, script: AgentScript) {
        self.lock().scripts.insert(agent.into(), script);
    }

    /// Fail the `nth` tool result submission (1-based) with a transient error
    ///
    /// The failed submission is recorded but not applied.
    pub fn with_transient_submit(self, nth: usize) -> Self {
        self.lock().failing_submits.push(nth);
        self
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Inputs of the runs created for `agent`, in creation order
    pub fn inputs_for(&self, agent: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::CreateRun { agent: a, input, .. } if a == agent => Some(input.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of runs created for `agent`
    pub fn created_runs_for(&self, agent: &str) -> usize {
        self.inputs_for(agent).len()
    }

    /// Tool call ids of every submission received, failed ones included
    pub fn submitted_tool_calls(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::SubmitToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of status queries received
    pub fn get_run_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, BackendCall::GetRun { .. }))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn create_run(&self, agent: &Agent, thread_id: &str, input: &str) -> Result<RunHandle> {
        let mut state = self.lock();
        state.calls.push(BackendCall::CreateRun {
            agent: agent.name.clone(),
            thread_id: thread_id.to_string(),
            input: input.to_string(),
        });

        let script = state
            .scripts
            .get(&agent.name)
            .cloned()
            .ok_or_else(|| RunnerError::backend(format!("no script for agent '{}'", agent.name)))?;

        state.next_run += 1;
        let id = format!("run_{}", state.next_run);
        state.runs.insert(
            id.clone(),
            ScriptedRun {
                script,
                cursor: 0,
                context: ScriptContext {
                    input: input.to_string(),
                    tool_outputs: Vec::new(),
                },
                pending: Vec::new(),
            },
        );

        Ok(RunHandle {
            id,
            status: RunStatus::Queued,
        })
    }

    async fn get_run(&self, _thread_id: &str, run_id: &str) -> Result<RemoteRun> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.calls.push(BackendCall::GetRun {
            run_id: run_id.to_string(),
        });

        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| RunnerError::backend(format!("unknown run '{}'", run_id)))?;

        let Some(last) = run.script.steps.len().checked_sub(1) else {
            return Ok(RemoteRun::with_status(RunStatus::InProgress));
        };
        let index = run.cursor.min(last);

        match run.script.steps[index].clone() {
            ScriptStep::Report(status) => {
                run.cursor += 1;
                Ok(RemoteRun::with_status(status))
            }
            ScriptStep::Transient(message) => {
                run.cursor += 1;
                Err(RunnerError::transient(message))
            }
            ScriptStep::CallTools(calls) => {
                if run.pending.is_empty() {
                    for (name, arguments) in calls {
                        state.next_call += 1;
                        run.pending.push(ToolCallRequest::new(
                            format!("call_{}", state.next_call),
                            name,
                            arguments,
                        ));
                    }
                }
                Ok(RemoteRun::requires_action(run.pending.clone()))
            }
            ScriptStep::Complete(responder) => Ok(RemoteRun::completed(responder(&run.context))),
            ScriptStep::Fail(message) => Ok(RemoteRun::failed(message)),
        }
    }

    async fn submit_tool_result(
        &self,
        _thread_id: &str,
        run_id: &str,
        tool_call_id: &str,
        output: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::SubmitToolResult {
            run_id: run_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            output: output.to_string(),
        });

        state.submits += 1;
        let nth = state.submits;
        if let Some(position) = state.failing_submits.iter().position(|n| *n == nth) {
            state.failing_submits.remove(position);
            return Err(RunnerError::transient("tool output submission timed out"));
        }

        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| RunnerError::backend(format!("unknown run '{}'", run_id)))?;

        let position = run
            .pending
            .iter()
            .position(|call| call.id == tool_call_id)
            .ok_or_else(|| {
                RunnerError::backend(format!("run '{}' is not waiting on '{}'", run_id, tool_call_id))
            })?;
        run.pending.remove(position);
        run.context
            .tool_outputs
            .push(ToolOutput::new(tool_call_id, output));

        if run.pending.is_empty() {
            run.cursor += 1;
        }
        Ok(())
    }
}
