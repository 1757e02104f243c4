//! Run - one agent execution against a thread
//!
//! `RunMachine` owns the status transitions of a run:
//!
//! ```text
//! Queued -> InProgress <-> RequiresAction
//!              |
//!              +-> Completed | Failed | Cancelled | Expired
//! ```
//!
//! The machine never sleeps. Callers drive it with `poll` (see
//! [`crate::poller::Poller`] for the backoff loop) and `resume`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::agent::Agent;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{AgentBackend, RemoteRun, ToolCallRequest, ToolOutput};
use crate::error::{Result, RunnerError};
use crate::event::{RunEvent, RunStatus};
use crate::thread::{RunRecord, Thread};

/// One agent execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Local run id
    pub id: Uuid,

    /// Id assigned by the agent platform
    pub remote_id: String,

    pub agent_name: String,

    pub thread_id: Uuid,

    /// Run that delegated to this one
    pub parent_run_id: Option<Uuid>,

    pub status: RunStatus,

    pub created_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,

    /// Monotonic deadline; the run expires if still active past it
    #[serde(skip)]
    pub expires_at: Instant,

    /// Final text (completed runs only)
    pub result: Option<String>,

    /// Failure reason (failed, cancelled and expired runs only)
    pub error: Option<String>,

    /// Tool calls awaiting results (requires_action only)
    pub pending_tool_calls: Vec<ToolCallRequest>,
}

impl Run {
    /// Check if the run is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the deadline has passed
    pub fn is_past_deadline(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Duration from creation to the terminal transition
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at.map(|ended| {
            ended
                .signed_duration_since(self.created_at)
                .num_milliseconds()
                .max(0) as u64
        })
    }
}

/// Drives runs through their status transitions
#[derive(Clone)]
pub struct RunMachine {
    backend: Arc<dyn AgentBackend>,
}

impl RunMachine {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }

    /// Submit a run of `agent` with `input`
    ///
    /// Returns as soon as the platform accepts the run. The input is
    /// appended to the thread as a user message.
    pub async fn submit(
        &self,
        agent: &Agent,
        thread: &mut Thread,
        input: &str,
        expires_at: Instant,
    ) -> Result<Run> {
        self.start(agent, thread, input, expires_at, None).await
    }

    /// Submit a run on behalf of another run that delegated to `agent`
    pub async fn submit_delegated(
        &self,
        agent: &Agent,
        thread: &mut Thread,
        input: &str,
        expires_at: Instant,
        parent_run_id: Uuid,
    ) -> Result<Run> {
        self.start(agent, thread, input, expires_at, Some(parent_run_id))
            .await
    }

    async fn start(
        &self,
        agent: &Agent,
        thread: &mut Thread,
        input: &str,
        expires_at: Instant,
        parent_run_id: Option<Uuid>,
    ) -> Result<Run> {
        let thread_id = thread.id();
        let handle = self
            .backend
            .create_run(agent, &thread_id.to_string(), input)
            .await?;

        let run = Run {
            id: Uuid::new_v4(),
            remote_id: handle.id,
            agent_name: agent.name.clone(),
            thread_id,
            parent_run_id,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            ended_at: None,
            expires_at,
            result: None,
            error: None,
            pending_tool_calls: Vec::new(),
        };

        thread.record_run(RunRecord {
            run_id: run.id,
            agent_name: run.agent_name.clone(),
            parent_run_id,
            created_at: run.created_at,
        });
        thread.append_user(input, run.id);

        info!(
            run.id = %run.id,
            remote.id = %run.remote_id,
            agent.name = %agent.name,
            thread.id = %thread_id,
            "Created run"
        );
        Ok(run)
    }

    /// Advance a run by one remote query
    ///
    /// Terminal runs are returned unchanged without contacting the platform.
    /// An active run past its deadline becomes `Expired`, also without a
    /// remote query. Transient errors leave the run untouched.
    pub async fn poll(&self, run: &mut Run, thread: &mut Thread) -> Result<RunStatus> {
        if run.is_terminal() {
            return Ok(run.status);
        }

        if run.is_past_deadline() {
            warn!(run.id = %run.id, agent.name = %run.agent_name, "Run expired");
            self.finish(
                run,
                thread,
                RunStatus::Expired,
                Some("run exceeded its deadline".to_string()),
            );
            return Ok(run.status);
        }

        let remote = self
            .backend
            .get_run(&run.thread_id.to_string(), &run.remote_id)
            .await?;
        self.apply(run, thread, remote)?;
        Ok(run.status)
    }

    /// Supply tool results and return the run to `InProgress`
    ///
    /// Only valid while the run requires action; every pending tool call
    /// must have an output. Each accepted output is dropped from the
    /// pending calls, so a retry after a failed submission only sends what
    /// the platform has not seen yet.
    pub async fn resume(
        &self,
        run: &mut Run,
        thread: &mut Thread,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunStatus> {
        if run.status != RunStatus::RequiresAction {
            return Err(RunnerError::InvalidState {
                run_id: run.id,
                status: run.status,
                expected: RunStatus::RequiresAction,
            });
        }

        let mut ordered = Vec::with_capacity(run.pending_tool_calls.len());
        for call in &run.pending_tool_calls {
            let output = outputs
                .iter()
                .find(|o| o.tool_call_id == call.id)
                .ok_or_else(|| RunnerError::MissingToolOutput {
                    run_id: run.id,
                    tool_call_id: call.id.clone(),
                })?;
            ordered.push(output.clone());
        }
        if outputs.len() > ordered.len() {
            warn!(
                run.id = %run.id,
                "Ignoring {} tool outputs with no pending call",
                outputs.len() - ordered.len()
            );
        }

        let thread_id = run.thread_id.to_string();
        for output in ordered {
            self.backend
                .submit_tool_result(&thread_id, &run.remote_id, &output.tool_call_id, &output.output)
                .await?;
            thread.append_tool(&output.tool_call_id, &output.output, run.id);
            run.pending_tool_calls.retain(|call| call.id != output.tool_call_id);
        }

        self.transition(run, thread, RunStatus::InProgress);
        Ok(run.status)
    }

    /// Mark an active run as cancelled locally
    ///
    /// The platform is not contacted; whatever it produces later is ignored.
    pub fn cancel(&self, run: &mut Run, thread: &mut Thread) {
        if run.is_terminal() {
            return;
        }
        info!(run.id = %run.id, agent.name = %run.agent_name, "Cancelling run");
        self.finish(
            run,
            thread,
            RunStatus::Cancelled,
            Some("run was cancelled".to_string()),
        );
    }

    fn apply(&self, run: &mut Run, thread: &mut Thread, remote: RemoteRun) -> Result<()> {
        match remote.status {
            RunStatus::Queued | RunStatus::InProgress => {
                self.transition(run, thread, remote.status);
            }
            RunStatus::RequiresAction => {
                if remote.tool_calls.is_empty() {
                    return Err(RunnerError::backend(format!(
                        "run {} requires action but reported no tool calls",
                        run.remote_id
                    )));
                }
                self.transition(run, thread, RunStatus::RequiresAction);
                for call in &remote.tool_calls {
                    if !run.pending_tool_calls.iter().any(|p| p.id == call.id) {
                        debug!(run.id = %run.id, tool = %call.name, "Tool call requested");
                        thread.record_event(RunEvent::ToolCallRequested {
                            run_id: run.id,
                            call: call.clone(),
                        });
                    }
                }
                run.pending_tool_calls = remote.tool_calls;
            }
            RunStatus::Completed => {
                let output = remote.output.unwrap_or_default();
                thread.append_agent(&run.agent_name, &output, run.id);
                run.result = Some(output);
                self.finish(run, thread, RunStatus::Completed, None);
            }
            RunStatus::Failed | RunStatus::Cancelled | RunStatus::Expired => {
                let error = remote
                    .error
                    .unwrap_or_else(|| format!("run ended as {}", remote.status));
                self.finish(run, thread, remote.status, Some(error));
            }
        }
        Ok(())
    }

    fn transition(&self, run: &mut Run, thread: &mut Thread, new_status: RunStatus) {
        let old_status = run.status;
        if old_status == new_status {
            return;
        }
        run.status = new_status;
        debug!(run.id = %run.id, "Run status {} -> {}", old_status, new_status);
        thread.record_event(RunEvent::StatusChanged {
            run_id: run.id,
            old_status,
            new_status,
        });
    }

    fn finish(&self, run: &mut Run, thread: &mut Thread, status: RunStatus, error: Option<String>) {
        self.transition(run, thread, status);
        run.error = error;
        run.ended_at = Some(Utc::now());
        run.pending_tool_calls.clear();
        thread.record_event(RunEvent::Completed {
            run_id: run.id,
            status,
            result: run.result.clone(),
            error: run.error.clone(),
        });
        info!(
            run.id = %run.id,
            agent.name = %run.agent_name,
            duration_ms = run.duration_ms().unwrap_or(0),
            "Run finished as {}",
            status
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{AgentScript, BackendCall, ScriptedBackend};
    use serde_json::json;
    use std::time::Duration;

    fn machine(backend: &Arc<ScriptedBackend>) -> RunMachine {
        RunMachine::new(backend.clone())
    }

    fn agent(name: &str) -> Agent {
        Agent::new(name, "gpt-4o", "test agent")
    }

    fn ttl() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_submit_queues_run_and_appends_input() {
        let backend = Arc::new(ScriptedBackend::new().with_agent("echo", AgentScript::echo()));
        let mut thread = Thread::new();

        let run = machine(&backend)
            .submit(&agent("echo"), &mut thread, "hello", ttl())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.thread_id, thread.id());
        assert_eq!(thread.messages().len(), 1);
        assert_eq!(thread.messages()[0].content, "hello");
        assert_eq!(thread.runs()[0].run_id, run.id);
        assert_eq!(backend.get_run_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_to_completion() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "summarizer",
            AgentScript::new()
                .then_status(RunStatus::InProgress)
                .then_reply("short summary"),
        ));
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("summarizer"), &mut thread, "long text", ttl())
            .await
            .unwrap();

        assert_eq!(machine.poll(&mut run, &mut thread).await.unwrap(), RunStatus::InProgress);
        assert_eq!(machine.poll(&mut run, &mut thread).await.unwrap(), RunStatus::Completed);
        assert_eq!(run.result.as_deref(), Some("short summary"));
        assert!(run.error.is_none());
        assert!(run.ended_at.is_some());
        assert_eq!(thread.last_agent_message().unwrap().content, "short summary");
    }

    #[tokio::test]
    async fn test_poll_is_idempotent_on_terminal_runs() {
        let backend = Arc::new(ScriptedBackend::new().with_agent("echo", AgentScript::echo()));
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("echo"), &mut thread, "ping", ttl())
            .await
            .unwrap();

        machine.poll(&mut run, &mut thread).await.unwrap();
        let first = run.clone();
        let queries = backend.get_run_count();
        let events = thread.events().len();

        machine.poll(&mut run, &mut thread).await.unwrap();
        machine.poll(&mut run, &mut thread).await.unwrap();

        assert_eq!(run, first);
        assert_eq!(backend.get_run_count(), queries);
        assert_eq!(thread.events().len(), events);
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let backend = Arc::new(
            ScriptedBackend::new().with_agent("broken", AgentScript::fail("model overloaded")),
        );
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("broken"), &mut thread, "hi", ttl())
            .await
            .unwrap();

        assert_eq!(machine.poll(&mut run, &mut thread).await.unwrap(), RunStatus::Failed);
        assert!(run.result.is_none());
        assert_eq!(run.error.as_deref(), Some("model overloaded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_run_is_not_queried() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "slow",
            AgentScript::new().then_status(RunStatus::InProgress),
        ));
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(
                &agent("slow"),
                &mut thread,
                "hi",
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(machine.poll(&mut run, &mut thread).await.unwrap(), RunStatus::InProgress);
        assert_eq!(backend.get_run_count(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(machine.poll(&mut run, &mut thread).await.unwrap(), RunStatus::Expired);
        assert_eq!(backend.get_run_count(), 1);
        assert!(run.error.is_some());
    }

    #[tokio::test]
    async fn test_transient_error_leaves_run_unchanged() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "flaky",
            AgentScript::new()
                .then_transient("connection reset")
                .then_reply("ok"),
        ));
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("flaky"), &mut thread, "hi", ttl())
            .await
            .unwrap();
        let before = run.clone();

        let err = machine.poll(&mut run, &mut thread).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(run, before);

        assert_eq!(machine.poll(&mut run, &mut thread).await.unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_requires_action_and_resume() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "catalog",
            AgentScript::new()
                .then_call_tool("SearchFood", json!({ "searchTerm": "pizza" }))
                .then_respond_with(|ctx| format!("found: {}", ctx.tool_outputs[0].output)),
        ));
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("catalog"), &mut thread, "any pizza?", ttl())
            .await
            .unwrap();

        assert_eq!(
            machine.poll(&mut run, &mut thread).await.unwrap(),
            RunStatus::RequiresAction
        );
        assert_eq!(run.pending_tool_calls.len(), 1);
        let call = run.pending_tool_calls[0].clone();
        assert_eq!(call.name, "SearchFood");

        // Polling again while waiting does not duplicate the request event
        machine.poll(&mut run, &mut thread).await.unwrap();
        let requested = thread
            .events()
            .iter()
            .filter(|r| matches!(r.event, RunEvent::ToolCallRequested { .. }))
            .count();
        assert_eq!(requested, 1);

        let status = machine
            .resume(&mut run, &mut thread, vec![ToolOutput::new(call.id.clone(), "Margherita")])
            .await
            .unwrap();
        assert_eq!(status, RunStatus::InProgress);
        assert!(run.pending_tool_calls.is_empty());

        assert_eq!(machine.poll(&mut run, &mut thread).await.unwrap(), RunStatus::Completed);
        assert_eq!(run.result.as_deref(), Some("found: Margherita"));
        assert!(backend.calls().iter().any(|c| matches!(
            c,
            BackendCall::SubmitToolResult { tool_call_id, .. } if *tool_call_id == call.id
        )));
    }

    #[tokio::test]
    async fn test_resume_requires_pending_action() {
        let backend = Arc::new(ScriptedBackend::new().with_agent("echo", AgentScript::echo()));
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("echo"), &mut thread, "hi", ttl())
            .await
            .unwrap();

        match machine.resume(&mut run, &mut thread, vec![]).await.unwrap_err() {
            RunnerError::InvalidState { status, expected, .. } => {
                assert_eq!(status, RunStatus::Queued);
                assert_eq!(expected, RunStatus::RequiresAction);
            }
            e => panic!("Expected InvalidState error, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_resume_rejects_missing_output() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "catalog",
            AgentScript::new()
                .then_call_tool("ListFood", json!({}))
                .then_reply("done"),
        ));
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("catalog"), &mut thread, "list", ttl())
            .await
            .unwrap();
        machine.poll(&mut run, &mut thread).await.unwrap();

        let err = machine
            .resume(&mut run, &mut thread, vec![ToolOutput::new("other", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::MissingToolOutput { .. }));
        assert_eq!(run.status, RunStatus::RequiresAction);
    }

    #[tokio::test]
    async fn test_failed_submission_keeps_only_unsent_calls_pending() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_agent(
                    "catalog",
                    AgentScript::new()
                        .then_call_tools(vec![
                            ("ListFood".to_string(), json!({})),
                            ("SearchFood".to_string(), json!({ "searchTerm": "soup" })),
                        ])
                        .then_reply("done"),
                )
                .with_transient_submit(2),
        );
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("catalog"), &mut thread, "menu", ttl())
            .await
            .unwrap();
        machine.poll(&mut run, &mut thread).await.unwrap();
        let outputs: Vec<ToolOutput> = run
            .pending_tool_calls
            .iter()
            .map(|call| ToolOutput::new(call.id.clone(), "[]"))
            .collect();

        let err = machine
            .resume(&mut run, &mut thread, outputs.clone())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(run.status, RunStatus::RequiresAction);
        assert_eq!(run.pending_tool_calls.len(), 1);
        assert_eq!(run.pending_tool_calls[0].id, outputs[1].tool_call_id);

        let status = machine.resume(&mut run, &mut thread, outputs).await.unwrap();
        assert_eq!(status, RunStatus::InProgress);
        assert_eq!(backend.submitted_tool_calls(), vec!["call_1", "call_2", "call_2"]);
        assert_eq!(machine.poll(&mut run, &mut thread).await.unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_is_local() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "slow",
            AgentScript::new().then_status(RunStatus::InProgress),
        ));
        let machine = machine(&backend);
        let mut thread = Thread::new();
        let mut run = machine
            .submit(&agent("slow"), &mut thread, "hi", ttl())
            .await
            .unwrap();

        machine.cancel(&mut run, &mut thread);
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(backend.get_run_count(), 0);

        // Cancelled runs stay cancelled
        machine.poll(&mut run, &mut thread).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(backend.get_run_count(), 0);
    }
}
