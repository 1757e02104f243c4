//! Pipeline executor
//!
//! Runs the stages of a [`PipelineSpec`] against a validated registry.
//! Sequential stages feed each result into the next stage's input; an
//! orchestrator stage delegates to sub-agents through agent tools, which are
//! run here as nested runs on the same thread.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use relay_core::agent::{Agent, AgentRegistry, ToolRef};
use relay_core::pipeline::PipelineSpec;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{AgentBackend, ToolCallRequest, ToolOutput};
use crate::error::{Result, RunnerError};
use crate::event::RunStatus;
use crate::poller::{CancellationToken, PollConfig, Poller};
use crate::run::{Run, RunMachine};
use crate::thread::Thread;
use crate::tool::{NoFunctionTools, ToolInvoker};

/// Executor settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Lifetime of every run; also the per-stage budget
    pub run_ttl: Duration,

    /// Deepest allowed chain of agent-to-agent delegation
    pub max_delegation_depth: u32,

    /// Upper bound on any pipeline's overall deadline
    pub pipeline_deadline: Option<Duration>,

    pub poll: PollConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_ttl: Duration::from_secs(120),
            max_delegation_depth: 3,
            pipeline_deadline: None,
            poll: PollConfig::default(),
        }
    }
}

/// Outcome of one pipeline stage
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage_index: usize,
    pub agent_name: String,
    pub input: String,
    pub output: String,
    /// The stage's own run
    pub run: Run,
    /// Completed sub-agent runs, in completion order
    pub delegations: Vec<Run>,
    pub duration_ms: u64,
}

/// Outcome of a completed pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub pipeline: String,
    /// Result of the last stage
    pub final_text: String,
    pub stages: Vec<StageResult>,
    pub total_duration_ms: u64,
    /// Full audit trail of the execution
    pub thread: Thread,
}

/// Executes pipelines and single agents
#[derive(Clone)]
pub struct PipelineExecutor {
    registry: Arc<AgentRegistry>,
    poller: Poller,
    tools: Arc<dyn ToolInvoker>,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        backend: Arc<dyn AgentBackend>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            poller: Poller::new(RunMachine::new(backend), config.poll.clone()),
            tools: Arc::new(NoFunctionTools),
            config,
        }
    }

    /// Use `tools` for function tool calls
    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = tools;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute the registered pipeline named `name`
    pub async fn execute_pipeline(
        &self,
        name: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let spec = self.registry.pipeline(name)?;
        self.execute(&spec, input, cancel).await
    }

    /// Execute a single registered agent as a one-stage pipeline
    pub async fn execute_agent(
        &self,
        name: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        self.execute(&PipelineSpec::single(name), input, cancel).await
    }

    /// Execute `spec` with `input`
    ///
    /// Every stage agent is bound before the first run is submitted, so an
    /// unvalidated registry or an unknown agent fails without remote calls.
    /// Execution stops at the first stage whose run does not complete.
    pub async fn execute(
        &self,
        spec: &PipelineSpec,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        spec.validate()?;
        let agents = spec
            .stages
            .iter()
            .map(|stage| self.registry.resolve_for_execution(&stage.agent))
            .collect::<relay_core::Result<Vec<_>>>()?;

        let started = Instant::now();
        let budget = self.overall_budget(spec);
        let deadline = instant_after(started, budget);
        let mut thread = Thread::new();

        info!(
            pipeline = %spec.name,
            thread.id = %thread.id(),
            stages = spec.stages.len(),
            budget_ms = budget.as_millis() as u64,
            "Executing pipeline"
        );

        let mut prior = input.to_string();
        let mut stages = Vec::with_capacity(spec.stages.len());

        for (index, (stage, agent)) in spec.stages.iter().zip(agents).enumerate() {
            if Instant::now() >= deadline {
                return Err(timeout(spec, index, budget));
            }

            let stage_input = stage.input.render(&prior, input);
            let stage_started = Instant::now();
            let expires_at = instant_after(stage_started, self.config.run_ttl).min(deadline);
            let mut delegations = Vec::new();

            let run = self
                .run_agent(
                    agent,
                    &mut thread,
                    stage_input.clone(),
                    0,
                    expires_at,
                    None,
                    &mut delegations,
                    cancel,
                )
                .await
                .map_err(|e| stage_error(spec, index, deadline, budget, e))?;

            let output = run.result.clone().unwrap_or_default();
            info!(
                pipeline = %spec.name,
                stage = index,
                run.id = %run.id,
                "Stage completed"
            );
            stages.push(StageResult {
                stage_index: index,
                agent_name: stage.agent.clone(),
                input: stage_input,
                output: output.clone(),
                run,
                delegations,
                duration_ms: stage_started.elapsed().as_millis() as u64,
            });
            prior = output;
        }

        Ok(PipelineResult {
            pipeline: spec.name.clone(),
            final_text: prior,
            stages,
            total_duration_ms: started.elapsed().as_millis() as u64,
            thread,
        })
    }

    /// min(pipeline deadline, configured deadline, sum of stage budgets)
    fn overall_budget(&self, spec: &PipelineSpec) -> Duration {
        let stage_count = u32::try_from(spec.stages.len()).unwrap_or(u32::MAX);
        let mut budget = self.config.run_ttl.saturating_mul(stage_count);
        if let Some(own) = spec.deadline() {
            budget = budget.min(own);
        }
        if let Some(configured) = self.config.pipeline_deadline {
            budget = budget.min(configured);
        }
        budget
    }

    /// Submit a run and drive it to completion, serving its tool calls
    #[allow(clippy::too_many_arguments)]
    fn run_agent<'a>(
        &'a self,
        agent: Arc<Agent>,
        thread: &'a mut Thread,
        input: String,
        depth: u32,
        expires_at: Instant,
        parent: Option<Uuid>,
        delegations: &'a mut Vec<Run>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Run>> {
        async move {
            let machine = self.poller.machine();
            let mut run = match parent {
                Some(parent_id) => {
                    machine
                        .submit_delegated(&agent, thread, &input, expires_at, parent_id)
                        .await?
                }
                None => machine.submit(&agent, thread, &input, expires_at).await?,
            };

            loop {
                match self.poller.wait(&mut run, thread, cancel).await? {
                    RunStatus::Completed => return Ok(run),
                    RunStatus::RequiresAction => {
                        let calls = run.pending_tool_calls.clone();
                        let mut outputs = Vec::with_capacity(calls.len());
                        for call in &calls {
                            let output = match self
                                .dispatch(&agent, &run, call, thread, depth, delegations, cancel)
                                .await
                            {
                                Ok(output) => output,
                                Err(e) => {
                                    machine.cancel(&mut run, thread);
                                    return Err(e);
                                }
                            };
                            outputs.push(ToolOutput::new(&call.id, output));
                        }
                        self.poller.resume(&mut run, thread, outputs).await?;
                    }
                    _ => return Err(RunnerError::terminal(&run)),
                }
            }
        }
        .boxed()
    }

    /// Serve one tool call of `run`
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        agent: &Agent,
        run: &Run,
        call: &ToolCallRequest,
        thread: &mut Thread,
        depth: u32,
        delegations: &mut Vec<Run>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        match agent.tool(&call.name) {
            Some(ToolRef::Agent(tool)) => {
                let limit = self.config.max_delegation_depth;
                let child_depth = depth + 1;
                if child_depth > limit {
                    warn!(
                        run.id = %run.id,
                        agent.name = %tool.agent,
                        "Delegation depth {} exceeds limit {}",
                        child_depth,
                        limit
                    );
                    return Err(RunnerError::DelegationDepthExceeded {
                        agent: tool.agent.clone(),
                        depth: child_depth,
                        limit,
                    });
                }

                let sub_agent = self.registry.resolve_for_execution(&tool.agent)?;
                let expires_at = instant_after(Instant::now(), self.config.run_ttl).min(run.expires_at);
                info!(
                    run.id = %run.id,
                    agent.name = %agent.name,
                    delegate = %tool.agent,
                    depth = child_depth,
                    "Delegating to sub-agent"
                );

                let child = self
                    .run_agent(
                        sub_agent,
                        thread,
                        call.input_text(),
                        child_depth,
                        expires_at,
                        Some(run.id),
                        delegations,
                        cancel,
                    )
                    .await?;
                let output = child.result.clone().unwrap_or_default();
                delegations.push(child);
                Ok(output)
            }
            Some(ToolRef::Function(tool)) => self.tools.invoke(tool, &call.arguments).await,
            None => Err(RunnerError::UnknownTool {
                run_id: run.id,
                agent: agent.name.clone(),
                tool: call.name.clone(),
            }),
        }
    }
}

/// Furthest deadline handed out; longer budgets are clamped to it
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn instant_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after.min(FAR_FUTURE)).unwrap_or(from)
}

fn timeout(spec: &PipelineSpec, stage_index: usize, budget: Duration) -> RunnerError {
    warn!(pipeline = %spec.name, stage = stage_index, "Pipeline deadline exceeded");
    RunnerError::PipelineTimeout {
        pipeline: spec.name.clone(),
        stage_index,
        deadline_ms: budget.as_millis() as u64,
    }
}

fn stage_error(
    spec: &PipelineSpec,
    stage_index: usize,
    deadline: Instant,
    budget: Duration,
    error: RunnerError,
) -> RunnerError {
    match error {
        RunnerError::TerminalFailure {
            status: RunStatus::Expired,
            ..
        } if Instant::now() >= deadline => timeout(spec, stage_index, budget),
        RunnerError::TerminalFailure { .. } => {
            warn!(pipeline = %spec.name, stage = stage_index, "Stage failed: {}", error);
            RunnerError::StageFailed {
                pipeline: spec.name.clone(),
                stage_index,
                cause: Box::new(error),
            }
        }
        other => other,
    }
}
