//! Routing front
//!
//! Maps an incoming message to a pipeline (or a single agent) and executes
//! it. The target is either fixed or picked by a classifier agent whose
//! reply names the target.

use std::sync::Arc;

use agent_runner::{CancellationToken, PipelineExecutor, PipelineResult, RunnerError};
use relay_core::pipeline::PipelineSpec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How a message is mapped to its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Every message goes to one pipeline or agent
    Static { target: String },
    /// A classifier agent replies with the name of the target
    Classifier { agent: String },
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No pipeline or agent named '{choice}'")]
    Unroutable { choice: String },

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// What a message is routed to
#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    Pipeline(Arc<PipelineSpec>),
    Agent(String),
}

impl RouteTarget {
    pub fn name(&self) -> &str {
        match self {
            Self::Pipeline(spec) => &spec.name,
            Self::Agent(name) => name,
        }
    }
}

pub struct RoutingFront {
    executor: PipelineExecutor,
    policy: RoutingPolicy,
}

impl RoutingFront {
    /// Create a routing front, checking the policy against the registry
    pub fn new(executor: PipelineExecutor, policy: RoutingPolicy) -> relay_core::Result<Self> {
        let front = Self { executor, policy };
        match &front.policy {
            RoutingPolicy::Static { target } => {
                if front.lookup(target).is_none() {
                    return Err(relay_core::Error::NotFound(format!(
                        "routing target '{}'",
                        target
                    )));
                }
            }
            RoutingPolicy::Classifier { agent } => {
                front.executor.registry().resolve_for_execution(agent)?;
            }
        }
        Ok(front)
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Route `message` and execute its target
    pub async fn route(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult, RoutingError> {
        if message.trim().is_empty() {
            return Err(RoutingError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }

        let target = self.select(message, cancel).await?;
        info!(target = %target.name(), "Routing message");

        let result = match &target {
            RouteTarget::Pipeline(spec) => self.executor.execute(spec, message, cancel).await?,
            RouteTarget::Agent(name) => self.executor.execute_agent(name, message, cancel).await?,
        };
        Ok(result)
    }

    async fn select(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<RouteTarget, RoutingError> {
        match &self.policy {
            RoutingPolicy::Static { target } => {
                self.lookup(target).ok_or_else(|| RoutingError::Unroutable {
                    choice: target.clone(),
                })
            }
            RoutingPolicy::Classifier { agent } => {
                let classified = self.executor.execute_agent(agent, message, cancel).await?;
                let choice = normalize_choice(&classified.final_text);
                debug!(classifier = %agent, choice = %choice, "Classifier replied");
                self.lookup(&choice).ok_or_else(|| {
                    warn!(classifier = %agent, "Classifier chose unknown target '{}'", choice);
                    RoutingError::Unroutable { choice }
                })
            }
        }
    }

    /// Find a pipeline, then an agent, by exact name and then ignoring case
    fn lookup(&self, name: &str) -> Option<RouteTarget> {
        let registry = self.executor.registry();
        if name.is_empty() {
            return None;
        }
        if registry.contains_pipeline(name) {
            return registry.pipeline(name).ok().map(RouteTarget::Pipeline);
        }
        if registry.contains_agent(name) {
            return Some(RouteTarget::Agent(name.to_string()));
        }

        if let Some(pipeline) = registry
            .pipeline_names()
            .into_iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(name))
        {
            return registry.pipeline(pipeline).ok().map(RouteTarget::Pipeline);
        }
        registry
            .agent_names()
            .iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(name))
            .map(|agent| RouteTarget::Agent(agent.clone()))
    }
}

/// Reduce a classifier reply to a bare target name
fn normalize_choice(reply: &str) -> String {
    reply
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`'))
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ',' | ';' | ':'))
        .trim()
        .to_string()
}
