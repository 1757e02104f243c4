//! Pipeline model definitions

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Placeholder replaced with the previous stage's output
pub const PRIOR_RESULT: &str = "{prior_result}";

/// Placeholder replaced with the input the pipeline was started with
pub const INITIAL_INPUT: &str = "{initial_input}";

/// How the stages of a pipeline are composed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Each stage's result feeds the next stage
    #[default]
    Sequential,
    /// A single orchestrator delegates to its agent tools
    Connected,
}

/// How a stage builds its input from the previous result
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "template", rename_all = "snake_case")]
pub enum StageInput {
    /// Pass the previous result through unchanged
    #[default]
    Verbatim,
    /// Substitute the previous result into a fixed instruction template
    Template(String),
}

impl StageInput {
    /// Build the stage input from the prior result and the pipeline input
    pub fn render(&self, prior_result: &str, initial_input: &str) -> String {
        match self {
            Self::Verbatim => prior_result.to_string(),
            Self::Template(template) => render_template(template, prior_result, initial_input),
        }
    }
}

/// Substitute placeholders in one pass; substituted text is never rescanned
fn render_template(template: &str, prior_result: &str, initial_input: &str) -> String {
    let mut rendered = String::with_capacity(template.len() + prior_result.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix(PRIOR_RESULT) {
            rendered.push_str(prior_result);
            rest = after;
        } else if let Some(after) = tail.strip_prefix(INITIAL_INPUT) {
            rendered.push_str(initial_input);
            rest = after;
        } else {
            rendered.push('{');
            rest = &tail[1..];
        }
    }
    rendered.push_str(rest);
    rendered
}

/// One stage of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    /// Name of the registered agent that runs this stage
    pub agent: String,

    #[serde(default)]
    pub input: StageInput,
}

impl StageSpec {
    pub fn verbatim(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            input: StageInput::Verbatim,
        }
    }

    pub fn templated(agent: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            input: StageInput::Template(template.into()),
        }
    }
}

/// A named pipeline of agent stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub name: String,

    #[serde(default)]
    pub topology: Topology,

    pub stages: Vec<StageSpec>,

    /// Overall deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl PipelineSpec {
    /// A sequential pipeline
    pub fn sequential(name: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        Self {
            name: name.into(),
            topology: Topology::Sequential,
            stages,
            deadline_ms: None,
        }
    }

    /// A connected-agents pipeline driven by one orchestrator
    pub fn connected(name: impl Into<String>, orchestrator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topology: Topology::Connected,
            stages: vec![StageSpec::verbatim(orchestrator)],
            deadline_ms: None,
        }
    }

    /// A one-stage pipeline named after the agent it runs
    pub fn single(agent: impl Into<String>) -> Self {
        let agent = agent.into();
        Self::sequential(agent.clone(), vec![StageSpec::verbatim(agent)])
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Check the structural invariants of the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(self.invalid("pipeline has no stages"));
        }
        if self.topology == Topology::Connected && self.stages.len() != 1 {
            return Err(self.invalid("connected pipelines have exactly one orchestrator stage"));
        }
        if let Some(stage) = self.stages.iter().find(|s| s.agent.trim().is_empty()) {
            return Err(self.invalid(&format!("stage agent name '{}' is blank", stage.agent)));
        }
        if self.deadline_ms == Some(0) {
            return Err(self.invalid("deadline must be positive"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::InvalidPipeline {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}
