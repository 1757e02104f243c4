//! Agent registry
//!
//! Agents and pipelines are registered once at startup. `validate_acyclic`
//! checks the delegation graph and freezes the registry; only a validated
//! registry hands out agents and pipelines for execution.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::model::Agent;
use crate::pipeline::PipelineSpec;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unseen,
    InProgress,
    Done,
}

/// Registry of agents and pipelines, keyed by name
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<Agent>>,
    /// Registration order, used to keep validation deterministic
    order: Vec<String>,
    pipelines: HashMap<String, Arc<PipelineSpec>>,
    validated: bool,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent
    pub fn register(&mut self, agent: Agent) -> Result<()> {
        if self.validated {
            return Err(Error::RegistryFrozen);
        }
        if self.agents.contains_key(&agent.name) {
            return Err(Error::DuplicateName(agent.name));
        }
        debug!("Registered agent {}", agent.name);
        self.order.push(agent.name.clone());
        self.agents.insert(agent.name.clone(), Arc::new(agent));
        Ok(())
    }

    /// Register a pipeline; its stages are bound during validation
    pub fn register_pipeline(&mut self, pipeline: PipelineSpec) -> Result<()> {
        if self.validated {
            return Err(Error::RegistryFrozen);
        }
        if self.pipelines.contains_key(&pipeline.name) {
            return Err(Error::DuplicateName(pipeline.name));
        }
        self.pipelines
            .insert(pipeline.name.clone(), Arc::new(pipeline));
        Ok(())
    }

    /// Look up an agent by name
    pub fn resolve(&self, name: &str) -> Result<Arc<Agent>> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", name)))
    }

    /// Look up an agent for execution; fails until the registry is validated
    pub fn resolve_for_execution(&self, name: &str) -> Result<Arc<Agent>> {
        if !self.validated {
            return Err(Error::RegistryNotValidated);
        }
        self.resolve(name)
    }

    /// Look up a pipeline for execution; fails until the registry is validated
    pub fn pipeline(&self, name: &str) -> Result<Arc<PipelineSpec>> {
        if !self.validated {
            return Err(Error::RegistryNotValidated);
        }
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pipeline '{}'", name)))
    }

    pub fn contains_agent(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn contains_pipeline(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    pub fn agent_names(&self) -> &[String] {
        &self.order
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Validate the delegation graph and pipeline bindings, then freeze.
    ///
    /// Fails with `NotFound` when an agent tool or pipeline stage names an
    /// unknown agent, and with `CyclicDelegation` when an agent can reach
    /// itself through agent tools. The reported cycle starts and ends with
    /// the same agent.
    pub fn validate_acyclic(&mut self) -> Result<()> {
        for name in &self.order {
            let agent = &self.agents[name];
            for delegate in agent.delegates() {
                if !self.agents.contains_key(delegate) {
                    return Err(Error::NotFound(format!(
                        "agent '{}' (declared as a tool of '{}')",
                        delegate, name
                    )));
                }
            }
        }

        let mut visits: HashMap<&str, Visit> = self
            .order
            .iter()
            .map(|name| (name.as_str(), Visit::Unseen))
            .collect();
        for name in &self.order {
            if visits[name.as_str()] == Visit::Unseen {
                let mut path = Vec::new();
                self.visit(name, &mut visits, &mut path)?;
            }
        }

        for pipeline in self.pipelines.values() {
            pipeline.validate()?;
            for stage in &pipeline.stages {
                if !self.agents.contains_key(&stage.agent) {
                    return Err(Error::NotFound(format!(
                        "agent '{}' (stage of pipeline '{}')",
                        stage.agent, pipeline.name
                    )));
                }
            }
        }

        self.validated = true;
        info!(
            agents = self.agents.len(),
            pipelines = self.pipelines.len(),
            "Agent registry validated"
        );
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        visits: &mut HashMap<&'a str, Visit>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        visits.insert(name, Visit::InProgress);
        path.push(name);

        for delegate in self.agents[name].delegates() {
            match visits[delegate] {
                Visit::InProgress => {
                    let start = path.iter().position(|n| *n == delegate).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(delegate.to_string());
                    return Err(Error::CyclicDelegation { cycle });
                }
                Visit::Unseen => self.visit(delegate, visits, path)?,
                Visit::Done => {}
            }
        }

        path.pop();
        visits.insert(name, Visit::Done);
        Ok(())
    }
}
