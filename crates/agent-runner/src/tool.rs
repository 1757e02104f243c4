//! Function tool invocation
//!
//! Agent tools are handled by the pipeline executor itself; function tools
//! are handed to a [`ToolInvoker`] chosen by the tool's target.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::agent::FunctionTool;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, RunnerError};

/// Executes function tools on behalf of runs
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Run `tool` with the arguments the agent supplied, returning text for the agent
    async fn invoke(&self, tool: &FunctionTool, arguments: &Value) -> Result<String>;
}

/// Invoker for deployments without function tools
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFunctionTools;

#[async_trait]
impl ToolInvoker for NoFunctionTools {
    async fn invoke(&self, tool: &FunctionTool, _arguments: &Value) -> Result<String> {
        Err(RunnerError::tool_failed(
            &tool.name,
            format!("no handler for tool target '{}'", tool.target),
        ))
    }
}

/// Dispatches function tools to invokers by target
#[derive(Clone, Default)]
pub struct ToolRouter {
    targets: HashMap<String, Arc<dyn ToolInvoker>>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route tools whose target is `target` to `invoker`
    pub fn with_target(mut self, target: impl Into<String>, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.targets.insert(target.into(), invoker);
        self
    }
}

#[async_trait]
impl ToolInvoker for ToolRouter {
    async fn invoke(&self, tool: &FunctionTool, arguments: &Value) -> Result<String> {
        let invoker = self.targets.get(&tool.target).ok_or_else(|| {
            RunnerError::tool_failed(&tool.name, format!("unknown tool target '{}'", tool.target))
        })?;
        debug!(tool = %tool.name, target = %tool.target, "Invoking function tool");
        invoker.invoke(tool, arguments).await
    }
}
