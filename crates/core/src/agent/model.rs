//! Agent model definitions

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An agent hosted by the remote platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Unique, stable name
    pub name: String,

    /// System instructions sent with every run
    pub instructions: String,

    /// Model deployment identifier
    pub model: String,

    /// Tools this agent may invoke, unique by name
    #[serde(default)]
    pub tools: Vec<ToolRef>,
}

impl Agent {
    /// Create a new agent without tools
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            model: model.into(),
            tools: Vec::new(),
        }
    }

    /// Add a tool, replacing any tool with the same name
    pub fn with_tool(mut self, tool: ToolRef) -> Self {
        self.tools.retain(|existing| existing.name() != tool.name());
        self.tools.push(tool);
        self
    }

    /// Declare another agent as a callable sub-agent
    pub fn with_agent_tool(self, agent: impl Into<String>, description: impl Into<String>) -> Self {
        self.with_tool(ToolRef::Agent(AgentTool::new(agent, description)))
    }

    /// Declare a function tool
    pub fn with_function_tool(self, tool: FunctionTool) -> Self {
        self.with_tool(ToolRef::Function(tool))
    }

    /// Look up a declared tool by name
    pub fn tool(&self, name: &str) -> Option<&ToolRef> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    /// Names of the agents this agent delegates to
    pub fn delegates(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().filter_map(|tool| match tool {
            ToolRef::Agent(agent_tool) => Some(agent_tool.agent.as_str()),
            ToolRef::Function(_) => None,
        })
    }
}

/// A tool an agent may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolRef {
    Function(FunctionTool),
    Agent(AgentTool),
}

impl ToolRef {
    /// Name the model uses to call this tool
    pub fn name(&self) -> &str {
        match self {
            Self::Function(tool) => &tool.name,
            Self::Agent(tool) => &tool.agent,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Function(tool) => &tool.description,
            Self::Agent(tool) => &tool.description,
        }
    }

    /// JSON schema of the tool arguments
    pub fn parameters(&self) -> Value {
        match self {
            Self::Function(tool) => tool.parameters.clone(),
            Self::Agent(_) => AgentTool::parameters(),
        }
    }
}

/// A function executed locally when the model calls it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionTool {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON schema of the arguments
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,

    /// Invocation target that handles the call (e.g. "catalog")
    pub target: String,
}

impl FunctionTool {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: empty_object_schema(),
            target: target.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Another registered agent exposed as a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTool {
    /// Name of the wrapped agent; also the tool name
    pub agent: String,

    #[serde(default)]
    pub description: String,
}

impl AgentTool {
    pub fn new(agent: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            description: description.into(),
        }
    }

    /// Sub-agents take a single free-text input
    pub fn parameters() -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": { "type": "string", "description": "Task for the sub-agent" }
            },
            "required": ["input"]
        })
    }
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}
