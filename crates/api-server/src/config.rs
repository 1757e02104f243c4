//! Server configuration
//!
//! Loaded from a JSON file (`RELAY_CONFIG`, default `relay.json`), then
//! selected fields are overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_runner::{ExecutorConfig, HttpBackendConfig, PollConfig};
use relay_core::agent::{Agent, AgentRegistry, ToolRef};
use relay_core::pipeline::PipelineSpec;
use serde::Deserialize;
use thiserror::Error;

use crate::routing::RoutingPolicy;

const DEFAULT_CONFIG_PATH: &str = "relay.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Connection to the agent platform
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSettings {
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            api_key: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// An agent as written in the config file; `model` falls back to the default
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolRef>,
}

impl AgentDefinition {
    pub fn into_agent(self, default_model: &str) -> Agent {
        let model = self.model.unwrap_or_else(|| default_model.to_string());
        self.tools.into_iter().fold(
            Agent::new(self.name, model, self.instructions),
            |agent, tool| agent.with_tool(tool),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default = "default_model")]
    pub default_model: String,

    /// Lifetime of every run
    #[serde(default = "default_run_ttl_ms")]
    pub run_ttl_ms: u64,

    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,

    /// Upper bound on every pipeline's deadline
    #[serde(default)]
    pub pipeline_deadline_ms: Option<u64>,

    #[serde(default)]
    pub poll: PollConfig,

    pub routing: RoutingPolicy,

    #[serde(default)]
    pub agents: Vec<AgentDefinition>,

    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,

    /// Directory holding the catalog data file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backend_url() -> String {
    "http://localhost:4000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_run_ttl_ms() -> u64 {
    120_000
}

fn default_max_delegation_depth() -> u32 {
    3
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".relay-data")
}

impl RelayConfig {
    /// Load the file named by `RELAY_CONFIG` and apply environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `RELAY_PORT`, `AGENT_BACKEND_URL`,
    /// `AGENT_BACKEND_API_KEY` and `RELAY_DATA_DIR`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("RELAY_PORT") {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "RELAY_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(url) = lookup("AGENT_BACKEND_URL") {
            self.backend.base_url = url;
        }
        if let Some(key) = lookup("AGENT_BACKEND_API_KEY") {
            self.backend.api_key = Some(key);
        }
        if let Some(dir) = lookup("RELAY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Register every agent and pipeline, then validate and freeze
    pub fn build_registry(&self) -> relay_core::Result<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        for definition in &self.agents {
            registry.register(definition.clone().into_agent(&self.default_model))?;
        }
        for pipeline in &self.pipelines {
            registry.register_pipeline(pipeline.clone())?;
        }
        registry.validate_acyclic()?;
        Ok(registry)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            run_ttl: Duration::from_millis(self.run_ttl_ms),
            max_delegation_depth: self.max_delegation_depth,
            pipeline_deadline: self.pipeline_deadline_ms.map(Duration::from_millis),
            poll: self.poll.clone(),
        }
    }

    pub fn backend_config(&self) -> HttpBackendConfig {
        let config = HttpBackendConfig::new(&self.backend.base_url)
            .with_request_timeout(Duration::from_millis(self.backend.request_timeout_ms));
        match &self.backend.api_key {
            Some(key) => config.with_api_key(key),
            None => config,
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }
}
