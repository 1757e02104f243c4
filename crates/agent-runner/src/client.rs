//! HTTP adapter for the remote agent platform
//!
//! Speaks a small REST surface:
//!
//! - `POST {base}/threads/{thread}/runs` creates a run
//! - `GET  {base}/threads/{thread}/runs/{run}` reports its state
//! - `POST {base}/threads/{thread}/runs/{run}/tool_outputs` delivers a tool result

use std::time::Duration;

use async_trait::async_trait;
use relay_core::agent::{Agent, ToolRef};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::backend::{AgentBackend, RemoteRun, RunHandle, ToolCallRequest};
use crate::error::{Result, RunnerError};
use crate::event::RunStatus;

/// Connection settings for [`HttpAgentBackend`]
#[derive(Debug, Clone, PartialEq)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentDefinition<'a> {
    name: &'a str,
    model: &'a str,
    instructions: &'a str,
    tools: Vec<ToolDefinition<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDefinition<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    description: &'a str,
    parameters: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunRequest<'a> {
    agent: AgentDefinition<'a>,
    input: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolOutputRequest<'a> {
    tool_call_id: &'a str,
    output: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequiredAction {
    #[serde(default)]
    tool_calls: Vec<ToolCallRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    id: String,
    status: RunStatus,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    required_action: Option<RequiredAction>,
}

impl From<RunResponse> for RemoteRun {
    fn from(response: RunResponse) -> Self {
        Self {
            status: response.status,
            output: response.output,
            error: response.error,
            tool_calls: response
                .required_action
                .map(|action| action.tool_calls)
                .unwrap_or_default(),
        }
    }
}

/// [`AgentBackend`] over HTTP
pub struct HttpAgentBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAgentBackend {
    /// Build the adapter; fails if the HTTP client cannot be configured
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RunnerError::backend(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn runs_url(&self, thread_id: &str) -> String {
        format!(
            "{}/threads/{}/runs",
            self.base_url,
            urlencoding::encode(thread_id)
        )
    }

    fn run_url(&self, thread_id: &str, run_id: &str) -> String {
        format!("{}/{}", self.runs_url(thread_id), urlencoding::encode(run_id))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| classify_send_error(action, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{} returned {}: {}", action, status, body.trim());
        if is_transient_status(status) {
            Err(RunnerError::transient(message))
        } else {
            Err(RunnerError::backend(message))
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn classify_send_error(action: &str, error: reqwest::Error) -> RunnerError {
    let message = format!("{} failed: {}", action, error);
    if error.is_timeout() || error.is_connect() || error.is_request() {
        RunnerError::transient(message)
    } else {
        RunnerError::backend(message)
    }
}

async fn read_run(response: Response, action: &str) -> Result<RunResponse> {
    response
        .json::<RunResponse>()
        .await
        .map_err(|e| RunnerError::backend(format!("{} returned an invalid body: {}", action, e)))
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn create_run(&self, agent: &Agent, thread_id: &str, input: &str) -> Result<RunHandle> {
        let request = CreateRunRequest {
            agent: AgentDefinition {
                name: &agent.name,
                model: &agent.model,
                instructions: &agent.instructions,
                tools: agent
                    .tools
                    .iter()
                    .map(|tool| ToolDefinition {
                        kind: match tool {
                            ToolRef::Function(_) => "function",
                            ToolRef::Agent(_) => "agent",
                        },
                        name: tool.name(),
                        description: tool.description(),
                        parameters: tool.parameters(),
                    })
                    .collect(),
            },
            input,
        };

        let url = self.runs_url(thread_id);
        info!("Creating run for agent {} at {}", agent.name, url);
        let response = self
            .send(self.client.post(&url).json(&request), "create run")
            .await?;
        let run = read_run(response, "create run").await?;

        Ok(RunHandle {
            id: run.id,
            status: run.status,
        })
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RemoteRun> {
        let response = self
            .send(self.client.get(self.run_url(thread_id, run_id)), "get run")
            .await?;
        let run = read_run(response, "get run").await?;
        debug!("Run {} reported {}", run.id, run.status);
        Ok(run.into())
    }

    async fn submit_tool_result(
        &self,
        thread_id: &str,
        run_id: &str,
        tool_call_id: &str,
        output: &str,
    ) -> Result<()> {
        let url = format!("{}/tool_outputs", self.run_url(thread_id, run_id));
        let request = ToolOutputRequest {
            tool_call_id,
            output,
        };
        self.send(self.client.post(url).json(&request), "submit tool output")
            .await?;
        Ok(())
    }
}
