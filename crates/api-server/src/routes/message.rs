//! Message routing endpoint
//!
//! `POST /message` routes the message to a pipeline and returns the final
//! result. Failures are reported as `{"error": {"code", "message"}}` with a
//! stable code; the full error is only logged.

use agent_runner::{CancellationToken, RunnerError};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::routing::RoutingError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

type RouteError = (StatusCode, Json<ErrorResponse>);

fn route_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> RouteError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code,
                message: message.into(),
            },
        }),
    )
}

fn runner_error(err: &RunnerError) -> RouteError {
    match err {
        RunnerError::StageFailed {
            stage_index, cause, ..
        } => {
            let run = cause
                .run_id()
                .map(|id| format!(" (run {})", id))
                .unwrap_or_default();
            route_error(
                StatusCode::BAD_GATEWAY,
                "stage_failed",
                format!("Pipeline stage {} did not complete{}", stage_index, run),
            )
        }
        RunnerError::TerminalFailure { run_id, status, .. } => route_error(
            StatusCode::BAD_GATEWAY,
            "run_failed",
            format!("Run {} ended as {}", run_id, status),
        ),
        RunnerError::PipelineTimeout { stage_index, .. } => route_error(
            StatusCode::GATEWAY_TIMEOUT,
            "pipeline_timeout",
            format!("Pipeline deadline exceeded at stage {}", stage_index),
        ),
        RunnerError::DelegationDepthExceeded { .. } => route_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "delegation_depth_exceeded",
            "Agent delegation went deeper than allowed",
        ),
        RunnerError::Transient { .. } => route_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "upstream_unavailable",
            "The agent platform is unavailable",
        ),
        RunnerError::Backend { .. } => route_error(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "The agent platform rejected the request",
        ),
        RunnerError::UnknownTool { run_id, .. } => route_error(
            StatusCode::BAD_GATEWAY,
            "unknown_tool",
            format!("Run {} called a tool it does not declare", run_id),
        ),
        RunnerError::ToolFailed { .. } => route_error(
            StatusCode::BAD_GATEWAY,
            "tool_failed",
            "A tool call failed",
        ),
        RunnerError::Validation(_) => route_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "configuration_error",
            "The routing configuration is invalid",
        ),
        RunnerError::InvalidState { .. } | RunnerError::MissingToolOutput { .. } => route_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal error",
        ),
    }
}

fn routing_error(err: &RoutingError) -> RouteError {
    match err {
        RoutingError::InvalidRequest(message) => {
            route_error(StatusCode::BAD_REQUEST, "invalid_request", message.clone())
        }
        RoutingError::Unroutable { .. } => route_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unroutable_request",
            "No pipeline matches the request",
        ),
        RoutingError::Runner(err) => runner_error(err),
    }
}

/// POST /message - Route a message to its pipeline
async fn post_message(
    State(state): State<AppState>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, RouteError> {
    let message = match payload {
        Ok(Json(MessageRequest {
            message: Some(message),
        })) if !message.trim().is_empty() => message,
        Ok(_) => {
            return Err(route_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "Field 'message' must be a non-empty string",
            ))
        }
        Err(rejection) => {
            return Err(route_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                rejection.body_text(),
            ))
        }
    };

    // Dropping this handler (client gone) cancels the runs it started
    let cancel = CancellationToken::new();
    let guard = cancel.drop_guard();

    let task_state = state.clone();
    let task = tokio::spawn(async move { task_state.front().route(&message, &cancel).await });
    let outcome = task.await;
    guard.disarm();

    match outcome {
        Ok(Ok(result)) => {
            info!(
                pipeline = %result.pipeline,
                duration_ms = result.total_duration_ms,
                "Message routed"
            );
            Ok(Json(MessageResponse {
                response: result.final_text,
            }))
        }
        Ok(Err(err)) => {
            let response = routing_error(&err);
            if response.0.is_server_error() {
                error!("Message routing failed: {}", err);
            } else {
                warn!("Message rejected: {}", err);
            }
            Err(response)
        }
        Err(join_error) => {
            error!("Message routing task failed: {}", join_error);
            Err(route_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal error",
            ))
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/message", post(post_message))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use agent_runner::scripted::{AgentScript, ScriptedBackend};
    use agent_runner::RunStatus;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::router;
    use crate::state::test_support::build_state;

    const STATIC_CONFIG: &str = r#"{
        "routing": { "policy": "static", "target": "triage" },
        "agents": [
            { "name": "summarizer" },
            { "name": "classifier" }
        ],
        "pipelines": [{
            "name": "triage",
            "stages": [
                { "agent": "summarizer" },
                { "agent": "classifier", "input": { "mode": "template", "template": "Classify: {prior_result}" } }
            ]
        }]
    }"#;

    const CLASSIFIER_CONFIG: &str = r#"{
        "routing": { "policy": "classifier", "agent": "router" },
        "agents": [{ "name": "router" }, { "name": "title" }]
    }"#;

    async fn post(backend: Arc<ScriptedBackend>, config: &str, body: Body) -> (StatusCode, Value) {
        let (state, _temp_dir) = build_state(backend, config).await;
        let response: Response = router()
            .with_state(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/message")
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn json_body(value: Value) -> Body {
        Body::from(value.to_string())
    }

    #[tokio::test]
    async fn static_route_returns_final_result() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_agent("summarizer", AgentScript::reply("Checkout is slow"))
                .with_agent("classifier", AgentScript::echo()),
        );

        let (status, body) = post(
            backend,
            STATIC_CONFIG,
            json_body(json!({ "message": "The checkout page takes a minute to load" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "response": "Classify: Checkout is slow" }));
    }

    #[tokio::test]
    async fn missing_or_empty_message_is_bad_request() {
        for payload in [json!({}), json!({ "message": "" }), json!({ "message": "   " })] {
            let backend = Arc::new(ScriptedBackend::new());
            let (status, body) = post(backend.clone(), STATIC_CONFIG, json_body(payload)).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"]["code"], "invalid_request");
            assert!(backend.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let (status, body) = post(
            Arc::new(ScriptedBackend::new()),
            STATIC_CONFIG,
            Body::from("{ not json"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn unmatched_classification_is_unprocessable() {
        let backend = Arc::new(ScriptedBackend::new().with_agent("router", AgentScript::reply("haiku")));

        let (status, body) = post(
            backend,
            CLASSIFIER_CONFIG,
            json_body(json!({ "message": "write me a haiku" })),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "unroutable_request");
    }

    #[tokio::test]
    async fn classifier_routes_to_named_agent() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_agent("router", AgentScript::reply("title"))
                .with_agent("title", AgentScript::reply("Ten Lessons From Rust")),
        );

        let (status, body) = post(
            backend,
            CLASSIFIER_CONFIG,
            json_body(json!({ "message": "a title for my rust post" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "Ten Lessons From Rust");
    }

    #[tokio::test]
    async fn stage_failure_names_stage_without_internal_detail() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_agent("summarizer", AgentScript::reply("summary"))
                .with_agent("classifier", AgentScript::fail("secret deployment quota exhausted")),
        );

        let (status, body) = post(
            backend,
            STATIC_CONFIG,
            json_body(json!({ "message": "hello" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "stage_failed");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("stage 1"));
        assert!(message.contains("run "));
        assert!(!message.contains("quota"));
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_stops_polling() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "summarizer",
            AgentScript::new().then_status(RunStatus::InProgress),
        ));
        let (state, _temp_dir) = build_state(backend.clone(), STATIC_CONFIG).await;

        let request = router().with_state(state).oneshot(
            Request::builder()
                .method("POST")
                .uri("/message")
                .header("content-type", "application/json")
                .body(json_body(json!({ "message": "hello" })))
                .unwrap(),
        );

        // The client gives up while the first stage is still running
        assert!(tokio::time::timeout(Duration::from_millis(50), request)
            .await
            .is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let polls = backend.get_run_count();
        assert!(polls > 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.get_run_count(), polls);
        assert_eq!(backend.created_runs_for("classifier"), 0);
    }

    #[tokio::test]
    async fn unavailable_platform_is_service_unavailable() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_agent("summarizer", AgentScript::new().then_transient("connection reset")),
        );

        let (status, body) = post(
            backend,
            STATIC_CONFIG,
            json_body(json!({ "message": "hello" })),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "upstream_unavailable");
    }
}
