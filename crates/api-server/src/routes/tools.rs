//! Catalog tool endpoint
//!
//! `POST /mcp` speaks JSON-RPC 2.0 with the `initialize`, `tools/list` and
//! `tools/call` methods. Notifications are accepted and ignored.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::catalog_tools::{CatalogTools, ToolCallError};
use crate::state::AppState;

const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn list_tools() -> Value {
    let tools: Vec<Value> = CatalogTools::definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.parameters,
            })
        })
        .collect();
    json!({ "tools": tools })
}

async fn call_tool(catalog: &CatalogTools, id: Value, params: Value) -> RpcResponse {
    let params: CallParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => return RpcResponse::failure(id, INVALID_PARAMS, format!("Invalid params: {}", e)),
    };

    match catalog.call(&params.name, &params.arguments).await {
        Ok(result) => {
            let mut body = json!({
                "content": [{ "type": "text", "text": result.text }],
                "isError": false,
            });
            if let Some(structured) = result.structured {
                body["structuredContent"] = structured;
            }
            RpcResponse::success(id, body)
        }
        Err(err @ (ToolCallError::UnknownTool(_) | ToolCallError::InvalidArguments { .. })) => {
            warn!("Rejected tool call: {}", err);
            RpcResponse::failure(id, INVALID_PARAMS, err.to_string())
        }
        Err(ToolCallError::Store(err)) => {
            error!("Catalog tool {} failed: {}", params.name, err);
            RpcResponse::failure(id, INTERNAL_ERROR, "Internal error")
        }
    }
}

/// POST /mcp - JSON-RPC tool surface for the catalog
async fn handle_rpc(State(state): State<AppState>, body: String) -> Response {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return Json(RpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {}", e)))
                .into_response()
        }
    };

    let request: RpcRequest = match serde_json::from_value::<RpcRequest>(value) {
        Ok(request) if request.jsonrpc == "2.0" => request,
        _ => {
            return Json(RpcResponse::failure(Value::Null, INVALID_REQUEST, "Invalid request"))
                .into_response()
        }
    };

    let Some(id) = request.id else {
        return StatusCode::ACCEPTED.into_response();
    };

    let response = match request.method.as_str() {
        "initialize" => RpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "agent-relay-catalog",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => RpcResponse::success(id, list_tools()),
        "tools/call" => call_tool(state.catalog(), id, request.params).await,
        other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    };
    Json(response).into_response()
}

pub fn router() -> Router<AppState> {
    Router::new().route("/mcp", post(handle_rpc))
}
