//! MCP server boundary.
//!
//! Exposes the kernel itself over the same JSON-RPC surface its client fleet
//! speaks: `initialize`, `tools/list`, `tools/get`, `tools/call`, POSTed to
//! `/mcp` and answered as SSE frames. Inbound `tools/call` requests are
//! handed to the execution manager's unified dispatch, so external callers
//! get the same validation, approval and quota pipeline as the turn engine.
//!
//! Authentication is a bearer token compared in constant time. A
//! `tools/call` whose params carry `"stream": true` uses the streaming
//! variant: one SSE notification per execution state transition, then the
//! final response frame.
//!
//! The JSON-RPC dispatch is a pure async function over the request value, so
//! the protocol surface is testable without a socket; the axum router is a
//! thin shell around it.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures::Stream;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::executor::ExecutionManager;
use crate::registry::{ToolFilter, ToolRegistry};
use crate::transport::MCP_PROTOCOL_VERSION;
use crate::types::{ExecutionState, ToolCall, ToolResult};
use crate::Result;

/// Shared state behind the MCP routes.
pub struct McpServerState {
    registry: Arc<ToolRegistry>,
    executor: Arc<ExecutionManager>,
    auth_token: Option<String>,
}

impl McpServerState {
    /// Create the server state.
    pub fn new(
        registry: Arc<ToolRegistry>,
        executor: Arc<ExecutionManager>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            registry,
            executor,
            auth_token,
        }
    }

    /// Constant-time bearer check. No configured token means open access.
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.auth_token else {
            return true;
        };
        let Some(supplied) = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        constant_time_eq(supplied, expected)
    }
}

/// Compare two tokens without short-circuiting on the first mismatch.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ============================================================================
// JSON-RPC DISPATCH
// ============================================================================

fn rpc_result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn tool_entry(name: &str, description: &str, schema: &Value) -> Value {
    json!({"name": name, "description": description, "inputSchema": schema})
}

fn call_result_payload(result: &ToolResult) -> Value {
    json!({
        "content": [{"type": "text", "text": result.llm_content}],
        "isError": !result.success,
    })
}

/// Handle one JSON-RPC request value; returns `None` for notifications,
/// which must not elicit a response.
pub async fn dispatch(state: &McpServerState, request: &Value) -> Option<Value> {
    let method = request.get("method").and_then(Value::as_str)?;
    let id = request.get("id").cloned();
    let Some(id) = id else {
        debug!(%method, "notification received");
        return None;
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let response = match method {
        "initialize" => rpc_result(
            &id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {
                    "name": "agent-kernel",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        ),
        "tools/list" => {
            let tools: Vec<Value> = state
                .registry
                .list(&ToolFilter::default())
                .iter()
                .map(|t| {
                    tool_entry(
                        &t.definition.name,
                        &t.definition.description,
                        &t.definition.parameter_schema,
                    )
                })
                .collect();
            rpc_result(&id, json!({"tools": tools}))
        }
        "tools/get" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(rpc_error(&id, -32602, "params.name is required"));
            };
            match state.registry.lookup(name) {
                Some(tool) => rpc_result(
                    &id,
                    tool_entry(
                        &tool.definition.name,
                        &tool.definition.description,
                        &tool.definition.parameter_schema,
                    ),
                ),
                None => rpc_error(&id, -32602, &format!("unknown tool '{name}'")),
            }
        }
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(rpc_error(&id, -32602, "params.name is required"));
            };
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            let call = ToolCall::new(format!("mcp-{}", uuid::Uuid::new_v4()), name, &arguments);
            let result = state
                .executor
                .execute_tool_call(&call, &tokio_util::sync::CancellationToken::new())
                .await;
            rpc_result(&id, call_result_payload(&result))
        }
        other => rpc_error(&id, -32601, &format!("method '{other}' is not supported")),
    };
    Some(response)
}

/// Whether a `tools/call` request asked for the streaming variant.
fn wants_stream(request: &Value) -> bool {
    request.get("method").and_then(Value::as_str) == Some("tools/call")
        && request
            .pointer("/params/stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

/// Streaming `tools/call`: one notification per execution state transition,
/// then the final response frame.
fn dispatch_streaming(
    state: &Arc<McpServerState>,
    request: &Value,
) -> impl Stream<Item = std::result::Result<Event, std::convert::Infallible>> + use<> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let name = request
        .pointer("/params/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let arguments = request
        .pointer("/params/arguments")
        .cloned()
        .unwrap_or(json!({}));

    let (tx, rx) = tokio::sync::mpsc::channel::<Value>(16);
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let execution_id = match state.executor.submit(&name, arguments) {
            Ok(id) => id,
            Err(e) => {
                let _ = tx.send(rpc_error(&id, -32602, &e.to_string())).await;
                return;
            }
        };
        let Some(mut watcher) = state.executor.watch_execution(execution_id) else {
            let _ = tx
                .send(rpc_error(&id, -32603, "execution watcher unavailable"))
                .await;
            return;
        };

        loop {
            let execution_state = *watcher.borrow_and_update();
            let _ = tx
                .send(json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/execution/state",
                    "params": {
                        "executionId": execution_id.to_string(),
                        "state": execution_state,
                    }
                }))
                .await;
            if execution_state == ExecutionState::Completed {
                break;
            }
            if watcher.changed().await.is_err() {
                break;
            }
        }

        let payload = state
            .executor
            .execution(execution_id)
            .and_then(|record| record.result)
            .map(|result| call_result_payload(&result))
            .unwrap_or_else(|| json!({"content": [], "isError": true}));
        let _ = tx.send(rpc_result(&id, payload)).await;
    });

    ReceiverStream::new(rx).map(|value| Ok(Event::default().data(value.to_string())))
}

// ============================================================================
// AXUM SURFACE
// ============================================================================

/// Build the MCP router.
pub fn router(state: Arc<McpServerState>) -> Router {
    Router::new().route("/mcp", post(handle_mcp)).with_state(state)
}

async fn handle_mcp(
    State(state): State<Arc<McpServerState>>,
    headers: HeaderMap,
    body: axum::Json<Value>,
) -> Response {
    if !state.authorize(&headers) {
        warn!("rejected MCP request with bad credentials");
        return (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response();
    }
    let request = body.0;

    if wants_stream(&request) {
        return Sse::new(dispatch_streaming(&state, &request))
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    match dispatch(&state, &request).await {
        // Notifications are accepted and never answered.
        None => StatusCode::ACCEPTED.into_response(),
        Some(response) => {
            let frame = futures::stream::once(async move {
                Ok::<_, std::convert::Infallible>(Event::default().data(response.to_string()))
            });
            Sse::new(frame).into_response()
        }
    }
}

/// Bind and serve the MCP surface; resolves when the listener is bound and
/// returns the serving task.
pub async fn serve(
    state: Arc<McpServerState>,
    addr: std::net::SocketAddr,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::Error::other(format!("cannot bind MCP listener on {addr}: {e}")))?;
    let app = router(state);
    debug!(%addr, "MCP server listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "MCP server exited");
        }
    }))
}
