//! MCP transport: one instance per connected remote agent.
//!
//! Speaks JSON-RPC 2.0 over two interchangeable carriers:
//!
//! - **stdio**: line-delimited JSON on a child process's stdin/stdout.
//!   stderr is captured and logged, never parsed.
//! - **streamable HTTP**: requests POSTed to a single endpoint, responses
//!   framed as Server-Sent Events (one JSON-RPC message per `data:` line).
//!   A session id supplied in an `Mcp-Session-Id` response header is echoed
//!   on every subsequent request.
//!
//! Requests carry a monotonically increasing numeric id per transport
//! instance; notifications carry no id and elicit no response. The advertised
//! protocol version is [`MCP_PROTOCOL_VERSION`]; `initialize` fails with a
//! handshake error on mismatch.
//!
//! Transports do not reconnect on fault. They flip to `failing`/`closed`,
//! push a [`TransportNotice`] to their owner (the fleet), and let it decide.
//! Outstanding requests are capped per transport; excess requests queue in a
//! bounded buffer and overflow fails fast with `Overloaded`.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{ToolDefinition, ToolResult};
use crate::{Error, Result};

/// MCP protocol version this client advertises and requires.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Default cap on concurrently outstanding requests per transport.
const DEFAULT_REQUEST_CAP: usize = 8;
/// Default bound on requests queued behind the cap.
const DEFAULT_QUEUE_LIMIT: usize = 32;
/// Safety-net timeout for a single MCP request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// JSON-RPC ENVELOPES
// ============================================================================

/// Outbound JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request envelope.
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// Outbound JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Build a notification envelope.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// Inbound JSON-RPC 2.0 message: response or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcMessage {
    fn id_i64(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }

    /// Extract the result or surface the error object.
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(Error::other(format!(
                "MCP error {}: {}",
                err.code, err.message
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ============================================================================
// ENDPOINTS, STATUS, NOTICES
// ============================================================================

/// How to reach a remote agent. Serialisable so the fleet can persist its
/// agent registry and rehydrate connections on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum EndpointDescriptor {
    /// Child process speaking line-delimited JSON on stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Streamable HTTP endpoint with SSE responses.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
    },
}

impl EndpointDescriptor {
    /// Open a transport for this endpoint. The transport pushes
    /// [`TransportNotice`]s to `notices` for its whole lifetime.
    pub fn connect(
        &self,
        notices: mpsc::UnboundedSender<TransportNotice>,
    ) -> Result<Arc<dyn McpTransport>> {
        match self {
            EndpointDescriptor::Stdio { command, args } => Ok(Arc::new(StdioTransport::spawn(
                command, args, notices,
            )?)),
            EndpointDescriptor::Http { url, bearer_token } => Ok(Arc::new(HttpTransport::new(
                url.clone(),
                bearer_token.clone(),
                notices,
            )?)),
        }
    }
}

/// Transport lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Connecting,
    Ready,
    Failing,
    Closed,
}

/// Events a transport pushes to its owner.
#[derive(Debug, Clone)]
pub enum TransportNotice {
    /// The server announced `notifications/tools/list_changed`.
    ToolsListChanged,
    /// The transport reached its terminal state.
    Closed { reason: String },
}

/// Uniform client interface over one remote agent.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Perform the MCP handshake. Fails with a handshake error on protocol
    /// version mismatch.
    async fn initialize(&self) -> Result<()>;

    /// Fetch the tools the agent hosts. Definitions come back tagged
    /// `external` with no `server_ref`; the fleet assigns one.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Invoke a hosted tool and wait for its terminal response.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult>;

    /// Close the transport. Idempotent; in-flight calls fail with
    /// `TransportClosed`.
    async fn close(&self);

    /// Current lifecycle state.
    fn status(&self) -> TransportStatus;
}

// ============================================================================
// SHARED PROTOCOL HELPERS
// ============================================================================

fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": {
            "name": "agent-kernel",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Verify the server accepted our protocol version.
fn check_handshake(result: &Value) -> Result<()> {
    let server_version = result
        .get("protocolVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::handshake("initialize result lacks protocolVersion"))?;
    if server_version != MCP_PROTOCOL_VERSION {
        return Err(Error::handshake(format!(
            "protocol version mismatch: client {MCP_PROTOCOL_VERSION}, server {server_version}"
        )));
    }
    Ok(())
}

/// Parse a `tools/list` result into definitions.
fn parse_tool_list(result: &Value) -> Result<Vec<ToolDefinition>> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::other("tools/list result lacks a tools array"))?;

    let mut defs = Vec::with_capacity(tools.len());
    for tool in tools {
        let Some(name) = tool.get("name").and_then(Value::as_str) else {
            warn!("skipping tool entry without a name");
            continue;
        };
        let description = tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let schema = tool
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
        let mut def = ToolDefinition::new(name, description, schema);
        if let Some(display) = tool.get("title").and_then(Value::as_str) {
            def.display_name = display.to_string();
        }
        defs.push(def.into_external(""));
    }
    Ok(defs)
}

/// Normalise a `tools/call` result into a [`ToolResult`].
///
/// Structured content arrays are flattened to their text items; anything else
/// is carried verbatim as JSON text.
fn parse_call_result(tool_name: &str, result: &Value) -> ToolResult {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let text = match result.get("content").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        None => result.to_string(),
    };

    if is_error {
        ToolResult::fail(tool_name, text)
    } else {
        ToolResult::ok(tool_name, text)
    }
}

/// Bounded admission of outstanding requests: up to `cap` run, up to
/// `queue_limit` wait, the rest fail fast with `Overloaded`.
struct RequestGate {
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    queue_limit: usize,
}

impl RequestGate {
    fn new(cap: usize, queue_limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(cap)),
            queued: AtomicUsize::new(0),
            queue_limit,
        }
    }

    async fn admit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(permit);
        }
        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.queue_limit {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Overloaded);
        }
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::TransportClosed);
        self.queued.fetch_sub(1, Ordering::SeqCst);
        permit
    }
}

// ============================================================================
// STREAMABLE HTTP TRANSPORT
// ============================================================================

/// MCP client over streamable HTTP with SSE response bodies.
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
    bearer: Option<String>,
    session_id: StdMutex<Option<String>>,
    next_id: AtomicI64,
    status: StdMutex<TransportStatus>,
    gate: RequestGate,
    cancel: CancellationToken,
    notices: mpsc::UnboundedSender<TransportNotice>,
}

impl HttpTransport {
    /// Create a transport for `url`, optionally authenticating with a bearer
    /// token.
    pub fn new(
        url: String,
        bearer: Option<String>,
        notices: mpsc::UnboundedSender<TransportNotice>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            url,
            bearer,
            session_id: StdMutex::new(None),
            next_id: AtomicI64::new(1),
            status: StdMutex::new(TransportStatus::Connecting),
            gate: RequestGate::new(DEFAULT_REQUEST_CAP, DEFAULT_QUEUE_LIMIT),
            cancel: CancellationToken::new(),
            notices,
        })
    }

    fn set_status(&self, status: TransportStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        if let Some(bearer) = &self.bearer {
            req = req.header("Authorization", format!("Bearer {bearer}"));
        }
        if let Some(session) = self
            .session_id
            .lock()
            .expect("session lock poisoned")
            .clone()
        {
            req = req.header("Mcp-Session-Id", session);
        }
        req
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.status() == TransportStatus::Closed {
            return Err(Error::TransportClosed);
        }
        let _permit = self.gate.admit().await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = JsonRpcRequest::new(id, method, params);

        let send = self.apply_headers(self.http.post(&self.url)).json(&envelope);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::TransportClosed),
            result = send.send() => result.inspect_err(|_| {
                self.set_status(TransportStatus::Failing);
            })?,
        };

        if let Some(session) = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().expect("session lock poisoned") = Some(session.to_string());
        }

        if !response.status().is_success() {
            self.set_status(TransportStatus::Failing);
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::other(format!("MCP endpoint returned {status}: {body}")));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let message = if content_type.starts_with("text/event-stream") {
            self.read_sse_response(response, id).await?
        } else {
            let body = response.bytes().await?;
            serde_json::from_slice::<JsonRpcMessage>(&body)?
        };

        if self.status() == TransportStatus::Failing {
            self.set_status(TransportStatus::Ready);
        }
        message.into_result()
    }

    /// Read SSE frames until the response matching `id` arrives. Server
    /// notifications interleaved in the stream are relayed as notices.
    async fn read_sse_response(
        &self,
        response: reqwest::Response,
        id: i64,
    ) -> Result<JsonRpcMessage> {
        let mut stream = response.bytes_stream().eventsource();
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::TransportClosed),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                return Err(Error::stream(format!(
                    "SSE stream ended before a response for request {id}"
                )));
            };
            let event = event.map_err(|e| Error::stream(format!("SSE error: {e}")))?;
            if event.data.is_empty() {
                continue;
            }
            let message: JsonRpcMessage = serde_json::from_str(&event.data)
                .map_err(|e| Error::stream(format!("malformed JSON-RPC frame: {e}")))?;

            if message.id_i64() == Some(id) {
                return Ok(message);
            }
            self.relay_notification(&message);
        }
    }

    fn relay_notification(&self, message: &JsonRpcMessage) {
        if message.id.is_none()
            && message.method.as_deref() == Some("notifications/tools/list_changed")
        {
            let _ = self.notices.send(TransportNotice::ToolsListChanged);
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let envelope = JsonRpcNotification::new(method, params);
        self.apply_headers(self.http.post(&self.url))
            .json(&envelope)
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn initialize(&self) -> Result<()> {
        self.set_status(TransportStatus::Connecting);
        let result = self.rpc("initialize", Some(initialize_params())).await?;
        check_handshake(&result)?;
        self.notify("notifications/initialized", None).await?;
        self.set_status(TransportStatus::Ready);
        debug!(url = %self.url, "MCP HTTP transport ready");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let result = self.rpc("tools/list", None).await?;
        parse_tool_list(&result)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let result = self
            .rpc(
                "tools/call",
                Some(serde_json::json!({"name": name, "arguments": arguments})),
            )
            .await?;
        Ok(parse_call_result(name, &result))
    }

    async fn close(&self) {
        if self.status() == TransportStatus::Closed {
            return;
        }
        self.set_status(TransportStatus::Closed);
        self.cancel.cancel();
        let _ = self.notices.send(TransportNotice::Closed {
            reason: "closed by client".to_string(),
        });
    }

    fn status(&self) -> TransportStatus {
        *self.status.lock().expect("status lock poisoned")
    }
}

// ============================================================================
// STDIO TRANSPORT
// ============================================================================

/// MCP client over a child process's stdin/stdout.
pub struct StdioTransport {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: StdMutex<Option<Child>>,
    pending: Arc<StdMutex<HashMap<i64, oneshot::Sender<JsonRpcMessage>>>>,
    next_id: AtomicI64,
    status: Arc<StdMutex<TransportStatus>>,
    gate: RequestGate,
    cancel: CancellationToken,
    notices: mpsc::UnboundedSender<TransportNotice>,
}

impl StdioTransport {
    /// Spawn `command args...` and wire up reader tasks.
    pub fn spawn(
        command: &str,
        args: &[String],
        notices: mpsc::UnboundedSender<TransportNotice>,
    ) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::other(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::other("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::other("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::other("child stderr unavailable"))?;

        let pending: Arc<StdMutex<HashMap<i64, oneshot::Sender<JsonRpcMessage>>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let status = Arc::new(StdMutex::new(TransportStatus::Connecting));
        let cancel = CancellationToken::new();

        // Reader task: routes responses to pending callers, relays
        // notifications, and reports EOF as a terminal close.
        {
            let pending = Arc::clone(&pending);
            let status = Arc::clone(&status);
            let notices = notices.clone();
            let cancel = cancel.clone();
            let command = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    let line = tokio::select! {
                        _ = cancel.cancelled() => break,
                        line = lines.next_line() => line,
                    };
                    match line {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => match serde_json::from_str::<JsonRpcMessage>(&line) {
                            Ok(message) => {
                                if let Some(id) = message.id_i64() {
                                    let sender =
                                        pending.lock().expect("pending lock poisoned").remove(&id);
                                    if let Some(sender) = sender {
                                        let _ = sender.send(message);
                                    }
                                } else if message.method.as_deref()
                                    == Some("notifications/tools/list_changed")
                                {
                                    let _ = notices.send(TransportNotice::ToolsListChanged);
                                }
                            }
                            Err(e) => {
                                warn!(command = %command, error = %e, "unparseable stdio frame");
                            }
                        },
                        Ok(None) | Err(_) => break,
                    }
                }
                // EOF or cancellation: fail anything still pending.
                *status.lock().expect("status lock poisoned") = TransportStatus::Closed;
                pending.lock().expect("pending lock poisoned").clear();
                let _ = notices.send(TransportNotice::Closed {
                    reason: format!("stdio stream for '{command}' ended"),
                });
            });
        }

        // stderr is logged, never parsed.
        {
            let command = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "stderr: {line}");
                }
            });
        }

        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            child: StdMutex::new(Some(child)),
            pending,
            next_id: AtomicI64::new(1),
            status,
            gate: RequestGate::new(DEFAULT_REQUEST_CAP, DEFAULT_QUEUE_LIMIT),
            cancel,
            notices,
        })
    }

    fn set_status(&self, status: TransportStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    async fn write_line(&self, line: String) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| Error::TransportClosed)?;
        stdin.write_all(b"\n").await.map_err(|_| Error::TransportClosed)?;
        stdin.flush().await.map_err(|_| Error::TransportClosed)?;
        Ok(())
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.status() == TransportStatus::Closed {
            return Err(Error::TransportClosed);
        }
        let _permit = self.gate.admit().await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let envelope = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&envelope)?;
        if let Err(e) = self.write_line(line).await {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            self.set_status(TransportStatus::Failing);
            return Err(e);
        }

        let message = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.lock().expect("pending lock poisoned").remove(&id);
                return Err(Error::TransportClosed);
            }
            received = rx => received.map_err(|_| Error::TransportClosed)?,
        };
        message.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let envelope = JsonRpcNotification::new(method, params);
        self.write_line(serde_json::to_string(&envelope)?).await
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn initialize(&self) -> Result<()> {
        let result = self.rpc("initialize", Some(initialize_params())).await?;
        check_handshake(&result)?;
        self.notify("notifications/initialized", None).await?;
        self.set_status(TransportStatus::Ready);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let result = self.rpc("tools/list", None).await?;
        parse_tool_list(&result)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let result = self
            .rpc(
                "tools/call",
                Some(serde_json::json!({"name": name, "arguments": arguments})),
            )
            .await?;
        Ok(parse_call_result(name, &result))
    }

    async fn close(&self) {
        if self.status() == TransportStatus::Closed {
            return;
        }
        self.set_status(TransportStatus::Closed);
        self.cancel.cancel();
        if let Some(mut child) = self.child.lock().expect("child lock poisoned").take() {
            let _ = child.start_kill();
        }
        let _ = self.notices.send(TransportNotice::Closed {
            reason: "closed by client".to_string(),
        });
    }

    fn status(&self) -> TransportStatus {
        *self.status.lock().expect("status lock poisoned")
    }
}
