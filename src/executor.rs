//! Tool execution manager.
//!
//! The unified dispatch point for every tool call, local or external. One
//! pipeline runs regardless of origin:
//!
//! 1. record a [`ToolExecution`] in `validating`
//! 2. look the tool up in the registry (`ToolNotFound` when missing)
//! 3. validate parameters against the definition's JSON Schema (draft-07)
//! 4. consult the approval policy, suspending on the approval queue when a
//!    decision is needed
//! 5. admit through the concurrency quotas: the global cap queues, the
//!    per-tool cap fails fast with `QuotaExceeded`
//! 6. dispatch: local handler under timeout + cancellation, or the hosting
//!    MCP transport via the fleet
//! 7. normalise the payload into a [`ToolResult`]
//! 8. complete the record, timestamps at every edge
//!
//! Failures at any step become failed `ToolResult`s rather than propagating;
//! the turn engine feeds them back to the LLM as signals. The manager
//! exclusively owns its [`ToolExecution`] records; everything else reads
//! snapshots or a [`watch`] stream of state transitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::approval::{ApprovalDecision, ApprovalHandler, ApprovalPolicy, ApprovalRequest, ApproveAll};
use crate::config::KernelConfig;
use crate::fleet::McpFleet;
use crate::registry::ToolRegistry;
use crate::tools::LocalTool;
use crate::types::{
    ExecutionState, ToolCall, ToolDefinition, ToolExecution, ToolOrigin, ToolResult,
};
use crate::{Error, Result};

/// Unified dispatcher for tool calls.
pub struct ExecutionManager {
    registry: Arc<ToolRegistry>,
    fleet: Arc<McpFleet>,
    local: StdRwLock<HashMap<String, LocalTool>>,
    approvals: Arc<dyn ApprovalHandler>,
    policy: ApprovalPolicy,
    global_slots: Arc<Semaphore>,
    per_tool: StdMutex<HashMap<String, Arc<Semaphore>>>,
    per_tool_cap: usize,
    default_timeout: Duration,
    executions: StdRwLock<HashMap<Uuid, ToolExecution>>,
    watchers: StdMutex<HashMap<Uuid, watch::Sender<ExecutionState>>>,
}

impl ExecutionManager {
    /// Create a manager wired to the registry and fleet, with approvals
    /// granted automatically (override with
    /// [`with_approval_handler`](Self::with_approval_handler)).
    pub fn new(registry: Arc<ToolRegistry>, fleet: Arc<McpFleet>, config: &KernelConfig) -> Self {
        Self {
            registry,
            fleet,
            local: StdRwLock::new(HashMap::new()),
            approvals: Arc::new(ApproveAll),
            policy: ApprovalPolicy::default(),
            global_slots: Arc::new(Semaphore::new(config.global_tool_concurrency)),
            per_tool: StdMutex::new(HashMap::new()),
            per_tool_cap: config.per_tool_concurrency,
            default_timeout: config.default_tool_timeout,
            executions: StdRwLock::new(HashMap::new()),
            watchers: StdMutex::new(HashMap::new()),
        }
    }

    /// Replace the approval handler.
    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approvals = handler;
        self
    }

    /// Replace the approval policy data.
    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a local tool: its definition goes into the registry, its
    /// handler into the local dispatch table.
    pub fn register_tool(&self, tool: LocalTool) -> Result<()> {
        self.registry.register_local(tool.definition().clone())?;
        self.local
            .write()
            .expect("local table lock poisoned")
            .insert(tool.name().to_string(), tool);
        Ok(())
    }

    /// Snapshot of a tracked execution.
    pub fn execution(&self, id: Uuid) -> Option<ToolExecution> {
        self.executions
            .read()
            .expect("executions lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Watch an execution's state transitions. The receiver immediately
    /// holds the current state.
    pub fn watch_execution(&self, id: Uuid) -> Option<watch::Receiver<ExecutionState>> {
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .get(&id)
            .map(watch::Sender::subscribe)
    }

    /// Execute one tool call to completion. Never fails: every error is
    /// folded into a failed [`ToolResult`] so the turn can continue.
    pub async fn execute_tool_call(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let started = Utc::now();
        let name = call.name().to_string();

        let mode = self
            .registry
            .lookup(&name)
            .map(|t| t.definition.approval_mode)
            .unwrap_or_default();
        let parameters = call.parsed_arguments().unwrap_or(Value::Null);
        let execution_id = self.track(ToolExecution::new(&name, parameters, mode));

        let outcome = self.run(execution_id, call, cancel).await;
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                debug!(tool = %name, error = %e, "tool call failed");
                ToolResult::fail(&name, error_text(&e))
            }
        }
        .with_window(started, Utc::now());

        self.finish(execution_id, result.clone());
        result
    }

    /// Asynchronous submission with execution tracking, used by the MCP
    /// server boundary. The execution runs on a background task; observe it
    /// via [`execution`](Self::execution) / [`watch_execution`](Self::watch_execution).
    pub fn submit(self: &Arc<Self>, tool_name: &str, parameters: Value) -> Result<Uuid> {
        if !self.registry.has(tool_name) {
            return Err(Error::ToolNotFound(tool_name.to_string()));
        }
        let mode = self
            .registry
            .lookup(tool_name)
            .map(|t| t.definition.approval_mode)
            .unwrap_or_default();
        let record = ToolExecution::new(tool_name, parameters.clone(), mode);
        let execution_id = self.track(record);

        let call = ToolCall::new(format!("exec-{execution_id}"), tool_name, &parameters);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let started = Utc::now();
            let outcome = manager.run(execution_id, &call, &cancel).await;
            let result = match outcome {
                Ok(result) => result,
                Err(e) => ToolResult::fail(call.name(), error_text(&e)),
            }
            .with_window(started, Utc::now());
            manager.finish(execution_id, result);
        });

        Ok(execution_id)
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn run(
        &self,
        execution_id: Uuid,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        let name = call.name();

        // Lookup.
        let registered = self
            .registry
            .lookup(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;
        let definition = registered.definition;

        // Validation.
        let parameters = call.parsed_arguments()?;
        validate_parameters(&definition, &parameters)?;

        // Approval.
        if self.policy.requires_approval(&definition) {
            self.advance(execution_id, ExecutionState::AwaitingApproval);
            let request = ApprovalRequest {
                execution_id,
                tool_name: name.to_string(),
                parameters: parameters.clone(),
                mode: definition.approval_mode,
            };
            let decision = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                decision = self.approvals.decide(&request) => decision,
            };
            match decision {
                ApprovalDecision::Approved => self.mark_approved(execution_id),
                ApprovalDecision::Denied(reason) => return Err(Error::ApprovalDenied(reason)),
            }
        }

        // Quotas: global admission queues, per-tool admission fails fast.
        self.advance(execution_id, ExecutionState::Scheduled);
        let _global = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.global_slots.clone().acquire_owned() => {
                permit.map_err(|_| Error::other("global tool semaphore closed"))?
            }
        };
        let _per_tool = self
            .per_tool_semaphore(name)
            .try_acquire_owned()
            .map_err(|_| Error::QuotaExceeded(name.to_string()))?;

        // Dispatch.
        self.advance(execution_id, ExecutionState::Executing);
        let timeout = definition
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        match definition.origin {
            ToolOrigin::Local => self.dispatch_local(&definition, parameters, timeout, cancel).await,
            ToolOrigin::External => {
                self.dispatch_external(&definition, parameters, timeout, cancel)
                    .await
            }
        }
    }

    async fn dispatch_local(
        &self,
        definition: &ToolDefinition,
        parameters: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        let name = &definition.name;
        let tool = self
            .local
            .read()
            .expect("local table lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::tool_unavailable(name, "no local handler registered"))?;

        let execution = tool.execute(parameters);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(timeout, execution) => match outcome {
                Err(_) => Err(Error::ToolTimeout { name: name.clone(), timeout }),
                Ok(Ok(payload)) => Ok(normalize_payload(name, payload)),
                Ok(Err(e)) => Ok(ToolResult::fail(name, e.to_string())),
            },
        }
    }

    async fn dispatch_external(
        &self,
        definition: &ToolDefinition,
        parameters: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        let name = &definition.name;
        let server = definition
            .server_ref
            .as_deref()
            .ok_or_else(|| Error::tool_unavailable(name, "external tool lacks a server_ref"))?;

        let call = self.fleet.call(server, name, parameters);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(timeout, call) => match outcome {
                Err(_) => Err(Error::ToolTimeout { name: name.clone(), timeout }),
                Ok(result) => result,
            },
        }
    }

    // ------------------------------------------------------------------
    // Record keeping
    // ------------------------------------------------------------------

    fn track(&self, record: ToolExecution) -> Uuid {
        let id = record.execution_id;
        let (tx, _) = watch::channel(record.state);
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .insert(id, tx);
        self.executions
            .write()
            .expect("executions lock poisoned")
            .insert(id, record);
        id
    }

    fn advance(&self, id: Uuid, state: ExecutionState) {
        if let Some(record) = self
            .executions
            .write()
            .expect("executions lock poisoned")
            .get_mut(&id)
        {
            record.advance(state);
        }
        if let Some(tx) = self.watchers.lock().expect("watchers lock poisoned").get(&id) {
            let _ = tx.send(state);
        }
    }

    fn mark_approved(&self, id: Uuid) {
        if let Some(record) = self
            .executions
            .write()
            .expect("executions lock poisoned")
            .get_mut(&id)
        {
            record.approved = true;
        }
    }

    fn finish(&self, id: Uuid, result: ToolResult) {
        if let Some(record) = self
            .executions
            .write()
            .expect("executions lock poisoned")
            .get_mut(&id)
        {
            record.complete(result);
        }
        if let Some(tx) = self.watchers.lock().expect("watchers lock poisoned").get(&id) {
            let _ = tx.send(ExecutionState::Completed);
        }
    }

    fn per_tool_semaphore(&self, name: &str) -> Arc<Semaphore> {
        let mut map = self.per_tool.lock().expect("per-tool lock poisoned");
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_tool_cap))),
        )
    }
}

/// Validate `parameters` against a definition's draft-07 schema; all
/// violations are joined into one message.
fn validate_parameters(definition: &ToolDefinition, parameters: &Value) -> Result<()> {
    let schema = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&definition.parameter_schema)
        .map_err(|e| {
            Error::invalid_parameters(format!(
                "tool '{}' carries an invalid schema: {e}",
                definition.name
            ))
        })?;

    if let Err(errors) = schema.validate(parameters) {
        let messages: Vec<String> = errors
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();
        return Err(Error::invalid_parameters(messages.join("; ")));
    }
    Ok(())
}

/// Normalise a local tool's payload into a [`ToolResult`].
///
/// A payload already shaped like a `ToolResult` passes through; a bare
/// string becomes both the LLM content and the display; anything else is
/// carried as compact JSON.
fn normalize_payload(tool_name: &str, payload: Value) -> ToolResult {
    if payload.is_object() && payload.get("llm_content").is_some() && payload.get("success").is_some()
    {
        if let Ok(result) = serde_json::from_value::<ToolResult>(payload.clone()) {
            return result;
        }
        warn!(tool = %tool_name, "payload looked like a ToolResult but failed to parse");
    }
    let text = match payload {
        Value::String(s) => s,
        other => other.to_string(),
    };
    ToolResult::ok(tool_name, text)
}

/// Render an error as the `error` field of a failed tool result. Marker
/// errors read as their bare kind so callers can match on them.
fn error_text(error: &Error) -> String {
    match error {
        Error::TransportClosed | Error::Cancelled | Error::Overloaded | Error::DomainLoading => {
            error.kind().to_string()
        }
        Error::InvalidParameters(_) => error.to_string(),
        _ => format!("{}: {error}", error.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::local_tool;
    use serde_json::json;

    fn config() -> KernelConfig {
        KernelConfig::builder()
            .llm_endpoint("http://localhost:1234/v1")
            .llm_model("test-model")
            .per_tool_concurrency(1)
            .global_tool_concurrency(4)
            .build()
            .unwrap()
    }

    fn manager() -> Arc<ExecutionManager> {
        let registry = Arc::new(ToolRegistry::new());
        let fleet = Arc::new(McpFleet::new(Arc::clone(&registry), None));
        Arc::new(ExecutionManager::new(registry, fleet, &config()))
    }

    fn echo_tool() -> LocalTool {
        local_tool("echo", "Echo the input back")
            .param("text", "string")
            .build(|args| async move {
                Ok(json!(args["text"].as_str().unwrap_or_default().to_string()))
            })
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let manager = manager();
        manager.register_tool(echo_tool()).unwrap();

        let call = ToolCall::new("c1", "echo", &json!({"text": "hi"}));
        let result = manager.execute_tool_call(&call, &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.llm_content, "hi");
        assert!(result.completed_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_without_aborting() {
        let manager = manager();
        let call = ToolCall::new("c1", "nope", &json!({}));
        let result = manager.execute_tool_call(&call, &CancellationToken::new()).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("ToolNotFound"));
    }

    #[tokio::test]
    async fn test_schema_validation_rejects_bad_parameters() {
        let manager = manager();
        manager.register_tool(echo_tool()).unwrap();

        // Missing the required "text" property.
        let call = ToolCall::new("c1", "echo", &json!({"wrong": 1}));
        let result = manager.execute_tool_call(&call, &CancellationToken::new()).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().starts_with("invalid parameters"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failed_result() {
        let manager = manager();
        let failing = local_tool("boom", "Always fails").build(|_| async {
            Err(Error::other("kaput"))
        });
        manager.register_tool(failing).unwrap();

        let call = ToolCall::new("c1", "boom", &json!({}));
        let result = manager.execute_tool_call(&call, &CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("kaput"));
    }

    #[tokio::test]
    async fn test_timeout_produces_tool_timeout() {
        let manager = manager();
        let slow = local_tool("slow", "Sleeps forever")
            .timeout_secs(1)
            .build(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({}))
            });
        manager.register_tool(slow).unwrap();

        tokio::time::pause();
        let call = ToolCall::new("c1", "slow", &json!({}));
        let manager2 = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            manager2.execute_tool_call(&call, &CancellationToken::new()).await
        });
        tokio::time::advance(Duration::from_secs(2)).await;
        let result = handle.await.unwrap();

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("ToolTimeout"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_execution() {
        let manager = manager();
        let slow = local_tool("slow", "Sleeps")
            .build(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({}))
            });
        manager.register_tool(slow).unwrap();

        let cancel = CancellationToken::new();
        let call = ToolCall::new("c1", "slow", &json!({}));
        let manager2 = Arc::clone(&manager);
        let child = cancel.child_token();
        let handle =
            tokio::spawn(async move { manager2.execute_tool_call(&call, &child).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = handle.await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Cancelled"));
    }

    #[tokio::test]
    async fn test_per_tool_quota_fails_fast() {
        let manager = manager();
        let slow = local_tool("slow", "Sleeps briefly").build(|_| async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(json!("done"))
        });
        manager.register_tool(slow).unwrap();

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let call = ToolCall::new("c1", "slow", &json!({}));
                manager.execute_tool_call(&call, &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // per_tool_concurrency = 1: the second concurrent call is refused.
        let call = ToolCall::new("c2", "slow", &json!({}));
        let second = manager.execute_tool_call(&call, &CancellationToken::new()).await;
        assert!(!second.success);
        assert!(second.error.as_deref().unwrap().contains("QuotaExceeded"));

        assert!(first.await.unwrap().success);
    }

    #[tokio::test]
    async fn test_approval_denied() {
        let registry = Arc::new(ToolRegistry::new());
        let fleet = Arc::new(McpFleet::new(Arc::clone(&registry), None));
        let manager = Arc::new(
            ExecutionManager::new(registry, fleet, &config())
                .with_approval_handler(Arc::new(crate::approval::DenyAll("not today".into()))),
        );
        let gated = local_tool("gated", "Needs approval")
            .approval_required()
            .build(|_| async { Ok(json!("ran")) });
        manager.register_tool(gated).unwrap();

        let call = ToolCall::new("c1", "gated", &json!({}));
        let result = manager.execute_tool_call(&call, &CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("ApprovalDenied"));
        assert!(result.error.as_deref().unwrap().contains("not today"));
    }

    #[tokio::test]
    async fn test_execution_record_lifecycle() {
        let manager = manager();
        manager.register_tool(echo_tool()).unwrap();

        let execution_id = manager.submit("echo", json!({"text": "tracked"})).unwrap();
        let mut watcher = manager.watch_execution(execution_id).unwrap();

        // Wait for the terminal state.
        while *watcher.borrow() != ExecutionState::Completed {
            watcher.changed().await.unwrap();
        }

        let record = manager.execution(execution_id).unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
        assert!(record.completed_at.is_some());
        let result = record.result.unwrap();
        assert!(result.success);
        assert_eq!(result.llm_content, "tracked");
    }

    #[tokio::test]
    async fn test_submit_unknown_tool_rejected() {
        let manager = manager();
        assert!(manager.submit("ghost", json!({})).is_err());
    }

    #[test]
    fn test_normalize_payload_variants() {
        let bare = normalize_payload("t", json!("plain text"));
        assert_eq!(bare.llm_content, "plain text");

        let object = normalize_payload("t", json!({"a": 1}));
        assert_eq!(object.llm_content, r#"{"a":1}"#);

        let shaped = normalize_payload(
            "t",
            serde_json::to_value(ToolResult::fail("t", "structured failure")).unwrap(),
        );
        assert!(!shaped.success);
        assert_eq!(shaped.error.as_deref(), Some("structured failure"));
    }
}
