//! Core type definitions for the orchestration kernel.
//!
//! Three families of types live here:
//!
//! - **Work units and history**: [`PromptObject`], [`Message`], [`Session`];
//!   what a caller hands the turn engine and what accumulates as the turn
//!   runs.
//! - **Tooling**: [`ToolCall`], [`ToolDefinition`], [`ToolResult`],
//!   [`ToolExecution`]; the uniform shapes shared by local tools and
//!   MCP-hosted external tools.
//! - **Wire format**: the OpenAI-compatible request/response/chunk structs
//!   ([`ChatRequest`], [`ChatCompletion`], [`ChatChunk`] and their deltas)
//!   used by the provider adapter. These are public so test doubles can
//!   script streams against the [`LlmProvider`](crate::LlmProvider)
//!   trait.
//!
//! Internal kernel types and the wire format are deliberately distinct: the
//! kernel's [`Message`] carries timestamps and metadata the wire never sees,
//! and the wire's argument strings stay JSON-encoded until a component
//! actually needs them parsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

// ============================================================================
// MESSAGES
// ============================================================================

/// Identifies the sender of a message. Serialises to lowercase strings to
/// match the chat-completions convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions and context established ahead of the conversation.
    System,
    /// Input from the human or calling application.
    User,
    /// Model output, possibly carrying tool-call requests.
    Assistant,
    /// Result of a tool execution, correlated by `tool_call_id`.
    Tool,
}

impl Role {
    /// The wire-format role string.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One conversation message.
///
/// A `tool` message always carries the `tool_call_id` of the assistant
/// message that requested it; an assistant message that requested tools keeps
/// its [`ToolCall`]s so history can be replayed to the LLM verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message.
    pub role: Role,
    /// Text content. Empty for assistant messages that only request tools.
    pub content: String,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Id of the tool call this message answers (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name for tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// When the message was recorded.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata attached by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    /// Creates a plain assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    /// Creates an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        let mut msg = Self::base(Role::Assistant, content);
        msg.tool_calls = Some(tool_calls);
        msg
    }

    /// Creates a tool-result message answering `tool_call_id`.
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(name.into());
        msg
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Convert into the wire shape sent to the LLM.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            role: self.role.as_str().to_string(),
            content: if self.content.is_empty() && self.tool_calls.is_some() {
                None
            } else {
                Some(self.content.clone())
            },
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
            name: self.name.clone(),
        }
    }

    /// Rough character weight of this message, used for context-size caps.
    pub fn char_weight(&self) -> usize {
        let calls = self
            .tool_calls
            .as_ref()
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| c.function.name.len() + c.function.arguments.len() + c.id.len())
                    .sum()
            })
            .unwrap_or(0);
        self.content.len() + calls
    }
}

// ============================================================================
// TOOL CALLS AND DEFINITIONS
// ============================================================================

/// A tool-call request in OpenAI-compatible shape.
///
/// `function.arguments` is a JSON-*encoded string* (a wire-format quirk);
/// use [`ToolCall::parsed_arguments`] for the decoded mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique id within a turn, generated by the model.
    pub id: String,
    /// Always `"function"` in the current protocol.
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    /// The requested function and its encoded arguments.
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

/// Name plus JSON-encoded arguments of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    /// Tool name; must be present in the registry at dispatch time.
    pub name: String,
    /// Arguments as a JSON-encoded string.
    pub arguments: String,
}

impl ToolCall {
    /// Build a call from a name and already-parsed arguments.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.to_string(),
            },
        }
    }

    /// The tool name this call targets.
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Decode the argument string. An empty string decodes to `{}`.
    pub fn parsed_arguments(&self) -> Result<Value> {
        if self.function.arguments.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.function.arguments).map_err(|e| {
            Error::invalid_parameters(format!(
                "tool call '{}' carries malformed arguments: {e}",
                self.id
            ))
        })
    }
}

/// Where a tool's implementation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOrigin {
    /// Registered in-process with a handler.
    Local,
    /// Hosted by an external agent behind an MCP transport.
    External,
}

/// Approval behaviour for a tool.
///
/// `default` and `yolo` are fully specified; `auto_edit` and `plan` consult
/// the caller-supplied [`ApprovalPolicy`](crate::ApprovalPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Ask iff the definition sets `approval_required`.
    #[default]
    Default,
    /// Auto-approve operations on the policy whitelist; ask otherwise.
    AutoEdit,
    /// Auto-approve operations covered by the plan token; ask otherwise.
    Plan,
    /// Never ask.
    Yolo,
}

/// Descriptor of a tool: identity, parameter schema and policy knobs.
///
/// Names are globally unique within the registry. For external tools
/// `server_ref` identifies the hosting MCP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-facing name; defaults to `name`.
    #[serde(default)]
    pub display_name: String,
    /// Description sent to the LLM.
    pub description: String,
    /// JSON Schema (draft-07) for the parameters object.
    pub parameter_schema: Value,
    /// Whether `default` approval mode should ask.
    #[serde(default)]
    pub approval_required: bool,
    /// Approval behaviour.
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// Where the implementation lives.
    #[serde(default = "default_origin")]
    pub origin: ToolOrigin,
    /// Hosting agent id for external tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ref: Option<String>,
    /// Per-tool execution timeout in seconds; falls back to the kernel's
    /// `default_tool_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_origin() -> ToolOrigin {
    ToolOrigin::Local
}

impl ToolDefinition {
    /// Create a local definition with the given schema.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: Value,
    ) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: description.into(),
            parameter_schema,
            approval_required: false,
            approval_mode: ApprovalMode::Default,
            origin: ToolOrigin::Local,
            server_ref: None,
            timeout_secs: None,
        }
    }

    /// Mark the tool as requiring approval under `default` mode.
    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.approval_required = required;
        self
    }

    /// Override the approval mode.
    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    /// Override the per-tool timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Re-tag the definition as hosted by an external agent.
    pub fn into_external(mut self, server_ref: impl Into<String>) -> Self {
        self.origin = ToolOrigin::External;
        self.server_ref = Some(server_ref.into());
        self
    }

    /// The OpenAI function-calling entry for this tool.
    pub fn to_function_schema(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameter_schema,
            }
        })
    }
}

// ============================================================================
// TOOL RESULTS AND EXECUTIONS
// ============================================================================

/// Uniform result of a tool execution, local or remote.
///
/// When `success` is false, `error` is always non-empty; the constructors
/// enforce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Name of the executed tool.
    pub tool_name: String,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Text fed back to the LLM.
    pub llm_content: String,
    /// Human-readable rendering for UIs.
    pub return_display: String,
    /// Failure description; present iff `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution completed.
    pub completed_at: DateTime<Utc>,
}

impl ToolResult {
    /// Successful result with identical LLM and display content.
    pub fn ok(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            tool_name: tool_name.into(),
            success: true,
            llm_content: content.clone(),
            return_display: content,
            error: None,
            started_at: now,
            completed_at: now,
        }
    }

    /// Failed result. The error text doubles as LLM content so the model can
    /// adapt to the failure.
    pub fn fail(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        let error = if error.is_empty() {
            "unspecified tool failure".to_string()
        } else {
            error
        };
        let now = Utc::now();
        Self {
            tool_name: tool_name.into(),
            success: false,
            llm_content: error.clone(),
            return_display: error.clone(),
            error: Some(error),
            started_at: now,
            completed_at: now,
        }
    }

    /// Stamp the start/completion window.
    pub fn with_window(mut self, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.completed_at = completed_at;
        self
    }
}

/// Lifecycle states of a tracked tool execution, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Validating,
    AwaitingApproval,
    Scheduled,
    Executing,
    Completed,
}

/// A tracked tool execution, owned and mutated exclusively by the execution
/// manager. Other components read snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    /// Unique execution id.
    pub execution_id: Uuid,
    /// Target tool name.
    pub tool_name: String,
    /// Parsed parameters as submitted.
    pub parameters: Value,
    /// Current lifecycle state; advances monotonically.
    pub state: ExecutionState,
    /// Approval mode in effect.
    pub approval_mode: ApprovalMode,
    /// Whether an approval was granted (false until decided).
    pub approved: bool,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
    /// Set on entry to `executing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    /// Set on the single transition to `completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Final result, present once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

impl ToolExecution {
    /// Create a new record in `validating`.
    pub fn new(tool_name: impl Into<String>, parameters: Value, mode: ApprovalMode) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            tool_name: tool_name.into(),
            parameters,
            state: ExecutionState::Validating,
            approval_mode: mode,
            approved: false,
            submitted_at: Utc::now(),
            executed_at: None,
            completed_at: None,
            result: None,
        }
    }

    /// Advance to `state`, recording edge timestamps.
    ///
    /// States only move forward; a backward transition is a bug in the
    /// execution manager and is ignored (asserted in debug builds).
    pub fn advance(&mut self, state: ExecutionState) {
        debug_assert!(
            state >= self.state,
            "execution state must advance monotonically ({:?} -> {:?})",
            self.state,
            state
        );
        if state < self.state {
            return;
        }
        if state == ExecutionState::Executing && self.executed_at.is_none() {
            self.executed_at = Some(Utc::now());
        }
        if state == ExecutionState::Completed && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        self.state = state;
    }

    /// Record the terminal result and complete the execution.
    pub fn complete(&mut self, result: ToolResult) {
        self.result = Some(result);
        self.advance(ExecutionState::Completed);
    }
}

// ============================================================================
// PROMPTS AND SESSIONS
// ============================================================================

/// Which registry tools a prompt exposes to the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolPolicy {
    /// Expose every registered tool.
    #[default]
    AllAvailable,
    /// Expose only the names listed in `custom_tools`.
    NamedSubset,
    /// Expose no tools at all.
    None,
}

/// Processing status of a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Created,
    Processing,
    AwaitingTool,
    Completed,
    Error,
}

/// A unit of work handed to the turn engine.
///
/// The turn engine owns the object for the duration of the turn, accumulating
/// the per-turn conversation history and filling `result_content` on
/// completion. Once `status` is `completed`, `result_content` is non-empty or
/// at least one tool result is present in the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptObject {
    /// Unique prompt id.
    pub prompt_id: Uuid,
    /// The user text.
    pub content: String,
    /// Role of the submitted content; almost always `user`.
    pub role: Role,
    /// Turn-level history accumulated while processing.
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    /// Subset of registry tools to expose under `NamedSubset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_tools: Option<Vec<String>>,
    /// Tool exposure policy.
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    /// Whether the LLM responses should stream.
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
    /// Final assistant text, filled by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_content: Option<String>,
    /// Tool calls pending dispatch.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Processing status.
    pub status: PromptStatus,
}

fn default_true() -> bool {
    true
}

impl PromptObject {
    /// Create a user prompt with default policy (all tools, streaming on).
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            prompt_id: Uuid::new_v4(),
            content: content.into(),
            role: Role::User,
            conversation_history: Vec::new(),
            custom_tools: None,
            tool_policy: ToolPolicy::AllAvailable,
            streaming_enabled: true,
            result_content: None,
            tool_calls: Vec::new(),
            status: PromptStatus::Created,
        }
    }

    /// Restrict the prompt to a named subset of tools.
    pub fn with_tools(mut self, names: Vec<String>) -> Self {
        self.tool_policy = ToolPolicy::NamedSubset;
        self.custom_tools = Some(names);
        self
    }

    /// Expose no tools for this prompt.
    pub fn without_tools(mut self) -> Self {
        self.tool_policy = ToolPolicy::None;
        self
    }

    /// Toggle streaming.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming_enabled = streaming;
        self
    }
}

/// Counters kept per session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionStatistics {
    /// Turns that reached `completed`.
    pub turns_completed: u64,
    /// Messages appended to the session plane.
    pub messages_appended: u64,
    /// Tool calls executed on behalf of this session.
    pub tool_calls_executed: u64,
    /// Times the session history was compressed.
    pub compressions: u64,
}

/// A long-lived context grouping multiple turns.
///
/// Session history spans turns and is distinct from a prompt's per-turn
/// history. Sessions live for the process lifetime unless the caller
/// serialises them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id.
    pub session_id: Uuid,
    /// Session-level conversation history.
    pub history: Vec<Message>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Usage counters.
    pub statistics: SessionStatistics,
}

impl Session {
    /// Create an empty session.
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            history: Vec::new(),
            created_at: Utc::now(),
            statistics: SessionStatistics::default(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ASSISTANT MESSAGES (provider output)
// ============================================================================

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

impl FinishReason {
    /// Parse the wire string; unknown values map to `Error`.
    pub fn parse(s: &str) -> Self {
        match s {
            "stop" => FinishReason::Stop,
            "tool_calls" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A complete assistant response, whether reconstructed from deltas or taken
/// from a non-streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Text content, if any.
    pub content: Option<String>,
    /// Tool calls requested by the model, in issue order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Why generation ended.
    pub finish_reason: FinishReason,
    /// Token usage, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl AssistantMessage {
    /// Whether the model requested tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Convert into a history [`Message`].
    pub fn to_message(&self) -> Message {
        let content = self.content.clone().unwrap_or_default();
        if self.tool_calls.is_empty() {
            Message::assistant(content)
        } else {
            Message::assistant_with_tool_calls(content, self.tool_calls.clone())
        }
    }
}

// ============================================================================
// OPENAI-COMPATIBLE WIRE FORMAT
// ============================================================================

/// Request payload for the chat/completions endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation as wire messages, in order.
    pub messages: Vec<WireMessage>,
    /// Whether to stream the response.
    pub stream: bool,
    /// Generation cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Function-calling tool schemas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

/// One message in the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Role string (`system` / `user` / `assistant` / `tool`).
    pub role: String,
    /// Text content; omitted for tool-call-only assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls on assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Correlation id on tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Assistant message as it appears inside completions and authoritative
/// final chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireAssistantMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Non-streaming completion response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// One choice of a non-streaming completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: WireAssistantMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One streamed chunk of a completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// One choice within a streamed chunk.
///
/// Some providers attach a complete `message` to the final chunk; when
/// present it is authoritative over the reconstructed deltas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<WireAssistantMessage>,
}

/// Incremental update carried by a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Incremental update for one tool call, keyed by `index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Which tool call this delta belongs to.
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

/// Incremental function name/argument fragments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}
