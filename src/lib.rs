//! # Agent Kernel
//!
//! An adaptive multi-agent orchestration kernel. It mediates between a
//! caller, an OpenAI-compatible LLM, and a dynamic fleet of tools: local
//! handlers registered in-process and external agents reachable over the
//! Model Context Protocol (MCP).
//!
//! Given a prompt, the kernel drives a bounded reasoning loop: materialise a
//! request from the system instructions, tool catalogue and conversation
//! history; stream the LLM's response; dispatch any requested tool calls
//! concurrently with bounded fan-out; feed the results back; and recurse
//! until the model produces a terminal answer or the loop bound trips.
//!
//! ## Key pieces
//!
//! - **[`Kernel`]**: the composition root, with explicit dependency
//!   injection and no ambient globals.
//! - **[`TurnEngine`]**: the per-turn state machine, observed as an ordered
//!   [`TurnEvent`] stream with cancellation.
//! - **[`ToolRegistry`]**: the unified name → definition map for local and
//!   MCP-hosted tools.
//! - **[`McpFleet`]**: connection manager for external agents, with
//!   `listChanged` reconciliation, exact tool removal on disconnect, and a
//!   persisted agent registry.
//! - **[`ExecutionManager`]**: validation (JSON Schema draft-07), approval
//!   policy, concurrency quotas and uniform dispatch for every tool call.
//! - **[`ConversationStore`]**: per-session history with LLM-backed
//!   compression.
//! - **Retry controller**: every LLM call retries transient failures with
//!   exponential backoff and surfaces structured [`ErrorSignal`]s.
//! - **MCP server boundary**: the kernel is itself an MCP endpoint
//!   (`initialize` / `tools/list` / `tools/get` / `tools/call` over SSE with
//!   constant-time bearer auth).
//!
//! ## Example
//!
//! ```no_run
//! use agent_kernel::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> agent_kernel::Result<()> {
//!     let config = KernelConfig::builder()
//!         .llm_endpoint("http://localhost:1234/v1")
//!         .llm_model("qwen2.5-32b-instruct")
//!         .build()?;
//!     let kernel = Kernel::new(config)?;
//!
//!     kernel.register_tool(
//!         local_tool("get_time", "Current UTC time")
//!             .build(|_| async { Ok(json!(chrono::Utc::now().to_rfc3339())) }),
//!     )?;
//!
//!     let mut turn = kernel
//!         .submit_prompt("What time is it?", SubmitOptions::default())
//!         .await?;
//!     while let Some(event) = turn.next_event().await {
//!         match event {
//!             TurnEvent::Content(text) => print!("{text}"),
//!             TurnEvent::Finished(_) => println!(),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Approval queue, handlers and the approval-mode policy matrix.
mod approval;

/// Kernel configuration and its validating builder.
mod config;

/// Per-session conversation history with compression.
mod conversation;

/// Domain overlays: hot-swappable tools, endpoints and prompt fragments.
mod domain;

/// Error taxonomy and the structured error-as-signal type.
mod error;

/// Unified tool dispatch: validation, approval, quotas, execution records.
mod executor;

/// MCP client fleet: transport table, discovery events, persistence.
mod fleet;

/// Composition root.
mod kernel;

/// Pure prompt/context assembly.
mod prompt;

/// LLM provider adapter (OpenAI-compatible chat/completions).
mod provider;

/// Thread-safe tool registry.
mod registry;

/// The kernel's own MCP server surface.
mod server;

/// Local tool definitions and the fluent builder.
mod tools;

/// MCP transports: JSON-RPC 2.0 over stdio and streamable HTTP.
mod transport;

/// The turn engine state machine.
mod turn;

/// Core data model and OpenAI-compatible wire types.
mod types;

/// Streaming reconstruction (delta merge + authoritative final).
mod utils;

/// Adaptive retry with exponential backoff; public so embedders can wrap
/// their own operations.
pub mod retry;

// --- Composition root ---

pub use kernel::{Kernel, KernelBuilder, SubmitOptions};

// --- Configuration ---

pub use config::{KernelConfig, KernelConfigBuilder};

// --- Errors ---

pub use error::{Error, ErrorCategory, ErrorSignal, Result};

// --- Turn engine ---

pub use turn::{TurnEngine, TurnEvent, TurnHandle};

// --- Tool system ---

pub use executor::ExecutionManager;
pub use registry::{RegisteredTool, ToolFilter, ToolRegistry};
pub use tools::{LocalTool, LocalToolBuilder, ToolHandler, local_tool, normalize_schema};

// --- Approval ---

pub use approval::{
    ApprovalDecision, ApprovalHandler, ApprovalInbox, ApprovalPolicy, ApprovalQueue,
    ApprovalRequest, ApproveAll, DenyAll, PendingApproval,
};

// --- MCP ---

pub use fleet::{FleetEvent, McpFleet};
pub use server::{McpServerState, dispatch as mcp_dispatch, router as mcp_router};
pub use transport::{
    EndpointDescriptor, HttpTransport, JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, MCP_PROTOCOL_VERSION, McpTransport, StdioTransport, TransportNotice,
    TransportStatus,
};

// --- Conversation & prompts ---

pub use conversation::{ConversationStore, SessionSlot, compress_history};
pub use domain::{DomainManager, DomainOverlay};
pub use prompt::{BuiltRequest, DEFAULT_BASE_INSTRUCTIONS, PromptContext, build_request};

// --- Provider ---

pub use provider::{ChunkStream, LlmProvider, OpenAiProvider, completion_to_assistant};
pub use utils::StreamAssembler;

// --- Core types ---

pub use types::{
    ApprovalMode, AssistantMessage, ChatChunk, ChatCompletion, ChatRequest, ChunkChoice,
    ChunkDelta, CompletionChoice, ExecutionState, FinishReason, FunctionCall, FunctionDelta,
    Message, PromptObject, PromptStatus, Role, Session, SessionStatistics, ToolCall,
    ToolCallDelta, ToolDefinition, ToolExecution, ToolOrigin, ToolPolicy, ToolResult, Usage,
    WireAssistantMessage, WireMessage,
};

/// The most commonly used types, importable in one line.
pub mod prelude {
    pub use crate::{
        ApprovalMode, ApprovalPolicy, AssistantMessage, EndpointDescriptor, Error, ErrorCategory,
        FinishReason, Kernel, KernelConfig, LocalTool, Message, PromptObject, Result, Role,
        SubmitOptions, ToolCall, ToolDefinition, ToolResult, TurnEvent, TurnHandle, local_tool,
    };
}
