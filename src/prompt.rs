//! Prompt/context builder.
//!
//! Pure assembly of the request sent to the LLM: no I/O, deterministic for a
//! given input. The builder produces both halves of the request: the message
//! list (system message with optional domain fragments and a rendered tool
//! catalogue, then session history, then turn history, then the pending user
//! message) and the structured `tools` array for function calling.
//!
//! The rendered catalogue mirrors the structured array so models without
//! native function calling still see what is available; external tools name
//! their hosting agent.

use serde_json::Value;

use crate::config::KernelConfig;
use crate::domain::DomainOverlay;
use crate::registry::RegisteredTool;
use crate::types::{Message, PromptObject, Role, ToolOrigin, ToolPolicy, WireMessage};

/// Base instructions used when the embedder supplies none.
pub const DEFAULT_BASE_INSTRUCTIONS: &str = "You are an adaptive orchestration assistant. \
Use the available tools when they help answer the request; otherwise answer directly.";

/// Everything the builder needs for one request.
pub struct PromptContext<'a> {
    /// The prompt being processed.
    pub prompt: &'a PromptObject,
    /// Session-plane history (already compressed by the store).
    pub session_history: &'a [Message],
    /// Registry view at build time.
    pub tools: &'a [RegisteredTool],
    /// Loaded domain overlay, if any.
    pub domain: Option<&'a DomainOverlay>,
    /// Base system instructions.
    pub base_instructions: &'a str,
}

/// Materialised request: wire messages plus the function-calling tool array.
pub struct BuiltRequest {
    /// Messages in send order.
    pub messages: Vec<WireMessage>,
    /// `tools` array for the request body; `None` when the policy exposes
    /// nothing.
    pub tools: Option<Vec<Value>>,
}

/// Tools eligible under the prompt's policy.
fn eligible_tools<'a>(
    prompt: &PromptObject,
    tools: &'a [RegisteredTool],
) -> Vec<&'a RegisteredTool> {
    match prompt.tool_policy {
        ToolPolicy::None => Vec::new(),
        ToolPolicy::AllAvailable => tools.iter().collect(),
        ToolPolicy::NamedSubset => {
            let names = prompt.custom_tools.as_deref().unwrap_or_default();
            tools
                .iter()
                .filter(|t| names.iter().any(|n| n == &t.definition.name))
                .collect()
        }
    }
}

/// Render the human-readable tool catalogue appended to the system message.
fn render_catalogue(tools: &[&RegisteredTool]) -> String {
    let mut out = String::from("\n\nAvailable tools:\n");
    for tool in tools {
        let def = &tool.definition;
        out.push_str(&format!("- {}: {}", def.name, def.description));
        if def.origin == ToolOrigin::External {
            if let Some(agent) = &def.server_ref {
                out.push_str(&format!(" (hosted by {agent})"));
            }
        }
        out.push('\n');
        out.push_str(&format!("  parameters: {}\n", def.parameter_schema));
    }
    out
}

/// Assemble the request for `ctx`.
///
/// Message order: system, session history, turn history, then the prompt's
/// content as a user message unless the turn history already ends with it
/// (the engine appends the user message before recursing).
pub fn build_request(ctx: &PromptContext<'_>, config: &KernelConfig) -> BuiltRequest {
    let eligible = eligible_tools(ctx.prompt, ctx.tools);

    // System message: base instructions, domain fragments, tool catalogue.
    let mut system = ctx.base_instructions.to_string();
    if let Some(domain) = ctx.domain {
        for fragment in &domain.prompt_fragments {
            system.push_str("\n\n");
            system.push_str(fragment);
        }
    }
    if !eligible.is_empty() {
        system.push_str(&render_catalogue(&eligible));
    }

    let mut messages = Vec::new();
    messages.push(WireMessage {
        role: Role::System.as_str().to_string(),
        content: Some(system),
        tool_calls: None,
        tool_call_id: None,
        name: None,
    });

    // Session plane, then the turn plane, trimmed to the character budget.
    let mut history: Vec<&Message> = Vec::new();
    history.extend(ctx.session_history);
    history.extend(&ctx.prompt.conversation_history);
    for msg in budgeted(&history, config.max_context_size) {
        messages.push(msg.to_wire());
    }

    // The pending user message, unless the engine already appended it to the
    // turn plane. The engine does so before the first call, so on recursion
    // (a turn history ending in tool results) nothing is re-appended.
    let already_appended = ctx
        .prompt
        .conversation_history
        .iter()
        .any(|m| m.role == Role::User && m.content == ctx.prompt.content);
    if !already_appended && !ctx.prompt.content.is_empty() {
        messages.push(WireMessage {
            role: ctx.prompt.role.as_str().to_string(),
            content: Some(ctx.prompt.content.clone()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    }

    let tools = if eligible.is_empty() {
        None
    } else {
        Some(
            eligible
                .iter()
                .map(|t| t.definition.to_function_schema())
                .collect(),
        )
    };

    BuiltRequest { messages, tools }
}

/// Keep the newest messages that fit within `max_chars`.
///
/// The hard cap protects the provider call; proper summarisation happens in
/// the conversation store before the history ever reaches this point.
fn budgeted<'a>(history: &[&'a Message], max_chars: usize) -> Vec<&'a Message> {
    let mut total = 0usize;
    let mut kept: Vec<&Message> = Vec::new();
    for msg in history.iter().rev() {
        let weight = msg.char_weight();
        if total + weight > max_chars && !kept.is_empty() {
            break;
        }
        total += weight;
        kept.push(msg);
    }
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolFilter, ToolRegistry};
    use crate::types::ToolDefinition;
    use serde_json::json;

    fn config() -> KernelConfig {
        KernelConfig::builder()
            .llm_endpoint("http://localhost:1234/v1")
            .llm_model("test-model")
            .build()
            .unwrap()
    }

    fn registry_view() -> Vec<RegisteredTool> {
        let registry = ToolRegistry::new();
        registry
            .register_local(ToolDefinition::new(
                "shell_command",
                "Run a shell command",
                json!({"type": "object", "properties": {"command": {"type": "string"}}, "required": ["command"]}),
            ))
            .unwrap();
        registry
            .register_external(
                "agent-1",
                ToolDefinition::new(
                    "remote_search",
                    "Search the remote index",
                    json!({"type": "object", "properties": {}}),
                ),
            )
            .unwrap();
        registry.list(&ToolFilter::default())
    }

    #[test]
    fn test_system_message_and_user_message() {
        let prompt = PromptObject::user("What's the date?");
        let tools = registry_view();
        let ctx = PromptContext {
            prompt: &prompt,
            session_history: &[],
            tools: &tools,
            domain: None,
            base_instructions: DEFAULT_BASE_INSTRUCTIONS,
        };

        let built = build_request(&ctx, &config());
        assert_eq!(built.messages[0].role, "system");
        let system = built.messages[0].content.as_deref().unwrap();
        assert!(system.contains("shell_command"));
        assert!(system.contains("hosted by agent-1"));

        let last = built.messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert_eq!(last.content.as_deref(), Some("What's the date?"));

        assert_eq!(built.tools.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_policy_none_hides_tools() {
        let prompt = PromptObject::user("hi").without_tools();
        let tools = registry_view();
        let ctx = PromptContext {
            prompt: &prompt,
            session_history: &[],
            tools: &tools,
            domain: None,
            base_instructions: DEFAULT_BASE_INSTRUCTIONS,
        };

        let built = build_request(&ctx, &config());
        assert!(built.tools.is_none());
        assert!(!built.messages[0].content.as_deref().unwrap().contains("Available tools"));
    }

    #[test]
    fn test_named_subset_filters() {
        let prompt = PromptObject::user("hi").with_tools(vec!["remote_search".into()]);
        let tools = registry_view();
        let ctx = PromptContext {
            prompt: &prompt,
            session_history: &[],
            tools: &tools,
            domain: None,
            base_instructions: DEFAULT_BASE_INSTRUCTIONS,
        };

        let built = build_request(&ctx, &config());
        let schemas = built.tools.unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0]["function"]["name"], "remote_search");
    }

    #[test]
    fn test_histories_in_order_and_no_duplicate_user_message() {
        let mut prompt = PromptObject::user("follow-up");
        prompt.conversation_history.push(Message::user("follow-up"));
        let session = vec![Message::user("earlier"), Message::assistant("sure")];
        let ctx = PromptContext {
            prompt: &prompt,
            session_history: &session,
            tools: &[],
            domain: None,
            base_instructions: DEFAULT_BASE_INSTRUCTIONS,
        };

        let built = build_request(&ctx, &config());
        let roles: Vec<&str> = built.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        // The turn-history copy is the only occurrence of the new message.
        let occurrences = built
            .messages
            .iter()
            .filter(|m| m.content.as_deref() == Some("follow-up"))
            .count();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn test_determinism() {
        let prompt = PromptObject::user("same");
        let tools = registry_view();
        let ctx = PromptContext {
            prompt: &prompt,
            session_history: &[],
            tools: &tools,
            domain: None,
            base_instructions: DEFAULT_BASE_INSTRUCTIONS,
        };
        let a = build_request(&ctx, &config());
        let b = build_request(&ctx, &config());
        assert_eq!(
            serde_json::to_value(&a.messages).unwrap(),
            serde_json::to_value(&b.messages).unwrap()
        );
    }

    #[test]
    fn test_context_budget_trims_oldest() {
        let prompt = PromptObject::user("now");
        let session: Vec<Message> = (0..50)
            .map(|i| Message::user(format!("message number {i} {}", "x".repeat(100))))
            .collect();
        let config = KernelConfig::builder()
            .llm_endpoint("http://localhost:1234/v1")
            .llm_model("test-model")
            .max_context_size(600)
            .build()
            .unwrap();
        let ctx = PromptContext {
            prompt: &prompt,
            session_history: &session,
            tools: &[],
            domain: None,
            base_instructions: DEFAULT_BASE_INSTRUCTIONS,
        };

        let built = build_request(&ctx, &config);
        // System + a small tail + the user message.
        assert!(built.messages.len() < 10);
        // The newest history message survives.
        assert!(
            built
                .messages
                .iter()
                .any(|m| m.content.as_deref().is_some_and(|c| c.contains("number 49")))
        );
    }
}
