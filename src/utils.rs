//! Streaming reconstruction.
//!
//! Chunked responses arrive as incremental deltas: text fragments and
//! tool-call pieces split at arbitrary positions, interleaved across calls.
//! [`StreamAssembler`] is the single reconstruction point: both the
//! delta-merge path and the authoritative-final path come out of
//! [`StreamAssembler::finish`] as one [`AssistantMessage`], so no caller ever
//! sees a half-assembled tool call.
//!
//! Reconstruction rules:
//!
//! 1. Content deltas are concatenated in arrival order.
//! 2. Tool-call deltas are keyed by their `index` field; `function.name` and
//!    `function.arguments` fragments are concatenated per index.
//! 3. When a chunk carries a complete `message` or `usage`, that object is
//!    authoritative over the reconstruction.
//!
//! A tool call missing its id or name at finish time is dropped; it cannot
//! be dispatched or correlated.

use std::collections::BTreeMap;

use crate::types::{
    AssistantMessage, ChatChunk, FinishReason, FunctionCall, ToolCall, Usage,
    WireAssistantMessage,
};

/// Accumulates chunks into a final [`AssistantMessage`].
#[derive(Debug, Default)]
pub struct StreamAssembler {
    content: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    authoritative: Option<WireAssistantMessage>,
}

/// A tool call under assembly: id and name usually arrive in the first delta,
/// the argument string accrues across the rest.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl StreamAssembler {
    /// Creates an assembler with empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the buffers.
    ///
    /// Returns the text fragment this chunk contributed, if any, so callers
    /// can emit it as a `content` event without waiting for the stream to
    /// end.
    pub fn push(&mut self, chunk: ChatChunk) -> Option<String> {
        let mut fragment: Option<String> = None;

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.content.push_str(&content);
                    fragment
                        .get_or_insert_with(String::new)
                        .push_str(&content);
                }
            }

            if let Some(deltas) = choice.delta.tool_calls {
                for delta in deltas {
                    let entry = self.tool_calls.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(args) = function.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(FinishReason::parse(&reason));
            }

            if let Some(message) = choice.message {
                self.authoritative = Some(message);
            }
        }

        fragment
    }

    /// Whether a finish reason has been observed.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Produce the final assistant message.
    ///
    /// Prefers the authoritative final `message` when one was observed,
    /// otherwise returns the per-index reconstruction.
    pub fn finish(self) -> AssistantMessage {
        if let Some(authoritative) = self.authoritative {
            let tool_calls = authoritative.tool_calls.unwrap_or_default();
            let finish_reason = self.finish_reason.unwrap_or(if tool_calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            });
            return AssistantMessage {
                content: authoritative.content,
                tool_calls,
                finish_reason,
                usage: self.usage,
            };
        }

        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_values()
            .filter_map(|partial| {
                let (id, name) = (partial.id?, partial.name?);
                let arguments = if partial.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    partial.arguments
                };
                Some(ToolCall {
                    id,
                    call_type: "function".to_string(),
                    function: FunctionCall { name, arguments },
                })
            })
            .collect();

        let finish_reason = self.finish_reason.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

        AssistantMessage {
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkChoice, ChunkDelta, FunctionDelta, ToolCallDelta};

    fn content_chunk(text: &str, finish: Option<&str>) -> ChatChunk {
        ChatChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some(text.to_string()),
                    tool_calls: None,
                },
                finish_reason: finish.map(|s| s.to_string()),
                message: None,
            }],
            usage: None,
        }
    }

    fn tool_chunk(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        args: Option<&str>,
        finish: Option<&str>,
    ) -> ChatChunk {
        ChatChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: id.map(|s| s.to_string()),
                        call_type: id.map(|_| "function".to_string()),
                        function: Some(FunctionDelta {
                            name: name.map(|s| s.to_string()),
                            arguments: args.map(|s| s.to_string()),
                        }),
                    }]),
                },
                finish_reason: finish.map(|s| s.to_string()),
                message: None,
            }],
            usage: None,
        }
    }

    #[test]
    fn test_content_concatenation() {
        let mut assembler = StreamAssembler::new();
        assert_eq!(assembler.push(content_chunk("Hello ", None)).as_deref(), Some("Hello "));
        assert_eq!(
            assembler.push(content_chunk("world", Some("stop"))).as_deref(),
            Some("world")
        );
        assert!(assembler.is_finished());

        let message = assembler.finish();
        assert_eq!(message.content.as_deref(), Some("Hello world"));
        assert_eq!(message.finish_reason, FinishReason::Stop);
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn test_tool_call_assembly_across_chunks() {
        let mut assembler = StreamAssembler::new();
        assembler.push(tool_chunk(0, Some("c1"), Some("get_weather"), Some(r#"{"loc"#), None));
        assembler.push(tool_chunk(0, None, None, Some(r#"ation":"Paris"}"#), Some("tool_calls")));

        let message = assembler.finish();
        assert_eq!(message.finish_reason, FinishReason::ToolCalls);
        assert_eq!(message.tool_calls.len(), 1);
        let call = &message.tool_calls[0];
        assert_eq!(call.id, "c1");
        assert_eq!(call.name(), "get_weather");
        assert_eq!(call.parsed_arguments().unwrap()["location"], "Paris");
    }

    #[test]
    fn test_interleaved_tool_calls_keep_index_order() {
        let mut assembler = StreamAssembler::new();
        assembler.push(tool_chunk(0, Some("c1"), Some("search"), None, None));
        assembler.push(tool_chunk(1, Some("c2"), Some("calculate"), None, None));
        assembler.push(tool_chunk(0, None, None, Some(r#"{"q":"rust"}"#), None));
        assembler.push(tool_chunk(1, None, None, Some(r#"{"expr":"2+2"}"#), Some("tool_calls")));

        let message = assembler.finish();
        assert_eq!(message.tool_calls.len(), 2);
        assert_eq!(message.tool_calls[0].id, "c1");
        assert_eq!(message.tool_calls[1].id, "c2");
    }

    #[test]
    fn test_empty_arguments_default_to_object() {
        let mut assembler = StreamAssembler::new();
        assembler.push(tool_chunk(0, Some("c1"), Some("noop"), None, Some("tool_calls")));
        let message = assembler.finish();
        assert_eq!(
            message.tool_calls[0].parsed_arguments().unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn test_incomplete_tool_call_dropped() {
        let mut assembler = StreamAssembler::new();
        // No id ever arrives for index 0.
        assembler.push(tool_chunk(0, None, Some("broken"), Some("{}"), Some("tool_calls")));
        let message = assembler.finish();
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn test_authoritative_final_message_wins() {
        let mut assembler = StreamAssembler::new();
        assembler.push(content_chunk("partial recon", None));

        let authoritative = WireAssistantMessage {
            role: Some("assistant".to_string()),
            content: Some("the real answer".to_string()),
            tool_calls: None,
        };
        assembler.push(ChatChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some("stop".to_string()),
                message: Some(authoritative),
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        });

        let message = assembler.finish();
        assert_eq!(message.content.as_deref(), Some("the real answer"));
        assert_eq!(message.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_missing_finish_reason_inferred() {
        let mut assembler = StreamAssembler::new();
        assembler.push(content_chunk("hi", None));
        let message = assembler.finish();
        assert_eq!(message.finish_reason, FinishReason::Stop);

        let mut assembler = StreamAssembler::new();
        assembler.push(tool_chunk(0, Some("c1"), Some("t"), Some("{}"), None));
        let message = assembler.finish();
        assert_eq!(message.finish_reason, FinishReason::ToolCalls);
    }
}
