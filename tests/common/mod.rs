//! Shared test doubles: a scripted LLM provider and message builders.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use agent_kernel::{
    AssistantMessage, ChatChunk, ChatRequest, ChunkChoice, ChunkDelta, Error, ErrorCategory,
    FinishReason, LlmProvider, Result, StreamAssembler, ToolCall, WireAssistantMessage,
};
use async_trait::async_trait;
use serde_json::Value;

/// One scripted provider response.
pub enum Script {
    /// Return this message (as a single authoritative chunk when streamed).
    Message(AssistantMessage),
    /// Stream these chunks.
    Chunks(Vec<ChatChunk>),
    /// Fail with this category.
    Fail(ErrorCategory, String),
}

/// Provider double that replays a fixed script and records its traffic.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// How many LLM calls were made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request the kernel sent.
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn next(&self, request: ChatRequest) -> Result<Script> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::other("scripted provider ran out of responses"))
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, request: ChatRequest) -> Result<AssistantMessage> {
        match self.next(request)? {
            Script::Message(message) => Ok(message),
            Script::Chunks(chunks) => {
                let mut assembler = StreamAssembler::new();
                for chunk in chunks {
                    assembler.push(chunk);
                }
                Ok(assembler.finish())
            }
            Script::Fail(category, message) => Err(Error::llm(category, message)),
        }
    }

    async fn stream(&self, request: ChatRequest) -> Result<agent_kernel::ChunkStream> {
        match self.next(request)? {
            Script::Chunks(chunks) => Ok(Box::pin(futures::stream::iter(
                chunks.into_iter().map(Ok),
            ))),
            Script::Message(message) => {
                let chunk = authoritative_chunk(&message);
                Ok(Box::pin(futures::stream::iter(vec![Ok(chunk)])))
            }
            Script::Fail(category, message) => Err(Error::llm(category, message)),
        }
    }
}

/// Wrap a complete message as one authoritative final chunk.
pub fn authoritative_chunk(message: &AssistantMessage) -> ChatChunk {
    ChatChunk {
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: Some("assistant".into()),
                content: message.content.clone(),
                tool_calls: None,
            },
            finish_reason: Some(match message.finish_reason {
                FinishReason::Stop => "stop".to_string(),
                FinishReason::ToolCalls => "tool_calls".to_string(),
                FinishReason::Length => "length".to_string(),
                FinishReason::ContentFilter => "content_filter".to_string(),
                FinishReason::Error => "error".to_string(),
            }),
            message: Some(WireAssistantMessage {
                role: Some("assistant".into()),
                content: message.content.clone(),
                tool_calls: if message.tool_calls.is_empty() {
                    None
                } else {
                    Some(message.tool_calls.clone())
                },
            }),
        }],
        usage: message.usage,
    }
}

/// Plain text answer.
pub fn text_message(text: &str) -> AssistantMessage {
    AssistantMessage {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
        finish_reason: FinishReason::Stop,
        usage: None,
    }
}

/// Assistant message requesting the given tool calls.
pub fn tool_call_message(calls: Vec<(&str, &str, Value)>) -> AssistantMessage {
    AssistantMessage {
        content: None,
        tool_calls: calls
            .into_iter()
            .map(|(id, name, args)| ToolCall::new(id, name, &args))
            .collect(),
        finish_reason: FinishReason::ToolCalls,
        usage: None,
    }
}

/// Stream a text answer as word-by-word content deltas.
pub fn text_chunks(words: &[&str]) -> Vec<ChatChunk> {
    let mut chunks: Vec<ChatChunk> = words
        .iter()
        .map(|word| ChatChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some((*word).to_string()),
                    tool_calls: None,
                },
                finish_reason: None,
                message: None,
            }],
            usage: None,
        })
        .collect();
    chunks.push(ChatChunk {
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some("stop".to_string()),
            message: None,
        }],
        usage: None,
    });
    chunks
}
