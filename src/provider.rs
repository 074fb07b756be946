//! LLM provider adapter.
//!
//! [`LlmProvider`] is the seam between the kernel and the reasoning engine:
//! `generate` for a single complete response, `stream` for chunked deltas.
//! The concrete [`OpenAiProvider`] speaks the OpenAI-compatible
//! chat/completions protocol over HTTP; test doubles implement the trait
//! directly with scripted responses.
//!
//! HTTP failures map onto the retry controller's categories: connection
//! faults are `network`, 401/403 `auth`, 429 `rate_limit`, 5xx `server`,
//! 400/422 `validation`. The turn engine wraps every provider call in
//! [`retry_with_backoff`](crate::retry::retry_with_backoff).

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::config::KernelConfig;
use crate::error::ErrorCategory;
use crate::types::{AssistantMessage, ChatChunk, ChatCompletion, ChatRequest, FinishReason};
use crate::{Error, Result};

/// Stream of parsed chunks from a streaming completion.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// Unified interface to the reasoning engine.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Request a complete response.
    async fn generate(&self, request: ChatRequest) -> Result<AssistantMessage>;

    /// Request a streamed response. The caller folds the chunks through a
    /// [`StreamAssembler`](crate::StreamAssembler) to obtain the final
    /// message.
    async fn stream(&self, request: ChatRequest) -> Result<ChunkStream>;
}

/// Provider speaking the OpenAI-compatible chat/completions protocol.
pub struct OpenAiProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiProvider {
    /// Build a provider from the kernel configuration.
    pub fn new(config: &KernelConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.llm_endpoint.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    async fn post(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let category = ErrorCategory::from_status(status);
            let body = response.text().await.unwrap_or_default();
            return Err(Error::llm(category, format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate(&self, mut request: ChatRequest) -> Result<AssistantMessage> {
        request.stream = false;
        debug!(model = %request.model, messages = request.messages.len(), "LLM generate");
        let response = self.post(&request).await?;
        let completion: ChatCompletion = response.json().await?;
        completion_to_assistant(completion)
    }

    async fn stream(&self, mut request: ChatRequest) -> Result<ChunkStream> {
        request.stream = true;
        debug!(model = %request.model, messages = request.messages.len(), "LLM stream");
        let response = self.post(&request).await?;

        let chunks = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) if event.data == "[DONE]" => None,
                    Ok(event) if event.data.is_empty() => None,
                    Ok(event) => Some(
                        serde_json::from_str::<ChatChunk>(&event.data)
                            .map_err(|e| Error::stream(format!("malformed chunk: {e}"))),
                    ),
                    Err(e) => Some(Err(Error::stream(format!("SSE error: {e}")))),
                }
            });
        Ok(Box::pin(chunks))
    }
}

/// Convert a non-streaming completion into an [`AssistantMessage`].
pub fn completion_to_assistant(completion: ChatCompletion) -> Result<AssistantMessage> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::llm(ErrorCategory::Server, "completion carried no choices"))?;

    let tool_calls = choice.message.tool_calls.unwrap_or_default();
    let finish_reason = choice
        .finish_reason
        .as_deref()
        .map(FinishReason::parse)
        .unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

    Ok(AssistantMessage {
        content: choice.message.content,
        tool_calls,
        finish_reason,
        usage: completion.usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompletionChoice, ToolCall, WireAssistantMessage};
    use serde_json::json;

    #[test]
    fn test_completion_to_assistant_plain() {
        let completion = ChatCompletion {
            choices: vec![CompletionChoice {
                index: 0,
                message: WireAssistantMessage {
                    role: Some("assistant".into()),
                    content: Some("Hello, world!".into()),
                    tool_calls: None,
                },
                finish_reason: Some("stop".into()),
            }],
            usage: None,
        };
        let message = completion_to_assistant(completion).unwrap();
        assert_eq!(message.content.as_deref(), Some("Hello, world!"));
        assert_eq!(message.finish_reason, FinishReason::Stop);
        assert!(!message.has_tool_calls());
    }

    #[test]
    fn test_completion_to_assistant_tool_calls() {
        let completion = ChatCompletion {
            choices: vec![CompletionChoice {
                index: 0,
                message: WireAssistantMessage {
                    role: Some("assistant".into()),
                    content: None,
                    tool_calls: Some(vec![ToolCall::new(
                        "c1",
                        "shell_command",
                        &json!({"command": "date"}),
                    )]),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: None,
        };
        let message = completion_to_assistant(completion).unwrap();
        assert_eq!(message.finish_reason, FinishReason::ToolCalls);
        assert_eq!(message.tool_calls.len(), 1);
    }

    #[test]
    fn test_completion_without_choices_is_server_error() {
        let err = completion_to_assistant(ChatCompletion::default()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Server);
    }

    #[test]
    fn test_missing_finish_reason_inferred() {
        let completion = ChatCompletion {
            choices: vec![CompletionChoice {
                index: 0,
                message: WireAssistantMessage {
                    role: None,
                    content: Some("hi".into()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        };
        let message = completion_to_assistant(completion).unwrap();
        assert_eq!(message.finish_reason, FinishReason::Stop);
    }
}
