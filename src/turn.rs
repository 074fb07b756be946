//! Turn engine.
//!
//! One turn is a bounded reasoning loop: materialise the request, stream the
//! LLM's response, dispatch any requested tool calls, fold the results back
//! into the turn history, and recurse until the model stops asking for tools
//! or the iteration bound trips.
//!
//! States: `init → requesting → streaming → tools_pending → recursing →
//! finished | error | cancelled`. The caller observes the turn as an ordered
//! event stream ([`TurnEvent`]); within one assistant message, tool-call
//! requests and responses are emitted in issue order, and the engine waits
//! for every tool result before re-invoking the LLM.
//!
//! Tool failures never end a turn; they come back as failed results for the
//! model to adapt to. LLM failures retry per the adaptive controller; once
//! exhausted the turn ends with a single `error` event carrying the
//! structured signal, and nothing is committed to session history.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::conversation::ConversationStore;
use crate::domain::DomainManager;
use crate::error::ErrorSignal;
use crate::executor::ExecutionManager;
use crate::prompt::{self, PromptContext};
use crate::provider::LlmProvider;
use crate::registry::ToolRegistry;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::types::{
    AssistantMessage, ChatRequest, Message, PromptObject, PromptStatus, ToolResult,
};
use crate::utils::StreamAssembler;
use crate::{Error, Result};

/// Events yielded to the caller while a turn runs.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A text fragment (one per streamed delta; one per response when not
    /// streaming).
    Content(String),
    /// The model requested a tool call.
    ToolCallRequest(crate::types::ToolCall),
    /// A tool call completed (successfully or not).
    ToolCallResponse {
        call_id: String,
        result: ToolResult,
    },
    /// The turn failed; this is the last event.
    Error(ErrorSignal),
    /// The turn finished; carries the final assistant message.
    Finished(AssistantMessage),
}

/// Handle on a running turn: consume events, cancel, join.
pub struct TurnHandle {
    /// Id of the prompt being processed.
    pub prompt_id: Uuid,
    events: mpsc::Receiver<TurnEvent>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<PromptObject>,
}

impl TurnHandle {
    /// Next event, or `None` once the turn is over.
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// Abort the turn: in-flight tool calls are cancelled and the LLM
    /// stream is closed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token cancelled together with this turn.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the turn to finish and return the final prompt object.
    /// Unconsumed events are discarded; drain them first if you need them.
    pub async fn join(mut self) -> Result<PromptObject> {
        // Stop accepting events so an unread buffer can never block the
        // engine task we are about to wait on.
        self.events.close();
        self.join
            .await
            .map_err(|e| Error::other(format!("turn task failed: {e}")))
    }
}

/// Drives turns against the shared kernel services.
pub struct TurnEngine {
    provider: Arc<dyn LlmProvider>,
    executor: Arc<ExecutionManager>,
    registry: Arc<ToolRegistry>,
    store: Arc<ConversationStore>,
    domains: Arc<DomainManager>,
    config: KernelConfig,
    base_instructions: String,
}

impl TurnEngine {
    /// Wire an engine to the kernel services.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        executor: Arc<ExecutionManager>,
        registry: Arc<ToolRegistry>,
        store: Arc<ConversationStore>,
        domains: Arc<DomainManager>,
        config: KernelConfig,
        base_instructions: String,
    ) -> Self {
        Self {
            provider,
            executor,
            registry,
            store,
            domains,
            config,
            base_instructions,
        }
    }

    /// Start a turn. Events flow on the returned handle; the turn runs on
    /// its own task and survives an unread event buffer.
    pub fn run_turn(
        self: &Arc<Self>,
        prompt: PromptObject,
        session_id: Option<Uuid>,
    ) -> TurnHandle {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let prompt_id = prompt.prompt_id;

        let engine = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { engine.drive(prompt, session_id, token, tx).await });

        TurnHandle {
            prompt_id,
            events: rx,
            cancel,
            join,
        }
    }

    async fn drive(
        &self,
        mut prompt: PromptObject,
        session_id: Option<Uuid>,
        cancel: CancellationToken,
        events: mpsc::Sender<TurnEvent>,
    ) -> PromptObject {
        if self.domains.is_loading() {
            return self.fail(prompt, &events, &Error::DomainLoading).await;
        }

        // Turns within a session are serialised on the session's gate.
        let slot = match session_id {
            Some(id) => match self.store.slot(id).await {
                Ok(slot) => Some(slot),
                Err(e) => return self.fail(prompt, &events, &e).await,
            },
            None => None,
        };
        let _gate = match &slot {
            Some(slot) => Some(slot.turn_gate.lock().await),
            None => None,
        };

        debug!(prompt = %prompt.prompt_id, "turn started");
        prompt.status = PromptStatus::Processing;
        prompt.conversation_history.push(Message {
            role: prompt.role,
            content: prompt.content.clone(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            timestamp: chrono::Utc::now(),
            metadata: None,
        });

        let mut iterations = 0u32;
        let mut tool_calls_executed = 0u64;
        let mut seen_call_ids: HashSet<String> = HashSet::new();

        loop {
            // Materialise the request from the current registry, domain and
            // history state.
            let session_history = match session_id {
                Some(id) => self.store.history(id).await.unwrap_or_default(),
                None => Vec::new(),
            };
            let domain = self.domains.current().await;
            let tools = self.registry.list_all();
            let built = prompt::build_request(
                &PromptContext {
                    prompt: &prompt,
                    session_history: &session_history,
                    tools: &tools,
                    domain: domain.as_ref(),
                    base_instructions: &self.base_instructions,
                },
                &self.config,
            );
            let request = ChatRequest {
                model: self.config.llm_model.clone(),
                messages: built.messages,
                stream: prompt.streaming_enabled,
                max_tokens: None,
                temperature: None,
                tools: built.tools,
            };

            let assistant = match self.call_llm(request, &cancel, &events).await {
                Ok(assistant) => assistant,
                Err(e) => return self.fail(prompt, &events, &e).await,
            };

            if !assistant.has_tool_calls() {
                prompt.conversation_history.push(assistant.to_message());
                prompt.result_content = assistant.content.clone();
                prompt.status = PromptStatus::Completed;
                let _ = events.send(TurnEvent::Finished(assistant)).await;

                if let Some(id) = session_id {
                    if let Err(e) = self
                        .store
                        .append_turn(id, prompt.conversation_history.clone(), tool_calls_executed)
                        .await
                    {
                        debug!(session = %id, error = %e, "session append failed");
                    }
                }
                info!(prompt = %prompt.prompt_id, iterations, "turn finished");
                return prompt;
            }

            // The model wants tools. Enforce the recursion bound before
            // dispatching anything further.
            if iterations >= self.config.max_turn_iterations {
                prompt.conversation_history.push(assistant.to_message());
                prompt.result_content = assistant.content.clone();
                return self
                    .fail(prompt, &events, &Error::ToolLoopExceeded(iterations))
                    .await;
            }
            iterations += 1;

            prompt.status = PromptStatus::AwaitingTool;
            prompt.conversation_history.push(assistant.to_message());
            prompt.tool_calls = assistant.tool_calls.clone();

            for call in &assistant.tool_calls {
                let _ = events.send(TurnEvent::ToolCallRequest(call.clone())).await;
            }

            // Duplicate ids within the turn execute once; duplicates get an
            // error reply.
            let calls: Vec<(crate::types::ToolCall, bool)> = assistant
                .tool_calls
                .iter()
                .map(|call| {
                    let duplicate = !seen_call_ids.insert(call.id.clone());
                    (call.clone(), duplicate)
                })
                .collect();

            // Bounded fan-out preserving issue order.
            let child = cancel.child_token();
            let executor = Arc::clone(&self.executor);
            let results: Vec<ToolResult> = futures::stream::iter(calls.into_iter().map(
                move |(call, duplicate)| {
                    let executor = Arc::clone(&executor);
                    let child = child.clone();
                    async move {
                        if duplicate {
                            ToolResult::fail(
                                call.name(),
                                format!("DuplicateCallId: id '{}' was already used in this turn", call.id),
                            )
                        } else {
                            executor.execute_tool_call(&call, &child).await
                        }
                    }
                },
            ))
            .buffered(self.config.global_tool_concurrency.max(1))
            .collect()
            .await;

            let issued = prompt.tool_calls.clone();
            for (call, result) in issued.iter().zip(results) {
                let _ = events
                    .send(TurnEvent::ToolCallResponse {
                        call_id: call.id.clone(),
                        result: result.clone(),
                    })
                    .await;
                prompt.conversation_history.push(Message::tool(
                    &call.id,
                    call.name(),
                    result.llm_content.clone(),
                ));
                tool_calls_executed += 1;
            }
            prompt.tool_calls.clear();

            if cancel.is_cancelled() {
                // Partial results stay in the turn history.
                return self.fail(prompt, &events, &Error::Cancelled).await;
            }

            prompt.status = PromptStatus::Processing;
            // Recurse: the next loop iteration re-invokes the LLM with the
            // tool results appended.
        }
    }

    /// One retry-wrapped LLM call, streaming or not.
    async fn call_llm(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<AssistantMessage> {
        let retry = RetryConfig::from_kernel(&self.config);

        if request.stream {
            retry_with_backoff(&retry, || {
                let request = request.clone();
                let events = events.clone();
                let cancel = cancel.clone();
                async move {
                    let mut chunks = self.provider.stream(request).await?;
                    let mut assembler = StreamAssembler::new();
                    loop {
                        let chunk = tokio::select! {
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            chunk = chunks.next() => chunk,
                        };
                        match chunk {
                            None => break,
                            Some(Ok(chunk)) => {
                                if let Some(fragment) = assembler.push(chunk) {
                                    let _ = events.send(TurnEvent::Content(fragment)).await;
                                }
                            }
                            Some(Err(e)) => return Err(e),
                        }
                    }
                    Ok(assembler.finish())
                }
            })
            .await
        } else {
            let assistant = retry_with_backoff(&retry, || {
                let request = request.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        result = self.provider.generate(request) => result,
                    }
                }
            })
            .await?;
            if let Some(content) = &assistant.content {
                if !content.is_empty() {
                    let _ = events.send(TurnEvent::Content(content.clone())).await;
                }
            }
            Ok(assistant)
        }
    }

    /// Terminal failure: emit the signal, mark the prompt, append nothing to
    /// the session.
    async fn fail(
        &self,
        mut prompt: PromptObject,
        events: &mpsc::Sender<TurnEvent>,
        error: &Error,
    ) -> PromptObject {
        info!(prompt = %prompt.prompt_id, error = %error, "turn failed");
        prompt.status = PromptStatus::Error;
        let _ = events.send(TurnEvent::Error(error.signal())).await;
        prompt
    }
}
