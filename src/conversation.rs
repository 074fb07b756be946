//! Conversation store.
//!
//! Two history planes exist. Turn-level history lives on the
//! [`PromptObject`](crate::PromptObject) and is owned by the turn
//! engine. Session-level history lives here, guarded per session (not
//! globally), with a per-session turn gate so a session processes at most
//! one turn at a time.
//!
//! Completed turns are appended verbatim to the session plane. When the
//! plane's message count exceeds the compression threshold the store
//! summarises the oldest segment through the LLM, replacing it with a single
//! system message (`Previous conversation summary: …`) while keeping the two
//! most recent exchanges verbatim. If summarisation fails the plane is
//! trimmed to the tail of `max_history_length` messages instead.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::provider::LlmProvider;
use crate::types::{ChatRequest, Message, Role, Session, WireMessage};
use crate::{Error, Result};

/// Messages kept verbatim at the end of a compressed plane: the two most
/// recent user/assistant exchanges.
const VERBATIM_TAIL: usize = 4;

/// One session's state plus its turn gate.
pub struct SessionSlot {
    /// Session data; lock per access.
    pub data: Mutex<Session>,
    /// Held for the duration of a turn: serialises turns within a session.
    pub turn_gate: Mutex<()>,
}

/// Per-session conversation histories with compression.
pub struct ConversationStore {
    sessions: RwLock<HashMap<Uuid, Arc<SessionSlot>>>,
    provider: Arc<dyn LlmProvider>,
    model: String,
    compression_threshold: usize,
    max_history_length: usize,
}

impl ConversationStore {
    /// Create a store; `provider` powers history summarisation.
    pub fn new(config: &KernelConfig, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            provider,
            model: config.llm_model.clone(),
            compression_threshold: config.compression_threshold,
            max_history_length: config.max_history_length,
        }
    }

    /// Create a new session and return its id.
    pub async fn create_session(&self) -> Uuid {
        let session = Session::new();
        let id = session.session_id;
        self.sessions.write().await.insert(
            id,
            Arc::new(SessionSlot {
                data: Mutex::new(session),
                turn_gate: Mutex::new(()),
            }),
        );
        debug!(session = %id, "created session");
        id
    }

    /// Whether a session exists.
    pub async fn has_session(&self, id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Drop a session entirely.
    pub async fn remove_session(&self, id: Uuid) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }

    /// Handle to a session's slot (data + turn gate).
    pub async fn slot(&self, id: Uuid) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::other(format!("session '{id}' does not exist")))
    }

    /// Clone of the session's current history.
    pub async fn history(&self, id: Uuid) -> Result<Vec<Message>> {
        let slot = self.slot(id).await?;
        let session = slot.data.lock().await;
        Ok(session.history.clone())
    }

    /// Snapshot of the whole session.
    pub async fn snapshot(&self, id: Uuid) -> Result<Session> {
        let slot = self.slot(id).await?;
        let session = slot.data.lock().await;
        Ok(session.clone())
    }

    /// Append a completed turn's messages verbatim and run compression under
    /// threshold. Only well-formed, finished turns reach this point; errored
    /// turns append nothing.
    pub async fn append_turn(
        &self,
        id: Uuid,
        messages: Vec<Message>,
        tool_calls_executed: u64,
    ) -> Result<()> {
        let slot = self.slot(id).await?;
        let history = {
            let mut session = slot.data.lock().await;
            session.statistics.turns_completed += 1;
            session.statistics.messages_appended += messages.len() as u64;
            session.statistics.tool_calls_executed += tool_calls_executed;
            session.history.extend(messages);
            if session.history.len() <= self.compression_threshold {
                return Ok(());
            }
            session.history.clone()
        };

        // Summarise outside the session lock; the turn gate keeps this
        // consistent within a session.
        let (new_history, did_compress) = compress_history(
            history,
            self.provider.as_ref(),
            &self.model,
            self.compression_threshold,
            self.max_history_length,
        )
        .await;

        let mut session = slot.data.lock().await;
        session.history = new_history;
        if did_compress {
            session.statistics.compressions += 1;
        }
        Ok(())
    }
}

/// Compress `messages` when it exceeds `threshold`.
///
/// Returns the new plane and whether a summary replaced the head. On
/// summarisation failure the plane is trimmed to the last
/// `max_history_length` messages and `false` is returned.
pub async fn compress_history(
    messages: Vec<Message>,
    provider: &dyn LlmProvider,
    model: &str,
    threshold: usize,
    max_history_length: usize,
) -> (Vec<Message>, bool) {
    if messages.len() <= threshold || messages.len() <= VERBATIM_TAIL {
        return (messages, false);
    }

    let split = messages.len() - VERBATIM_TAIL;
    let head = &messages[..split];
    let tail = &messages[split..];

    let transcript: String = head
        .iter()
        .map(|m| format!("{}: {}\n", m.role.as_str(), m.content))
        .collect();

    let request = ChatRequest {
        model: model.to_string(),
        messages: vec![
            WireMessage {
                role: Role::System.as_str().to_string(),
                content: Some(
                    "Summarise the following conversation segment in a few sentences. \
                     Preserve facts, decisions, tool outputs and open questions."
                        .to_string(),
                ),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            WireMessage {
                role: Role::User.as_str().to_string(),
                content: Some(transcript),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
        ],
        stream: false,
        max_tokens: Some(512),
        temperature: Some(0.2),
        tools: None,
    };

    match provider.generate(request).await {
        Ok(response) => {
            let Some(summary) = response.content.filter(|c| !c.trim().is_empty()) else {
                warn!("summarisation produced no content, trimming instead");
                return (trim_tail(messages, max_history_length), false);
            };
            let mut compressed =
                vec![Message::system(format!("Previous conversation summary: {summary}"))];
            compressed.extend_from_slice(tail);
            debug!(
                before = split + VERBATIM_TAIL,
                after = compressed.len(),
                "compressed session history"
            );
            (compressed, true)
        }
        Err(e) => {
            warn!(error = %e, "summarisation failed, trimming instead");
            (trim_tail(messages, max_history_length), false)
        }
    }
}

/// Keep the last `max_len` messages.
fn trim_tail(messages: Vec<Message>, max_len: usize) -> Vec<Message> {
    if messages.len() <= max_len {
        return messages;
    }
    let start = messages.len() - max_len;
    messages[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantMessage, FinishReason};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Provider double: summarises with a fixed sentence, or fails.
    struct ScriptedSummarizer {
        fail: AtomicBool,
    }

    impl ScriptedSummarizer {
        fn ok() -> Self {
            Self { fail: AtomicBool::new(false) }
        }
        fn failing() -> Self {
            Self { fail: AtomicBool::new(true) }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedSummarizer {
        async fn generate(&self, _request: ChatRequest) -> Result<AssistantMessage> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::llm(
                    crate::error::ErrorCategory::Server,
                    "summariser down",
                ));
            }
            Ok(AssistantMessage {
                content: Some("they talked about dates".to_string()),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                usage: None,
            })
        }

        async fn stream(&self, _request: ChatRequest) -> Result<crate::provider::ChunkStream> {
            Err(Error::other("not scripted"))
        }
    }

    fn config() -> KernelConfig {
        KernelConfig::builder()
            .llm_endpoint("http://localhost:1234/v1")
            .llm_model("test-model")
            .max_history_length(10)
            .compression_threshold(6)
            .build()
            .unwrap()
    }

    fn chat(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {i}"))
                } else {
                    Message::assistant(format!("answer {i}"))
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = ConversationStore::new(&config(), Arc::new(ScriptedSummarizer::ok()));
        let id = store.create_session().await;
        assert!(store.has_session(id).await);
        assert!(store.history(id).await.unwrap().is_empty());

        store
            .append_turn(id, vec![Message::user("hi"), Message::assistant("hello")], 0)
            .await
            .unwrap();
        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 2);

        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.statistics.turns_completed, 1);
        assert_eq!(snapshot.statistics.messages_appended, 2);

        assert!(store.remove_session(id).await);
        assert!(store.history(id).await.is_err());
    }

    #[tokio::test]
    async fn test_compression_preserves_recent_exchanges_verbatim() {
        let (compressed, did) = compress_history(
            chat(10),
            &ScriptedSummarizer::ok(),
            "test-model",
            6,
            10,
        )
        .await;

        assert!(did);
        // One summary message plus the four newest messages.
        assert_eq!(compressed.len(), 5);
        assert_eq!(compressed[0].role, Role::System);
        assert!(
            compressed[0]
                .content
                .starts_with("Previous conversation summary:")
        );
        assert_eq!(compressed[1].content, "question 6");
        assert_eq!(compressed[4].content, "answer 9");
    }

    #[tokio::test]
    async fn test_compression_failure_falls_back_to_trim() {
        let (trimmed, did) = compress_history(
            chat(16),
            &ScriptedSummarizer::failing(),
            "test-model",
            6,
            10,
        )
        .await;

        assert!(!did);
        assert_eq!(trimmed.len(), 10);
        // Tail preserved.
        assert_eq!(trimmed.last().unwrap().content, "answer 15");
    }

    #[tokio::test]
    async fn test_below_threshold_untouched() {
        let (out, did) =
            compress_history(chat(4), &ScriptedSummarizer::ok(), "test-model", 6, 10).await;
        assert!(!did);
        assert_eq!(out.len(), 4);
    }

    #[tokio::test]
    async fn test_store_compresses_over_threshold() {
        let store = ConversationStore::new(&config(), Arc::new(ScriptedSummarizer::ok()));
        let id = store.create_session().await;

        // 8 messages > threshold 6: compression kicks in.
        store.append_turn(id, chat(8), 0).await.unwrap();
        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].role, Role::System);

        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.statistics.compressions, 1);
    }
}
