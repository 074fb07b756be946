//! Approval queue and policy.
//!
//! The execution manager decides *whether* a tool execution needs approval
//! (the mode matrix lives in [`ApprovalPolicy`]); deciding *the answer* is
//! delegated to an [`ApprovalHandler`]. The default production handler is a
//! queue: requests are enqueued, the executing task suspends, and whoever
//! drains the queue (a UI, an operator bot) responds through a oneshot
//! channel.
//!
//! Approval mode matrix:
//!
//! | mode       | behaviour                                                   |
//! |------------|-------------------------------------------------------------|
//! | `default`  | ask iff the definition sets `approval_required`             |
//! | `auto_edit`| auto-approve names on the policy whitelist, ask otherwise   |
//! | `plan`     | auto-approve names covered by the plan token, ask otherwise |
//! | `yolo`     | never ask                                                   |
//!
//! `auto_edit` and `plan` are policy hooks: the whitelist and plan token are
//! supplied by the caller.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::types::{ApprovalMode, ToolDefinition};

/// A pending approval question.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// The execution awaiting the decision.
    pub execution_id: Uuid,
    /// Tool to be executed.
    pub tool_name: String,
    /// Validated parameters.
    pub parameters: Value,
    /// Mode that triggered the question.
    pub mode: ApprovalMode,
}

/// Outcome of an approval question.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Approved,
    Denied(String),
}

/// Answers approval questions. Implementations may block (a human in the
/// loop); the executing task is suspended, not the kernel.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything. Useful for tests and trusted embeddings.
pub struct ApproveAll;

#[async_trait]
impl ApprovalHandler for ApproveAll {
    async fn decide(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// Denies everything with a fixed reason.
pub struct DenyAll(pub String);

#[async_trait]
impl ApprovalHandler for DenyAll {
    async fn decide(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Denied(self.0.clone())
    }
}

/// Caller-supplied data consulted by the `auto_edit` and `plan` modes.
#[derive(Debug, Clone, Default)]
pub struct ApprovalPolicy {
    /// Operations `auto_edit` may approve without asking.
    pub auto_edit_whitelist: HashSet<String>,
    /// Out-of-band plan token: the set of operations the current plan
    /// covers. `None` means no plan is active and `plan` mode always asks.
    pub plan_token: Option<HashSet<String>>,
}

impl ApprovalPolicy {
    /// Whether an execution of `definition` needs an approval decision.
    pub fn requires_approval(&self, definition: &ToolDefinition) -> bool {
        match definition.approval_mode {
            ApprovalMode::Yolo => false,
            ApprovalMode::Default => definition.approval_required,
            ApprovalMode::AutoEdit => !self.auto_edit_whitelist.contains(&definition.name),
            ApprovalMode::Plan => !self
                .plan_token
                .as_ref()
                .is_some_and(|plan| plan.contains(&definition.name)),
        }
    }
}

/// A queued approval question with its response channel.
pub struct PendingApproval {
    /// The question.
    pub request: ApprovalRequest,
    respond: oneshot::Sender<ApprovalDecision>,
}

impl PendingApproval {
    /// Answer the question, resuming the suspended execution.
    pub fn respond(self, decision: ApprovalDecision) {
        let _ = self.respond.send(decision);
    }
}

/// Queue-backed approval handler.
///
/// `ApprovalQueue` implements [`ApprovalHandler`] by enqueueing; the paired
/// [`ApprovalInbox`] is handed to the component that answers questions.
pub struct ApprovalQueue {
    tx: mpsc::Sender<PendingApproval>,
}

/// The draining side of an [`ApprovalQueue`].
pub struct ApprovalInbox {
    rx: Mutex<mpsc::Receiver<PendingApproval>>,
}

impl ApprovalQueue {
    /// Create a queue with the given depth and its inbox.
    pub fn new(depth: usize) -> (Self, ApprovalInbox) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, ApprovalInbox { rx: Mutex::new(rx) })
    }
}

impl ApprovalInbox {
    /// Wait for the next pending approval. Returns `None` once every queue
    /// handle is dropped.
    pub async fn next(&self) -> Option<PendingApproval> {
        self.rx.lock().await.recv().await
    }
}

#[async_trait]
impl ApprovalHandler for ApprovalQueue {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        let pending = PendingApproval {
            request: request.clone(),
            respond: tx,
        };
        if self.tx.send(pending).await.is_err() {
            return ApprovalDecision::Denied("approval queue is closed".to_string());
        }
        match rx.await {
            Ok(decision) => decision,
            Err(_) => ApprovalDecision::Denied("approval request dropped unanswered".to_string()),
        }
    }
}
