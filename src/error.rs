//! Error types for the orchestration kernel.
//!
//! Two layers live here. [`Error`] is the crate-wide error enum: every fallible
//! operation returns `Result<T, Error>`. [`ErrorSignal`] is the error-as-signal
//! view of the same failure: a structured record with a category and suggested
//! actions that downstream components (the turn engine, a UI) can act on
//! instead of unwinding.
//!
//! Tool-call failures never abort a turn. They are converted into failed
//! [`ToolResult`](crate::ToolResult)s and fed back to the LLM; only LLM
//! failures that survive the retry controller end a turn, and they end it with
//! a signal, not a panic.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using the kernel's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid startup configuration. Fatal at boot.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// HTTP request error (LLM provider or MCP transport).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MCP protocol-version mismatch or malformed handshake.
    #[error("MCP handshake failed: {0}")]
    Handshake(String),

    /// The transport ended while a call was in flight.
    #[error("transport closed")]
    TransportClosed,

    /// The transport's outstanding-request buffer is full.
    #[error("transport overloaded")]
    Overloaded,

    /// The requested tool is not present in the registry.
    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    /// The tool is registered but its hosting transport is not ready.
    #[error("tool '{name}' unavailable: {reason}")]
    ToolUnavailable { name: String, reason: String },

    /// A tool-call id was repeated within one turn.
    #[error("duplicate tool call id '{0}'")]
    DuplicateCallId(String),

    /// The approval handler denied the execution.
    #[error("approval denied: {0}")]
    ApprovalDenied(String),

    /// The per-tool concurrency cap is exhausted.
    #[error("concurrency quota exceeded for tool '{0}'")]
    QuotaExceeded(String),

    /// The tool did not complete within its timeout.
    #[error("tool '{name}' timed out after {timeout:?}")]
    ToolTimeout { name: String, timeout: Duration },

    /// Tool arguments failed JSON Schema validation.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// A domain load is in flight; the request was rejected.
    #[error("domain load in progress")]
    DomainLoading,

    /// The turn's tool-recursion bound was hit.
    #[error("tool loop exceeded after {0} iterations")]
    ToolLoopExceeded(u32),

    /// The operation was aborted by its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// LLM failure, categorised per the retry controller's taxonomy.
    #[error("LLM error ({category}): {message}")]
    Llm {
        category: ErrorCategory,
        message: String,
    },

    /// Streaming protocol error (malformed SSE frame or chunk).
    #[error("streaming error: {0}")]
    Stream(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new handshake error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new invalid-parameters error.
    pub fn invalid_parameters(msg: impl Into<String>) -> Self {
        Error::InvalidParameters(msg.into())
    }

    /// Create a tool-unavailable error.
    pub fn tool_unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ToolUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an LLM error with an explicit category.
    pub fn llm(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Error::Llm {
            category,
            message: msg.into(),
        }
    }

    /// Create a new other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// The short machine-readable kind name, used when a failure is folded
    /// into a tool result.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::Http(_) => "HttpError",
            Error::Json(_) => "JsonError",
            Error::Handshake(_) => "HandshakeError",
            Error::TransportClosed => "TransportClosed",
            Error::Overloaded => "Overloaded",
            Error::ToolNotFound(_) => "ToolNotFound",
            Error::ToolUnavailable { .. } => "ToolUnavailable",
            Error::DuplicateCallId(_) => "DuplicateCallId",
            Error::ApprovalDenied(_) => "ApprovalDenied",
            Error::QuotaExceeded(_) => "QuotaExceeded",
            Error::ToolTimeout { .. } => "ToolTimeout",
            Error::InvalidParameters(_) => "InvalidParameters",
            Error::DomainLoading => "DomainLoading",
            Error::ToolLoopExceeded(_) => "ToolLoopExceeded",
            Error::Cancelled => "Cancelled",
            Error::Llm { .. } => "LLMError",
            Error::Stream(_) => "StreamError",
            Error::Other(_) => "Error",
        }
    }

    /// Categorise this error for the retry controller.
    ///
    /// Categorisation inspects the error kind first and falls back to message
    /// substrings for errors that arrive as opaque text (HTTP bodies, wrapped
    /// provider messages).
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Llm { category, .. } => *category,
            Error::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorCategory::Network
                } else if let Some(status) = e.status() {
                    ErrorCategory::from_status(status.as_u16())
                } else {
                    ErrorCategory::Network
                }
            }
            Error::Config(_) | Error::InvalidParameters(_) | Error::Json(_) => {
                ErrorCategory::Validation
            }
            Error::ToolNotFound(_)
            | Error::ToolUnavailable { .. }
            | Error::DuplicateCallId(_)
            | Error::ApprovalDenied(_)
            | Error::QuotaExceeded(_)
            | Error::ToolTimeout { .. } => ErrorCategory::Tool,
            Error::TransportClosed | Error::Overloaded | Error::Stream(_) => {
                ErrorCategory::Network
            }
            Error::Handshake(_) => ErrorCategory::Validation,
            _ => {
                let msg = self.to_string().to_ascii_lowercase();
                if msg.contains("rate limit") || msg.contains("too many requests") {
                    ErrorCategory::RateLimit
                } else if msg.contains("unauthorized")
                    || msg.contains("forbidden")
                    || msg.contains("api key")
                {
                    ErrorCategory::Auth
                } else if msg.contains("timeout")
                    || msg.contains("connection")
                    || msg.contains("network")
                {
                    ErrorCategory::Network
                } else if msg.contains("internal server") || msg.contains("unavailable") {
                    ErrorCategory::Server
                } else {
                    ErrorCategory::Unknown
                }
            }
        }
    }

    /// Produce the structured signal for this failure.
    pub fn signal(&self) -> ErrorSignal {
        ErrorSignal::from_error(self)
    }
}

/// Failure categories driving retry decisions and suggested actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Auth,
    RateLimit,
    Server,
    Validation,
    Tool,
    Unknown,
}

impl ErrorCategory {
    /// Map an HTTP status code onto a category.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorCategory::Auth,
            429 => ErrorCategory::RateLimit,
            400 | 404 | 422 => ErrorCategory::Validation,
            500..=599 => ErrorCategory::Server,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether the retry controller may retry this category.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::RateLimit | ErrorCategory::Server
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Server => "server",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Tool => "tool",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Structured error signal surfaced to consumers instead of a bare exception.
///
/// A failed turn yields exactly one of these on the event stream. Suggested
/// actions follow fixed per-category heuristics so a UI can render remediation
/// hints without parsing messages.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorSignal {
    /// Failure category.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error kind (e.g. `ToolLoopExceeded`).
    pub kind: String,
    /// Remediation hints derived from the category.
    pub suggested_actions: Vec<String>,
    /// Free-form context supplied by the failing component.
    pub context: HashMap<String, String>,
}

impl ErrorSignal {
    /// Build the signal for an error, deriving category and suggestions.
    pub fn from_error(error: &Error) -> Self {
        let category = error.category();
        Self {
            category,
            message: error.to_string(),
            kind: error.kind().to_string(),
            suggested_actions: suggested_actions(category),
            context: HashMap::new(),
        }
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

fn suggested_actions(category: ErrorCategory) -> Vec<String> {
    let actions: &[&str] = match category {
        ErrorCategory::RateLimit => &["reduce_request_frequency", "retry_after_backoff"],
        ErrorCategory::Auth => &["verify_credentials"],
        ErrorCategory::Network => &["check_connectivity", "retry_after_backoff"],
        ErrorCategory::Validation => &["fix_input"],
        ErrorCategory::Server => &["retry_after_backoff"],
        ErrorCategory::Tool => &["inspect_tool_result"],
        ErrorCategory::Unknown => &["inspect_logs"],
    };
    actions.iter().map(|s| (*s).to_string()).collect()
}
