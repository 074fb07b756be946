//! Kernel configuration.
//!
//! [`KernelConfig`] is validated once at boot through [`KernelConfigBuilder`];
//! a bad configuration is the only fatal error class in the crate. The
//! constructed value is immutable and passed explicitly to every component;
//! there is no ambient global.
//!
//! # Example
//!
//! ```
//! use agent_kernel::KernelConfig;
//!
//! let config = KernelConfig::builder()
//!     .llm_endpoint("http://localhost:1234/v1")
//!     .llm_model("qwen2.5-32b-instruct")
//!     .max_turn_iterations(4)
//!     .build()
//!     .expect("valid configuration");
//! assert_eq!(config.max_turn_iterations, 4);
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Immutable kernel configuration.
///
/// Construct with [`KernelConfig::builder()`]; required fields are the LLM
/// endpoint and model, everything else has a working default.
#[derive(Clone)]
pub struct KernelConfig {
    /// OpenAI-compatible chat/completions endpoint (e.g. `http://host/v1`).
    pub llm_endpoint: String,
    /// Model identifier sent on every request.
    pub llm_model: String,
    /// Bearer token for the LLM endpoint. Local servers usually ignore it.
    pub llm_api_key: String,

    /// Hard cap on characters materialised into one LLM request.
    pub max_context_size: usize,
    /// Message-count cap per history plane.
    pub max_history_length: usize,
    /// Message count that triggers summarisation. Must be strictly less than
    /// `max_history_length`.
    pub compression_threshold: usize,

    /// Retries after the initial attempt for retryable LLM failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_retry_delay: Duration,
    /// Jitter factor applied to backoff delays (0.0 to 1.0).
    pub retry_jitter: f64,

    /// Cap on tool round-trips within a single turn.
    pub max_turn_iterations: u32,

    /// Concurrency cap per tool name.
    pub per_tool_concurrency: usize,
    /// Concurrency cap across all tool executions.
    pub global_tool_concurrency: usize,
    /// Timeout for tools whose definition does not carry its own.
    pub default_tool_timeout: Duration,

    /// Listen address for the kernel's own MCP server, if enabled.
    pub mcp_listen_address: Option<SocketAddr>,
    /// Bearer token required by the kernel's MCP server.
    pub mcp_auth_token: Option<String>,

    /// Directory holding domain overlay files.
    pub domain_directory: Option<PathBuf>,
    /// Directory for runtime state such as the persisted agent registry.
    pub runtime_data_directory: Option<PathBuf>,

    /// Log level hint for the embedding application.
    pub log_level: String,
}

/// Mask the API key in debug output.
impl std::fmt::Debug for KernelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConfig")
            .field("llm_endpoint", &self.llm_endpoint)
            .field("llm_model", &self.llm_model)
            .field("llm_api_key", &"***")
            .field("max_context_size", &self.max_context_size)
            .field("max_history_length", &self.max_history_length)
            .field("compression_threshold", &self.compression_threshold)
            .field("max_retries", &self.max_retries)
            .field("base_retry_delay", &self.base_retry_delay)
            .field("retry_jitter", &self.retry_jitter)
            .field("max_turn_iterations", &self.max_turn_iterations)
            .field("per_tool_concurrency", &self.per_tool_concurrency)
            .field("global_tool_concurrency", &self.global_tool_concurrency)
            .field("default_tool_timeout", &self.default_tool_timeout)
            .field("mcp_listen_address", &self.mcp_listen_address)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl KernelConfig {
    /// Create a new builder.
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }
}

/// Builder for [`KernelConfig`] with validation at `build()`.
#[derive(Default, Debug)]
pub struct KernelConfigBuilder {
    llm_endpoint: Option<String>,
    llm_model: Option<String>,
    llm_api_key: Option<String>,
    max_context_size: Option<usize>,
    max_history_length: Option<usize>,
    compression_threshold: Option<usize>,
    max_retries: Option<u32>,
    base_retry_delay: Option<Duration>,
    retry_jitter: Option<f64>,
    max_turn_iterations: Option<u32>,
    per_tool_concurrency: Option<usize>,
    global_tool_concurrency: Option<usize>,
    default_tool_timeout: Option<Duration>,
    mcp_listen_address: Option<SocketAddr>,
    mcp_auth_token: Option<String>,
    domain_directory: Option<PathBuf>,
    runtime_data_directory: Option<PathBuf>,
    log_level: Option<String>,
}

impl KernelConfigBuilder {
    /// Sets the OpenAI-compatible endpoint URL (required).
    pub fn llm_endpoint(mut self, url: impl Into<String>) -> Self {
        self.llm_endpoint = Some(url.into());
        self
    }

    /// Sets the model identifier (required).
    pub fn llm_model(mut self, model: impl Into<String>) -> Self {
        self.llm_model = Some(model.into());
        self
    }

    /// Sets the LLM API key.
    pub fn llm_api_key(mut self, key: impl Into<String>) -> Self {
        self.llm_api_key = Some(key.into());
        self
    }

    /// Sets the character cap per materialised request.
    pub fn max_context_size(mut self, chars: usize) -> Self {
        self.max_context_size = Some(chars);
        self
    }

    /// Sets the message-count cap per history plane.
    pub fn max_history_length(mut self, messages: usize) -> Self {
        self.max_history_length = Some(messages);
        self
    }

    /// Sets the compression trigger threshold.
    pub fn compression_threshold(mut self, messages: usize) -> Self {
        self.compression_threshold = Some(messages);
        self
    }

    /// Sets the retry count for retryable LLM failures.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the base backoff delay.
    pub fn base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = Some(delay);
        self
    }

    /// Sets the backoff jitter factor (clamped to 0.0..=1.0 at build).
    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = Some(jitter);
        self
    }

    /// Sets the tool-recursion bound per turn.
    pub fn max_turn_iterations(mut self, iterations: u32) -> Self {
        self.max_turn_iterations = Some(iterations);
        self
    }

    /// Sets the per-tool concurrency cap.
    pub fn per_tool_concurrency(mut self, cap: usize) -> Self {
        self.per_tool_concurrency = Some(cap);
        self
    }

    /// Sets the global tool concurrency cap.
    pub fn global_tool_concurrency(mut self, cap: usize) -> Self {
        self.global_tool_concurrency = Some(cap);
        self
    }

    /// Sets the default per-tool timeout.
    pub fn default_tool_timeout(mut self, timeout: Duration) -> Self {
        self.default_tool_timeout = Some(timeout);
        self
    }

    /// Sets the listen address for the kernel's MCP server.
    pub fn mcp_listen_address(mut self, addr: SocketAddr) -> Self {
        self.mcp_listen_address = Some(addr);
        self
    }

    /// Sets the bearer token for the kernel's MCP server.
    pub fn mcp_auth_token(mut self, token: impl Into<String>) -> Self {
        self.mcp_auth_token = Some(token.into());
        self
    }

    /// Sets the domain overlay directory.
    pub fn domain_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.domain_directory = Some(dir.into());
        self
    }

    /// Sets the runtime data directory.
    pub fn runtime_data_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_data_directory = Some(dir.into());
        self
    }

    /// Sets the log level hint.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Validates the configuration and builds the final [`KernelConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a required field is missing, the
    /// endpoint is not an http(s) URL, or a numeric constraint is violated
    /// (notably `compression_threshold < max_history_length`).
    pub fn build(self) -> Result<KernelConfig> {
        let llm_endpoint = self
            .llm_endpoint
            .ok_or_else(|| Error::config("llm_endpoint is required"))?;
        if !llm_endpoint.starts_with("http://") && !llm_endpoint.starts_with("https://") {
            return Err(Error::config(
                "llm_endpoint must start with http:// or https://",
            ));
        }

        let llm_model = self
            .llm_model
            .ok_or_else(|| Error::config("llm_model is required"))?;
        if llm_model.trim().is_empty() {
            return Err(Error::config("llm_model cannot be empty or whitespace"));
        }

        let max_history_length = self.max_history_length.unwrap_or(40);
        let compression_threshold = self.compression_threshold.unwrap_or_else(|| {
            // Default threshold sits at half the history cap.
            (max_history_length / 2).max(1)
        });
        if compression_threshold >= max_history_length {
            return Err(Error::config(
                "compression_threshold must be strictly less than max_history_length",
            ));
        }

        let max_turn_iterations = self.max_turn_iterations.unwrap_or(8);
        if max_turn_iterations == 0 {
            return Err(Error::config("max_turn_iterations must be greater than 0"));
        }

        let per_tool_concurrency = self.per_tool_concurrency.unwrap_or(2);
        let global_tool_concurrency = self.global_tool_concurrency.unwrap_or(8);
        if per_tool_concurrency == 0 || global_tool_concurrency == 0 {
            return Err(Error::config("concurrency caps must be greater than 0"));
        }

        let retry_jitter = self.retry_jitter.unwrap_or(0.1);
        if !(0.0..=1.0).contains(&retry_jitter) {
            return Err(Error::config("retry_jitter must be between 0.0 and 1.0"));
        }

        Ok(KernelConfig {
            llm_endpoint,
            llm_model,
            llm_api_key: self.llm_api_key.unwrap_or_else(|| "not-needed".to_string()),
            max_context_size: self.max_context_size.unwrap_or(48_000),
            max_history_length,
            compression_threshold,
            max_retries: self.max_retries.unwrap_or(3),
            base_retry_delay: self.base_retry_delay.unwrap_or(Duration::from_secs(1)),
            retry_jitter,
            max_turn_iterations,
            per_tool_concurrency,
            global_tool_concurrency,
            default_tool_timeout: self.default_tool_timeout.unwrap_or(Duration::from_secs(30)),
            mcp_listen_address: self.mcp_listen_address,
            mcp_auth_token: self.mcp_auth_token,
            domain_directory: self.domain_directory,
            runtime_data_directory: self.runtime_data_directory,
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}
