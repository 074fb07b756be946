//! Root kernel.
//!
//! [`Kernel`] is the composition root: it owns the registry, fleet,
//! execution manager, conversation store, provider adapter, domain manager
//! and turn engine, constructed once from a validated [`KernelConfig`] and
//! passed around as narrow `Arc` handles. There is no ambient global and no
//! back references: services never see the kernel, only the collaborators
//! they need.
//!
//! # Example
//!
//! ```no_run
//! use agent_kernel::{Kernel, KernelConfig, SubmitOptions, TurnEvent, local_tool};
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
//!         local_tool("shell_command", "Run a shell command")
//!             .param("command", "string")
//!             .build(|args| async move {
//!                 let command = args["command"].as_str().unwrap_or_default().to_string();
//!                 Ok(json!(format!("(would run {command})")))
//!             }),
//!     )?;
//!
//!     let session = kernel.create_session().await;
//!     let mut turn = kernel
//!         .submit_prompt("What's the date?", SubmitOptions::default().session(session))
//!         .await?;
//!     while let Some(event) = turn.next_event().await {
//!         if let TurnEvent::Content(text) = event {
//!             print!("{text}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::approval::{ApprovalHandler, ApprovalPolicy};
use crate::config::KernelConfig;
use crate::conversation::ConversationStore;
use crate::domain::{DomainManager, DomainOverlay};
use crate::executor::ExecutionManager;
use crate::fleet::McpFleet;
use crate::prompt::DEFAULT_BASE_INSTRUCTIONS;
use crate::provider::{LlmProvider, OpenAiProvider};
use crate::registry::ToolRegistry;
use crate::server::{McpServerState, serve};
use crate::tools::LocalTool;
use crate::transport::EndpointDescriptor;
use crate::turn::{TurnEngine, TurnHandle};
use crate::types::{PromptObject, ToolPolicy};
use crate::{Error, Result};

/// Per-prompt submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Session to run the turn under; `None` runs a sessionless turn.
    pub session_id: Option<Uuid>,
    /// Override streaming (defaults to on).
    pub streaming: Option<bool>,
    /// Override the tool exposure policy.
    pub tool_policy: Option<ToolPolicy>,
    /// Names for the `NamedSubset` policy.
    pub custom_tools: Option<Vec<String>>,
}

impl SubmitOptions {
    /// Run under `session_id`.
    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Toggle streaming.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    /// Expose only the named tools.
    pub fn tools(mut self, names: Vec<String>) -> Self {
        self.tool_policy = Some(ToolPolicy::NamedSubset);
        self.custom_tools = Some(names);
        self
    }

    /// Expose no tools.
    pub fn no_tools(mut self) -> Self {
        self.tool_policy = Some(ToolPolicy::None);
        self
    }
}

/// Builder wiring optional collaborators before the kernel is assembled.
pub struct KernelBuilder {
    config: KernelConfig,
    provider: Option<Arc<dyn LlmProvider>>,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    approval_policy: ApprovalPolicy,
    base_instructions: String,
}

impl KernelBuilder {
    /// Override the LLM provider (tests inject scripted providers here).
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Install an approval handler (e.g. an [`ApprovalQueue`](crate::ApprovalQueue)).
    pub fn approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval_handler = Some(handler);
        self
    }

    /// Supply the `auto_edit` whitelist / plan token data.
    pub fn approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval_policy = policy;
        self
    }

    /// Replace the base system instructions.
    pub fn base_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.base_instructions = instructions.into();
        self
    }

    /// Assemble the kernel.
    pub fn build(self) -> Result<Kernel> {
        let provider: Arc<dyn LlmProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(OpenAiProvider::new(&self.config)?),
        };

        let registry = Arc::new(ToolRegistry::new());
        let fleet = Arc::new(McpFleet::new(
            Arc::clone(&registry),
            self.config.runtime_data_directory.clone(),
        ));

        let mut executor =
            ExecutionManager::new(Arc::clone(&registry), Arc::clone(&fleet), &self.config)
                .with_policy(self.approval_policy);
        if let Some(handler) = self.approval_handler {
            executor = executor.with_approval_handler(handler);
        }
        let executor = Arc::new(executor);

        let store = Arc::new(ConversationStore::new(&self.config, Arc::clone(&provider)));
        let domains = Arc::new(DomainManager::new(
            Arc::clone(&registry),
            Arc::clone(&fleet),
            self.config.domain_directory.clone(),
        ));

        let engine = Arc::new(TurnEngine::new(
            Arc::clone(&provider),
            Arc::clone(&executor),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&domains),
            self.config.clone(),
            self.base_instructions,
        ));

        info!(model = %self.config.llm_model, "kernel assembled");
        Ok(Kernel {
            config: self.config,
            registry,
            fleet,
            executor,
            provider,
            store,
            domains,
            engine,
        })
    }
}

/// The assembled orchestration kernel.
pub struct Kernel {
    config: KernelConfig,
    registry: Arc<ToolRegistry>,
    fleet: Arc<McpFleet>,
    executor: Arc<ExecutionManager>,
    provider: Arc<dyn LlmProvider>,
    store: Arc<ConversationStore>,
    domains: Arc<DomainManager>,
    engine: Arc<TurnEngine>,
}

impl Kernel {
    /// Build a kernel with the default HTTP provider.
    pub fn new(config: KernelConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start a builder for custom wiring.
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder {
            config,
            provider: None,
            approval_handler: None,
            approval_policy: ApprovalPolicy::default(),
            base_instructions: DEFAULT_BASE_INSTRUCTIONS.to_string(),
        }
    }

    /// The kernel's configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The shared tool registry.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The MCP client fleet.
    pub fn fleet(&self) -> &Arc<McpFleet> {
        &self.fleet
    }

    /// The execution manager.
    pub fn executor(&self) -> &Arc<ExecutionManager> {
        &self.executor
    }

    /// The conversation store.
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// The domain manager.
    pub fn domains(&self) -> &Arc<DomainManager> {
        &self.domains
    }

    /// The LLM provider.
    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Register an in-process tool.
    pub fn register_tool(&self, tool: LocalTool) -> Result<()> {
        self.executor.register_tool(tool)
    }

    /// Create a new session.
    pub async fn create_session(&self) -> Uuid {
        self.store.create_session().await
    }

    /// Connect an external agent; returns its assigned id.
    pub async fn connect_agent(&self, descriptor: EndpointDescriptor) -> Result<String> {
        self.fleet.connect(descriptor).await
    }

    /// Disconnect an external agent.
    pub async fn disconnect_agent(&self, agent_id: &str) -> Result<()> {
        self.fleet.disconnect(agent_id).await
    }

    /// Reconnect every agent from the persisted registry.
    pub async fn rehydrate_agents(&self) -> Result<usize> {
        self.fleet.rehydrate().await
    }

    /// Persist the current agent registry.
    pub async fn save_agent_registry(&self) -> Result<()> {
        self.fleet.save_agent_registry().await
    }

    /// Load a domain overlay by name from the domain directory.
    pub async fn load_domain(&self, name: &str) -> Result<()> {
        self.domains.load_by_name(name).await
    }

    /// Load an already-parsed domain overlay.
    pub async fn load_domain_overlay(&self, overlay: DomainOverlay) -> Result<()> {
        self.domains.load(overlay).await
    }

    /// Unload the current domain.
    pub async fn unload_domain(&self) -> Result<()> {
        self.domains.unload().await
    }

    /// Submit a prompt and stream its turn events.
    ///
    /// Rejects immediately when a domain load is in flight or the session
    /// does not exist; later failures arrive as `error` events on the
    /// handle.
    pub async fn submit_prompt(
        &self,
        content: impl Into<String>,
        options: SubmitOptions,
    ) -> Result<TurnHandle> {
        if self.domains.is_loading() {
            return Err(Error::DomainLoading);
        }
        if let Some(session_id) = options.session_id {
            if !self.store.has_session(session_id).await {
                return Err(Error::other(format!("session '{session_id}' does not exist")));
            }
        }

        let mut prompt = PromptObject::user(content);
        if let Some(streaming) = options.streaming {
            prompt.streaming_enabled = streaming;
        }
        if let Some(policy) = options.tool_policy {
            prompt.tool_policy = policy;
        }
        if options.custom_tools.is_some() {
            prompt.custom_tools = options.custom_tools;
        }

        Ok(self.engine.run_turn(prompt, options.session_id))
    }

    /// Serve the kernel's own MCP surface on the configured listen address.
    pub async fn serve_mcp(&self) -> Result<tokio::task::JoinHandle<()>> {
        let addr = self
            .config
            .mcp_listen_address
            .ok_or_else(|| Error::config("no mcp_listen_address configured"))?;
        let state = Arc::new(McpServerState::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            self.config.mcp_auth_token.clone(),
        ));
        serve(state, addr).await
    }
}
