//! Domain manager.
//!
//! A *domain* is a named overlay of tools, MCP endpoints and prompt
//! fragments, described by a JSON file in the configured domain directory.
//! At most one domain is loaded at a time; loading a new one atomically
//! unloads the previous one, and any failure mid-load rolls back to the
//! previous overlay.
//!
//! Turn requests that arrive while a load is in flight are rejected with
//! `DomainLoading` (the kernel checks [`DomainManager::is_loading`] before
//! starting a turn). Loads happen between turns by construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::fleet::McpFleet;
use crate::registry::ToolRegistry;
use crate::transport::EndpointDescriptor;
use crate::types::ToolDefinition;
use crate::{Error, Result};

/// A named overlay of tools, endpoints and prompt fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainOverlay {
    /// Domain name; also tags its registrations.
    pub name: String,
    /// Overlay version string.
    #[serde(default)]
    pub version: String,
    /// Fragments appended to the system message while loaded.
    #[serde(default)]
    pub prompt_fragments: Vec<String>,
    /// Local tool definitions the domain contributes. Handlers are resolved
    /// by name against the execution manager's local table.
    #[serde(default)]
    pub tool_definitions: Vec<ToolDefinition>,
    /// MCP endpoints to connect while loaded, keyed by a stable label.
    #[serde(default)]
    pub mcp_endpoints: HashMap<String, EndpointDescriptor>,
}

struct LoadedDomain {
    overlay: DomainOverlay,
    /// Agent ids this domain connected.
    agents: Vec<String>,
}

/// Hot-swaps domain overlays between turns.
pub struct DomainManager {
    registry: Arc<ToolRegistry>,
    fleet: Arc<McpFleet>,
    directory: Option<PathBuf>,
    current: Mutex<Option<LoadedDomain>>,
    loading: AtomicBool,
}

impl DomainManager {
    /// Create a manager over the shared registry and fleet.
    pub fn new(
        registry: Arc<ToolRegistry>,
        fleet: Arc<McpFleet>,
        directory: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            fleet,
            directory,
            current: Mutex::new(None),
            loading: AtomicBool::new(false),
        }
    }

    /// Whether a load is currently in flight.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// The loaded overlay, if any.
    pub async fn current(&self) -> Option<DomainOverlay> {
        self.current.lock().await.as_ref().map(|d| d.overlay.clone())
    }

    /// Parse `<directory>/<name>.json` and load it.
    pub async fn load_by_name(self: &Arc<Self>, name: &str) -> Result<()> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| Error::config("no domain_directory configured"))?;
        let path = directory.join(format!("{name}.json"));
        let json = std::fs::read_to_string(&path)
            .map_err(|e| Error::other(format!("cannot read domain file '{}': {e}", path.display())))?;
        let overlay: DomainOverlay = serde_json::from_str(&json)?;
        self.load(overlay).await
    }

    /// Load `overlay`, atomically replacing the current domain.
    ///
    /// Rejects with `DomainLoading` when another load is in flight. On any
    /// failure the previous domain's tools and endpoints are restored (best
    /// effort for endpoint reconnects, logged when they fail).
    pub async fn load(self: &Arc<Self>, overlay: DomainOverlay) -> Result<()> {
        if self
            .loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::DomainLoading);
        }
        let result = self.load_inner(overlay).await;
        self.loading.store(false, Ordering::SeqCst);
        result
    }

    async fn load_inner(self: &Arc<Self>, overlay: DomainOverlay) -> Result<()> {
        let mut current = self.current.lock().await;

        // Unload the previous domain, keeping it around for rollback.
        let previous = current.take();
        if let Some(prev) = &previous {
            self.teardown(prev).await;
        }

        match self.bring_up(&overlay).await {
            Ok(agents) => {
                info!(domain = %overlay.name, version = %overlay.version, "domain loaded");
                *current = Some(LoadedDomain { overlay, agents });
                Ok(())
            }
            Err(e) => {
                warn!(domain = %overlay.name, error = %e, "domain load failed, rolling back");
                // Remove anything the failed load managed to register.
                self.registry.deregister_domain(&overlay.name);
                // Restore the previous overlay.
                if let Some(prev) = previous {
                    match self.bring_up(&prev.overlay).await {
                        Ok(agents) => {
                            *current = Some(LoadedDomain {
                                overlay: prev.overlay,
                                agents,
                            });
                        }
                        Err(rollback_err) => {
                            warn!(
                                domain = %prev.overlay.name,
                                error = %rollback_err,
                                "rollback failed, no domain loaded"
                            );
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Unload the current domain, if any.
    pub async fn unload(&self) -> Result<()> {
        if self
            .loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::DomainLoading);
        }
        let mut current = self.current.lock().await;
        if let Some(loaded) = current.take() {
            self.teardown(&loaded).await;
            info!(domain = %loaded.overlay.name, "domain unloaded");
        }
        self.loading.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Register tools and connect endpoints for `overlay`. Returns the
    /// connected agent ids; fails on the first refused registration or
    /// failed connection (the caller rolls back).
    async fn bring_up(self: &Arc<Self>, overlay: &DomainOverlay) -> Result<Vec<String>> {
        for def in &overlay.tool_definitions {
            self.registry
                .register_local_tagged(def.clone(), Some(overlay.name.clone()))?;
        }

        let mut agents = Vec::new();
        for (label, descriptor) in &overlay.mcp_endpoints {
            let agent_id = format!("domain:{}:{label}", overlay.name);
            match self
                .fleet
                .connect_as(agent_id.clone(), descriptor.clone())
                .await
            {
                Ok(()) => agents.push(agent_id),
                Err(e) => {
                    // Disconnect what this overlay already brought up.
                    for agent in &agents {
                        let _ = self.fleet.disconnect(agent).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(agents)
    }

    /// Remove a loaded domain's registrations and connections.
    async fn teardown(&self, loaded: &LoadedDomain) {
        self.registry.deregister_domain(&loaded.overlay.name);
        for agent in &loaded.agents {
            if let Err(e) = self.fleet.disconnect(agent).await {
                warn!(agent = %agent, error = %e, "domain endpoint disconnect failed");
            }
        }
    }
}
