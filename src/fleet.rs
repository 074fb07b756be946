//! MCP client fleet: opens, tracks and tears down transports.
//!
//! The fleet owns the transport table and the `agent_id → hosted tool names`
//! map, which makes tool removal on disconnect complete and exact. Discovery
//! flows one way: transports push [`TransportNotice`]s, the fleet re-lists
//! tools, diffs against its bookkeeping, updates the registry and emits
//! [`FleetEvent`]s on a broadcast channel for anyone watching.
//!
//! The fleet also persists its agent registry (`agent_id →
//! EndpointDescriptor`) as a JSON file under the runtime data directory so
//! persistent connections can be rehydrated on startup.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::registry::ToolRegistry;
use crate::transport::{EndpointDescriptor, McpTransport, TransportNotice, TransportStatus};
use crate::types::{ToolDefinition, ToolResult};
use crate::{Error, Result};

/// File name of the persisted agent registry.
const AGENT_REGISTRY_FILE: &str = "external_agents.json";

/// Discovery and lifecycle events emitted by the fleet.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// Initial (or re-listed) tool set for an agent.
    ToolsDiscovered {
        agent_id: String,
        tool_names: Vec<String>,
    },
    /// A tool appeared on an already-connected agent.
    ToolAdded { agent_id: String, tool_name: String },
    /// A tool disappeared from a connected agent.
    ToolRemoved { agent_id: String, tool_name: String },
    /// A tool's definition changed in place.
    ToolUpdated { agent_id: String, tool_name: String },
    /// The agent's transport reached its terminal state.
    ServerDisconnected { agent_id: String },
}

struct FleetEntry {
    transport: Arc<dyn McpTransport>,
    descriptor: EndpointDescriptor,
    /// Tools this fleet registered on behalf of the agent. Authoritative for
    /// removal on disconnect.
    hosted_tools: HashSet<String>,
}

/// Connection manager for every external agent.
pub struct McpFleet {
    registry: Arc<ToolRegistry>,
    entries: RwLock<HashMap<String, FleetEntry>>,
    events: broadcast::Sender<FleetEvent>,
    data_dir: Option<PathBuf>,
    next_agent: AtomicU64,
}

impl McpFleet {
    /// Create a fleet that registers discovered tools into `registry`.
    pub fn new(registry: Arc<ToolRegistry>, data_dir: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
            events,
            data_dir,
            next_agent: AtomicU64::new(1),
        }
    }

    /// Subscribe to fleet events.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Connect to an external agent and register its tools.
    ///
    /// Returns the assigned agent id. The connection is handshaken and its
    /// tool list registered before this returns; discovery updates continue
    /// in the background for the life of the transport.
    pub async fn connect(self: &Arc<Self>, descriptor: EndpointDescriptor) -> Result<String> {
        let agent_id = format!("agent-{}", self.next_agent.fetch_add(1, Ordering::SeqCst));
        self.connect_as(agent_id.clone(), descriptor).await?;
        Ok(agent_id)
    }

    /// Connect under a caller-chosen agent id (used by rehydration and
    /// domain overlays, whose ids must be stable).
    pub async fn connect_as(
        self: &Arc<Self>,
        agent_id: String,
        descriptor: EndpointDescriptor,
    ) -> Result<()> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let transport = descriptor.connect(notice_tx)?;
        self.adopt(agent_id, descriptor, transport, notice_rx).await
    }

    /// Adopt an already-constructed transport under `agent_id`.
    ///
    /// This is the seam the regular connect path goes through; it also lets
    /// embedders (and tests) supply their own [`McpTransport`]
    /// implementation.
    pub async fn adopt(
        self: &Arc<Self>,
        agent_id: String,
        descriptor: EndpointDescriptor,
        transport: Arc<dyn McpTransport>,
        notice_rx: mpsc::UnboundedReceiver<TransportNotice>,
    ) -> Result<()> {
        {
            let entries = self.entries.read().await;
            if entries.contains_key(&agent_id) {
                return Err(Error::other(format!("agent '{agent_id}' is already connected")));
            }
        }

        transport.initialize().await?;

        let defs = transport.list_tools().await?;
        let hosted = self.register_discovered(&agent_id, defs);

        info!(
            agent = %agent_id,
            tools = hosted.len(),
            "connected external agent"
        );
        let _ = self.events.send(FleetEvent::ToolsDiscovered {
            agent_id: agent_id.clone(),
            tool_names: hosted.iter().cloned().collect(),
        });

        self.entries.write().await.insert(
            agent_id.clone(),
            FleetEntry {
                transport,
                descriptor,
                hosted_tools: hosted,
            },
        );

        // Notice listener lives until the transport closes.
        let fleet = Arc::clone(self);
        tokio::spawn(async move {
            fleet.listen(agent_id, notice_rx).await;
        });

        Ok(())
    }

    /// Register freshly discovered definitions; returns the accepted names.
    fn register_discovered(&self, agent_id: &str, defs: Vec<ToolDefinition>) -> HashSet<String> {
        let mut hosted = HashSet::new();
        for def in defs {
            let name = def.name.clone();
            match self
                .registry
                .register_external(agent_id, def.into_external(agent_id))
            {
                Ok(()) => {
                    hosted.insert(name);
                }
                Err(e) => {
                    warn!(agent = %agent_id, tool = %name, error = %e, "tool registration refused");
                }
            }
        }
        hosted
    }

    async fn listen(
        self: Arc<Self>,
        agent_id: String,
        mut notices: mpsc::UnboundedReceiver<TransportNotice>,
    ) {
        while let Some(notice) = notices.recv().await {
            match notice {
                TransportNotice::ToolsListChanged => {
                    if let Err(e) = self.refresh_tools(&agent_id).await {
                        warn!(agent = %agent_id, error = %e, "tool refresh failed");
                    }
                }
                TransportNotice::Closed { reason } => {
                    debug!(agent = %agent_id, %reason, "transport closed");
                    self.handle_disconnect(&agent_id).await;
                    break;
                }
            }
        }
    }

    /// Re-list an agent's tools and reconcile the registry.
    async fn refresh_tools(&self, agent_id: &str) -> Result<()> {
        let transport = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(agent_id)
                .ok_or_else(|| Error::other(format!("agent '{agent_id}' is not connected")))?;
            Arc::clone(&entry.transport)
        };

        let defs = transport.list_tools().await?;
        let new_names: HashSet<String> = defs.iter().map(|d| d.name.clone()).collect();

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(agent_id) else {
            return Ok(());
        };

        // Removals first so renames do not collide.
        let removed: Vec<String> = entry
            .hosted_tools
            .difference(&new_names)
            .cloned()
            .collect();
        for gone in removed {
            self.registry.deregister(&gone);
            entry.hosted_tools.remove(&gone);
            let _ = self.events.send(FleetEvent::ToolRemoved {
                agent_id: agent_id.to_string(),
                tool_name: gone,
            });
        }

        for def in defs {
            let name = def.name.clone();
            if entry.hosted_tools.contains(&name) {
                // Re-register in place to pick up schema/description changes.
                self.registry.deregister(&name);
                if self
                    .registry
                    .register_external(agent_id, def.into_external(agent_id))
                    .is_ok()
                {
                    let _ = self.events.send(FleetEvent::ToolUpdated {
                        agent_id: agent_id.to_string(),
                        tool_name: name,
                    });
                }
            } else if self
                .registry
                .register_external(agent_id, def.into_external(agent_id))
                .is_ok()
            {
                entry.hosted_tools.insert(name.clone());
                let _ = self.events.send(FleetEvent::ToolAdded {
                    agent_id: agent_id.to_string(),
                    tool_name: name,
                });
            }
        }

        let _ = self.events.send(FleetEvent::ToolsDiscovered {
            agent_id: agent_id.to_string(),
            tool_names: entry.hosted_tools.iter().cloned().collect(),
        });
        Ok(())
    }

    /// Remove every trace of a disconnected agent.
    async fn handle_disconnect(&self, agent_id: &str) {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(agent_id)
        };
        if removed.is_some() {
            let names = self.registry.deregister_server(agent_id);
            info!(agent = %agent_id, tools = names.len(), "external agent disconnected");
        }
        let _ = self.events.send(FleetEvent::ServerDisconnected {
            agent_id: agent_id.to_string(),
        });
    }

    /// Disconnect an agent, closing its transport and deregistering its
    /// tools.
    pub async fn disconnect(&self, agent_id: &str) -> Result<()> {
        let transport = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(agent_id)
                .ok_or_else(|| Error::other(format!("agent '{agent_id}' is not connected")))?;
            Arc::clone(&entry.transport)
        };
        transport.close().await;
        // The notice listener also reacts to the close; do the cleanup here
        // as well so disconnect is synchronous for the caller.
        self.handle_disconnect(agent_id).await;
        Ok(())
    }

    /// Ids of all connected agents.
    pub async fn list_connected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tool names hosted by one agent.
    pub async fn capabilities(&self, agent_id: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(agent_id)
            .ok_or_else(|| Error::other(format!("agent '{agent_id}' is not connected")))?;
        let mut names: Vec<String> = entry.hosted_tools.iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Current transport status for an agent.
    pub async fn status(&self, agent_id: &str) -> Option<TransportStatus> {
        let entries = self.entries.read().await;
        entries.get(agent_id).map(|e| e.transport.status())
    }

    /// Invoke a tool on a specific agent.
    ///
    /// Fails with `ToolUnavailable` when the transport is not `ready`.
    pub async fn call(&self, agent_id: &str, tool_name: &str, arguments: Value) -> Result<ToolResult> {
        let transport = {
            let entries = self.entries.read().await;
            let entry = entries.get(agent_id).ok_or_else(|| {
                Error::tool_unavailable(tool_name, format!("agent '{agent_id}' is not connected"))
            })?;
            if entry.transport.status() != TransportStatus::Ready {
                return Err(Error::tool_unavailable(
                    tool_name,
                    format!("agent '{agent_id}' transport is not ready"),
                ));
            }
            Arc::clone(&entry.transport)
        };
        transport.call_tool(tool_name, arguments).await
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn registry_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(AGENT_REGISTRY_FILE))
    }

    /// Persist the current `agent_id → endpoint` map.
    pub async fn save_agent_registry(&self) -> Result<()> {
        let Some(path) = self.registry_path() else {
            return Ok(());
        };
        let map: HashMap<String, EndpointDescriptor> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .map(|(id, e)| (id.clone(), e.descriptor.clone()))
                .collect()
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::other(format!("cannot create data directory: {e}")))?;
        }
        let json = serde_json::to_string_pretty(&map)?;
        std::fs::write(&path, json)
            .map_err(|e| Error::other(format!("cannot write agent registry: {e}")))?;
        debug!(path = %path.display(), agents = map.len(), "saved agent registry");
        Ok(())
    }

    /// Load the persisted `agent_id → endpoint` map, if present.
    pub fn load_agent_registry(&self) -> Result<HashMap<String, EndpointDescriptor>> {
        let Some(path) = self.registry_path() else {
            return Ok(HashMap::new());
        };
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let json = std::fs::read_to_string(&path)
            .map_err(|e| Error::other(format!("cannot read agent registry: {e}")))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Reconnect every persisted agent. Failures are logged per agent and do
    /// not abort the rest.
    pub async fn rehydrate(self: &Arc<Self>) -> Result<usize> {
        let persisted = self.load_agent_registry()?;
        let mut connected = 0;
        for (agent_id, descriptor) in persisted {
            match self.connect_as(agent_id.clone(), descriptor).await {
                Ok(()) => connected += 1,
                Err(e) => warn!(agent = %agent_id, error = %e, "rehydration failed"),
            }
        }
        Ok(connected)
    }
}
