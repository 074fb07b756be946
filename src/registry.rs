//! Tool registry.
//!
//! The registry holds the union of locally-registered tools and tools hosted
//! by external agents, keyed by globally-unique name. It is the only piece of
//! cross-task mutable state in the kernel and sits behind a single read-mostly
//! lock; registration storms from several MCP transports and a user-triggered
//! domain swap may hit it concurrently.
//!
//! Conflict rules:
//!
//! - A local tool preempts any external tool with the same name: the external
//!   registration is refused (or, when the local arrives second, the external
//!   entry is evicted with a warning).
//! - Between two external transports claiming one name, the first writer
//!   wins; the later registration is refused and logged.
//! - Domain-provided tools are tagged; unloading a domain removes exactly the
//!   tools it introduced.
//!
//! Invariant: an external tool name is present iff some `ready` transport
//! lists it; the fleet enforces this by deregistering on every disconnect
//! and `listChanged` diff.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::types::{ToolDefinition, ToolOrigin};
use crate::{Error, Result};

/// A registry entry: the definition plus the domain that introduced it, if
/// any.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    /// The tool definition; `origin` / `server_ref` live here.
    pub definition: ToolDefinition,
    /// Name of the domain overlay that registered this tool.
    pub domain: Option<String>,
}

/// Filter for [`ToolRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    /// Restrict to one origin.
    pub origin: Option<ToolOrigin>,
    /// Restrict to tools registered by one domain.
    pub domain: Option<String>,
    /// Restrict to an explicit name set.
    pub names: Option<Vec<String>>,
}

/// Thread-safe mapping from tool name to [`RegisteredTool`].
#[derive(Debug, Default)]
pub struct ToolRegistry {
    inner: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local tool.
    ///
    /// Evicts a same-named external tool (locals preempt externals); refuses
    /// a same-named local duplicate.
    pub fn register_local(&self, definition: ToolDefinition) -> Result<()> {
        self.register_local_tagged(definition, None)
    }

    /// Register a local tool on behalf of a domain overlay.
    pub fn register_local_tagged(
        &self,
        mut definition: ToolDefinition,
        domain: Option<String>,
    ) -> Result<()> {
        definition.origin = ToolOrigin::Local;
        definition.server_ref = None;
        let mut inner = self.inner.write().expect("registry lock poisoned");

        if let Some(existing) = inner.get(&definition.name) {
            match existing.definition.origin {
                ToolOrigin::Local => {
                    return Err(Error::other(format!(
                        "local tool '{}' is already registered",
                        definition.name
                    )));
                }
                ToolOrigin::External => {
                    warn!(
                        tool = %definition.name,
                        server = existing.definition.server_ref.as_deref().unwrap_or("?"),
                        "local tool preempts external registration"
                    );
                }
            }
        }

        debug!(tool = %definition.name, "registered local tool");
        inner.insert(
            definition.name.clone(),
            RegisteredTool { definition, domain },
        );
        Ok(())
    }

    /// Register a tool hosted by an external agent.
    ///
    /// Refused when the name is already claimed, whether by a local tool (locals
    /// preempt) or by another transport (first writer wins).
    pub fn register_external(
        &self,
        server_ref: impl Into<String>,
        mut definition: ToolDefinition,
    ) -> Result<()> {
        let server_ref = server_ref.into();
        definition.origin = ToolOrigin::External;
        definition.server_ref = Some(server_ref.clone());

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(existing) = inner.get(&definition.name) {
            let holder = match existing.definition.origin {
                ToolOrigin::Local => "a local tool".to_string(),
                ToolOrigin::External => format!(
                    "agent '{}'",
                    existing.definition.server_ref.as_deref().unwrap_or("?")
                ),
            };
            warn!(
                tool = %definition.name,
                server = %server_ref,
                holder = %holder,
                "refusing external tool registration: name already claimed"
            );
            return Err(Error::other(format!(
                "tool name '{}' is already claimed by {holder}",
                definition.name
            )));
        }

        debug!(tool = %definition.name, server = %server_ref, "registered external tool");
        inner.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                domain: None,
            },
        );
        Ok(())
    }

    /// Remove one tool by name. Returns whether it was present.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self
            .inner
            .write()
            .expect("registry lock poisoned")
            .remove(name)
            .is_some();
        if removed {
            debug!(tool = %name, "deregistered tool");
        }
        removed
    }

    /// Remove every external tool hosted by `server_ref`; returns the removed
    /// names so the caller can emit exact removal events.
    pub fn deregister_server(&self, server_ref: &str) -> Vec<String> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let names: Vec<String> = inner
            .iter()
            .filter(|(_, t)| t.definition.server_ref.as_deref() == Some(server_ref))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            inner.remove(name);
        }
        if !names.is_empty() {
            debug!(server = %server_ref, count = names.len(), "deregistered server tools");
        }
        names
    }

    /// Remove every tool tagged with `domain`; returns the removed names.
    pub fn deregister_domain(&self, domain: &str) -> Vec<String> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let names: Vec<String> = inner
            .iter()
            .filter(|(_, t)| t.domain.as_deref() == Some(domain))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            inner.remove(name);
        }
        names
    }

    /// Look up a tool by name.
    pub fn lookup(&self, name: &str) -> Option<RegisteredTool> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Whether a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List definitions matching `filter`, sorted by name for deterministic
    /// catalogue rendering.
    pub fn list(&self, filter: &ToolFilter) -> Vec<RegisteredTool> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut tools: Vec<RegisteredTool> = inner
            .values()
            .filter(|t| {
                filter
                    .origin
                    .is_none_or(|origin| t.definition.origin == origin)
            })
            .filter(|t| {
                filter
                    .domain
                    .as_deref()
                    .is_none_or(|domain| t.domain.as_deref() == Some(domain))
            })
            .filter(|t| {
                filter
                    .names
                    .as_ref()
                    .is_none_or(|names| names.iter().any(|n| n == &t.definition.name))
            })
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        tools
    }

    /// List every definition.
    pub fn list_all(&self) -> Vec<RegisteredTool> {
        self.list(&ToolFilter::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, format!("{name} tool"), json!({"type": "object", "properties": {}, "required": []}))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register_local(def("shell")).unwrap();

        assert!(registry.has("shell"));
        let found = registry.lookup("shell").unwrap();
        assert_eq!(found.definition.origin, ToolOrigin::Local);
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn test_local_duplicate_refused() {
        let registry = ToolRegistry::new();
        registry.register_local(def("shell")).unwrap();
        assert!(registry.register_local(def("shell")).is_err());
    }

    #[test]
    fn test_local_preempts_external() {
        let registry = ToolRegistry::new();
        registry.register_external("agent-1", def("search")).unwrap();

        // Local registration evicts the external holder.
        registry.register_local(def("search")).unwrap();
        let found = registry.lookup("search").unwrap();
        assert_eq!(found.definition.origin, ToolOrigin::Local);
        assert!(found.definition.server_ref.is_none());
    }

    #[test]
    fn test_external_refused_when_local_exists() {
        let registry = ToolRegistry::new();
        registry.register_local(def("search")).unwrap();
        assert!(registry.register_external("agent-1", def("search")).is_err());
        assert_eq!(
            registry.lookup("search").unwrap().definition.origin,
            ToolOrigin::Local
        );
    }

    #[test]
    fn test_external_first_writer_wins() {
        let registry = ToolRegistry::new();
        registry.register_external("agent-1", def("search")).unwrap();
        assert!(registry.register_external("agent-2", def("search")).is_err());
        assert_eq!(
            registry
                .lookup("search")
                .unwrap()
                .definition
                .server_ref
                .as_deref(),
            Some("agent-1")
        );
    }

    #[test]
    fn test_deregister_server_is_exact() {
        let registry = ToolRegistry::new();
        registry.register_external("agent-1", def("a")).unwrap();
        registry.register_external("agent-1", def("b")).unwrap();
        registry.register_external("agent-2", def("c")).unwrap();
        registry.register_local(def("d")).unwrap();

        let mut removed = registry.deregister_server("agent-1");
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
        assert!(!registry.has("a"));
        assert!(!registry.has("b"));
        assert!(registry.has("c"));
        assert!(registry.has("d"));
    }

    #[test]
    fn test_deregister_domain_removes_only_tagged() {
        let registry = ToolRegistry::new();
        registry
            .register_local_tagged(def("domain_tool"), Some("ops".into()))
            .unwrap();
        registry.register_local(def("core_tool")).unwrap();

        let removed = registry.deregister_domain("ops");
        assert_eq!(removed, vec!["domain_tool".to_string()]);
        assert!(registry.has("core_tool"));
        assert!(!registry.has("domain_tool"));
    }

    #[test]
    fn test_list_filters() {
        let registry = ToolRegistry::new();
        registry.register_local(def("alpha")).unwrap();
        registry.register_external("agent-1", def("beta")).unwrap();

        let locals = registry.list(&ToolFilter {
            origin: Some(ToolOrigin::Local),
            ..Default::default()
        });
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].definition.name, "alpha");

        let named = registry.list(&ToolFilter {
            names: Some(vec!["beta".into()]),
            ..Default::default()
        });
        assert_eq!(named.len(), 1);

        // Sorted output.
        let all = registry.list_all();
        assert_eq!(all[0].definition.name, "alpha");
        assert_eq!(all[1].definition.name, "beta");
    }

    #[test]
    fn test_quiescent_state_matches_registrations() {
        // Interleaved register/deregister activity settles to exactly the
        // surviving registrations.
        let registry = ToolRegistry::new();
        registry.register_local(def("keep_local")).unwrap();
        registry.register_external("agent-1", def("drop_me")).unwrap();
        registry.register_external("agent-2", def("keep_external")).unwrap();
        registry.deregister_server("agent-1");
        registry.deregister("nonexistent");

        let names: Vec<String> = registry
            .list_all()
            .into_iter()
            .map(|t| t.definition.name)
            .collect();
        assert_eq!(names, vec!["keep_external".to_string(), "keep_local".to_string()]);
    }
}
