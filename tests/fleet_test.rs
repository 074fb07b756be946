//! Fleet behaviour against a scripted MCP transport: discovery, listChanged
//! reconciliation, and mid-call disconnects.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agent_kernel::{
    EndpointDescriptor, Error, ExecutionManager, FleetEvent, KernelConfig, McpFleet, McpTransport,
    Result, ToolCall, ToolDefinition, ToolRegistry, ToolResult, TransportNotice, TransportStatus,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transport double with a mutable tool list and a switchable failure mode.
struct ScriptedTransport {
    tools: Mutex<Vec<ToolDefinition>>,
    status: Mutex<TransportStatus>,
    /// When set, `call_tool` fails with `TransportClosed` and the transport
    /// reports itself closed.
    drop_mid_call: AtomicBool,
    refuse_handshake: bool,
    notices: mpsc::UnboundedSender<TransportNotice>,
}

impl ScriptedTransport {
    fn new(
        tools: Vec<ToolDefinition>,
        notices: mpsc::UnboundedSender<TransportNotice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(tools),
            status: Mutex::new(TransportStatus::Connecting),
            drop_mid_call: AtomicBool::new(false),
            refuse_handshake: false,
            notices,
        })
    }

    fn set_tools(&self, tools: Vec<ToolDefinition>) {
        *self.tools.lock().unwrap() = tools;
        let _ = self.notices.send(TransportNotice::ToolsListChanged);
    }

    fn drop_on_next_call(&self) {
        self.drop_mid_call.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl McpTransport for ScriptedTransport {
    async fn initialize(&self) -> Result<()> {
        if self.refuse_handshake {
            return Err(Error::handshake("protocol version mismatch"));
        }
        *self.status.lock().unwrap() = TransportStatus::Ready;
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<ToolResult> {
        if self.drop_mid_call.load(Ordering::SeqCst) {
            *self.status.lock().unwrap() = TransportStatus::Closed;
            let _ = self.notices.send(TransportNotice::Closed {
                reason: "connection reset".to_string(),
            });
            return Err(Error::TransportClosed);
        }
        Ok(ToolResult::ok(name, "remote says hi"))
    }

    async fn close(&self) {
        *self.status.lock().unwrap() = TransportStatus::Closed;
        let _ = self.notices.send(TransportNotice::Closed {
            reason: "closed by client".to_string(),
        });
    }

    fn status(&self) -> TransportStatus {
        *self.status.lock().unwrap()
    }
}

fn remote_def(name: &str) -> ToolDefinition {
    ToolDefinition::new(
        name,
        format!("{name} hosted remotely"),
        json!({"type": "object", "properties": {}}),
    )
}

fn descriptor() -> EndpointDescriptor {
    EndpointDescriptor::Http {
        url: "http://localhost:9000/mcp".into(),
        bearer_token: None,
    }
}

async fn adopt(
    fleet: &Arc<McpFleet>,
    agent_id: &str,
    tools: Vec<ToolDefinition>,
) -> Arc<ScriptedTransport> {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = ScriptedTransport::new(tools, tx);
    fleet
        .adopt(
            agent_id.to_string(),
            descriptor(),
            Arc::clone(&transport) as Arc<dyn McpTransport>,
            rx,
        )
        .await
        .unwrap();
    transport
}

/// Wait until `check` passes or a short deadline expires.
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn discovery_registers_external_tools() {
    let registry = Arc::new(ToolRegistry::new());
    let fleet = Arc::new(McpFleet::new(Arc::clone(&registry), None));
    let mut events = fleet.subscribe();

    adopt(&fleet, "agent-a", vec![remote_def("remote_search")]).await;

    assert!(registry.has("remote_search"));
    let registered = registry.lookup("remote_search").unwrap();
    assert_eq!(registered.definition.server_ref.as_deref(), Some("agent-a"));

    match events.recv().await.unwrap() {
        FleetEvent::ToolsDiscovered { agent_id, tool_names } => {
            assert_eq!(agent_id, "agent-a");
            assert_eq!(tool_names, vec!["remote_search".to_string()]);
        }
        other => panic!("expected ToolsDiscovered, got {other:?}"),
    }

    assert_eq!(fleet.list_connected().await, vec!["agent-a".to_string()]);
    assert_eq!(
        fleet.capabilities("agent-a").await.unwrap(),
        vec!["remote_search".to_string()]
    );
}

#[tokio::test]
async fn handshake_refusal_fails_connect() {
    let registry = Arc::new(ToolRegistry::new());
    let fleet = Arc::new(McpFleet::new(Arc::clone(&registry), None));

    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(ScriptedTransport {
        tools: Mutex::new(vec![remote_def("never_registered")]),
        status: Mutex::new(TransportStatus::Connecting),
        drop_mid_call: AtomicBool::new(false),
        refuse_handshake: true,
        notices: tx,
    });

    let result = fleet
        .adopt(
            "agent-bad".to_string(),
            descriptor(),
            transport as Arc<dyn McpTransport>,
            rx,
        )
        .await;
    assert!(matches!(result, Err(Error::Handshake(_))));
    assert!(!registry.has("never_registered"));
    assert!(fleet.list_connected().await.is_empty());
}

#[tokio::test]
async fn list_changed_reconciles_registry() {
    let registry = Arc::new(ToolRegistry::new());
    let fleet = Arc::new(McpFleet::new(Arc::clone(&registry), None));

    let transport = adopt(
        &fleet,
        "agent-a",
        vec![remote_def("keep_me"), remote_def("drop_me")],
    )
    .await;
    assert!(registry.has("drop_me"));

    // The server now hosts keep_me + new_one; drop_me is gone.
    transport.set_tools(vec![remote_def("keep_me"), remote_def("new_one")]);

    let reg = Arc::clone(&registry);
    eventually(move || reg.has("new_one") && !reg.has("drop_me")).await;
    assert!(registry.has("keep_me"));
}

#[tokio::test]
async fn disconnect_removes_exactly_the_agents_tools() {
    let registry = Arc::new(ToolRegistry::new());
    let fleet = Arc::new(McpFleet::new(Arc::clone(&registry), None));
    registry
        .register_local(remote_def("local_stay"))
        .unwrap();

    adopt(&fleet, "agent-a", vec![remote_def("tool_a")]).await;
    adopt(&fleet, "agent-b", vec![remote_def("tool_b")]).await;

    fleet.disconnect("agent-a").await.unwrap();

    assert!(!registry.has("tool_a"));
    assert!(registry.has("tool_b"));
    assert!(registry.has("local_stay"));
    assert_eq!(fleet.list_connected().await, vec!["agent-b".to_string()]);
}

// ---------------------------------------------------------------------------
// Scenario 4: external tool disconnect mid-call
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_mid_call_fails_the_result_and_deregisters() {
    let config = KernelConfig::builder()
        .llm_endpoint("http://localhost:1234/v1")
        .llm_model("test-model")
        .build()
        .unwrap();
    let registry = Arc::new(ToolRegistry::new());
    let fleet = Arc::new(McpFleet::new(Arc::clone(&registry), None));
    let executor = Arc::new(ExecutionManager::new(
        Arc::clone(&registry),
        Arc::clone(&fleet),
        &config,
    ));
    let mut events = fleet.subscribe();

    let transport = adopt(&fleet, "agent-a", vec![remote_def("remote_search")]).await;
    transport.drop_on_next_call();

    // The execution fails like any other tool error; the turn would go on.
    let call = ToolCall::new("c1", "remote_search", &json!({}));
    let result = executor
        .execute_tool_call(&call, &CancellationToken::new())
        .await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("TransportClosed"));
    assert_eq!(result.llm_content, "TransportClosed");

    // The fleet processed the close notice: the tool is gone.
    let reg = Arc::clone(&registry);
    eventually(move || !reg.has("remote_search")).await;

    // A ServerDisconnected event was emitted.
    let mut disconnected = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, FleetEvent::ServerDisconnected { ref agent_id } if agent_id == "agent-a")
        {
            disconnected = true;
        }
    }
    assert!(disconnected);

    // A follow-up call reports the tool as unknown, not a crash.
    let result = executor
        .execute_tool_call(&call, &CancellationToken::new())
        .await;
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("ToolNotFound"));
}

#[tokio::test]
async fn not_ready_transport_means_tool_unavailable() {
    let registry = Arc::new(ToolRegistry::new());
    let fleet = Arc::new(McpFleet::new(Arc::clone(&registry), None));
    let transport = adopt(&fleet, "agent-a", vec![remote_def("remote_search")]).await;

    // Force the transport out of ready without a close notice.
    *transport.status.lock().unwrap() = TransportStatus::Failing;

    let result = fleet.call("agent-a", "remote_search", json!({})).await;
    assert!(matches!(result, Err(Error::ToolUnavailable { .. })));
}
