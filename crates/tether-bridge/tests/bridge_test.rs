//! End-to-end bridge behaviour over the in-memory transport.
//!
//! Run with: `cargo test -p tether-bridge --test bridge_test`

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_bridge::{
    memory_key, memory_transport, serve_connection, ConnectionRegistry, Frame, FrameSink,
    MemoryPeer, MemorySink, ReaderExit, StateReconciler,
};
use tether_core::{
    BridgeError, CommandAck, EngramStore, EventBus, Identity, LinkSettings, Notifier, PersonaStore,
    ServerCommand, ServerMessage, SledVault,
};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    registry: Arc<ConnectionRegistry>,
    reconciler: Arc<StateReconciler>,
    vault: Arc<SledVault>,
    bus: Arc<EventBus>,
}

fn settings() -> LinkSettings {
    LinkSettings {
        read_timeout: Duration::from_secs(10),
        ping_interval: Duration::from_secs(60),
        ..LinkSettings::default()
    }
}

fn harness(settings: LinkSettings) -> Harness {
    let vault = Arc::new(SledVault::temporary().expect("vault"));
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(
        ConnectionRegistry::new(settings)
            .with_notifier(bus.clone() as Arc<dyn Notifier>)
            .with_audit(vault.clone()),
    );
    let reconciler = Arc::new(StateReconciler::new(vault.clone(), vault.clone()).with_sessions(vault.clone()));
    Harness {
        registry,
        reconciler,
        vault,
        bus,
    }
}

fn connect(h: &Harness, user_id: &str) -> (MemoryPeer, JoinHandle<ReaderExit>) {
    let (source, sink, peer) = memory_transport();
    let task = tokio::spawn(serve_connection(
        Arc::clone(&h.registry),
        Arc::clone(&h.reconciler),
        Some(Identity::new(user_id, "bearer")),
        source,
        sink,
    ));
    (peer, task)
}

async fn next_json(peer: &mut MemoryPeer) -> Value {
    tokio::time::timeout(WAIT, peer.recv_json())
        .await
        .expect("frame within deadline")
        .expect("text frame")
}

async fn register(peer: &mut MemoryPeer, client_id: &str) -> Value {
    peer.send_json(&json!({
        "type": "register_tools",
        "payload": {
            "client_id": client_id,
            "client_version": "0.4.2",
            "platform": "linux",
            "tools": [
                { "name": "read_file", "description": "Read a file", "server_name": "filesystem" },
                { "name": "search" }
            ],
            "servers": [{ "name": "filesystem", "command": "fs-server" }]
        }
    }));
    next_json(peer).await
}

/// Sends an unknown message and waits for its error: everything sent before
/// it has been dispatched once this returns.
async fn barrier(peer: &mut MemoryPeer, tag: &str) {
    peer.send_json(&json!({ "type": tag, "payload": {} }));
    let reply = next_json(peer).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], format!("Unknown message type: {}", tag));
}

#[tokio::test]
async fn registration_starts_writer_and_round_trips() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");

    let ack = register(&mut peer, "c-1").await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["payload"]["status"], "connected");
    assert_eq!(ack["payload"]["tools_registered"], 2);

    let conn = h.registry.lookup("c-1").expect("registered");
    assert_eq!(conn.user_id, "alice");
    assert_eq!(h.registry.connection_count(), 1);

    conn.enqueue(ServerMessage::RequestSync, WAIT).await.expect("enqueue");
    assert_eq!(next_json(&mut peer).await["type"], "request_sync");

    let catalog = h.registry.tool_catalog("alice");
    assert_eq!(catalog["filesystem"].len(), 1);
    assert_eq!(catalog["mcp"].len(), 1);
    let summary = h.registry.connection_summary("alice").expect("summary");
    assert_eq!(summary.platform, "linux");
    assert_eq!(summary.servers, vec!["filesystem".to_string()]);
}

#[tokio::test]
async fn tool_call_round_trip_is_audited() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    let registry = Arc::clone(&h.registry);
    let caller = tokio::spawn(async move {
        registry
            .execute_tool("alice", "read_file", json!({ "path": "/tmp/x" }), Some(WAIT))
            .await
    });

    let call = next_json(&mut peer).await;
    assert_eq!(call["type"], "tool_call");
    assert_eq!(call["payload"]["tool_name"], "read_file");
    assert_eq!(call["payload"]["arguments"]["path"], "/tmp/x");
    let call_id = call["payload"]["call_id"].as_str().expect("call id").to_string();

    peer.send_json(&json!({
        "type": "tool_result",
        "payload": { "call_id": call_id, "success": true, "result": "file contents" }
    }));

    let result = caller.await.expect("join").expect("tool result");
    assert_eq!(result, "file contents");
    let conn = h.registry.lookup("c-1").expect("still registered");
    assert_eq!(conn.pending_calls(), 0);

    let audit = h.vault.audit_for("alice").expect("audit");
    assert_eq!(audit.len(), 1);
    assert!(audit[0].success);
}

#[tokio::test]
async fn failed_tool_reports_client_error() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    let registry = Arc::clone(&h.registry);
    let caller = tokio::spawn(async move {
        registry.execute_tool("alice", "search", json!({}), Some(WAIT)).await
    });
    let call = next_json(&mut peer).await;
    peer.send_json(&json!({
        "type": "tool_result",
        "payload": { "call_id": call["payload"]["call_id"], "success": false, "error": "no index" }
    }));

    let err = caller.await.expect("join").unwrap_err();
    assert!(matches!(err, BridgeError::ToolFailed(ref m) if m == "no index"));
    assert!(!h.vault.audit_for("alice").expect("audit")[0].success);
}

#[tokio::test]
async fn tool_call_without_bridge_is_not_found() {
    let h = harness(settings());
    let err = h
        .registry
        .execute_tool("nobody", "search", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotFound(_)));
}

#[tokio::test]
async fn result_for_unknown_call_id_is_dropped() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    peer.send_json(&json!({
        "type": "tool_result",
        "payload": { "call_id": "never-issued", "success": true, "result": "?" }
    }));
    barrier(&mut peer, "ping_check").await;

    let conn = h.registry.lookup("c-1").expect("connection survives");
    assert_eq!(conn.pending_calls(), 0);
}

#[tokio::test]
async fn duplicate_results_deliver_exactly_once() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    let registry = Arc::clone(&h.registry);
    let caller = tokio::spawn(async move {
        registry.execute_tool("alice", "search", json!({}), Some(WAIT)).await
    });
    let call = next_json(&mut peer).await;
    let call_id = call["payload"]["call_id"].clone();

    for text in ["first", "second"] {
        peer.send_json(&json!({
            "type": "tool_result",
            "payload": { "call_id": call_id, "success": true, "result": text }
        }));
    }

    assert_eq!(caller.await.expect("join").expect("result"), "first");
    barrier(&mut peer, "after_duplicates").await;
    assert!(h.registry.lookup("c-1").is_some());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let h = harness(settings());
    let (mut peer, task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    assert!(h.registry.disconnect("c-1"));
    assert!(!h.registry.disconnect("c-1"));
    assert!(h.registry.lookup("c-1").is_none());
    assert!(!h.registry.is_user_connected("alice"));
    assert!(h.registry.tool_catalog("alice").is_empty());

    // The socket's reader notices the teardown and ends.
    let exit = tokio::time::timeout(WAIT, task).await.expect("reader ends").expect("join");
    assert_eq!(exit, ReaderExit::Stopped);
}

#[tokio::test]
async fn client_disconnect_message_ends_the_loop() {
    let h = harness(settings());
    let (mut peer, task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    peer.send_json(&json!({ "type": "disconnect", "payload": {} }));
    let exit = tokio::time::timeout(WAIT, task).await.expect("reader ends").expect("join");
    assert_eq!(exit, ReaderExit::ClientDisconnect);
    assert!(h.registry.lookup("c-1").is_none());
    assert_eq!(
        tokio::time::timeout(WAIT, peer.recv()).await.expect("close frame"),
        Some(Frame::Close)
    );
}

#[tokio::test]
async fn silent_connection_times_out_and_releases_waiters() {
    let h = harness(LinkSettings {
        read_timeout: Duration::from_millis(300),
        ping_interval: Duration::from_secs(60),
        ..LinkSettings::default()
    });
    let (mut peer, task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    let registry = Arc::clone(&h.registry);
    let caller = tokio::spawn(async move {
        registry
            .execute_tool("alice", "search", json!({}), Some(Duration::from_secs(30)))
            .await
    });
    assert_eq!(next_json(&mut peer).await["type"], "tool_call");

    let exit = tokio::time::timeout(WAIT, task).await.expect("reader ends").expect("join");
    assert_eq!(exit, ReaderExit::LivenessTimeout);

    let err = tokio::time::timeout(WAIT, caller)
        .await
        .expect("caller released")
        .expect("join")
        .unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionClosed));
    assert!(h.registry.lookup("c-1").is_none());
}

#[tokio::test]
async fn pong_keeps_the_connection_alive() {
    let h = harness(LinkSettings {
        read_timeout: Duration::from_millis(300),
        ping_interval: Duration::from_secs(60),
        ..LinkSettings::default()
    });
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(peer.send_pong());
    }
    assert!(h.registry.lookup("c-1").is_some());
}

#[tokio::test]
async fn memory_sync_is_idempotent() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    let sync = json!({
        "type": "sync_state",
        "payload": { "memories": [{ "id": 42, "type": "fact", "content": "likes coffee" }] }
    });
    peer.send_json(&sync);
    peer.send_json(&sync);
    barrier(&mut peer, "after_sync").await;

    let engrams = h.vault.engrams_for("alice").expect("engrams");
    assert_eq!(engrams.len(), 1);
    assert_eq!(engrams[0].key, memory_key(42));
    assert_eq!(engrams[0].value, "likes coffee");
    assert_eq!(engrams[0].source, "sync");
}

#[tokio::test]
async fn memory_update_ignores_persona_section() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    peer.send_json(&json!({
        "type": "memory_update",
        "payload": {
            "memories": [{ "id": 7, "type": "context", "content": "on a train" }],
            "persona": { "traits": ["curious"] }
        }
    }));
    barrier(&mut peer, "after_update").await;

    assert!(h.vault.find_by_key("alice", "local_memory_7").expect("find").is_some());
    assert!(h.vault.get_all("alice").expect("facts").is_empty());
}

#[tokio::test]
async fn unknown_type_yields_one_error_and_processing_continues() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    peer.send_json(&json!({ "type": "teleport", "payload": {} }));
    let reply = next_json(&mut peer).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "Unknown message type: teleport");

    // A heartbeat produces no reply; the next frame belongs to the next message.
    peer.send_json(&json!({ "type": "heartbeat", "payload": {} }));
    barrier(&mut peer, "still_here").await;
    assert!(h.registry.lookup("c-1").is_some());
}

#[tokio::test]
async fn invalid_registration_is_answered_not_fatal() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");

    peer.send_json(&json!({ "type": "register_tools", "payload": { "client_id": "c-1" } }));
    let reply = next_json(&mut peer).await;
    assert_eq!(reply["payload"]["message"], "Invalid registration format");

    let ack = register(&mut peer, "c-1").await;
    assert_eq!(ack["type"], "ack");
}

#[tokio::test]
async fn undecodable_frame_tears_the_connection_down() {
    let h = harness(settings());
    let (mut peer, task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    peer.send_text("{not json");
    let exit = tokio::time::timeout(WAIT, task).await.expect("reader ends").expect("join");
    assert!(matches!(exit, ReaderExit::DecodeError(_)));
    assert!(h.registry.lookup("c-1").is_none());
}

#[tokio::test]
async fn transport_error_tears_the_connection_down() {
    let h = harness(settings());
    let (mut peer, task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    peer.fail("connection reset");
    let exit = tokio::time::timeout(WAIT, task).await.expect("reader ends").expect("join");
    assert!(matches!(exit, ReaderExit::TransportError(_)));
    assert_eq!(h.registry.connection_count(), 0);
}

/// Lets a fixed number of text writes through, then fails every one after.
struct FlakySink {
    inner: MemorySink,
    writes_left: usize,
}

#[async_trait]
impl FrameSink for FlakySink {
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError> {
        if self.writes_left == 0 {
            return Err(BridgeError::Transport("connection reset".into()));
        }
        self.writes_left -= 1;
        self.inner.send_text(text).await
    }

    async fn send_ping(&mut self) -> Result<(), BridgeError> {
        self.inner.send_ping().await
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn write_failure_tears_down_and_releases_waiters() {
    let h = harness(settings());
    let (source, sink, mut peer) = memory_transport();
    let task = tokio::spawn(serve_connection(
        Arc::clone(&h.registry),
        Arc::clone(&h.reconciler),
        Some(Identity::new("alice", "bearer")),
        source,
        FlakySink {
            inner: sink,
            writes_left: 1,
        },
    ));
    assert_eq!(register(&mut peer, "c-1").await["type"], "ack");

    let err = h
        .registry
        .execute_tool("alice", "search", json!({}), Some(WAIT))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionClosed), "got {:?}", err);

    let exit = tokio::time::timeout(WAIT, task).await.expect("reader ends").expect("join");
    assert!(matches!(exit, ReaderExit::TransportError(ref e) if e.contains("connection reset")));
    assert!(!h.registry.is_user_connected("alice"));
    assert_eq!(h.registry.connection_count(), 0);
}

#[tokio::test]
async fn command_ack_unblocks_sender() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    let conn = h.registry.lookup("c-1").expect("registered");
    let pending = conn.pending_commands.register("req-1").expect("register");
    conn.enqueue(
        ServerMessage::Command {
            request_id: "req-1".into(),
            command: ServerCommand::ToggleServer {
                name: "filesystem".into(),
                enabled: false,
            },
        },
        WAIT,
    )
    .await
    .expect("enqueue");

    let command = next_json(&mut peer).await;
    assert_eq!(command["type"], "toggle_server");
    assert_eq!(command["payload"]["request_id"], "req-1");
    peer.send_json(&json!({
        "type": "server_command_ack",
        "payload": { "request_id": "req-1", "success": true }
    }));

    let ack: CommandAck = pending.wait(WAIT).await.expect("ack");
    assert!(ack.success);
    assert!(!conn.pending_commands.contains("req-1"));
}

#[tokio::test]
async fn server_command_failure_is_reported() {
    let h = harness(settings());
    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;

    let registry = Arc::clone(&h.registry);
    let sender = tokio::spawn(async move {
        registry
            .send_server_command("alice", ServerCommand::RemoveServer { name: "git".into() })
            .await
    });
    let command = next_json(&mut peer).await;
    assert_eq!(command["type"], "remove_server");
    peer.send_json(&json!({
        "type": "server_command_ack",
        "payload": {
            "request_id": command["payload"]["request_id"],
            "success": false,
            "error": "server not found"
        }
    }));

    let err = sender.await.expect("join").unwrap_err();
    assert!(matches!(err, BridgeError::CommandFailed(ref m) if m == "server not found"));
}

#[tokio::test]
async fn unauthenticated_socket_gets_terminal_error() {
    let h = harness(settings());
    let (source, sink, mut peer) = memory_transport();
    let exit = serve_connection(
        Arc::clone(&h.registry),
        Arc::clone(&h.reconciler),
        None,
        source,
        sink,
    )
    .await;

    assert_eq!(exit, ReaderExit::Unauthenticated);
    let reply = next_json(&mut peer).await;
    assert_eq!(reply["payload"]["message"], "Authentication required");
    assert_eq!(peer.recv().await, Some(Frame::Close));
}

#[tokio::test]
async fn second_socket_for_same_user_replaces_the_first() {
    let h = harness(settings());
    let mut events = h.bus.subscribe("alice");

    let (mut first, first_task) = connect(&h, "alice");
    register(&mut first, "laptop").await;
    let (mut second, _second_task) = connect(&h, "alice");
    register(&mut second, "desktop").await;

    let exit = tokio::time::timeout(WAIT, first_task).await.expect("first ends").expect("join");
    assert_eq!(exit, ReaderExit::Stopped);
    assert_eq!(h.registry.lookup_user("alice").expect("active").client_id, "desktop");

    let states: Vec<bool> = (0..3)
        .map(|_| events.try_recv().expect("event").data["bridge_connected"].as_bool().unwrap_or_default())
        .collect();
    assert_eq!(states, vec![true, false, true]);
}

#[tokio::test]
async fn push_without_bridge_is_a_no_op() {
    let h = harness(settings());
    h.registry.request_sync("nobody");
    h.registry.push_persona_sync("nobody", Vec::new());

    let (mut peer, _task) = connect(&h, "alice");
    register(&mut peer, "c-1").await;
    h.registry.push_persona_sync("alice", Vec::new());
    let push = next_json(&mut peer).await;
    assert_eq!(push["type"], "persona_sync");
    assert!(push["payload"]["facts"].as_array().expect("facts").is_empty());
}
