//! End-to-end tests driving the full pipeline (front-end context, engine
//! dispatch, router fan-out/resolve, policy) against real mock backends
//! reached over HTTP, grounded in the six scenarios of the specification's
//! testable-properties section.

use armour::config::{BackendTransportConfig, PolicyConfig, PolicyMode, Registry, RegistryMetadata, ServerEntry};
use armour::engine::{CallContext, ProxyEngine};
use armour::error::ProxyError;
use armour::policy::{BlocklistRule, PermissionMatrix, PolicySnapshot, RuleAction, Verdict};
use armour::protocol::{JsonRpcRequest, JsonRpcResponsePayload, MessageId};
use armour::router::Router;
use armour::transport::TransportKind;
use axum::extract::Json as AxumJson;
use axum::routing::post;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn spawn_mock_backend(handler: impl Fn(Value) -> Value + Send + Sync + 'static) -> String {
    let handler = Arc::new(handler);
    let app = axum::Router::new().route(
        "/rpc",
        post(move |AxumJson(body): AxumJson<Value>| {
            let handler = handler.clone();
            async move { AxumJson(handler(body)) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/rpc")
}

fn greet_backend_handler(body: Value) -> Value {
    match body.get("method").and_then(Value::as_str) {
        Some("initialize") => json!({
            "jsonrpc": "2.0", "id": body["id"],
            "result": {
                "protocolVersion": "2025-06-18",
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": "demo", "version": "1.0.0" },
            }
        }),
        Some("tools/list") => json!({
            "jsonrpc": "2.0", "id": body["id"],
            "result": { "tools": [ { "name": "greet", "description": "says hello" } ] }
        }),
        Some("tools/call") => json!({
            "jsonrpc": "2.0", "id": body["id"],
            "result": { "content": [{ "type": "text", "text": "hello!" }] }
        }),
        _ => json!({ "jsonrpc": "2.0", "id": body["id"], "error": { "code": -32601, "message": "unknown method" } }),
    }
}

fn shell_backend_handler(body: Value) -> Value {
    match body.get("method").and_then(Value::as_str) {
        Some("initialize") => json!({
            "jsonrpc": "2.0", "id": body["id"],
            "result": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "serverInfo": { "name": "shelly", "version": "1.0.0" },
            }
        }),
        Some("tools/call") => json!({
            "jsonrpc": "2.0", "id": body["id"],
            "result": { "ran": true }
        }),
        _ => json!({ "jsonrpc": "2.0", "id": body["id"], "result": { "tools": [] } }),
    }
}

async fn connect_engine(servers: Vec<ServerEntry>, policy: PolicySnapshot) -> (Arc<ProxyEngine>, Registry) {
    let registry = Registry {
        metadata: RegistryMetadata { version: "1.0.0".to_string() },
        policy: PolicyConfig { mode: PolicyMode::Moderate },
        servers,
        revision: 0,
    };
    registry.validate().unwrap();

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let mut backends = Vec::new();
    for entry in &registry.servers {
        let backend = armour::router::Backend::connect(entry, "test-host", "0.0.0", tx.clone()).await.unwrap();
        backends.push(Arc::new(backend));
    }
    let router = Arc::new(Router::new(backends));
    let engine = Arc::new(ProxyEngine::new(Arc::new(registry.clone()), router, policy));
    (engine, registry)
}

fn http_entry(name: &str, url: String) -> ServerEntry {
    ServerEntry {
        name: name.to_string(),
        transport: BackendTransportConfig::Http { url, headers: Default::default() },
    }
}

fn ctx(server_id_header: Option<&str>, session_id: Option<&str>) -> CallContext {
    CallContext {
        transport: TransportKind::Http,
        server_id_header: server_id_header.map(str::to_string),
        session_id: session_id.map(str::to_string),
        user_id: "tester".to_string(),
        agent_id: "tester-agent".to_string(),
    }
}

/// Scenario 1: initialize + list against one http backend surfaces exactly
/// one namespaced tool entry.
#[tokio::test]
async fn initialize_and_list_surfaces_namespaced_tool() {
    let url = spawn_mock_backend(greet_backend_handler).await;
    let (engine, _registry) = connect_engine(vec![http_entry("demo", url)], PolicySnapshot::default()).await;

    let init_request = JsonRpcRequest::new(
        MessageId::Number(1),
        "initialize",
        Some(json!({ "protocolVersion": "2025-06-18", "capabilities": {} })),
    );
    let init_response = engine.handle_request(init_request, &ctx(None, None)).await;
    let JsonRpcResponsePayload::Success { result: init_result } = init_response.payload else {
        panic!("expected initialize to succeed, got {init_response:?}");
    };
    assert_eq!(init_result["protocolVersion"], "2025-06-18");
    let session_id = init_result["sessionId"].as_str().expect("single-backend registry mints a session on initialize").to_string();

    let request = JsonRpcRequest::new(MessageId::Number(2), "tools/list", None);
    let response = engine.handle_request(request, &ctx(None, Some(&session_id))).await;

    let JsonRpcResponsePayload::Success { result } = response.payload else {
        panic!("expected success, got {response:?}");
    };
    let tools = result["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "demo:greet");
}

/// A host `initialize` against an empty-params request is rejected before
/// any backend involvement: a missing `protocolVersion` is invalid params,
/// not silently accepted.
#[tokio::test]
async fn initialize_without_protocol_version_is_rejected() {
    let (engine, _registry) = connect_engine(vec![], PolicySnapshot::default()).await;
    let request = JsonRpcRequest::new(MessageId::Number(1), "initialize", Some(json!({})));
    let response = engine.handle_request(request, &ctx(None, None)).await;
    assert!(matches!(response.payload, JsonRpcResponsePayload::Error { .. }));
}

/// Scenario 2: an explicit blocklist rule denies a matching `tools/call`
/// with JSON-RPC code -32001 and records an audit entry naming the rule.
#[tokio::test]
async fn blocklist_rule_blocks_matching_call() {
    let url = spawn_mock_backend(shell_backend_handler).await;
    let rule = BlocklistRule {
        id: "r1".to_string(),
        pattern: "rm -rf".to_string(),
        description: "blocks destructive shell invocations".to_string(),
        action: RuleAction::Block,
        is_regex: false,
        is_semantic: false,
        tools: String::new(),
        permissions: None,
        enabled: true,
    };
    let (engine, _registry) = connect_engine(vec![http_entry("demo", url)], PolicySnapshot::new(vec![rule])).await;

    let request = JsonRpcRequest::new(
        MessageId::Number(3),
        "tools/call",
        Some(json!({ "name": "demo:shell", "arguments": { "cmd": "rm -rf /tmp/x" } })),
    );
    let response = engine.handle_request(request, &ctx(None, None)).await;

    let JsonRpcResponsePayload::Error { error } = response.payload else {
        panic!("expected a blocked error, got {response:?}");
    };
    assert_eq!(error.code, -32001);

    let audit_entries = engine.audit.recent(1);
    let last = audit_entries.last().unwrap();
    assert_eq!(last.details["decision"], "block");
    assert_eq!(last.details["rule"], "r1");
}

/// Scenario 4: a session minted for one backend does not validate against
/// another backend reached via `MCP-Server-Id`.
#[tokio::test]
async fn session_does_not_cross_backend_boundary() {
    let demo_url = spawn_mock_backend(greet_backend_handler).await;
    let other_url = spawn_mock_backend(shell_backend_handler).await;
    let (engine, _registry) =
        connect_engine(vec![http_entry("demo", demo_url), http_entry("other", other_url)], PolicySnapshot::default()).await;

    let init_request = JsonRpcRequest::new(
        MessageId::Number(4),
        "initialize",
        Some(json!({ "protocolVersion": "2025-06-18", "capabilities": {} })),
    );
    let init_response = engine.handle_request(init_request, &ctx(Some("demo"), None)).await;
    let JsonRpcResponsePayload::Success { result: init_result } = init_response.payload else {
        panic!("expected initialize against 'demo' to succeed, got {init_response:?}");
    };
    let session_id = init_result["sessionId"].as_str().expect("initialize with MCP-Server-Id binds a session").to_string();

    let request = JsonRpcRequest::new(
        MessageId::Number(5),
        "tools/call",
        Some(json!({ "name": "shell", "arguments": {} })),
    );
    let response = engine.handle_request(request, &ctx(Some("other"), Some(&session_id))).await;

    let JsonRpcResponsePayload::Error { error } = response.payload else {
        panic!("expected session-not-found-for-server error, got {response:?}");
    };
    assert_eq!(error.code, -32002);
}

/// Scenario 5: fan-out `tools/list` across two backends where one never
/// responds still returns the healthy backend's entries, not an error.
#[tokio::test]
async fn fan_out_partial_failure_returns_remainder() {
    let demo_url = spawn_mock_backend(greet_backend_handler).await;
    // A TCP listener that accepts but never responds simulates a backend
    // that hangs past the fan-out deadline.
    let hang_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hang_addr = hang_listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if let Ok((socket, _)) = hang_listener.accept().await {
                // never read or write; connection just sits open
                std::mem::forget(socket);
            }
        }
    });

    let entries = vec![http_entry("demo", demo_url), http_entry("slow", format!("http://{hang_addr}/rpc"))];
    let (engine, _registry) = connect_engine(entries, PolicySnapshot::default()).await;

    let request = JsonRpcRequest::new(MessageId::Number(6), "tools/list", None);
    let response = tokio::time::timeout(Duration::from_secs(15), engine.handle_request(request, &ctx(None, None)))
        .await
        .expect("fan-out must not block past its own per-backend deadline");

    let JsonRpcResponsePayload::Success { result } = response.payload else {
        panic!("expected a 200-equivalent success with partial results, got {response:?}");
    };
    let tools = result["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1, "only the healthy backend's tool should be present");
    assert_eq!(tools[0]["name"], "demo:greet");
}

/// A `tools/list` fan-out whose host request id was already cancelled
/// before any backend outcome lands must drop every outcome, not just the
/// ones for a single-call path.
#[tokio::test]
async fn cancelled_fan_out_request_returns_no_entries() {
    let url = spawn_mock_backend(greet_backend_handler).await;
    let (engine, _registry) = connect_engine(vec![http_entry("demo", url)], PolicySnapshot::default()).await;

    engine.handle_cancelled(MessageId::Number(11));
    let request = JsonRpcRequest::new(MessageId::Number(11), "tools/list", None);
    let response = engine.handle_request(request, &ctx(None, None)).await;

    let JsonRpcResponsePayload::Success { result } = response.payload else {
        panic!("cancellation drops entries, it is not itself an error: got {response:?}");
    };
    assert_eq!(result["tools"].as_array().unwrap().len(), 0, "cancelled fan-out must not surface the backend's entries");
}

/// Single-backend routing ignores a stale/foreign `MCP-Server-Id` header per
/// the boundary-behaviour clause: the sole server is used regardless.
#[tokio::test]
async fn single_backend_registry_ignores_server_id_header() {
    let url = spawn_mock_backend(greet_backend_handler).await;
    let (engine, _registry) = connect_engine(vec![http_entry("demo", url)], PolicySnapshot::default()).await;

    let request = JsonRpcRequest::new(
        MessageId::Number(7),
        "tools/call",
        Some(json!({ "name": "greet", "arguments": {} })),
    );
    let response = engine.handle_request(request, &ctx(Some("nonexistent"), None)).await;

    let JsonRpcResponsePayload::Success { .. } = response.payload else {
        panic!("expected the sole backend to serve the call regardless of the header, got {response:?}");
    };
}

/// A rule's permission matrix can override the default verdict per
/// capability even when the rule's top-level action is `block`.
#[tokio::test]
async fn rule_permission_matrix_overrides_default_verdict() {
    let url = spawn_mock_backend(greet_backend_handler).await;
    let rule = BlocklistRule {
        id: "allow-greet".to_string(),
        pattern: "greet".to_string(),
        description: "greet is safe despite the broad shell block".to_string(),
        action: RuleAction::Block,
        is_regex: false,
        is_semantic: false,
        tools: "demo:greet".to_string(),
        permissions: Some(PermissionMatrix {
            tools_call: Verdict::Allow,
            tools_list: Verdict::Allow,
            resources_read: Verdict::Deny,
            resources_list: Verdict::Deny,
            resources_subscribe: Verdict::Deny,
            prompts_get: Verdict::Deny,
            prompts_list: Verdict::Deny,
            sampling: Verdict::Deny,
            elicitation: Verdict::Deny,
        }),
        enabled: true,
    };
    let (engine, _registry) = connect_engine(vec![http_entry("demo", url)], PolicySnapshot::new(vec![rule])).await;

    let request = JsonRpcRequest::new(
        MessageId::Number(8),
        "tools/call",
        Some(json!({ "name": "demo:greet", "arguments": {} })),
    );
    let response = engine.handle_request(request, &ctx(None, None)).await;
    assert!(matches!(response.payload, JsonRpcResponsePayload::Success { .. }));
}

/// Registry boundary behaviour: an empty `servers` array is accepted and
/// fan-out calls return empty lists rather than erroring.
#[tokio::test]
async fn empty_registry_fan_out_returns_empty_list() {
    let (engine, _registry) = connect_engine(vec![], PolicySnapshot::default()).await;
    let request = JsonRpcRequest::new(MessageId::Number(9), "tools/list", None);
    let response = engine.handle_request(request, &ctx(None, None)).await;

    let JsonRpcResponsePayload::Success { result } = response.payload else {
        panic!("expected success with empty tools, got {response:?}");
    };
    assert_eq!(result["tools"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_method_is_rejected_as_json_rpc_method_not_found() {
    let (engine, _registry) = connect_engine(vec![], PolicySnapshot::default()).await;
    let request = JsonRpcRequest::new(MessageId::Number(10), "not/a/real/method", None);
    let response = engine.handle_request(request, &ctx(None, None)).await;

    let JsonRpcResponsePayload::Error { error } = response.payload else {
        panic!("expected unknown-method error, got {response:?}");
    };
    assert_eq!(error.code, -32601);
    let _ = ProxyError::UnknownMethod("unused".to_string());
}
