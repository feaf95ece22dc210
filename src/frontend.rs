//! Proxy front-end (C10): accepts host connections over stdio or local
//! HTTP, drives the dispatch pipeline, and relays backend-to-host
//! notifications. Two run modes per the spec: a stdio loop reading
//! line-delimited JSON-RPC frames, and an `axum` HTTP server exposing
//! `POST /mcp` and `GET /healthz`.

use crate::config::Registry;
use crate::engine::{CallContext, ProxyEngine};
use crate::error::ProxyResult;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload, MessageId};
use crate::router::{Backend, BackendNotification, Router};
use crate::transport::TransportKind;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Connects to every registry entry, performing its `initialize` handshake.
/// A backend whose handshake fails is kept in `degraded` state rather than
/// omitted from the returned list, so its status remains visible to C11.
pub async fn connect_all(
    registry: &Registry,
    client_name: &str,
    client_version: &str,
) -> (Arc<Router>, mpsc::UnboundedReceiver<BackendNotification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut backends = Vec::with_capacity(registry.servers.len());
    for entry in &registry.servers {
        match Backend::connect(entry, client_name, client_version, tx.clone()).await {
            Ok(backend) => backends.push(Arc::new(backend)),
            Err(e) => {
                tracing::error!(server = %entry.name, error = %e, "failed to spawn backend transport");
            }
        }
    }
    (Arc::new(Router::new(backends)), rx)
}

/// Stdio front-end: one line-delimited JSON-RPC frame per line on stdin,
/// one frame per line on stdout, errors on stderr. Exactly one host
/// session for the process lifetime. Backend-to-host notifications (relayed
/// through `notifications`) are interleaved onto the same stdout stream as
/// they arrive, since stdio has no separate push channel.
pub async fn run_stdio(engine: Arc<ProxyEngine>, notifications: mpsc::UnboundedReceiver<BackendNotification>) -> ProxyResult<()> {
    let stdin = tokio::io::stdin();
    let stdout = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(stdin).lines();

    let mut ctx = CallContext {
        transport: TransportKind::Stdio,
        server_id_header: None,
        session_id: None,
        user_id: "stdio-host".to_string(),
        agent_id: "stdio-host".to_string(),
    };

    let relay_stdout = stdout.clone();
    let relay_engine = engine.clone();
    let relay_task = tokio::spawn(async move {
        relay_engine
            .relay_notifications(TransportKind::Stdio, notifications, move |payload| {
                let stdout = relay_stdout.clone();
                tokio::spawn(async move { write_line(&stdout, &payload).await });
            })
            .await;
    });

    loop {
        let next = lines.next_line().await.map_err(crate::error::ProxyError::Io)?;
        let Some(line) = next else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&engine, &line, &ctx).await;
        if let Some(response) = response {
            // `initialize` mints (or reuses) a session id for this process's
            // one host session; remember it for every subsequent frame.
            if let JsonRpcResponsePayload::Success { result } = &response.payload {
                if let Some(session_id) = result.get("sessionId").and_then(Value::as_str) {
                    ctx.session_id = Some(session_id.to_string());
                }
            }
            let value = serde_json::to_value(&response).map_err(crate::error::ProxyError::Serialization)?;
            write_line(&stdout, &value).await?;
        }
    }
    relay_task.abort();
    Ok(())
}

async fn write_line(stdout: &Arc<tokio::sync::Mutex<tokio::io::Stdout>>, value: &Value) -> ProxyResult<()> {
    let mut bytes = serde_json::to_vec(value).map_err(crate::error::ProxyError::Serialization)?;
    bytes.push(b'\n');
    let mut stdout = stdout.lock().await;
    stdout.write_all(&bytes).await.map_err(crate::error::ProxyError::Io)?;
    stdout.flush().await.map_err(crate::error::ProxyError::Io)
}

async fn handle_line(engine: &Arc<ProxyEngine>, line: &str, ctx: &CallContext) -> Option<JsonRpcResponse> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return Some(JsonRpcResponse::error(None, -32600, format!("malformed JSON-RPC: {e}"), None));
        }
    };

    if value.get("id").is_none() {
        if value.get("method").and_then(Value::as_str) == Some("notifications/cancelled") {
            if let Some(id) = value.get("params").and_then(|p| p.get("requestId")) {
                if let Some(id) = parse_message_id(id) {
                    engine.handle_cancelled(id);
                }
            }
        }
        return None;
    }

    match serde_json::from_value::<JsonRpcRequest>(value) {
        Ok(request) => Some(engine.handle_request(request, ctx).await),
        Err(e) => Some(JsonRpcResponse::error(None, -32600, format!("malformed JSON-RPC: {e}"), None)),
    }
}

fn parse_message_id(value: &Value) -> Option<MessageId> {
    if let Some(n) = value.as_i64() {
        return Some(MessageId::Number(n));
    }
    value.as_str().map(|s| MessageId::String(s.to_string()))
}

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<ProxyEngine>,
    pub ready: Arc<AtomicBool>,
}

/// Builds the `axum::Router` exposing `POST /mcp` and `GET /healthz`.
pub fn build_http_app(engine: Arc<ProxyEngine>, ready: Arc<AtomicBool>) -> axum::Router {
    let state = HttpState { engine, ready };
    axum::Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/healthz", get(handle_healthz))
        .with_state(state)
}

async fn handle_healthz(State(state): State<HttpState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn handle_mcp(State(state): State<HttpState>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    let server_id_header = headers.get("mcp-server-id").and_then(|v| v.to_str().ok()).map(str::to_string);
    let session_id = headers.get("mcp-session-id").and_then(|v| v.to_str().ok()).map(str::to_string);

    let ctx = CallContext {
        transport: TransportKind::Http,
        server_id_header,
        session_id,
        user_id: "http-host".to_string(),
        agent_id: "http-host".to_string(),
    };

    let request: JsonRpcRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return (HeaderMap::new(), Json(JsonRpcResponse::error(None, -32600, format!("malformed JSON-RPC: {e}"), None)));
        }
    };
    let is_initialize = request.method == "initialize";

    let response = state.engine.handle_request(request, &ctx).await;

    // On a successful `initialize`, the engine mints (or reuses) a session
    // id and returns it in the result body; surface it as the
    // `Mcp-Session-Id` response header the host is expected to echo back on
    // subsequent calls.
    let mut response_headers = HeaderMap::new();
    if is_initialize {
        if let JsonRpcResponsePayload::Success { result } = &response.payload {
            if let Some(session_id) = result.get("sessionId").and_then(Value::as_str) {
                if let Ok(value) = axum::http::HeaderValue::from_str(session_id) {
                    response_headers.insert("mcp-session-id", value);
                }
            }
        }
    }

    (response_headers, Json(response))
}

/// Runs the HTTP front-end, binding `addr`.
pub async fn run_http(engine: Arc<ProxyEngine>, addr: &str, ready: Arc<AtomicBool>) -> ProxyResult<()> {
    let app = build_http_app(engine, ready);
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(crate::error::ProxyError::Io)?;
    tracing::info!(%addr, "HTTP front-end listening");
    axum::serve(listener, app).await.map_err(crate::error::ProxyError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_message_id_handles_numbers_and_strings() {
        assert_eq!(parse_message_id(&Value::from(7)), Some(MessageId::Number(7)));
        assert_eq!(parse_message_id(&Value::from("abc")), Some(MessageId::String("abc".to_string())));
    }
}
