//! Router / aggregator (C9): tool/resource/prompt name-spacing, `*/list`
//! fan-out, and dispatch to the backend named by a parsed `server:tool` or
//! an `MCP-Server-Id` routing hint.
//!
//! Each backend transport is driven by a small actor task (grounded in the
//! proxy crate's `id_translator.rs` bounded-map pattern): the actor owns the
//! `Transport` trait object exclusively, multiplexing outbound sends and
//! inbound frames so `send`/`receive` are never called concurrently from two
//! tasks. Plain HTTP backends skip the actor — request/response HTTP has no
//! unsolicited frames to multiplex, so `call()` sends and receives inline.

use crate::config::{BackendTransportConfig, ServerEntry};
use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload, MessageId, RequestKey};
use crate::protocol::{self, CapabilitySet};
use crate::resource::ResourceManager;
use crate::transport::http::HttpTransport;
use crate::transport::sse::SseTransport;
use crate::transport::stdio::StdioTransport;
use crate::transport::{Frame, Transport, TransportKind};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Default per-backend deadline applied to fan-out list calls.
pub const FAN_OUT_DEADLINE: Duration = Duration::from_secs(10);

/// Default per-call deadline applied to a single dispatched call.
pub const CALL_DEADLINE: Duration = Duration::from_secs(30);

/// An unsolicited frame a backend actor could not correlate to a pending
/// request: forwarded by the front-end to the host as a notification.
#[derive(Debug, Clone)]
pub struct BackendNotification {
    pub backend: String,
    pub payload: Value,
}

enum StreamCommand {
    Send(Vec<u8>),
    Shutdown,
}

enum BackendIo {
    RequestResponse(Mutex<Box<dyn Transport>>),
    Streaming {
        cmd_tx: mpsc::UnboundedSender<StreamCommand>,
        pending: Arc<DashMap<RequestKey, oneshot::Sender<JsonRpcResponse>>>,
        _task: tokio::task::JoinHandle<()>,
    },
}

/// One connected backend: its transport, announced capabilities, and
/// degraded flag (handshake failed, omitted from fan-out).
pub struct Backend {
    pub name: String,
    pub kind: TransportKind,
    pub capabilities: CapabilitySet,
    pub degraded: bool,
    io: BackendIo,
}

fn extract_frame_id(payload: &Value) -> Option<MessageId> {
    let id = payload.get("id")?;
    if let Some(n) = id.as_i64() {
        return Some(MessageId::Number(n));
    }
    id.as_str().map(|s| MessageId::String(s.to_string()))
}

fn parse_response_frame(bytes: &[u8]) -> Option<(MessageId, JsonRpcResponse)> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let id = extract_frame_id(&value)?;
    let payload = if value.get("error").is_some() {
        let error = value.get("error")?.clone();
        JsonRpcResponsePayload::Error {
            error: serde_json::from_value(error).ok()?,
        }
    } else {
        JsonRpcResponsePayload::Success {
            result: value.get("result").cloned().unwrap_or(Value::Null),
        }
    };
    Some((
        id.clone(),
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            payload,
        },
    ))
}

impl Backend {
    /// Spawns the transport for one registry entry and performs its
    /// `initialize` handshake. The returned backend is marked `degraded` if
    /// the handshake fails; a degraded backend is never closed here, so its
    /// transport may be retried by the caller's backoff loop.
    pub async fn connect(
        entry: &ServerEntry,
        client_name: &str,
        client_version: &str,
        notifications: mpsc::UnboundedSender<BackendNotification>,
    ) -> ProxyResult<Self> {
        let (mut transport, kind): (Box<dyn Transport>, TransportKind) = match &entry.transport {
            BackendTransportConfig::Stdio { command, args, env } => (
                Box::new(StdioTransport::spawn(command, args, env, None)?),
                TransportKind::Stdio,
            ),
            BackendTransportConfig::Http { url, headers } => (
                Box::new(HttpTransport::new(
                    url.clone(),
                    None,
                    headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )),
                TransportKind::Http,
            ),
            BackendTransportConfig::Sse { url, .. } => {
                (Box::new(SseTransport::new(url.clone(), None)), TransportKind::Sse)
            }
        };

        let handshake_request = protocol::build_backend_initialize(MessageId::Number(0), client_name, client_version);
        let request_bytes = serde_json::to_vec(&handshake_request).map_err(ProxyError::Serialization)?;

        let handshake = async {
            transport.send(&request_bytes).await?;
            match transport.receive().await? {
                Frame::Data(bytes) => {
                    let value: Value = serde_json::from_slice(&bytes).map_err(ProxyError::Serialization)?;
                    let result = value
                        .get("result")
                        .cloned()
                        .ok_or_else(|| ProxyError::invalid_params("initialize response missing result"))?;
                    protocol::parse_backend_handshake(&result)
                }
                Frame::Eof => Err(ProxyError::TransportClosed(entry.name.clone())),
            }
        };

        match tokio::time::timeout(CALL_DEADLINE, handshake).await {
            Ok(Ok(hs)) => Ok(Self::build(entry.name.clone(), kind, hs.capabilities, false, transport, notifications)),
            _ => Ok(Self::build(
                entry.name.clone(),
                kind,
                CapabilitySet::default(),
                true,
                transport,
                notifications,
            )),
        }
    }

    fn build(
        name: String,
        kind: TransportKind,
        capabilities: CapabilitySet,
        degraded: bool,
        transport: Box<dyn Transport>,
        notifications: mpsc::UnboundedSender<BackendNotification>,
    ) -> Self {
        let io = if kind == TransportKind::Http {
            BackendIo::RequestResponse(Mutex::new(transport))
        } else {
            let pending: Arc<DashMap<RequestKey, oneshot::Sender<JsonRpcResponse>>> = Arc::new(DashMap::new());
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let task = spawn_actor(name.clone(), transport, cmd_rx, pending.clone(), notifications);
            BackendIo::Streaming {
                cmd_tx,
                pending,
                _task: task,
            }
        };
        Self {
            name,
            kind,
            capabilities,
            degraded,
            io,
        }
    }

    /// Sends one request and awaits its matched response, bounded by
    /// `deadline`. Responses for a cancelled request are the caller's
    /// responsibility to drop (see `ResourceManager::is_cancelled`).
    pub async fn call(&self, request: &JsonRpcRequest, deadline: Duration) -> ProxyResult<JsonRpcResponse> {
        let bytes = serde_json::to_vec(request).map_err(ProxyError::Serialization)?;
        match &self.io {
            BackendIo::RequestResponse(transport) => {
                let fut = async {
                    let mut guard = transport.lock().await;
                    guard.send(&bytes).await?;
                    match guard.receive().await? {
                        Frame::Data(body) => parse_response_frame(&body)
                            .map(|(_, resp)| resp)
                            .ok_or_else(|| ProxyError::ScannerError("malformed backend response".to_string())),
                        Frame::Eof => Err(ProxyError::TransportClosed(self.name.clone())),
                    }
                };
                tokio::time::timeout(deadline, fut)
                    .await
                    .map_err(|_| ProxyError::timeout("tools/call", deadline.as_millis() as u64))?
            }
            BackendIo::Streaming { cmd_tx, pending, .. } => {
                let key = RequestKey::from(&request.id);
                let (tx, rx) = oneshot::channel();
                pending.insert(key.clone(), tx);
                if cmd_tx.send(StreamCommand::Send(bytes)).is_err() {
                    pending.remove(&key);
                    return Err(ProxyError::TransportClosed(self.name.clone()));
                }
                match tokio::time::timeout(deadline, rx).await {
                    Ok(Ok(resp)) => Ok(resp),
                    Ok(Err(_)) => Err(ProxyError::TransportClosed(self.name.clone())),
                    Err(_) => {
                        pending.remove(&key);
                        Err(ProxyError::timeout("tools/call", deadline.as_millis() as u64))
                    }
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        if let BackendIo::Streaming { cmd_tx, .. } = &self.io {
            let _ = cmd_tx.send(StreamCommand::Shutdown);
        }
    }
}

fn spawn_actor(
    name: String,
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCommand>,
    pending: Arc<DashMap<RequestKey, oneshot::Sender<JsonRpcResponse>>>,
    notifications: mpsc::UnboundedSender<BackendNotification>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(StreamCommand::Send(bytes)) => {
                            if let Err(e) = transport.send(&bytes).await {
                                tracing::warn!(backend = %name, error = %e, "backend send failed");
                            }
                        }
                        Some(StreamCommand::Shutdown) | None => {
                            let _ = transport.close().await;
                            break;
                        }
                    }
                }
                frame = transport.receive() => {
                    match frame {
                        Ok(Frame::Data(bytes)) => {
                            if let Some((id, resp)) = parse_response_frame(&bytes) {
                                let key = RequestKey::from(&id);
                                if let Some((_, tx)) = pending.remove(&key) {
                                    let _ = tx.send(resp);
                                    continue;
                                }
                            }
                            if let Ok(payload) = serde_json::from_slice::<Value>(&bytes) {
                                let _ = notifications.send(BackendNotification { backend: name.clone(), payload });
                            }
                        }
                        Ok(Frame::Eof) => {
                            for entry in pending.iter() {
                                let _ = entry.key();
                            }
                            pending.clear();
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(backend = %name, error = %e, "backend receive failed");
                        }
                    }
                }
            }
        }
    })
}

/// Assigns fresh, monotonically increasing backend-facing ids to fan-out
/// requests so a single host id never collides across backends.
#[derive(Debug, Default)]
pub struct FanOutIdAllocator(AtomicI64);

impl FanOutIdAllocator {
    pub fn next(&self) -> MessageId {
        MessageId::Number(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Qualifies a tool/resource/prompt name as `server:name`.
pub fn namespaced(server: &str, name: &str) -> String {
    format!("{server}:{name}")
}

/// Splits a namespaced name at the first `:`, returning `(server, name)`.
pub fn split_namespaced(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(':')
}

/// The router holds the live set of connected backends in registry order
/// and dispatches/fan-out calls across them.
pub struct Router {
    backends: Vec<Arc<Backend>>,
    id_alloc: FanOutIdAllocator,
}

/// One backend's contribution (or failure) to a fan-out list call.
pub struct FanOutOutcome {
    pub backend: String,
    pub entries: Vec<Value>,
    pub error: Option<ProxyError>,
}

impl Router {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends,
            id_alloc: FanOutIdAllocator::default(),
        }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Looks up a non-degraded backend by name.
    pub fn find(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.name == name && !b.degraded)
    }

    /// Resolves the routing hint for a `tools/call`-style request: a parsed
    /// `server:tool` name wins unless an `MCP-Server-Id` header is present,
    /// in which case the header wins; a single-backend registry uses its
    /// sole server regardless of any header.
    pub fn resolve_target<'a>(
        &'a self,
        qualified_or_bare: &'a str,
        server_id_header: Option<&'a str>,
    ) -> ProxyResult<(&'a Arc<Backend>, &'a str)> {
        if self.backends.len() == 1 {
            let only = &self.backends[0];
            let tool = split_namespaced(qualified_or_bare)
                .map_or(qualified_or_bare, |(_, t)| t);
            return Ok((only, tool));
        }
        if let Some(server_id) = server_id_header {
            let backend = self
                .find(server_id)
                .ok_or_else(|| ProxyError::UnknownBackend(server_id.to_string()))?;
            let tool = split_namespaced(qualified_or_bare)
                .map_or(qualified_or_bare, |(_, t)| t);
            return Ok((backend, tool));
        }
        let (server, tool) = split_namespaced(qualified_or_bare)
            .ok_or_else(|| ProxyError::invalid_params(format!("'{qualified_or_bare}' is not namespaced as server:tool")))?;
        let backend = self.find(server).ok_or_else(|| ProxyError::UnknownBackend(server.to_string()))?;
        Ok((backend, tool))
    }

    /// Fans a `*/list` method out to every non-degraded backend in parallel,
    /// bounded by `deadline` per backend. Returns one `FanOutOutcome` per
    /// backend in registry order regardless of completion order; a slow or
    /// failing backend reports `error` but never blocks the others. Once
    /// `host_key` (the host's own request id for this `*/list` call) is
    /// marked cancelled, every outcome still in flight is dropped rather
    /// than forwarded — the same drop-late-responses rule the single-call
    /// path applies.
    pub async fn fan_out_list(
        &self,
        method: &str,
        entry_key: &str,
        deadline: Duration,
        resources: &ResourceManager,
        host_key: &RequestKey,
    ) -> Vec<FanOutOutcome> {
        let mut handles = Vec::with_capacity(self.backends.len());
        for backend in self.backends.iter().filter(|b| !b.degraded) {
            let backend = backend.clone();
            let method = method.to_string();
            let id = self.id_alloc.next();
            handles.push((backend.name.clone(), tokio::spawn(async move {
                let request = JsonRpcRequest::new(id, method, None);
                backend.call(&request, deadline).await.map(|resp| (backend.name.clone(), resp))
            })));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok((backend_name, resp))) => match resp.payload {
                    JsonRpcResponsePayload::Success { result } => {
                        let entries = result
                            .get(entry_key)
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default()
                            .into_iter()
                            .map(|mut entry| {
                                if let Some(name_field) = entry.get("name").and_then(Value::as_str) {
                                    let qualified = namespaced(&backend_name, name_field);
                                    if let Some(obj) = entry.as_object_mut() {
                                        obj.insert("name".to_string(), Value::String(qualified));
                                    }
                                }
                                entry
                            })
                            .collect();
                        FanOutOutcome { backend: name, entries, error: None }
                    }
                    JsonRpcResponsePayload::Error { error } => {
                        FanOutOutcome { backend: name, entries: Vec::new(), error: Some(ProxyError::Internal(error.message)) }
                    }
                },
                Ok(Err(e)) => FanOutOutcome { backend: name, entries: Vec::new(), error: Some(e) },
                Err(_join_err) => {
                    FanOutOutcome { backend: name, entries: Vec::new(), error: Some(ProxyError::internal("fan-out task panicked")) }
                }
            };
            // Drop this backend's outcome if the host cancelled the
            // originating `*/list` call while the fan-out was in flight.
            if resources.is_cancelled(host_key) {
                continue;
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_round_trips_through_split() {
        let qualified = namespaced("demo", "greet");
        assert_eq!(qualified, "demo:greet");
        assert_eq!(split_namespaced(&qualified), Some(("demo", "greet")));
    }

    #[test]
    fn split_namespaced_rejects_bare_names() {
        assert_eq!(split_namespaced("greet"), None);
    }

    #[test]
    fn fan_out_id_allocator_is_monotonic() {
        let alloc = FanOutIdAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        assert_ne!(a, b);
    }
}
