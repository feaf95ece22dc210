//! Ties C5 (protocol), C6 (resources), C7 (guards), C8 (policy), and C9
//! (router) into the single inbound-call pipeline the front-end drives for
//! every host message.

use crate::audit::{AuditLog, TraceLog, TraceStage};
use crate::config::{PolicyMode, Registry};
use crate::error::{ProxyError, ProxyResult};
use crate::guards::{ElicitationGuard, SamplingGuard};
use crate::oauth::OAuthStore;
use crate::policy::{Capability, PolicySnapshot, ResolvedVerdict};
use crate::protocol::{CapabilitySet, JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload, MessageId, RequestKey, MCP_PROTOCOL_VERSION};
use crate::resource::ResourceManager;
use crate::router::{self, BackendNotification, Router, FAN_OUT_DEADLINE};
use crate::session::SessionManager;
use crate::stats::Stats;
use crate::transport::TransportKind;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Everything the dispatch pipeline needs to know about the caller and the
/// wire it arrived on, for policy/session/audit purposes.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub transport: TransportKind,
    pub server_id_header: Option<String>,
    pub session_id: Option<String>,
    pub user_id: String,
    pub agent_id: String,
}

fn capability_for_method(method: &str) -> Option<Capability> {
    match method {
        // "initialize" is gated by the transport/session handshake itself,
        // not by the capability/policy matrix — no arm here.
        "tools/call" => Some(Capability::ToolsCall),
        "tools/list" => Some(Capability::ToolsList),
        "resources/read" => Some(Capability::ResourcesRead),
        "resources/list" => Some(Capability::ResourcesList),
        "resources/subscribe" => Some(Capability::ResourcesSubscribe),
        "prompts/get" => Some(Capability::PromptsGet),
        "prompts/list" => Some(Capability::PromptsList),
        "sampling/createMessageResponse" => Some(Capability::Sampling),
        _ => None,
    }
}

/// The assembled pipeline: registry + router snapshot, policy snapshot,
/// session/resource managers, guards, audit/trace/stats, and the OAuth
/// store. Consulted once per inbound host call.
pub struct ProxyEngine {
    pub registry: Arc<Registry>,
    pub router: Arc<Router>,
    pub policy: RwLock<Arc<PolicySnapshot>>,
    pub sessions: SessionManager,
    pub resources: Arc<ResourceManager>,
    pub sampling_guard: SamplingGuard,
    pub elicitation_guard: ElicitationGuard,
    pub oauth: OAuthStore,
    pub audit: AuditLog,
    pub trace: TraceLog,
    pub stats: Stats,
}

impl ProxyEngine {
    pub fn new(registry: Arc<Registry>, router: Arc<Router>, policy: PolicySnapshot) -> Self {
        Self {
            registry,
            router,
            policy: RwLock::new(Arc::new(policy)),
            sessions: SessionManager::new(),
            resources: Arc::new(ResourceManager::new()),
            sampling_guard: SamplingGuard::default(),
            elicitation_guard: ElicitationGuard::default(),
            oauth: OAuthStore::new(),
            audit: AuditLog::new(4096),
            trace: TraceLog::new(4096),
            stats: Stats::new(),
        }
    }

    /// Replaces the policy snapshot read by every subsequent call; in-flight
    /// calls keep the snapshot they already observed.
    pub async fn reload_policy(&self, policy: PolicySnapshot) {
        *self.policy.write().await = Arc::new(policy);
    }

    fn policy_mode(&self) -> PolicyMode {
        self.registry.policy.mode
    }

    async fn evaluate(&self, cap: Capability, qualified_tool: &str, description: &str, arguments: &str) -> (ResolvedVerdict, Option<String>) {
        let snapshot = self.policy.read().await.clone();
        let decision = snapshot.evaluate(self.policy_mode(), cap, qualified_tool, description, arguments);
        (decision.verdict, decision.matched_rule)
    }

    /// Handles one inbound JSON-RPC request from the host, returning the
    /// response frame to relay back (with the host's original id).
    pub async fn handle_request(&self, request: JsonRpcRequest, ctx: &CallContext) -> JsonRpcResponse {
        let host_id = Some(request.id.clone());
        match self.dispatch(&request, ctx).await {
            Ok(result) => JsonRpcResponse::success(host_id, result),
            Err(err) => JsonRpcResponse::from_proxy_error(host_id, &err),
        }
    }

    async fn dispatch(&self, request: &JsonRpcRequest, ctx: &CallContext) -> ProxyResult<Value> {
        self.trace.push(
            TraceStage::Discovery,
            ctx.server_id_header.as_deref().unwrap_or("*"),
            &request.method,
            ctx.transport.to_string(),
            "inbound",
            None,
        );

        let method = request.method.as_str();
        let is_gateless = matches!(method, "initialize" | "tools/list" | "resources/list" | "prompts/list" | "resources/unsubscribe");
        if !is_gateless && capability_for_method(method).is_none() {
            return Err(ProxyError::UnknownMethod(method.to_string()));
        }

        match method {
            "initialize" => self.dispatch_initialize(request, ctx).await,
            "tools/list" | "resources/list" | "prompts/list" => self.dispatch_fan_out(request, ctx).await,
            "tools/call" => self.dispatch_tool_call(request, ctx).await,
            "resources/read" => self.dispatch_single(request, ctx, Capability::ResourcesRead, "uri").await,
            "resources/subscribe" => self.dispatch_subscribe(request, ctx).await,
            "resources/unsubscribe" => self.dispatch_unsubscribe(request),
            "prompts/get" => self.dispatch_single(request, ctx, Capability::PromptsGet, "name").await,
            "sampling/createMessageResponse" => self.dispatch_sampling(request, ctx).await,
            other => Err(ProxyError::UnknownMethod(other.to_string())),
        }
    }

    /// Handles the host-facing `initialize` handshake. Independent of the
    /// per-backend handshakes `router.rs::Backend::connect` already
    /// performed at startup: this synthesizes the proxy's own response from
    /// the capabilities already cached on each live backend, rather than
    /// re-running any backend handshake. Binds (or validates) a session
    /// against a target backend when one can be determined, per §4.8.
    async fn dispatch_initialize(&self, request: &JsonRpcRequest, ctx: &CallContext) -> ProxyResult<Value> {
        let host_protocol_version = request
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if host_protocol_version.is_empty() {
            return Err(ProxyError::invalid_params("initialize requires a non-empty protocolVersion"));
        }

        let aggregated = self
            .router
            .backends()
            .iter()
            .filter(|b| !b.degraded)
            .fold(CapabilitySet::default(), |acc, b| acc.union(&b.capabilities));

        self.trace.push(
            TraceStage::Translate,
            ctx.server_id_header.as_deref().unwrap_or("*"),
            &request.method,
            ctx.transport.to_string(),
            "aggregated backend capabilities",
            None,
        );

        let session_id = self.bind_initialize_session(ctx)?;

        let mut result = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": aggregated,
            "serverInfo": { "name": "armour", "version": env!("CARGO_PKG_VERSION") },
        });
        if let Some(session_id) = session_id {
            result["sessionId"] = Value::String(session_id);
        }
        Ok(result)
    }

    /// Determines the backend a session should bind to, if any, and either
    /// validates an existing session against it or mints a new one. A
    /// multi-backend registry with no `MCP-Server-Id` header has no single
    /// backend to bind to yet, so no session is minted until the host
    /// addresses a specific backend.
    fn bind_initialize_session(&self, ctx: &CallContext) -> ProxyResult<Option<String>> {
        let target = match ctx.server_id_header.as_deref() {
            Some(id) => Some(id),
            None if self.router.backends().len() == 1 => Some(self.router.backends()[0].name.as_str()),
            None => None,
        };
        let Some(server_id) = target else {
            return Ok(None);
        };

        if let Some(existing) = &ctx.session_id {
            self.sessions.validate_session(existing, server_id)?;
            return Ok(Some(existing.clone()));
        }
        self.sessions.create_session(server_id).map(Some)
    }

    async fn dispatch_fan_out(&self, request: &JsonRpcRequest, ctx: &CallContext) -> ProxyResult<Value> {
        let entry_key = match request.method.as_str() {
            "tools/list" => "tools",
            "resources/list" => "resources",
            "prompts/list" => "prompts",
            _ => unreachable!(),
        };
        let host_key = RequestKey::from(&request.id);
        let outcomes = self
            .router
            .fan_out_list(&request.method, entry_key, FAN_OUT_DEADLINE, &self.resources, &host_key)
            .await;

        let mut merged = Vec::new();
        for outcome in outcomes {
            if let Some(err) = &outcome.error {
                self.trace.push(
                    TraceStage::Forward,
                    &outcome.backend,
                    &request.method,
                    ctx.transport.to_string(),
                    err.to_string(),
                    None,
                );
                continue;
            }
            self.trace.push(
                TraceStage::Response,
                &outcome.backend,
                &request.method,
                ctx.transport.to_string(),
                "fan-out entry received",
                None,
            );
            merged.extend(outcome.entries);
        }
        Ok(serde_json::json!({ entry_key: merged }))
    }

    async fn dispatch_tool_call(&self, request: &JsonRpcRequest, ctx: &CallContext) -> ProxyResult<Value> {
        let params = request.params.as_ref().ok_or_else(|| ProxyError::invalid_params("tools/call requires params"))?;
        let name = params.get("name").and_then(Value::as_str).ok_or_else(|| ProxyError::invalid_params("missing tool name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        let arguments_str = arguments.to_string();

        let (backend, tool) = self.router.resolve_target(name, ctx.server_id_header.as_deref())?;
        let qualified = router::namespaced(&backend.name, tool);
        self.trace.push(TraceStage::Translate, &backend.name, &request.method, ctx.transport.to_string(), format!("{name} -> {qualified}"), None);

        let (verdict, matched_rule) = self.evaluate(Capability::ToolsCall, &qualified, "", &arguments_str).await;
        self.trace.push(
            TraceStage::Blocklist,
            &backend.name,
            &request.method,
            ctx.transport.to_string(),
            format!("{verdict:?}"),
            matched_rule.clone().map(Value::String),
        );
        if verdict != ResolvedVerdict::Allow {
            self.stats.record_blocked(&qualified);
            self.audit.record(
                &ctx.user_id,
                &ctx.agent_id,
                &backend.name,
                &request.method,
                "tools.call",
                ctx.session_id.clone(),
                ctx.transport.to_string(),
                serde_json::json!({ "rule": matched_rule, "decision": "block", "tool": qualified }),
            );
            return Err(ProxyError::Blocked(matched_rule.unwrap_or_else(|| "policy mode default".to_string())));
        }
        self.stats.record_allowed();

        if let Some(session_id) = &ctx.session_id {
            self.sessions.validate_session(session_id, &backend.name)?;
        }

        let backend_request = JsonRpcRequest::new(request.id.clone(), "tools/call", Some(serde_json::json!({
            "name": tool,
            "arguments": arguments,
        })));

        self.resources.set_timeout((&backend_request.id).into(), router::CALL_DEADLINE);
        let response = backend.call(&backend_request, router::CALL_DEADLINE).await;
        self.resources.clear_timeout(&(&backend_request.id).into());

        let response = response?;
        if self.resources.is_cancelled(&(&backend_request.id).into()) {
            return Err(ProxyError::internal("request was cancelled"));
        }

        self.audit.record(
            &ctx.user_id,
            &ctx.agent_id,
            &backend.name,
            &request.method,
            "tools.call",
            ctx.session_id.clone(),
            ctx.transport.to_string(),
            serde_json::json!({ "rule": matched_rule, "decision": "allow", "tool": qualified }),
        );
        self.trace.push(TraceStage::Response, &backend.name, &request.method, ctx.transport.to_string(), "backend response received", None);

        match response.payload {
            JsonRpcResponsePayload::Success { result } => Ok(result),
            JsonRpcResponsePayload::Error { error } => Err(ProxyError::Internal(error.message)),
        }
    }

    async fn dispatch_single(&self, request: &JsonRpcRequest, ctx: &CallContext, cap: Capability, key_field: &str) -> ProxyResult<Value> {
        let params = request.params.as_ref().ok_or_else(|| ProxyError::invalid_params("missing params"))?;
        let raw_name = params.get(key_field).and_then(Value::as_str).ok_or_else(|| ProxyError::invalid_params(format!("missing {key_field}")))?;
        let (backend, local_name) = self.router.resolve_target(raw_name, ctx.server_id_header.as_deref())?;
        let qualified = router::namespaced(&backend.name, local_name);
        self.trace.push(TraceStage::Translate, &backend.name, &request.method, ctx.transport.to_string(), format!("{raw_name} -> {qualified}"), None);

        let (verdict, matched_rule) = self.evaluate(cap, &qualified, "", &params.to_string()).await;
        self.trace.push(
            TraceStage::Blocklist,
            &backend.name,
            &request.method,
            ctx.transport.to_string(),
            format!("{verdict:?}"),
            matched_rule.clone().map(Value::String),
        );
        if verdict != ResolvedVerdict::Allow {
            self.stats.record_blocked(&qualified);
            return Err(ProxyError::Blocked(matched_rule.unwrap_or_else(|| "policy mode default".to_string())));
        }
        self.stats.record_allowed();

        let mut forwarded_params = params.clone();
        if let Some(obj) = forwarded_params.as_object_mut() {
            obj.insert(key_field.to_string(), Value::String(local_name.to_string()));
        }
        let backend_request = JsonRpcRequest::new(request.id.clone(), request.method.clone(), Some(forwarded_params));
        let response = backend.call(&backend_request, router::CALL_DEADLINE).await?;
        self.trace.push(TraceStage::Response, &backend.name, &request.method, ctx.transport.to_string(), "backend response received", None);
        match response.payload {
            JsonRpcResponsePayload::Success { result } => Ok(result),
            JsonRpcResponsePayload::Error { error } => Err(ProxyError::Internal(error.message)),
        }
    }

    async fn dispatch_subscribe(&self, request: &JsonRpcRequest, ctx: &CallContext) -> ProxyResult<Value> {
        let params = request.params.as_ref().ok_or_else(|| ProxyError::invalid_params("missing params"))?;
        let uri = params.get("uri").and_then(Value::as_str).ok_or_else(|| ProxyError::invalid_params("missing uri"))?;

        let (verdict, matched_rule) = self.evaluate(Capability::ResourcesSubscribe, uri, "", "").await;
        self.trace.push(
            TraceStage::Blocklist,
            ctx.server_id_header.as_deref().unwrap_or("*"),
            &request.method,
            ctx.transport.to_string(),
            format!("{verdict:?}"),
            matched_rule.clone().map(Value::String),
        );
        if verdict != ResolvedVerdict::Allow {
            self.stats.record_blocked(uri);
            return Err(ProxyError::Blocked(matched_rule.unwrap_or_else(|| "policy mode default".to_string())));
        }
        self.stats.record_allowed();

        let sub_id = uuid::Uuid::new_v4().to_string();
        self.resources.subscribe(&sub_id, uri, &ctx.agent_id)?;
        self.trace.push(
            TraceStage::Response,
            ctx.server_id_header.as_deref().unwrap_or("*"),
            &request.method,
            ctx.transport.to_string(),
            "subscription created",
            None,
        );
        Ok(serde_json::json!({ "subscriptionId": sub_id }))
    }

    fn dispatch_unsubscribe(&self, request: &JsonRpcRequest) -> ProxyResult<Value> {
        let params = request.params.as_ref().ok_or_else(|| ProxyError::invalid_params("missing params"))?;
        let sub_id = params.get("subscriptionId").and_then(Value::as_str).ok_or_else(|| ProxyError::invalid_params("missing subscriptionId"))?;
        self.resources.unsubscribe(sub_id);
        Ok(Value::Null)
    }

    async fn dispatch_sampling(&self, request: &JsonRpcRequest, ctx: &CallContext) -> ProxyResult<Value> {
        let params = request.params.as_ref().ok_or_else(|| ProxyError::invalid_params("missing params"))?;
        let server = ctx.server_id_header.as_deref().ok_or_else(|| ProxyError::invalid_params("sampling requires MCP-Server-Id"))?;
        let backend = self.router.find(server).ok_or_else(|| ProxyError::UnknownBackend(server.to_string()))?;
        let history = params.get("messages").cloned().unwrap_or(Value::Array(vec![]));

        let (verdict, matched_rule) = self.evaluate(Capability::Sampling, server, "", &history.to_string()).await;
        self.trace.push(
            TraceStage::Blocklist,
            server,
            &request.method,
            ctx.transport.to_string(),
            format!("{verdict:?}"),
            matched_rule.clone().map(Value::String),
        );
        if verdict != ResolvedVerdict::Allow {
            self.stats.record_blocked(server);
            return Err(ProxyError::Blocked(matched_rule.unwrap_or_else(|| "policy mode default".to_string())));
        }
        self.stats.record_allowed();

        self.sampling_guard.validate_sampling_request(server, ctx.transport, backend.capabilities.sampling_tools(), &history)?;

        let backend_request = JsonRpcRequest::new(request.id.clone(), request.method.clone(), Some(params.clone()));
        let response = backend.call(&backend_request, router::CALL_DEADLINE).await?;
        self.trace.push(TraceStage::Response, server, &request.method, ctx.transport.to_string(), "backend response received", None);
        match response.payload {
            JsonRpcResponsePayload::Success { result } => Ok(result),
            JsonRpcResponsePayload::Error { error } => Err(ProxyError::Internal(error.message)),
        }
    }

    /// Handles a host-issued `notifications/cancelled`: marks the request
    /// cancelled so any in-flight or late backend response is dropped.
    pub fn handle_cancelled(&self, request_id: MessageId) {
        self.resources.cancel_request((&request_id).into());
    }

    /// Drains backend notifications arriving on `rx` forever, translating
    /// into host-facing JSON-RPC notification frames. Backend-initiated
    /// elicitation requests are gated through the same policy/guard checks
    /// as any other capability before being forwarded; everything else
    /// passes straight through. Intended to run as a background task the
    /// front-end owns for its lifetime.
    pub async fn relay_notifications(
        &self,
        front_transport: TransportKind,
        mut rx: mpsc::UnboundedReceiver<BackendNotification>,
        mut on_notify: impl FnMut(Value) + Send,
    ) {
        while let Some(event) = rx.recv().await {
            if let Some(method) = event.payload.get("method").and_then(Value::as_str) {
                if method.starts_with("elicitation/") {
                    if let Err(err) = self.gate_backend_elicitation(&event.backend, front_transport, method, &event.payload).await {
                        tracing::warn!(backend = %event.backend, method, error = %err, "dropped backend elicitation request");
                        continue;
                    }
                }
            }
            on_notify(event.payload);
        }
    }

    async fn gate_backend_elicitation(&self, backend_name: &str, front_transport: TransportKind, method: &str, payload: &Value) -> ProxyResult<()> {
        let capability_available = self.router.find(backend_name).is_some_and(|b| b.capabilities.elicitation_enabled());

        let (verdict, matched_rule) = self.evaluate(Capability::Elicitation, backend_name, method, &payload.to_string()).await;
        self.trace.push(
            TraceStage::Blocklist,
            backend_name,
            method,
            front_transport.to_string(),
            format!("{verdict:?}"),
            matched_rule.clone().map(Value::String),
        );
        if verdict != ResolvedVerdict::Allow {
            self.stats.record_blocked(backend_name);
            self.audit.record(
                "backend",
                backend_name,
                backend_name,
                method,
                "elicitation",
                None,
                front_transport.to_string(),
                serde_json::json!({ "rule": matched_rule, "decision": "block" }),
            );
            return Err(ProxyError::Blocked(matched_rule.unwrap_or_else(|| "policy mode default".to_string())));
        }

        self.elicitation_guard.validate_elicitation_request(method, front_transport, capability_available)
    }
}

#[cfg(test)]
mod capability_tests {
    use super::*;

    #[test]
    fn recognizes_every_gated_method() {
        assert_eq!(capability_for_method("tools/call"), Some(Capability::ToolsCall));
        assert_eq!(capability_for_method("sampling/createMessageResponse"), Some(Capability::Sampling));
        assert_eq!(capability_for_method("notifications/initialized"), None);
    }
}

#[cfg(test)]
mod relay_tests {
    use super::*;
    use crate::config::{PolicyConfig, PolicyMode, Registry, RegistryMetadata};
    use crate::policy::PolicySnapshot;

    fn empty_engine() -> ProxyEngine {
        let registry = Registry {
            metadata: RegistryMetadata { version: "1.0.0".to_string() },
            policy: PolicyConfig { mode: PolicyMode::Moderate },
            servers: Vec::new(),
            revision: 0,
        };
        ProxyEngine::new(Arc::new(registry), Arc::new(Router::new(Vec::new())), PolicySnapshot::new(Vec::new()))
    }

    #[tokio::test]
    async fn backend_elicitation_over_stdio_is_dropped_not_relayed() {
        let engine = empty_engine();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(BackendNotification {
            backend: "demo".to_string(),
            payload: serde_json::json!({ "method": "elicitation/create", "params": {} }),
        })
        .unwrap();
        drop(tx);

        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        engine.relay_notifications(TransportKind::Stdio, rx, move |payload| sink.lock().unwrap().push(payload)).await;

        assert!(delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_elicitation_notifications_pass_through_unfiltered() {
        let engine = empty_engine();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(BackendNotification {
            backend: "demo".to_string(),
            payload: serde_json::json!({ "method": "notifications/progress", "params": {} }),
        })
        .unwrap();
        drop(tx);

        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        engine.relay_notifications(TransportKind::Http, rx, move |payload| sink.lock().unwrap().push(payload)).await;

        assert_eq!(delivered.lock().unwrap().len(), 1);
    }
}
