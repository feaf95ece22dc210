//! MCP protocol engine: `initialize` handshake, capability bookkeeping, and
//! request/response correlation.

pub mod capabilities;
pub mod messages;

pub use capabilities::CapabilitySet;
pub use messages::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload,
    MessageId, RequestKey,
};

use crate::error::{ProxyError, ProxyResult};
use serde_json::Value;

/// Protocol version this proxy speaks to every backend.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// The result of a completed `initialize` handshake with one backend.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    pub protocol_version: String,
    pub capabilities: CapabilitySet,
    pub server_name: String,
    pub server_version: String,
}

/// Builds the `initialize` request the proxy sends to a backend, pinned to
/// the proxy's own supported protocol version rather than forwarding the
/// host's verbatim.
pub fn build_backend_initialize(id: MessageId, client_name: &str, client_version: &str) -> JsonRpcRequest {
    JsonRpcRequest::new(
        id,
        "initialize",
        Some(serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": client_name, "version": client_version },
        })),
    )
}

/// Parses a backend's `initialize` response into a `HandshakeResult`.
///
/// Effective capabilities are the backend's announcement verbatim: this
/// engine never computes an intersection with the host's declared
/// capabilities, and never expands what the backend states.
pub fn parse_backend_handshake(result: &Value) -> ProxyResult<HandshakeResult> {
    let protocol_version = result
        .get("protocolVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::invalid_params("initialize response missing protocolVersion"))?
        .to_string();
    if protocol_version.is_empty() {
        return Err(ProxyError::invalid_params("protocolVersion must be non-empty"));
    }

    let capabilities: CapabilitySet = result
        .get("capabilities")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| ProxyError::invalid_params(format!("malformed capabilities: {e}")))?
        .unwrap_or_default();

    let server_info = result.get("serverInfo");
    let server_name = server_info
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let server_version = server_info
        .and_then(|s| s.get("version"))
        .and_then(Value::as_str)
        .unwrap_or("0.0.0")
        .to_string();

    Ok(HandshakeResult {
        protocol_version,
        capabilities,
        server_name,
        server_version,
    })
}
