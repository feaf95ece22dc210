//! JSON-RPC 2.0 frame types shared by every transport.
//!
//! Transports carry these as opaque frames; only the protocol engine and
//! router inspect `method`/`params`. `RequestKey` canonicalizes numeric and
//! string JSON-RPC ids into a single hashable key used by the resource
//! manager and ID translator, while still round-tripping the host's
//! original wire representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A JSON-RPC request/response id, preserving the host's original type
/// (number or string) for the wire but providing a canonical hashable key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Canonical opaque key derived from a `MessageId`, used everywhere the
/// resource manager or ID translator needs to key state by request id
/// regardless of whether the host used a number or a string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl From<&MessageId> for RequestKey {
    fn from(id: &MessageId) -> Self {
        match id {
            MessageId::Number(n) => Self(format!("n:{n}")),
            MessageId::String(s) => Self(format!("s:{s}")),
        }
    }
}

impl From<MessageId> for RequestKey {
    fn from(id: MessageId) -> Self {
        Self::from(&id)
    }
}

/// A JSON-RPC 2.0 request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: MessageId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: MessageId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification frame (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 response frame (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<MessageId>,
    #[serde(flatten)]
    pub payload: JsonRpcResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponsePayload {
    Success { result: Value },
    Error { error: JsonRpcError },
}

impl JsonRpcResponse {
    pub fn success(id: Option<MessageId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            payload: JsonRpcResponsePayload::Success { result },
        }
    }

    pub fn error(id: Option<MessageId>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            payload: JsonRpcResponsePayload::Error {
                error: JsonRpcError {
                    code,
                    message: message.into(),
                    data,
                },
            },
        }
    }

    pub fn from_proxy_error(id: Option<MessageId>, err: &crate::error::ProxyError) -> Self {
        Self::error(id, err.json_rpc_code(), err.sanitize(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_key_canonicalizes_number_and_string_ids() {
        let a = RequestKey::from(MessageId::Number(42));
        let b = RequestKey::from(MessageId::String("42".to_string()));
        assert_ne!(a, b, "numeric and string ids must remain distinct keys");

        let a2 = RequestKey::from(MessageId::Number(42));
        assert_eq!(a, a2);
    }

    #[test]
    fn response_roundtrips_through_json() {
        let resp = JsonRpcResponse::success(Some(MessageId::Number(1)), serde_json::json!({"ok": true}));
        let text = serde_json::to_string(&resp).unwrap();
        let back: JsonRpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, Some(MessageId::Number(1)));
    }
}
