//! Error types for the armour proxy
//!
//! Follows a 3-tier hierarchy: protocol (malformed JSON-RPC), transport
//! (backend connectivity), and policy (blocklist/capability denials). Every
//! variant maps to a JSON-RPC error code per the proxy's error handling design.

use thiserror::Error;

/// Result type used throughout the proxy.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Main error type for the armour proxy.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// Malformed JSON-RPC frame.
    #[error("malformed JSON-RPC: {0}")]
    MalformedRequest(String),

    /// Unknown JSON-RPC method.
    #[error("method not found: {0}")]
    UnknownMethod(String),

    /// Invalid parameters for an otherwise known method.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Backend transport closed unexpectedly.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Backend HTTP/SSE session was lost (404) and must reinitialize.
    #[error("session lost for backend {0}, must reinitialize")]
    SessionLost(String),

    /// Backend returned a non-success HTTP status.
    #[error("backend HTTP error {status}: {body}")]
    HttpError { status: u16, body: String },

    /// Operation exceeded its configured timeout.
    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Backend transport's line/event scanner failed.
    #[error("scanner error: {0}")]
    ScannerError(String),

    /// Policy denied the call.
    #[error("blocked by policy: {0}")]
    Blocked(String),

    /// The effective capability is not announced by the backend.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The requested capability is not supported on the current transport.
    #[error("transport does not support capability: {0}")]
    TransportNotSupported(String),

    /// Tool-use/tool-result history failed structural validation.
    #[error("malformed tool-use history: {0}")]
    MalformedToolUseHistory(String),

    /// Session does not exist.
    #[error("session not found")]
    SessionNotFound,

    /// Session exists but is bound to a different backend.
    #[error("session belongs to another backend")]
    SessionBelongsToOther,

    /// OAuth token has expired.
    #[error("token expired")]
    TokenExpired,

    /// No OAuth token stored for this (server, audience, resource).
    #[error("token not found")]
    TokenNotFound,

    /// Token audience did not match.
    #[error("audience mismatch")]
    AudienceMismatch,

    /// Token resource did not match.
    #[error("resource mismatch")]
    ResourceMismatch,

    /// The same access token is stored for two distinct servers.
    #[error("token reuse detected across servers")]
    TokenReuseDetected,

    /// Step-up challenge retry budget exceeded.
    #[error("step-up retries exceeded")]
    StepUpRetriesExceeded,

    /// Registry or other configuration is invalid.
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    /// Registry file was not found at startup.
    #[error("registry not found: {0}")]
    RegistryNotFound(String),

    /// No backend is registered for the routing hint supplied.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Catch-all for unexpected internal failures.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProxyError {
    /// Sanitize this error for a host-visible message: strips internal
    /// detail that should not cross the trust boundary.
    pub fn sanitize(&self) -> String {
        match self {
            Self::Blocked(reason) => format!("blocked by policy: {reason}"),
            Self::CapabilityUnavailable(cap) => format!("capability unavailable: {cap}"),
            Self::TransportNotSupported(cap) => format!("unsupported on this transport: {cap}"),
            Self::MalformedToolUseHistory(msg) => msg.clone(),
            Self::SessionNotFound | Self::SessionBelongsToOther => {
                "session not found for this backend".to_string()
            }
            Self::Timeout { operation, .. } => format!("operation '{operation}' timed out"),
            Self::UnknownMethod(m) => format!("method not found: {m}"),
            Self::InvalidParams(_) => "invalid params".to_string(),
            _ => "internal error".to_string(),
        }
    }

    /// The JSON-RPC 2.0 error code this error maps to, per the documented
    /// error-handling design.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::MalformedRequest(_) => -32600,
            Self::UnknownMethod(_) => -32601,
            Self::InvalidParams(_) | Self::MalformedToolUseHistory(_) => -32602,
            Self::TransportClosed(_) | Self::HttpError { .. } | Self::ScannerError(_) => -32000,
            Self::Blocked(_) | Self::CapabilityUnavailable(_) | Self::TransportNotSupported(_) => -32001,
            Self::TokenExpired
            | Self::TokenNotFound
            | Self::AudienceMismatch
            | Self::ResourceMismatch
            | Self::TokenReuseDetected
            | Self::StepUpRetriesExceeded => -32001,
            Self::SessionNotFound | Self::SessionBelongsToOther | Self::SessionLost(_) => -32002,
            _ => -32603,
        }
    }

    /// Whether a caller may reasonably retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed(_) | Self::Timeout { .. } | Self::HttpError { .. }
        )
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_rpc_codes_match_design_table() {
        assert_eq!(ProxyError::MalformedRequest("x".into()).json_rpc_code(), -32600);
        assert_eq!(ProxyError::UnknownMethod("x".into()).json_rpc_code(), -32601);
        assert_eq!(ProxyError::SessionNotFound.json_rpc_code(), -32002);
        assert_eq!(ProxyError::CapabilityUnavailable("sampling".into()).json_rpc_code(), -32001);
        assert_eq!(ProxyError::Blocked("rm -rf".into()).json_rpc_code(), -32001);
        assert_eq!(ProxyError::Internal("x".into()).json_rpc_code(), -32603);
    }

    #[test]
    fn sanitize_hides_internal_detail() {
        let err = ProxyError::Internal("leaked db connection string".into());
        assert_eq!(err.sanitize(), "internal error");
    }

    #[test]
    fn retryable_errors() {
        assert!(ProxyError::timeout("tools/call", 30_000).is_retryable());
        assert!(!ProxyError::ConfigInvalid("bad".into()).is_retryable());
    }
}
