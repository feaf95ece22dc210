//! Transport layer (C3): a single capability set implemented three ways
//! (stdio child process, plain HTTP, SSE-framed HTTP) instead of a class
//! hierarchy.

pub mod http;
pub mod sse;
pub mod stdio;

use crate::error::ProxyResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Outcome of a single `receive()` call.
#[derive(Debug)]
pub enum Frame {
    Data(Bytes),
    Eof,
}

/// Which of the three backend transport kinds is in effect, used by the
/// guards and policy layer for transport-scoped restrictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// Uniform contract every backend transport implements. Transports MUST NOT
/// parse payloads except as required to extract framing metadata (e.g. SSE
/// `data:` lines).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one opaque JSON-RPC frame.
    async fn send(&mut self, bytes: &[u8]) -> ProxyResult<()>;

    /// Receives the next frame, or `Frame::Eof` once the peer is closed.
    async fn receive(&mut self) -> ProxyResult<Frame>;

    /// Releases the transport's underlying OS resource (child process or
    /// HTTP client). Must be idempotent.
    async fn close(&mut self) -> ProxyResult<()>;

    /// Whether this transport can deliver unsolicited server-to-client
    /// messages (SSE: yes; HTTP request/response: no; stdio: yes via its
    /// output stream).
    fn supports_server_to_client(&self) -> bool;

    /// The current backend-assigned session id, if any has been observed.
    fn session_id(&self) -> Option<&str> {
        None
    }
}

pub use sse::normalize_sse_payload;
