//! armour: a security-enforcing aggregating proxy for the Model Context
//! Protocol (MCP).
//!
//! A single host speaks MCP to this proxy over a local stream transport;
//! the proxy fans out to a configured set of backend MCP servers reached by
//! stdio, HTTP, or SSE, namespaces their tools/resources/prompts, and
//! enforces a blocklist/policy pipeline on every inbound call.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate, clippy::missing_errors_doc, clippy::too_many_lines)]

pub mod audit;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod frontend;
pub mod guards;
pub mod logging;
pub mod oauth;
pub mod policy;
pub mod protocol;
pub mod resource;
pub mod router;
pub mod session;
pub mod stats;
pub mod transport;

/// Common imports for consumers embedding the proxy core directly.
pub mod prelude {
    pub use crate::config::{BackendTransportConfig, PolicyMode, Registry, ServerEntry};
    pub use crate::engine::{CallContext, ProxyEngine};
    pub use crate::error::{ProxyError, ProxyResult};
    pub use crate::policy::{BlocklistRule, Capability, PolicySnapshot};
    pub use crate::protocol::{JsonRpcRequest, JsonRpcResponse, MessageId};
    pub use crate::router::Router;
}
