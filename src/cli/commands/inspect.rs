//! `armour inspect`: connect to one backend and print its capability set
//! and tool list, without starting the full proxy pipeline. A thin
//! read-only convenience, not a new core component.

use crate::config::{BackendTransportConfig, ServerEntry};
use crate::error::ProxyResult;
use crate::protocol::{self, MessageId};
use crate::transport::http::HttpTransport;
use crate::transport::sse::SseTransport;
use crate::transport::stdio::StdioTransport;
use crate::transport::{Frame, Transport};
use clap::Args;
use std::collections::HashMap;

#[derive(Debug, Args)]
pub struct InspectCommand {
    /// Backend transport: "stdio", "http", or "sse".
    #[arg(long)]
    pub transport: String,

    /// Command to spawn (stdio) or URL to connect (http/sse).
    #[arg(long)]
    pub target: String,

    #[arg(long, trailing_var_arg = true)]
    pub args: Vec<String>,
}

impl InspectCommand {
    pub async fn execute(self) -> ProxyResult<i32> {
        let entry = ServerEntry {
            name: "inspect".to_string(),
            transport: match self.transport.as_str() {
                "stdio" => BackendTransportConfig::Stdio { command: self.target.clone(), args: self.args.clone(), env: HashMap::new() },
                "http" => BackendTransportConfig::Http { url: self.target.clone(), headers: HashMap::new() },
                "sse" => BackendTransportConfig::Sse { url: self.target.clone(), headers: HashMap::new() },
                other => return Err(crate::error::ProxyError::ConfigInvalid(format!("unknown transport '{other}'"))),
            },
        };
        entry.validate()?;

        let mut transport: Box<dyn Transport> = match &entry.transport {
            BackendTransportConfig::Stdio { command, args, env } => Box::new(StdioTransport::spawn(command, args, env, None)?),
            BackendTransportConfig::Http { url, headers } => {
                Box::new(HttpTransport::new(url.clone(), None, headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
            }
            BackendTransportConfig::Sse { url, .. } => Box::new(SseTransport::new(url.clone(), None)),
        };

        let request = protocol::build_backend_initialize(MessageId::Number(0), "armour-inspect", env!("CARGO_PKG_VERSION"));
        let bytes = serde_json::to_vec(&request).map_err(crate::error::ProxyError::Serialization)?;
        transport.send(&bytes).await?;
        match transport.receive().await? {
            Frame::Data(body) => {
                let value: serde_json::Value = serde_json::from_slice(&body).map_err(crate::error::ProxyError::Serialization)?;
                println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            }
            Frame::Eof => {
                eprintln!("backend closed before responding to initialize");
                return Ok(3);
            }
        }
        transport.close().await?;
        Ok(0)
    }
}
