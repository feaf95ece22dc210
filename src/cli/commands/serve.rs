//! `armour serve`: run the proxy in stdio or HTTP mode against a registry.

use crate::config::Registry;
use crate::engine::ProxyEngine;
use crate::error::{ProxyError, ProxyResult};
use crate::frontend;
use crate::policy::PolicySnapshot;
use crate::transport::TransportKind;
use clap::Args;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Path to the registry JSON document.
    #[arg(long, value_name = "PATH")]
    pub registry: PathBuf,

    /// Front-end transport: "stdio" or "http".
    #[arg(long, default_value = "stdio")]
    pub frontend: String,

    /// Bind address for the HTTP front-end.
    #[arg(long, default_value = "127.0.0.1:3333")]
    pub bind: String,

    /// Client name sent to backends during `initialize`.
    #[arg(long, default_value = "armour")]
    pub client_name: String,

    /// Client version sent to backends during `initialize`.
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    pub client_version: String,

    /// Number of backend handshake failures tolerated before exiting with
    /// code 4 (see exit code table).
    #[arg(long, default_value_t = usize::MAX)]
    pub max_degraded: usize,
}

impl ServeCommand {
    pub async fn execute(self) -> ProxyResult<i32> {
        let registry = Registry::load(&self.registry)?;
        let (router, notifications) = frontend::connect_all(&registry, &self.client_name, &self.client_version).await;

        let degraded = router.backends().iter().filter(|b| b.degraded).count();
        if degraded > self.max_degraded {
            tracing::error!(degraded, max = self.max_degraded, "too many backend handshake failures");
            return Ok(4);
        }

        let policy = PolicySnapshot::new(Vec::new());
        let engine = Arc::new(ProxyEngine::new(Arc::new(registry), router, policy));

        match self.frontend.as_str() {
            "stdio" => {
                frontend::run_stdio(engine, notifications).await?;
                Ok(0)
            }
            "http" => {
                // The HTTP front-end is request/response only (no SSE push
                // channel to the host yet), so backend notifications can
                // only be logged, not delivered.
                let relay_engine = engine.clone();
                tokio::spawn(async move {
                    relay_engine
                        .relay_notifications(TransportKind::Http, notifications, |payload| {
                            tracing::debug!(?payload, "backend notification (no host transport wired to relay it)");
                        })
                        .await;
                });
                let ready = Arc::new(AtomicBool::new(true));
                ready.store(true, Ordering::Release);
                frontend::run_http(engine, &self.bind, ready).await?;
                Ok(0)
            }
            other => Err(ProxyError::ConfigInvalid(format!("unknown frontend transport '{other}'"))),
        }
    }
}
