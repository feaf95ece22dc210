//! `armour registry`: add/remove/list/validate backend registry entries.

use crate::config::{BackendTransportConfig, Registry, ServerEntry};
use crate::error::ProxyResult;
use clap::{Args, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct RegistryCommand {
    /// Path to the registry JSON document.
    #[arg(long, value_name = "PATH")]
    pub registry: PathBuf,

    #[command(subcommand)]
    pub action: RegistryAction,
}

#[derive(Debug, Subcommand)]
pub enum RegistryAction {
    /// List every registered backend.
    List,
    /// Validate the registry document without mutating it.
    Validate,
    /// Add or replace a stdio backend entry.
    AddStdio {
        name: String,
        command: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Add or replace an HTTP backend entry.
    AddHttp { name: String, url: String },
    /// Add or replace an SSE backend entry.
    AddSse { name: String, url: String },
    /// Remove a backend entry by name.
    Remove { name: String },
}

impl RegistryCommand {
    pub fn execute(self) -> ProxyResult<i32> {
        let registry = if self.registry.exists() {
            Registry::load(&self.registry)?
        } else {
            Registry::default()
        };

        match self.action {
            RegistryAction::List => {
                for server in &registry.servers {
                    println!("{}\t{:?}", server.name, server.transport);
                }
                Ok(0)
            }
            RegistryAction::Validate => {
                registry.validate()?;
                println!("registry is valid ({} servers)", registry.servers.len());
                Ok(0)
            }
            RegistryAction::AddStdio { name, command, args } => {
                let entry = ServerEntry {
                    name,
                    transport: BackendTransportConfig::Stdio { command, args, env: HashMap::new() },
                };
                registry.with_upserted(entry)?.save(&self.registry)?;
                Ok(0)
            }
            RegistryAction::AddHttp { name, url } => {
                let entry = ServerEntry { name, transport: BackendTransportConfig::Http { url, headers: HashMap::new() } };
                registry.with_upserted(entry)?.save(&self.registry)?;
                Ok(0)
            }
            RegistryAction::AddSse { name, url } => {
                let entry = ServerEntry { name, transport: BackendTransportConfig::Sse { url, headers: HashMap::new() } };
                registry.with_upserted(entry)?.save(&self.registry)?;
                Ok(0)
            }
            RegistryAction::Remove { name } => {
                registry.with_removed(&name).save(&self.registry)?;
                Ok(0)
            }
        }
    }
}
