//! CLI surface: `serve`, `registry`, `inspect`, grounded in the proxy
//! crate's `cli::args`/`cli::commands` split.

pub mod commands;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "armour", version, about = "Security-enforcing aggregating proxy for MCP")]
pub struct Cli {
    /// Log level directive (e.g. "info", "armour=debug").
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit structured JSON logs instead of human-readable output.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the proxy against a registry file.
    Serve(commands::serve::ServeCommand),
    /// Add/remove/list/validate backend registry entries.
    Registry(commands::registry::RegistryCommand),
    /// Connect to one backend and print its capabilities/tools, without
    /// starting the full proxy pipeline.
    Inspect(commands::inspect::InspectCommand),
}
