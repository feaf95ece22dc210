//! Registry (C2): load/validate/persist the list of backend servers.
//!
//! The registry is copy-on-write: mutation produces a new `Registry` value;
//! in-flight requests keep using the `Arc<Registry>` snapshot they observed.

use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Policy mode baseline (see `policy` module for rule evaluation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Strict,
    #[default]
    Moderate,
    Permissive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum BackendTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// A single registered backend server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    #[serde(flatten)]
    pub transport: BackendTransportConfig,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

impl ServerEntry {
    pub fn validate(&self) -> ProxyResult<()> {
        if !valid_name(&self.name) {
            return Err(ProxyError::ConfigInvalid(format!(
                "server name '{}' must match [A-Za-z0-9_.-]+",
                self.name
            )));
        }
        if self.name.eq_ignore_ascii_case("armour") {
            return Err(ProxyError::ConfigInvalid(
                "server name 'armour' is reserved for the proxy's own identity".to_string(),
            ));
        }
        match &self.transport {
            BackendTransportConfig::Stdio { command, .. } if command.is_empty() => {
                Err(ProxyError::ConfigInvalid(format!(
                    "stdio backend '{}' requires a non-empty command",
                    self.name
                )))
            }
            BackendTransportConfig::Http { url, .. } | BackendTransportConfig::Sse { url, .. }
                if url.is_empty() =>
            {
                Err(ProxyError::ConfigInvalid(format!(
                    "backend '{}' requires a non-empty url",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryMetadata {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Moderate,
        }
    }
}

/// The registry document, persisted as a single JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub metadata: RegistryMetadata,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    /// Monotonically increasing counter bumped on every mutation; used for
    /// optimistic-concurrency diagnostics, not persisted-timestamp tracking.
    #[serde(default)]
    pub revision: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            metadata: RegistryMetadata {
                version: "1.0.0".to_string(),
            },
            policy: PolicyConfig::default(),
            servers: Vec::new(),
            revision: 0,
        }
    }
}

impl Registry {
    pub fn validate(&self) -> ProxyResult<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.clone()) {
                return Err(ProxyError::ConfigInvalid(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> ProxyResult<Self> {
        if !path.exists() {
            return Err(ProxyError::RegistryNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(ProxyError::Io)?;
        let registry: Self = serde_json::from_str(&text).map_err(ProxyError::Serialization)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Persists the registry atomically: write to a sibling temp file, then
    /// rename over the target.
    pub fn save(&self, path: &Path) -> ProxyResult<()> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self).map_err(ProxyError::Serialization)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, text).map_err(ProxyError::Io)?;
        std::fs::rename(&tmp_path, path).map_err(ProxyError::Io)?;
        Ok(())
    }

    /// Returns a new registry with `server` upserted by name, bumping the
    /// revision counter. Copy-on-write: callers swap their `Arc<Registry>`.
    pub fn with_upserted(&self, server: ServerEntry) -> ProxyResult<Self> {
        server.validate()?;
        let mut servers: Vec<ServerEntry> = self
            .servers
            .iter()
            .filter(|s| s.name != server.name)
            .cloned()
            .collect();
        servers.push(server);
        Ok(Self {
            metadata: self.metadata.clone(),
            policy: self.policy.clone(),
            servers,
            revision: self.revision + 1,
        })
    }

    pub fn with_removed(&self, name: &str) -> Self {
        Self {
            metadata: self.metadata.clone(),
            policy: self.policy.clone(),
            servers: self.servers.iter().filter(|s| s.name != name).cloned().collect(),
            revision: self.revision + 1,
        }
    }

    pub fn find(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }
}
