//! Sampling & elicitation guards (C7): transport-scoped bans and structural
//! validation of tool-use/tool-result message history.

use crate::error::{ProxyError, ProxyResult};
use crate::transport::TransportKind;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Per-server allow set and per-transport disable set for sampling.
#[derive(Debug, Clone, Default)]
pub struct SamplingGuard {
    pub allowed_servers: HashSet<String>,
    pub disabled_transports: HashSet<TransportKind>,
}

impl SamplingGuard {
    pub fn validate_sampling_request(
        &self,
        server: &str,
        transport: TransportKind,
        capability_available: bool,
        history: &Value,
    ) -> ProxyResult<()> {
        if !capability_available {
            return Err(ProxyError::CapabilityUnavailable("sampling".to_string()));
        }
        if self.disabled_transports.contains(&transport) {
            return Err(ProxyError::TransportNotSupported(format!(
                "sampling disabled on {transport} transport"
            )));
        }
        if !self.allowed_servers.is_empty() && !self.allowed_servers.contains(server) {
            return Err(ProxyError::Blocked(format!("sampling not permitted for server '{server}'")));
        }
        validate_tool_use_and_result_balance(history)
    }
}

/// Content block kinds inside a sampling message, parsed into a strict
/// tagged variant instead of loose JSON descent.
#[derive(Debug, Clone)]
enum ContentBlock {
    Text,
    ToolUse { id: String },
    ToolResult { tool_use_id: String },
}

fn parse_block(value: &Value) -> Option<ContentBlock> {
    let kind = value.get("type")?.as_str()?;
    match kind {
        "text" => Some(ContentBlock::Text),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: value.get("id")?.as_str()?.to_string(),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: value.get("tool_use_id")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

fn blocks_of(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::Array(items) => items.iter().filter_map(parse_block).collect(),
        Value::Object(_) => parse_block(content).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn is_valid_tool_use_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validates:
/// - every `tool_result` block references a `tool_use_id` seen in an
///   earlier assistant message;
/// - a user message containing a `tool_result` block contains no other
///   content kind.
pub fn validate_tool_use_and_result_balance(history: &Value) -> ProxyResult<()> {
    let messages = history.as_array().ok_or_else(|| {
        ProxyError::MalformedToolUseHistory("message history must be an array".to_string())
    })?;

    let mut seen_tool_use_ids: HashSet<String> = HashSet::new();

    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        let content = message.get("content").cloned().unwrap_or(Value::Null);
        let blocks = blocks_of(&content);

        if role == "assistant" {
            for block in &blocks {
                if let ContentBlock::ToolUse { id } = block {
                    if !is_valid_tool_use_id(id) {
                        return Err(ProxyError::MalformedToolUseHistory(format!(
                            "invalid tool_use id '{id}'"
                        )));
                    }
                    seen_tool_use_ids.insert(id.clone());
                }
            }
        }

        if role == "user" {
            let has_tool_result = blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. }));
            if has_tool_result {
                let has_other = blocks.iter().any(|b| !matches!(b, ContentBlock::ToolResult { .. }));
                if has_other {
                    return Err(ProxyError::MalformedToolUseHistory(
                        "user message with tool_result must not contain other content kinds".to_string(),
                    ));
                }
                for block in &blocks {
                    if let ContentBlock::ToolResult { tool_use_id } = block {
                        if !seen_tool_use_ids.contains(tool_use_id) {
                            return Err(ProxyError::MalformedToolUseHistory(format!(
                                "unknown tool_use_id '{tool_use_id}'"
                            )));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Per-method allow map and block map for elicitation. Elicitation is
/// HTTP/SSE only; stdio backends may never elicit.
#[derive(Debug, Clone, Default)]
pub struct ElicitationGuard {
    pub allowed_methods: HashMap<String, bool>,
    pub blocked_methods: HashSet<String>,
}

impl ElicitationGuard {
    pub fn validate_elicitation_request(
        &self,
        method: &str,
        transport: TransportKind,
        capability_available: bool,
    ) -> ProxyResult<()> {
        if !capability_available {
            return Err(ProxyError::CapabilityUnavailable("elicitation".to_string()));
        }
        if transport == TransportKind::Stdio {
            return Err(ProxyError::TransportNotSupported(
                "elicitation is HTTP/SSE-only".to_string(),
            ));
        }
        if self.blocked_methods.contains(method) {
            return Err(ProxyError::Blocked(format!("elicitation method '{method}' is blocked")));
        }
        if !self.allowed_methods.is_empty() && !self.allowed_methods.contains_key(method) {
            return Err(ProxyError::Blocked(format!(
                "elicitation method '{method}' is not in the allow set"
            )));
        }
        Ok(())
    }
}
