//! Capability sets exchanged during `initialize`.
//!
//! A capability is effectively available only if the backend announces it;
//! the host's own announcement is informational and never expands what a
//! backend can do.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingCapability {
    #[serde(default)]
    pub tools: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElicitationCapability {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

/// A server's (or client's) announced capability set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
    #[serde(default)]
    pub subscribe: bool,
    #[serde(default)]
    pub logging: bool,
}

impl CapabilitySet {
    pub fn sampling_tools(&self) -> bool {
        self.sampling.as_ref().is_some_and(|s| s.tools)
    }

    pub fn elicitation_enabled(&self) -> bool {
        self.elicitation.as_ref().is_some_and(|e| e.enabled)
    }

    /// Aggregates `other` into `self`: a capability is present in the union
    /// if either side announces it. Used to build the proxy's own
    /// `initialize` response from its backends' announced capabilities.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            sampling: match (&self.sampling, &other.sampling) {
                (None, None) => None,
                (a, b) => Some(SamplingCapability {
                    tools: a.as_ref().is_some_and(|s| s.tools) || b.as_ref().is_some_and(|s| s.tools),
                }),
            },
            elicitation: match (&self.elicitation, &other.elicitation) {
                (None, None) => None,
                (a, b) => Some(ElicitationCapability {
                    enabled: a.as_ref().is_some_and(|e| e.enabled) || b.as_ref().is_some_and(|e| e.enabled),
                }),
            },
            tools: match (&self.tools, &other.tools) {
                (None, None) => None,
                (a, b) => Some(ToolsCapability {
                    list_changed: a.as_ref().is_some_and(|t| t.list_changed) || b.as_ref().is_some_and(|t| t.list_changed),
                }),
            },
            list_changed: self.list_changed || other.list_changed,
            subscribe: self.subscribe || other.subscribe,
            logging: self.logging || other.logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_sampling_is_unavailable() {
        let caps = CapabilitySet::default();
        assert!(!caps.sampling_tools());
    }

    #[test]
    fn announced_sampling_is_available() {
        let caps = CapabilitySet {
            sampling: Some(SamplingCapability { tools: true }),
            ..Default::default()
        };
        assert!(caps.sampling_tools());
    }

    #[test]
    fn union_keeps_either_sides_announcement() {
        let a = CapabilitySet { subscribe: true, ..Default::default() };
        let b = CapabilitySet {
            elicitation: Some(ElicitationCapability { enabled: true }),
            ..Default::default()
        };
        let merged = a.union(&b);
        assert!(merged.subscribe);
        assert!(merged.elicitation_enabled());
    }
}
