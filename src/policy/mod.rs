//! Blocklist / policy engine (C8): rule storage and evaluation, the 8-field
//! permission matrix, and the three policy-mode baselines.

use crate::config::PolicyMode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The eight gated MCP capabilities a rule's permission matrix covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    ToolsCall,
    ToolsList,
    ResourcesRead,
    ResourcesList,
    ResourcesSubscribe,
    PromptsGet,
    PromptsList,
    Sampling,
    Elicitation,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::ToolsCall,
        Capability::ToolsList,
        Capability::ResourcesRead,
        Capability::ResourcesList,
        Capability::ResourcesSubscribe,
        Capability::PromptsGet,
        Capability::PromptsList,
        Capability::Sampling,
        Capability::Elicitation,
    ];
}

/// A single capability's verdict. `Ask` is treated as `Deny` at the core
/// level; any confirmation affordance belongs to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
    Inherit,
    Ask,
}

impl Verdict {
    pub fn resolved(self) -> ResolvedVerdict {
        match self {
            Verdict::Allow => ResolvedVerdict::Allow,
            Verdict::Deny | Verdict::Ask => ResolvedVerdict::Deny,
            Verdict::Inherit => ResolvedVerdict::Inherit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVerdict {
    Allow,
    Deny,
    Inherit,
}

/// Fixed 9-field permission matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionMatrix {
    pub tools_call: Verdict,
    pub tools_list: Verdict,
    pub resources_read: Verdict,
    pub resources_list: Verdict,
    pub resources_subscribe: Verdict,
    pub prompts_get: Verdict,
    pub prompts_list: Verdict,
    pub sampling: Verdict,
    pub elicitation: Verdict,
}

impl PermissionMatrix {
    pub fn get(&self, cap: Capability) -> Verdict {
        match cap {
            Capability::ToolsCall => self.tools_call,
            Capability::ToolsList => self.tools_list,
            Capability::ResourcesRead => self.resources_read,
            Capability::ResourcesList => self.resources_list,
            Capability::ResourcesSubscribe => self.resources_subscribe,
            Capability::PromptsGet => self.prompts_get,
            Capability::PromptsList => self.prompts_list,
            Capability::Sampling => self.sampling,
            Capability::Elicitation => self.elicitation,
        }
    }

    /// Derives a matrix from a rule's top-level `action`: deny everything
    /// dangerous when `block`, allow everything when `allow`.
    pub fn from_action(action: RuleAction) -> Self {
        let v = match action {
            RuleAction::Block => Verdict::Deny,
            RuleAction::Allow => Verdict::Allow,
        };
        Self {
            tools_call: v,
            tools_list: v,
            resources_read: v,
            resources_list: v,
            resources_subscribe: v,
            prompts_get: v,
            prompts_list: v,
            sampling: v,
            elicitation: v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Block,
    Allow,
}

/// A blocklist rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistRule {
    pub id: String,
    pub pattern: String,
    pub description: String,
    pub action: RuleAction,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub is_semantic: bool,
    /// Comma list of fully-qualified `server:tool` names; empty = all.
    #[serde(default)]
    pub tools: String,
    #[serde(default)]
    pub permissions: Option<PermissionMatrix>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl BlocklistRule {
    fn effective_permissions(&self) -> PermissionMatrix {
        self.permissions
            .clone()
            .unwrap_or_else(|| PermissionMatrix::from_action(self.action))
    }

    fn tool_admitted(&self, qualified_tool: &str) -> bool {
        if self.tools.trim().is_empty() {
            return true;
        }
        self.tools
            .split(',')
            .map(str::trim)
            .any(|t| t.eq_ignore_ascii_case(qualified_tool))
    }

    fn pattern_admits(&self, qualified_tool: &str, description: &str, arguments: &str) -> bool {
        if self.is_regex {
            return Regex::new(&self.pattern)
                .is_ok_and(|re| re.is_match(qualified_tool) || re.is_match(arguments));
        }
        if self.is_semantic {
            let rule_tokens = tokenize(&self.pattern);
            let call_tokens: HashSet<String> = tokenize(qualified_tool)
                .into_iter()
                .chain(tokenize(description))
                .chain(tokenize(arguments))
                .collect();
            return rule_tokens.iter().any(|t| call_tokens.contains(t));
        }
        let haystack = format!("{qualified_tool} {description} {arguments}").to_lowercase();
        haystack.contains(&self.pattern.to_lowercase())
    }

    /// Whether this rule matches the call; both the tool/namespace filter
    /// and the pattern must admit it.
    pub fn matches(&self, qualified_tool: &str, description: &str, arguments: &str) -> bool {
        self.enabled
            && self.tool_admitted(qualified_tool)
            && self.pattern_admits(qualified_tool, description, arguments)
    }
}

fn tokenize(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

const DESTRUCTIVE_PREFIXES: [&str; 6] = ["rm", "delete", "drop", "truncate", "destroy", "format"];

fn destructive_regex() -> Regex {
    Regex::new(r"rm -rf /|~|\$HOME").expect("static pattern")
}

fn is_destructive(tool_name: &str, arguments: &str) -> bool {
    let local = tool_name.rsplit(':').next().unwrap_or(tool_name).to_lowercase();
    let prefix_match = DESTRUCTIVE_PREFIXES.iter().any(|p| local.starts_with(p));
    prefix_match || destructive_regex().is_match(arguments)
}

/// Baseline verdict for a capability under a policy mode, before any
/// explicit rule is consulted.
pub fn mode_default(mode: PolicyMode, cap: Capability, tool_name: &str, arguments: &str) -> ResolvedVerdict {
    if is_destructive(tool_name, arguments) && mode != PolicyMode::Permissive {
        return ResolvedVerdict::Deny;
    }
    match mode {
        PolicyMode::Strict => match cap {
            Capability::Sampling | Capability::Elicitation => ResolvedVerdict::Deny,
            Capability::ToolsCall => ResolvedVerdict::Deny, // ask-then-deny: core treats ask as deny
            _ => ResolvedVerdict::Allow,
        },
        PolicyMode::Moderate => ResolvedVerdict::Allow,
        PolicyMode::Permissive => ResolvedVerdict::Allow,
    }
}

/// A stable, read-only snapshot of the rule set. The evaluator reads one
/// snapshot for the lifetime of a single call.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    rules: Vec<BlocklistRule>,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: ResolvedVerdict,
    pub matched_rule: Option<String>,
}

impl PolicySnapshot {
    pub fn new(mut rules: Vec<BlocklistRule>) -> Self {
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Self { rules }
    }

    pub fn rules(&self) -> &[BlocklistRule] {
        &self.rules
    }

    /// Evaluates one inbound call in a single pass, ordered by rule id.
    pub fn evaluate(
        &self,
        mode: PolicyMode,
        cap: Capability,
        qualified_tool: &str,
        description: &str,
        arguments: &str,
    ) -> Decision {
        for rule in &self.rules {
            if rule.matches(qualified_tool, description, arguments) {
                let verdict = rule.effective_permissions().get(cap).resolved();
                let verdict = match verdict {
                    ResolvedVerdict::Inherit => {
                        mode_default(mode, cap, qualified_tool, arguments)
                    }
                    resolved => resolved,
                };
                return Decision {
                    verdict,
                    matched_rule: Some(rule.id.clone()),
                };
            }
        }
        Decision {
            verdict: mode_default(mode, cap, qualified_tool, arguments),
            matched_rule: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_rule(id: &str, pattern: &str, is_regex: bool) -> BlocklistRule {
        BlocklistRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            description: String::new(),
            action: RuleAction::Block,
            is_regex,
            is_semantic: false,
            tools: String::new(),
            permissions: None,
            enabled: true,
        }
    }

    #[test]
    fn regex_rule_matches_dangerous_arguments() {
        let rule = block_rule("r1", "rm -rf", false);
        assert!(rule.matches("demo:shell", "", r#"{"cmd":"rm -rf /tmp/x"}"#));
    }

    #[test]
    fn rule_scoped_to_tools_list_does_not_match_other_tools() {
        let mut rule = block_rule("r1", "anything", false);
        rule.tools = "demo:shell".to_string();
        assert!(!rule.matches("demo:other", "", ""));
    }

    #[test]
    fn snapshot_evaluates_in_rule_id_order_and_first_match_wins() {
        let snapshot = PolicySnapshot::new(vec![
            block_rule("a", "shell", false),
            {
                let mut allow = block_rule("b", "shell", false);
                allow.action = RuleAction::Allow;
                allow
            },
        ]);
        let decision = snapshot.evaluate(PolicyMode::Moderate, Capability::ToolsCall, "demo:shell", "", "");
        assert_eq!(decision.matched_rule.as_deref(), Some("a"));
        assert_eq!(decision.verdict, ResolvedVerdict::Deny);
    }

    #[test]
    fn moderate_mode_blocks_destructive_pattern_with_no_explicit_rule() {
        let snapshot = PolicySnapshot::new(vec![]);
        let decision = snapshot.evaluate(
            PolicyMode::Moderate,
            Capability::ToolsCall,
            "demo:rm_files",
            "",
            "{}",
        );
        assert_eq!(decision.verdict, ResolvedVerdict::Deny);
    }

    #[test]
    fn permissive_mode_allows_destructive_pattern() {
        let snapshot = PolicySnapshot::new(vec![]);
        let decision = snapshot.evaluate(
            PolicyMode::Permissive,
            Capability::ToolsCall,
            "demo:rm_files",
            "",
            "{}",
        );
        assert_eq!(decision.verdict, ResolvedVerdict::Allow);
    }

    #[test]
    fn strict_mode_denies_sampling_with_no_rule() {
        let snapshot = PolicySnapshot::new(vec![]);
        let decision = snapshot.evaluate(PolicyMode::Strict, Capability::Sampling, "demo:x", "", "");
        assert_eq!(decision.verdict, ResolvedVerdict::Deny);
    }

    #[test]
    fn ask_verdict_resolves_to_deny() {
        assert_eq!(Verdict::Ask.resolved(), ResolvedVerdict::Deny);
    }

    #[test]
    fn strict_mode_denies_elicitation_with_no_rule() {
        let snapshot = PolicySnapshot::new(vec![]);
        let decision = snapshot.evaluate(PolicyMode::Strict, Capability::Elicitation, "demo:x", "", "");
        assert_eq!(decision.verdict, ResolvedVerdict::Deny);
    }

    #[test]
    fn moderate_mode_allows_elicitation_with_no_rule() {
        let snapshot = PolicySnapshot::new(vec![]);
        let decision = snapshot.evaluate(PolicyMode::Moderate, Capability::Elicitation, "demo:x", "", "");
        assert_eq!(decision.verdict, ResolvedVerdict::Allow);
    }

    #[test]
    fn semantic_rule_matches_on_keyword_intersection() {
        let mut rule = block_rule("s1", "delete remove", false);
        rule.is_semantic = true;
        assert!(rule.matches("demo:file_delete", "removes a file", ""));
    }
}
