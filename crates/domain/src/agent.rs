//! Agent definitions and the tool policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Coarse role category carried on each agent. Drives phase-transition
/// rights and the per-category tool deny list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCategory {
    Orchestrator,
    Worker,
    Advisor,
    Auditor,
}

impl AgentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentCategory::Orchestrator => "orchestrator",
            AgentCategory::Worker => "worker",
            AgentCategory::Advisor => "advisor",
            AgentCategory::Auditor => "auditor",
        }
    }
}

impl Default for AgentCategory {
    fn default() -> Self {
        AgentCategory::Worker
    }
}

/// A single agent's definition, as loaded from `agents/<slug>.json`.
///
/// The signer and pubkey of a slug never change; they are attached by the
/// registry when the definition is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Identifier unique within the project.
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub category: AgentCategory,
    /// System prompt fragment describing the agent.
    #[serde(default)]
    pub instructions: String,
    /// Ordered tool names this agent may invoke.
    #[serde(default)]
    pub tool_allow: Vec<String>,
    /// Name of the LLM configuration this agent runs on.
    #[serde(default)]
    pub llm_config_name: Option<String>,
    /// Phase-specific instruction fragments.
    #[serde(default)]
    pub phases: HashMap<Phase, String>,
    /// MCP servers this agent has access to (descriptors only).
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    /// Tool-loop budget override. `None` = engine default.
    #[serde(default)]
    pub max_agent_steps: Option<usize>,
}

/// Allow/deny filter applied to tool names before dispatch.
///
/// Matching is case-insensitive and deny always wins over allow. An empty
/// allow list (or `"*"`) means unrestricted after the deny check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl ToolPolicy {
    pub fn allows(&self, tool_name: &str) -> bool {
        let name = tool_name.to_ascii_lowercase();

        for d in &self.deny {
            let d = d.to_ascii_lowercase();
            if d == "*" || name == d {
                return false;
            }
        }
        if self.allow.is_empty() || self.allow.iter().any(|a| a == "*") {
            return true;
        }
        self.allow.iter().any(|a| a.to_ascii_lowercase() == name)
    }
}

impl AgentDefinition {
    /// Build the effective tool policy: the agent's allow list combined
    /// with the per-category denies from config.
    pub fn tool_policy(&self, category_denies: &[String]) -> ToolPolicy {
        ToolPolicy {
            allow: self.tool_allow.clone(),
            deny: category_denies.to_vec(),
        }
    }

    /// Phase-specific instructions for the current phase, when defined.
    pub fn phase_instructions(&self, phase: Phase) -> Option<&str> {
        self.phases.get(&phase).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_wins_over_allow() {
        let policy = ToolPolicy {
            allow: vec!["shell".into()],
            deny: vec!["shell".into()],
        };
        assert!(!policy.allows("shell"));
    }

    #[test]
    fn empty_allow_is_unrestricted() {
        let policy = ToolPolicy::default();
        assert!(policy.allows("anything"));
    }

    #[test]
    fn allow_list_is_exact_and_case_insensitive() {
        let policy = ToolPolicy {
            allow: vec!["fs_read".into()],
            deny: vec![],
        };
        assert!(policy.allows("FS_READ"));
        assert!(!policy.allows("fs_write"));
    }

    #[test]
    fn wildcard_deny_blocks_everything() {
        let policy = ToolPolicy {
            allow: vec!["fs_read".into()],
            deny: vec!["*".into()],
        };
        assert!(!policy.allows("fs_read"));
    }

    #[test]
    fn effective_policy_combines_category_denies() {
        let def = AgentDefinition {
            slug: "helper".into(),
            name: "Helper".into(),
            category: AgentCategory::Advisor,
            instructions: String::new(),
            tool_allow: vec!["fs_read".into(), "shell".into()],
            llm_config_name: None,
            phases: HashMap::new(),
            mcp_servers: vec![],
            max_agent_steps: None,
        };
        let policy = def.tool_policy(&["shell".to_string()]);
        assert!(policy.allows("fs_read"));
        assert!(!policy.allows("shell"));
    }
}
