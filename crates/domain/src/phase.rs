//! Conversation phases and the transition policy.
//!
//! Phases form an ordered set. Transitions are always explicit; the policy
//! below decides which agent categories may move a conversation where.

use serde::{Deserialize, Serialize};

use crate::agent::AgentCategory;

/// The ordered set of conversation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Chat,
    Brainstorm,
    Plan,
    Execute,
    Verification,
    Chores,
    Reflection,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Chat,
        Phase::Brainstorm,
        Phase::Plan,
        Phase::Execute,
        Phase::Verification,
        Phase::Chores,
        Phase::Reflection,
    ];

    /// Parse a phase name. Comparison is case-insensitive.
    pub fn parse(name: &str) -> Option<Phase> {
        match name.to_ascii_lowercase().as_str() {
            "chat" => Some(Phase::Chat),
            "brainstorm" => Some(Phase::Brainstorm),
            "plan" => Some(Phase::Plan),
            "execute" => Some(Phase::Execute),
            "verification" => Some(Phase::Verification),
            "chores" => Some(Phase::Chores),
            "reflection" => Some(Phase::Reflection),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Chat => "chat",
            Phase::Brainstorm => "brainstorm",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Verification => "verification",
            Phase::Chores => "chores",
            Phase::Reflection => "reflection",
        }
    }

    /// Position within the ordered set.
    pub fn index(&self) -> usize {
        Phase::ALL.iter().position(|p| p == self).unwrap_or(0)
    }

    /// The immediate successor, if any.
    pub fn successor(&self) -> Option<Phase> {
        Phase::ALL.get(self.index() + 1).copied()
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Chat
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `category` may move a conversation from `from` to `to`.
///
/// Orchestrators may go anywhere. Everyone may fall back to `chat` (the
/// recovery path). All other roles may only advance to the immediate
/// successor.
pub fn transition_allowed(category: AgentCategory, from: Phase, to: Phase) -> bool {
    if from == to {
        return true;
    }
    if category == AgentCategory::Orchestrator {
        return true;
    }
    if to == Phase::Chat {
        return true;
    }
    from.successor() == Some(to)
}

/// A single recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub author: String,
    pub at: chrono::DateTime<chrono::Utc>,
    /// Free-form note from whoever triggered the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
