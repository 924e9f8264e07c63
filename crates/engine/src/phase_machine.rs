//! Per-conversation phase state and the transition policy.
//!
//! Transitions are always explicit: a dedicated tool call or a `phase`
//! tag on a published agent event. The machine checks the author's
//! category against the policy and records accepted transitions in the
//! conversation's phase log.

use std::sync::Arc;

use cv_agents::AgentRegistry;
use cv_domain::error::{Error, Result};
use cv_domain::event::Event;
use cv_domain::phase::{transition_allowed, Phase};
use cv_store::ConversationStore;
use cv_tools::PhaseGate;

pub struct PhaseMachine {
    store: Arc<ConversationStore>,
    agents: Arc<AgentRegistry>,
}

impl PhaseMachine {
    pub fn new(store: Arc<ConversationStore>, agents: Arc<AgentRegistry>) -> Self {
        Self { store, agents }
    }

    pub fn current(&self, conversation_id: &str) -> Phase {
        self.store
            .with_conversation(conversation_id, |c| c.phase)
            .unwrap_or_default()
    }

    fn transition(
        &self,
        conversation_id: &str,
        agent_slug: &str,
        to: Phase,
        message: Option<String>,
    ) -> Result<Phase> {
        let agent = self
            .agents
            .by_slug(agent_slug)
            .ok_or_else(|| Error::Validation(format!("unknown agent '{agent_slug}'")))?;

        let from = self.current(conversation_id);
        if from == to {
            return Ok(to);
        }
        if !transition_allowed(agent.definition.category, from, to) {
            return Err(Error::Validation(format!(
                "agent '{agent_slug}' ({}) may not move the conversation from {from} to {to}",
                agent.definition.category.as_str()
            )));
        }

        self.store
            .set_phase(conversation_id, to, &agent.pubkey, message)?;
        tracing::info!(
            conversation = conversation_id,
            agent = agent_slug,
            from = %from,
            to = %to,
            "phase transition"
        );
        Ok(to)
    }

    /// Apply a `phase` tag carried on a published agent event. Rejections
    /// are logged and swallowed; the publishing loop continues.
    pub fn apply_event_tag(&self, conversation_id: &str, event: &Event) {
        let Some(tag) = event.phase_tag() else {
            return;
        };
        let Some(phase) = Phase::parse(&tag) else {
            tracing::debug!(conversation = conversation_id, tag, "ignoring unknown phase tag");
            return;
        };
        let Some(agent) = self.agents.by_pubkey(&event.author) else {
            return;
        };
        if let Err(e) = self.transition(
            conversation_id,
            &agent.definition.slug,
            phase,
            None,
        ) {
            tracing::debug!(
                conversation = conversation_id,
                error = %e,
                "phase tag rejected"
            );
        }
    }
}

impl PhaseGate for PhaseMachine {
    fn request_transition(
        &self,
        conversation_id: &str,
        agent_slug: &str,
        to: Phase,
        message: Option<String>,
    ) -> Result<Phase> {
        self.transition(conversation_id, agent_slug, to, message)
    }
}
