//! The event → conversation → agent router.
//!
//! Every event coming off the bus lands here exactly once (the durable
//! seen marker dedupes replays). The router binds the event to a
//! conversation, appends it to history, feeds the delegation coordinator
//! and phase machine, and finally decides which agents act: mentioned
//! agents first, the project orchestrator as fallback for unaddressed
//! human events. A live loop for the same `(conversation, agent)` gets
//! the event as a resumption signal instead of a second loop.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use cv_agents::AgentHandle;
use cv_domain::agent::AgentDefinition;
use cv_domain::event::{Event, EventKind};

use crate::cancel::ral_key;
use crate::ral;
use crate::state::EngineState;

pub struct Router {
    state: EngineState,
    /// Events whose parent has not arrived yet, keyed by the missing id.
    orphans: Mutex<HashMap<String, Vec<Event>>>,
}

impl Router {
    pub fn new(state: EngineState) -> Self {
        Self {
            state,
            orphans: Mutex::new(HashMap::new()),
        }
    }

    /// Route one incoming event; drains any orphans it unblocks.
    pub async fn route(&self, event: Event) {
        if !self.state.bus.mark_seen(&event.id) {
            tracing::trace!(event_id = %event.id, "duplicate event dropped");
            return;
        }

        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let unblocked = self.route_one(event).await;
            queue.extend(unblocked);
        }
    }

    /// Handle a single event. Returns orphans unblocked by it.
    async fn route_one(&self, event: Event) -> Vec<Event> {
        if event.kind.is_telemetry() {
            return Vec::new();
        }

        match event.kind {
            EventKind::AGENT_DEFINITION => {
                self.apply_agent_definition(&event);
                return Vec::new();
            }
            EventKind::PROJECT_DEFINITION => {
                tracing::debug!(event_id = %event.id, "project definition observed");
                return Vec::new();
            }
            _ => {}
        }

        // ── Bind to a conversation ───────────────────────────────────
        let conversation_id = match self.resolve_conversation(&event) {
            Ok(id) => id,
            Err(missing_parent) => {
                tracing::debug!(
                    event_id = %event.id,
                    waiting_on = %missing_parent,
                    "parent unseen; holding orphan"
                );
                self.orphans
                    .lock()
                    .entry(missing_parent)
                    .or_default()
                    .push(event);
                return Vec::new();
            }
        };

        if let Err(e) = self.state.store.load_or_create(&conversation_id) {
            tracing::warn!(error = %e, "failed to open conversation");
            return Vec::new();
        }

        // ── Metadata: titles and phase tags, never history ──────────
        if event.kind == EventKind::METADATA {
            if let Some(title) = event.tag_value("title") {
                if let Err(e) = self.state.store.set_title(&conversation_id, title) {
                    tracing::warn!(error = %e, "failed to set title");
                }
            }
            self.state.phases.apply_event_tag(&conversation_id, &event);
            return Vec::new();
        }

        match self.state.store.append_event(&conversation_id, &event) {
            Ok(true) => {}
            Ok(false) => return Vec::new(), // idempotent replay
            Err(e) => {
                tracing::warn!(error = %e, "failed to append event");
                return Vec::new();
            }
        }

        // A phase tag on a published agent event is a transition proposal.
        self.state.phases.apply_event_tag(&conversation_id, &event);

        let unblocked = self.orphans.lock().remove(&event.id).unwrap_or_default();

        // ── Delegation replies wake the parent, not a fresh loop ────
        if self.state.delegations.on_event(&event) {
            tracing::debug!(event_id = %event.id, "consumed as delegation reply");
            return unblocked;
        }

        // ── Resolve target agents and dispatch ──────────────────────
        for agent in self.target_agents(&event) {
            let key = ral_key(&conversation_id, agent.slug());
            if self.state.live_rals.deliver(&key, event.clone()) {
                tracing::debug!(
                    agent = agent.slug(),
                    conversation = %conversation_id,
                    "delivered resumption signal to live loop"
                );
                continue;
            }
            ral::spawn(
                self.state.clone(),
                agent.clone(),
                conversation_id.clone(),
                event.clone(),
            );
        }

        unblocked
    }

    /// Determine the conversation id for an event.
    ///
    /// Precedence: explicit conversation tag, then the parent's
    /// conversation, then the event becomes a fresh root. `Err` carries
    /// the missing parent id for orphan buffering.
    fn resolve_conversation(&self, event: &Event) -> std::result::Result<String, String> {
        if let Some(conv) = event.conversation_ref() {
            return Ok(conv.to_owned());
        }
        if let Some(parent) = event.parent_id() {
            if let Some(conv) = self.state.store.conversation_containing(parent) {
                return Ok(conv);
            }
            if let Some(root) = event.root_ref() {
                if self.state.store.exists(root) {
                    return Ok(root.to_owned());
                }
            }
            return Err(parent.to_owned());
        }
        // No parent chain at all: this event roots a new conversation.
        Ok(event.id.clone())
    }

    fn target_agents(&self, event: &Event) -> Vec<std::sync::Arc<AgentHandle>> {
        let mentioned: Vec<_> = event
            .mentioned_pubkeys()
            .into_iter()
            .filter(|pk| *pk != event.author)
            .filter_map(|pk| self.state.agents.by_pubkey(pk))
            .collect();
        if !mentioned.is_empty() {
            return mentioned;
        }

        // Unaddressed events: agent output fans out to nobody; human
        // input falls back to the project orchestrator.
        if self.state.agents.is_agent_pubkey(&event.author) {
            return Vec::new();
        }
        self.state.agents.orchestrator().into_iter().collect()
    }

    fn apply_agent_definition(&self, event: &Event) {
        if let Some(slug) = event.tag_value("removed") {
            if self.state.agents.remove(slug) {
                tracing::info!(slug, "agent removed by control event");
            }
            return;
        }
        match serde_json::from_str::<AgentDefinition>(&event.content) {
            Ok(definition) => {
                if let Err(e) = self.state.agents.register(definition) {
                    tracing::warn!(error = %e, "agent definition rejected");
                }
            }
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "invalid agent definition event");
            }
        }
    }
}
