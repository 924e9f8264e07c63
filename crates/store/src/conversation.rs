//! In-memory representation of one conversation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cv_domain::event::Event;
use cv_domain::phase::{Phase, PhaseTransition};

/// The tree of events rooted at a single event, plus the state the engine
/// keeps alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Identified by its root event id.
    pub id: String,
    pub root_event_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub phase_log: Vec<PhaseTransition>,
    /// Ordered by `created_at`, ties broken by id lex order.
    #[serde(default)]
    pub history: Vec<Event>,
    /// agent-slug → key → value scratch space.
    #[serde(default)]
    pub agent_kv: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl Conversation {
    pub fn new(root_event_id: impl Into<String>) -> Self {
        let root_event_id = root_event_id.into();
        Self {
            id: root_event_id.clone(),
            root_event_id,
            title: None,
            phase: Phase::Chat,
            phase_log: Vec::new(),
            history: Vec::new(),
            agent_kv: HashMap::new(),
        }
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.history.iter().any(|e| e.id == event_id)
    }

    pub fn find(&self, event_id: &str) -> Option<&Event> {
        self.history.iter().find(|e| e.id == event_id)
    }

    /// Insert an event in timestamp order (ties by id). Idempotent:
    /// returns `false` when the id is already present.
    pub fn insert_event(&mut self, event: Event) -> bool {
        if self.contains(&event.id) {
            return false;
        }
        let key = (event.created_at, event.id.clone());
        let pos = self
            .history
            .partition_point(|e| (e.created_at, e.id.clone()) <= key);
        self.history.insert(pos, event);
        true
    }

    /// Direct children of `parent_id`, in history (timestamp) order.
    pub fn children_of<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a Event> {
        self.history
            .iter()
            .filter(move |e| e.parent_id() == Some(parent_id))
    }

    /// Record a phase transition. The caller has already validated it
    /// against the policy.
    pub fn push_phase(&mut self, transition: PhaseTransition) {
        self.phase = transition.to;
        self.phase_log.push(transition);
    }
}
