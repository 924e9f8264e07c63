//! Shared fixtures for the tool tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use cv_domain::agent::AgentCategory;
use cv_domain::cancel::CancelToken;
use cv_domain::error::{Error, Result};
use cv_domain::event::{EventKind, Tag};
use cv_domain::phase::Phase;
use cv_store::ConversationStore;

use crate::runtime::{EventPublisher, PhaseGate, RecipientResolver, ToolContext};
use crate::scope::Sandbox;

/// Publisher that records every event instead of sending it anywhere.
#[derive(Default)]
pub struct CapturingPublisher {
    events: Mutex<Vec<(EventKind, String, Vec<Tag>)>>,
}

impl CapturingPublisher {
    pub fn events(&self) -> Vec<(EventKind, String, Vec<Tag>)> {
        self.events.lock().clone()
    }

    /// The `tool-status` tag values, in publish order.
    pub fn statuses(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|(_, _, tags)| {
                tags.iter()
                    .find(|t| t.name() == "tool-status")
                    .map(|t| t.value().to_owned())
            })
            .collect()
    }
}

#[async_trait]
impl EventPublisher for CapturingPublisher {
    async fn publish(&self, kind: EventKind, content: String, tags: Vec<Tag>) -> Result<String> {
        let id = format!("captured-{}", self.events.lock().len());
        self.events.lock().push((kind, content, tags));
        Ok(id)
    }
}

/// Phase gate that approves any successor transition and records calls.
#[derive(Default)]
pub struct RecordingPhaseGate {
    pub transitions: Mutex<Vec<(String, Phase)>>,
}

impl PhaseGate for RecordingPhaseGate {
    fn request_transition(
        &self,
        conversation_id: &str,
        _agent_slug: &str,
        to: Phase,
        _message: Option<String>,
    ) -> Result<Phase> {
        if to == Phase::Reflection {
            return Err(Error::Validation("transition rejected".into()));
        }
        self.transitions
            .lock()
            .push((conversation_id.to_owned(), to));
        Ok(to)
    }
}

/// Resolver with a fixed name → pubkey table.
#[derive(Default)]
pub struct StaticResolver {
    pub table: HashMap<String, String>,
    pub agents: Vec<String>,
}

impl StaticResolver {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        Self {
            table: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            agents: entries.iter().map(|(_, v)| v.to_string()).collect(),
        }
    }
}

impl RecipientResolver for StaticResolver {
    fn resolve_pubkey(&self, recipient: &str) -> Option<String> {
        if self.table.values().any(|v| v == recipient) {
            return Some(recipient.to_owned());
        }
        self.table.get(recipient).cloned()
    }

    fn is_agent(&self, pubkey: &str) -> bool {
        self.agents.iter().any(|a| a == pubkey)
    }
}

/// Context whose sandbox points at the process temp dir. Good enough for
/// tools that never touch the filesystem.
pub fn noop_context(publisher: Arc<CapturingPublisher>) -> ToolContext {
    let tmp = std::env::temp_dir();
    context_with(
        publisher,
        Sandbox::new(tmp.clone(), tmp),
        Arc::new(ConversationStore::in_memory()),
    )
}

pub fn context_with(
    publisher: Arc<CapturingPublisher>,
    sandbox: Sandbox,
    store: Arc<ConversationStore>,
) -> ToolContext {
    store.load_or_create("conv-1").unwrap();
    ToolContext {
        conversation_id: "conv-1".into(),
        agent_slug: "tester".into(),
        agent_pubkey: "pk-tester".into(),
        agent_category: AgentCategory::Worker,
        project_address: "project:test".into(),
        phase: Phase::Chat,
        sandbox,
        store,
        publisher,
        phases: Arc::new(RecordingPhaseGate::default()),
        recipients: Arc::new(StaticResolver::with(&[("bob", "pk-bob")])),
        cancel: CancelToken::new(),
    }
}
