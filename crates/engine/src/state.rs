//! Shared engine state: every service bundled behind `Arc`s, threaded
//! explicitly through constructors instead of process-wide singletons.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use cv_agents::{AgentHandle, AgentRegistry};
use cv_bus::{EventBus, Keyring, RelayPool, SeenStore};
use cv_domain::cancel::CancelToken;
use cv_domain::config::EngineConfig;
use cv_domain::error::{Error, Result};
use cv_domain::event::{Event, EventBuilder, EventKind, Tag};
use cv_llm::LlmRegistry;
use cv_store::ConversationStore;
use cv_tools::{EventPublisher, RecipientResolver, ToolRuntime};

use crate::cancel::CancelMap;
use crate::coordinator::RalCoordinators;
use crate::delegation::DelegationCoordinator;
use crate::phase_machine::PhaseMachine;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Live RAL registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mailbox of one live loop: the router delivers repeat triggering
/// events here instead of spawning a second loop (resume policy).
#[derive(Clone)]
pub struct RalMailbox {
    pub tx: mpsc::UnboundedSender<Event>,
    pub cancel: CancelToken,
    pub ral_number: u64,
}

/// Enforces the single-live-RAL invariant per `(conversation, agent)`.
#[derive(Default)]
pub struct LiveRalMap {
    map: Mutex<HashMap<String, RalMailbox>>,
}

impl LiveRalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the key for a new loop. Fails when one is already live.
    pub fn claim(&self, key: &str, mailbox: RalMailbox) -> bool {
        let mut map = self.map.lock();
        if map.contains_key(key) {
            return false;
        }
        map.insert(key.to_owned(), mailbox);
        true
    }

    /// Deliver a resumption event to a live loop. `false` = nobody home.
    pub fn deliver(&self, key: &str, event: Event) -> bool {
        let map = self.map.lock();
        match map.get(key) {
            Some(mailbox) => mailbox.tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn release(&self, key: &str) {
        self.map.lock().remove(key);
    }

    pub fn is_live(&self, key: &str) -> bool {
        self.map.lock().contains_key(key)
    }

    pub fn live_count(&self) -> usize {
        self.map.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EngineState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared application state handed to the router and every loop.
#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<EngineConfig>,
    pub bus: Arc<EventBus>,
    pub store: Arc<ConversationStore>,
    pub agents: Arc<AgentRegistry>,
    pub llm: Arc<LlmRegistry>,
    pub tools: Arc<ToolRuntime>,
    pub coordinators: Arc<RalCoordinators>,
    pub delegations: Arc<DelegationCoordinator>,
    pub phases: Arc<PhaseMachine>,
    pub cancels: Arc<CancelMap>,
    pub live_rals: Arc<LiveRalMap>,
    /// Disk root for homes and workspaces; `None` = fully ephemeral.
    base_dir: Option<PathBuf>,
}

impl EngineState {
    /// State persisting under `config.home_base_path`.
    pub fn persistent(config: EngineConfig, pool: Arc<dyn RelayPool>) -> Result<Self> {
        let base = config.home_base_path.clone();
        std::fs::create_dir_all(&base).map_err(Error::Io)?;
        let keyring = Arc::new(Keyring::new());
        let agents = Arc::new(AgentRegistry::load_dir(&base.join("agents"), keyring.clone())?);
        let seen = SeenStore::open(&base)?;
        let store = Arc::new(ConversationStore::open(&base)?);
        Self::assemble(config, pool, keyring, agents, seen, store, Some(base))
    }

    /// Fully in-memory state, for tests and ephemeral runs.
    pub fn ephemeral(config: EngineConfig, pool: Arc<dyn RelayPool>) -> Result<Self> {
        let keyring = Arc::new(Keyring::new());
        let agents = Arc::new(AgentRegistry::new(keyring.clone()));
        let seen = SeenStore::in_memory();
        let store = Arc::new(ConversationStore::in_memory());
        Self::assemble(config, pool, keyring, agents, seen, store, None)
    }

    fn assemble(
        config: EngineConfig,
        pool: Arc<dyn RelayPool>,
        keyring: Arc<Keyring>,
        agents: Arc<AgentRegistry>,
        seen: SeenStore,
        store: Arc<ConversationStore>,
        base_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new(
            pool,
            keyring,
            seen,
            config.publish.clone(),
        ));

        let tools = Arc::new(ToolRuntime::new(Duration::from_secs(
            config.limits.tool_deadline_secs,
        )));
        let denied = Arc::new(config.shell.compile_denied()?);
        tools.register(Arc::new(cv_tools::fs::FsRead));
        tools.register(Arc::new(cv_tools::fs::FsWrite));
        tools.register(Arc::new(cv_tools::shell::ShellTool::new(
            denied,
            Duration::from_secs(config.shell.timeout_secs),
        )));
        tools.register(Arc::new(cv_tools::memory::Remember));
        tools.register(Arc::new(cv_tools::memory::Recall));
        tools.register(Arc::new(cv_tools::memory::Learn));
        tools.register(Arc::new(cv_tools::delegate::Delegate));
        tools.register(Arc::new(cv_tools::delegate::Ask));
        tools.register(Arc::new(cv_tools::delegate::DelegatePhase));
        tools.register(Arc::new(cv_tools::phase::SwitchPhase));

        let phases = Arc::new(PhaseMachine::new(store.clone(), agents.clone()));
        let delegations = Arc::new(DelegationCoordinator::new(
            agents.clone(),
            base_dir.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            bus,
            store,
            agents,
            llm: Arc::new(LlmRegistry::new()),
            tools,
            coordinators: Arc::new(RalCoordinators::new()),
            delegations,
            phases,
            cancels: Arc::new(CancelMap::new()),
            live_rals: Arc::new(LiveRalMap::new()),
            base_dir,
        })
    }

    /// Filesystem root. Ephemeral states get a per-process temp root so
    /// homes and workspaces still function.
    pub fn disk_root(&self) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.clone(),
            None => std::env::temp_dir().join(format!("conclave-{}", std::process::id())),
        }
    }

    /// The conversation-scoped working directory, created on demand.
    pub fn working_dir(&self, conversation_id: &str) -> Result<PathBuf> {
        let prefix: String = conversation_id.chars().take(12).collect();
        let dir = self.disk_root().join("workspaces").join(prefix);
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        Ok(dir)
    }

    /// Display name for an event author: agent name when known, else a
    /// shortened pubkey.
    pub fn author_display(&self, pubkey: &str) -> String {
        match self.agents.by_pubkey(pubkey) {
            Some(agent) => agent.definition.name.clone(),
            None => {
                let short: String = pubkey.chars().take(8).collect();
                format!("user {short}")
            }
        }
    }

    /// Publish a periodic agent-alive status event listing the project's
    /// agents, signed by the orchestrator when present.
    pub async fn publish_status(&self) -> Result<()> {
        let Some(orchestrator) = self.agents.orchestrator() else {
            return Ok(());
        };
        let mut tags = vec![Tag::address(&self.config.project_address)];
        let mut lines = Vec::new();
        for slug in self.agents.slugs() {
            if let Some(agent) = self.agents.by_slug(&slug) {
                tags.push(Tag::pubkey(&agent.pubkey));
                lines.push(format!("{slug}: {}", agent.pubkey));
            }
        }
        let publisher = AgentPublisher {
            bus: self.bus.clone(),
            agent: orchestrator,
        };
        publisher
            .publish(EventKind::STATUS, lines.join("\n"), tags)
            .await?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborator implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Publishes events signed by one agent through the bus.
pub struct AgentPublisher {
    pub bus: Arc<EventBus>,
    pub agent: Arc<AgentHandle>,
}

#[async_trait]
impl EventPublisher for AgentPublisher {
    async fn publish(&self, kind: EventKind, content: String, tags: Vec<Tag>) -> Result<String> {
        let event = EventBuilder::new(kind)
            .content(content)
            .tags(tags)
            .sign(self.agent.signer.as_ref());
        self.bus.publish(&event).await?;
        Ok(event.id)
    }
}

/// Resolves delegation recipients against the agent registry. Raw hex
/// pubkeys pass through so humans can be addressed directly.
pub struct RegistryResolver {
    pub agents: Arc<AgentRegistry>,
}

impl RecipientResolver for RegistryResolver {
    fn resolve_pubkey(&self, recipient: &str) -> Option<String> {
        if let Some(agent) = self.agents.by_slug(recipient) {
            return Some(agent.pubkey.clone());
        }
        if let Some(agent) = self.agents.by_name(recipient) {
            return Some(agent.pubkey.clone());
        }
        if self.agents.by_pubkey(recipient).is_some() {
            return Some(recipient.to_owned());
        }
        let is_hex_key =
            recipient.len() == 64 && recipient.chars().all(|c| c.is_ascii_hexdigit());
        is_hex_key.then(|| recipient.to_owned())
    }

    fn is_agent(&self, pubkey: &str) -> bool {
        self.agents.is_agent_pubkey(pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_bus::InMemoryRelayPool;
    use cv_domain::agent::{AgentCategory, AgentDefinition};

    fn state() -> EngineState {
        EngineState::ephemeral(EngineConfig::default(), Arc::new(InMemoryRelayPool::new()))
            .unwrap()
    }

    fn define(slug: &str, category: AgentCategory) -> AgentDefinition {
        AgentDefinition {
            slug: slug.into(),
            name: format!("Agent {slug}"),
            category,
            instructions: String::new(),
            tool_allow: vec![],
            llm_config_name: None,
            phases: Default::default(),
            mcp_servers: vec![],
            max_agent_steps: None,
        }
    }

    #[test]
    fn persistent_state_creates_the_disk_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.home_base_path = dir.path().join("base");

        let state =
            EngineState::persistent(config, Arc::new(InMemoryRelayPool::new())).unwrap();
        assert!(dir.path().join("base/agents").is_dir());
        assert!(dir.path().join("base/conversations").is_dir());
        assert!(dir.path().join("base/delegations").is_dir());

        state.bus.mark_seen("ev-1");
        assert!(dir.path().join("base/processed_events").is_file());
    }

    #[test]
    fn live_ral_map_enforces_single_live_loop() {
        let map = LiveRalMap::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mailbox = RalMailbox {
            tx,
            cancel: CancelToken::new(),
            ral_number: 1,
        };
        assert!(map.claim("conv:alice", mailbox.clone()));
        assert!(!map.claim("conv:alice", mailbox.clone()));
        map.release("conv:alice");
        assert!(map.claim("conv:alice", mailbox));
    }

    #[test]
    fn deliver_reaches_live_mailbox() {
        let map = LiveRalMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        map.claim(
            "conv:alice",
            RalMailbox {
                tx,
                cancel: CancelToken::new(),
                ral_number: 1,
            },
        );

        let event = EventBuilder::new(EventKind::NOTE)
            .content("resume")
            .created_at(1)
            .sign(&cv_bus::HmacSigner::from_name("human"));
        assert!(map.deliver("conv:alice", event.clone()));
        assert_eq!(rx.try_recv().unwrap().id, event.id);
        assert!(!map.deliver("conv:bob", event));
    }

    #[test]
    fn builtin_tools_are_registered() {
        let state = state();
        let names = state.tools.tool_names();
        for expected in [
            "ask",
            "delegate",
            "delegate_phase",
            "fs_read",
            "fs_write",
            "learn",
            "recall",
            "remember",
            "shell",
            "switch_phase",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn resolver_handles_slug_name_pubkey_and_raw_hex() {
        let state = state();
        let handle = state
            .agents
            .register(define("planner", AgentCategory::Orchestrator))
            .unwrap();
        let resolver = RegistryResolver {
            agents: state.agents.clone(),
        };

        assert_eq!(resolver.resolve_pubkey("planner"), Some(handle.pubkey.clone()));
        assert_eq!(
            resolver.resolve_pubkey("Agent planner"),
            Some(handle.pubkey.clone())
        );
        assert_eq!(
            resolver.resolve_pubkey(&handle.pubkey),
            Some(handle.pubkey.clone())
        );

        let human = "a".repeat(64);
        assert_eq!(resolver.resolve_pubkey(&human), Some(human.clone()));
        assert!(!resolver.is_agent(&human));
        assert!(resolver.resolve_pubkey("nobody").is_none());
    }

    #[tokio::test]
    async fn status_event_lists_every_agent() {
        let pool = Arc::new(cv_bus::InMemoryRelayPool::new());
        let state = EngineState::ephemeral(EngineConfig::default(), pool.clone()).unwrap();
        state
            .agents
            .register(define("orch", AgentCategory::Orchestrator))
            .unwrap();
        let worker = state
            .agents
            .register(define("worker", AgentCategory::Worker))
            .unwrap();

        state.publish_status().await.unwrap();

        let status = pool
            .stored()
            .into_iter()
            .find(|e| e.kind == EventKind::STATUS)
            .expect("status event published");
        assert!(status.mentioned_pubkeys().contains(&worker.pubkey.as_str()));
        assert!(status.content.contains("worker"));
        assert_eq!(
            status.tag_value("a"),
            Some(state.config.project_address.as_str())
        );
    }

    #[tokio::test]
    async fn agent_publisher_signs_as_its_agent() {
        let state = state();
        let handle = state
            .agents
            .register(define("scribe", AgentCategory::Worker))
            .unwrap();
        let publisher = AgentPublisher {
            bus: state.bus.clone(),
            agent: handle.clone(),
        };

        let id = publisher
            .publish(EventKind::NOTE, "hello".into(), vec![])
            .await
            .unwrap();
        assert!(!id.is_empty());
    }
}
