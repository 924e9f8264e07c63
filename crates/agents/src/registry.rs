//! Registry of the project's agents.
//!
//! Definitions live in `agents/<slug>.json`, signer material in
//! `agents/<slug>.secret`. A slug's signer and pubkey never change once
//! loaded; agents may be added or removed at runtime by control events,
//! but a re-registration of a known slug keeps its original signer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use cv_bus::signer::{HmacSigner, Keyring};
use cv_domain::agent::{AgentDefinition, ToolPolicy};
use cv_domain::config::EngineConfig;
use cv_domain::error::{Error, Result};
use cv_domain::event::Signer;

/// One registered agent: its definition plus the exclusively-owned signer.
pub struct AgentHandle {
    pub definition: AgentDefinition,
    pub signer: Arc<HmacSigner>,
    pub pubkey: String,
}

impl AgentHandle {
    pub fn slug(&self) -> &str {
        &self.definition.slug
    }

    /// Effective tool policy: allow list from the definition, denies from
    /// the per-category config.
    pub fn tool_policy(&self, config: &EngineConfig) -> ToolPolicy {
        self.definition
            .tool_policy(config.category_denies(self.definition.category.as_str()))
    }
}

pub struct AgentRegistry {
    agents_dir: Option<PathBuf>,
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    keyring: Arc<Keyring>,
}

impl AgentRegistry {
    pub fn new(keyring: Arc<Keyring>) -> Self {
        Self {
            agents_dir: None,
            agents: RwLock::new(HashMap::new()),
            keyring,
        }
    }

    /// Load every agent definition under `agents_dir`. Files that fail to
    /// parse are skipped with a warning; missing secret files are derived
    /// from the slug and written back.
    pub fn load_dir(agents_dir: &Path, keyring: Arc<Keyring>) -> Result<Self> {
        std::fs::create_dir_all(agents_dir).map_err(Error::Io)?;
        let registry = Self {
            agents_dir: Some(agents_dir.to_path_buf()),
            agents: RwLock::new(HashMap::new()),
            keyring,
        };

        let mut entries: Vec<_> = std::fs::read_dir(agents_dir)
            .map_err(Error::Io)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
            .collect();
        entries.sort();

        for path in entries {
            let raw = match std::fs::read_to_string(&path) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable agent file");
                    continue;
                }
            };
            match serde_json::from_str::<AgentDefinition>(&raw) {
                Ok(definition) => {
                    registry.register(definition)?;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid agent definition");
                }
            }
        }

        Ok(registry)
    }

    /// Register an agent. The signer is loaded from the slug's secret
    /// file when present, derived (and persisted) otherwise. Re-registering
    /// a known slug updates the definition but keeps the signer.
    pub fn register(&self, definition: AgentDefinition) -> Result<Arc<AgentHandle>> {
        let slug = definition.slug.clone();
        if slug.is_empty() {
            return Err(Error::Validation("agent slug must not be empty".into()));
        }

        let existing_signer_pubkey = self
            .agents
            .read()
            .get(&slug)
            .map(|existing| (existing.signer.clone(), existing.pubkey.clone()));
        if let Some((signer, pubkey)) = existing_signer_pubkey {
            let handle = Arc::new(AgentHandle {
                definition,
                signer,
                pubkey,
            });
            self.agents.write().insert(slug, handle.clone());
            return Ok(handle);
        }

        let signer = Arc::new(self.load_or_derive_signer(&slug)?);
        let pubkey = Signer::pubkey(signer.as_ref());
        self.keyring.insert(signer.clone());

        let handle = Arc::new(AgentHandle {
            definition,
            signer,
            pubkey: pubkey.clone(),
        });

        tracing::info!(
            slug,
            pubkey = %pubkey,
            tools = ?handle.definition.tool_allow,
            category = handle.definition.category.as_str(),
            "registered agent"
        );
        self.agents.write().insert(slug, handle.clone());
        Ok(handle)
    }

    fn load_or_derive_signer(&self, slug: &str) -> Result<HmacSigner> {
        let Some(dir) = &self.agents_dir else {
            return Ok(HmacSigner::from_name(slug));
        };
        let secret_path = dir.join(format!("{slug}.secret"));
        if secret_path.exists() {
            let raw = std::fs::read_to_string(&secret_path).map_err(Error::Io)?;
            return HmacSigner::from_secret_hex(slug, &raw);
        }
        let signer = HmacSigner::from_name(slug);
        std::fs::write(&secret_path, signer.secret_hex()).map_err(Error::Io)?;
        Ok(signer)
    }

    /// Remove an agent. Its signer stays in the keyring so previously
    /// published events still verify.
    pub fn remove(&self, slug: &str) -> bool {
        self.agents.write().remove(slug).is_some()
    }

    pub fn by_slug(&self, slug: &str) -> Option<Arc<AgentHandle>> {
        self.agents.read().get(slug).cloned()
    }

    pub fn by_pubkey(&self, pubkey: &str) -> Option<Arc<AgentHandle>> {
        self.agents
            .read()
            .values()
            .find(|a| a.pubkey == pubkey)
            .cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<AgentHandle>> {
        self.agents
            .read()
            .values()
            .find(|a| a.definition.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn is_agent_pubkey(&self, pubkey: &str) -> bool {
        self.by_pubkey(pubkey).is_some()
    }

    /// All slugs, sorted.
    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<_> = self.agents.read().keys().cloned().collect();
        slugs.sort();
        slugs
    }

    /// The first orchestrator-category agent, by slug order. Routing
    /// falls back to this when an event addresses nobody.
    pub fn orchestrator(&self) -> Option<Arc<AgentHandle>> {
        let agents = self.agents.read();
        let mut candidates: Vec<_> = agents
            .values()
            .filter(|a| {
                a.definition.category == cv_domain::agent::AgentCategory::Orchestrator
            })
            .collect();
        candidates.sort_by(|a, b| a.slug().cmp(b.slug()));
        candidates.first().map(|a| Arc::clone(a))
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}
