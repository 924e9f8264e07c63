//! The conversation store.
//!
//! All mutations are serialized per conversation (one writer at a time);
//! reads observe a consistent snapshot. Persistence is one directory per
//! conversation under `conversations/<root_event_id>/`: an append-only
//! `history.jsonl`, a `phase_log.jsonl`, a `meta.json` with the title, and
//! a `kv.json` per write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use cv_domain::error::{Error, Result};
use cv_domain::event::Event;
use cv_domain::phase::{Phase, PhaseTransition};

use crate::conversation::Conversation;

struct ConversationCell {
    inner: RwLock<Conversation>,
}

pub struct ConversationStore {
    base_dir: Option<PathBuf>,
    conversations: RwLock<HashMap<String, Arc<ConversationCell>>>,
}

impl ConversationStore {
    /// Store persisting under `base_dir/conversations/`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir.join("conversations")).map_err(Error::Io)?;
        Ok(Self {
            base_dir: Some(base_dir.to_path_buf()),
            conversations: RwLock::new(HashMap::new()),
        })
    }

    /// Volatile store for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            base_dir: None,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    fn conv_dir(&self, conv_id: &str) -> Option<PathBuf> {
        self.base_dir
            .as_ref()
            .map(|b| b.join("conversations").join(conv_id))
    }

    fn cell(&self, conv_id: &str) -> Option<Arc<ConversationCell>> {
        self.conversations.read().get(conv_id).cloned()
    }

    /// Load a conversation (from memory, then disk) or create it fresh.
    pub fn load_or_create(&self, root_event_id: &str) -> Result<()> {
        if self.cell(root_event_id).is_some() {
            return Ok(());
        }

        let conversation = match self.load_from_disk(root_event_id)? {
            Some(c) => c,
            None => Conversation::new(root_event_id),
        };

        let mut map = self.conversations.write();
        map.entry(root_event_id.to_owned()).or_insert_with(|| {
            Arc::new(ConversationCell {
                inner: RwLock::new(conversation),
            })
        });
        Ok(())
    }

    pub fn exists(&self, conv_id: &str) -> bool {
        self.conversations.read().contains_key(conv_id)
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.conversations.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Append an event to a conversation's history. Idempotent on the
    /// event id; returns `false` on duplicates.
    pub fn append_event(&self, conv_id: &str, event: &Event) -> Result<bool> {
        let cell = self
            .cell(conv_id)
            .ok_or_else(|| Error::Validation(format!("unknown conversation {conv_id}")))?;

        let inserted = cell.inner.write().insert_event(event.clone());
        if inserted {
            self.append_jsonl(conv_id, "history.jsonl", event)?;
        }
        Ok(inserted)
    }

    /// Record a phase transition. Policy checks happen in the caller;
    /// this only serializes and persists the change.
    pub fn set_phase(
        &self,
        conv_id: &str,
        to: Phase,
        author_pubkey: &str,
        message: Option<String>,
    ) -> Result<PhaseTransition> {
        let cell = self
            .cell(conv_id)
            .ok_or_else(|| Error::Validation(format!("unknown conversation {conv_id}")))?;

        let transition = {
            let mut conv = cell.inner.write();
            let transition = PhaseTransition {
                from: conv.phase,
                to,
                author: author_pubkey.to_owned(),
                at: chrono::Utc::now(),
                message,
            };
            conv.push_phase(transition.clone());
            transition
        };
        self.append_jsonl(conv_id, "phase_log.jsonl", &transition)?;
        Ok(transition)
    }

    /// Last-writer-wins title update. Idempotent.
    pub fn set_title(&self, conv_id: &str, title: &str) -> Result<()> {
        let cell = self
            .cell(conv_id)
            .ok_or_else(|| Error::Validation(format!("unknown conversation {conv_id}")))?;

        {
            let mut conv = cell.inner.write();
            if conv.title.as_deref() == Some(title) {
                return Ok(());
            }
            conv.title = Some(title.to_owned());
        }
        if let Some(dir) = self.conv_dir(conv_id) {
            std::fs::create_dir_all(&dir).map_err(Error::Io)?;
            let meta = serde_json::json!({ "title": title });
            std::fs::write(dir.join("meta.json"), meta.to_string()).map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Per-agent scratch read. Reads are unrestricted.
    pub fn kv_get(&self, conv_id: &str, agent_slug: &str, key: &str) -> Option<serde_json::Value> {
        let cell = self.cell(conv_id)?;
        let conv = cell.inner.read();
        conv.agent_kv.get(agent_slug)?.get(key).cloned()
    }

    /// All keys in an agent's scratch space, sorted.
    pub fn kv_keys(&self, conv_id: &str, agent_slug: &str) -> Vec<String> {
        let Some(cell) = self.cell(conv_id) else {
            return Vec::new();
        };
        let conv = cell.inner.read();
        let mut keys: Vec<_> = conv
            .agent_kv
            .get(agent_slug)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Per-agent scratch write. Single-writer: only the owning agent's
    /// loop may write its namespace.
    pub fn kv_set(
        &self,
        conv_id: &str,
        owner_slug: &str,
        writer_slug: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        if owner_slug != writer_slug {
            return Err(Error::Validation(format!(
                "agent '{writer_slug}' may not write '{owner_slug}' state"
            )));
        }
        let cell = self
            .cell(conv_id)
            .ok_or_else(|| Error::Validation(format!("unknown conversation {conv_id}")))?;

        let kv_snapshot = {
            let mut conv = cell.inner.write();
            conv.agent_kv
                .entry(owner_slug.to_owned())
                .or_default()
                .insert(key.to_owned(), value);
            conv.agent_kv.clone()
        };

        if let Some(dir) = self.conv_dir(conv_id) {
            std::fs::create_dir_all(&dir).map_err(Error::Io)?;
            let raw = serde_json::to_string_pretty(&kv_snapshot)?;
            std::fs::write(dir.join("kv.json"), raw).map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Consistent snapshot of a conversation.
    pub fn snapshot(&self, conv_id: &str) -> Option<Conversation> {
        self.cell(conv_id).map(|c| c.inner.read().clone())
    }

    /// Run a closure against a consistent read view without cloning.
    pub fn with_conversation<R>(
        &self,
        conv_id: &str,
        f: impl FnOnce(&Conversation) -> R,
    ) -> Option<R> {
        self.cell(conv_id).map(|c| f(&c.inner.read()))
    }

    /// Which conversation contains this event id, if any.
    pub fn conversation_containing(&self, event_id: &str) -> Option<String> {
        let map = self.conversations.read();
        for (id, cell) in map.iter() {
            if cell.inner.read().contains(event_id) {
                return Some(id.clone());
            }
        }
        None
    }

    // ── Persistence helpers ──────────────────────────────────────────

    fn append_jsonl<T: serde::Serialize>(
        &self,
        conv_id: &str,
        file: &str,
        record: &T,
    ) -> Result<()> {
        let Some(dir) = self.conv_dir(conv_id) else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        let json = serde_json::to_string(record)?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file))
            .map_err(Error::Io)?;
        writeln!(file, "{json}").map_err(Error::Io)?;
        Ok(())
    }

    fn load_from_disk(&self, conv_id: &str) -> Result<Option<Conversation>> {
        let Some(dir) = self.conv_dir(conv_id) else {
            return Ok(None);
        };
        if !dir.exists() {
            return Ok(None);
        }

        let mut conversation = Conversation::new(conv_id);

        let history_path = dir.join("history.jsonl");
        if history_path.exists() {
            let raw = std::fs::read_to_string(&history_path).map_err(Error::Io)?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => {
                        conversation.insert_event(event);
                    }
                    Err(e) => {
                        tracing::warn!(conv_id, error = %e, "skipping corrupt history line");
                    }
                }
            }
        }

        let phase_path = dir.join("phase_log.jsonl");
        if phase_path.exists() {
            let raw = std::fs::read_to_string(&phase_path).map_err(Error::Io)?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<PhaseTransition>(line) {
                    Ok(t) => conversation.push_phase(t),
                    Err(e) => {
                        tracing::warn!(conv_id, error = %e, "skipping corrupt phase line");
                    }
                }
            }
        }

        let meta_path = dir.join("meta.json");
        if meta_path.exists() {
            let raw = std::fs::read_to_string(&meta_path).map_err(Error::Io)?;
            if let Ok(meta) = serde_json::from_str::<serde_json::Value>(&raw) {
                conversation.title = meta
                    .get("title")
                    .and_then(|t| t.as_str())
                    .map(str::to_owned);
            }
        }

        let kv_path = dir.join("kv.json");
        if kv_path.exists() {
            let raw = std::fs::read_to_string(&kv_path).map_err(Error::Io)?;
            if let Ok(kv) = serde_json::from_str(&raw) {
                conversation.agent_kv = kv;
            }
        }

        Ok(Some(conversation))
    }
}
