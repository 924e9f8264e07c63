//! Signed, immutable events, the unit of everything on the wire.
//!
//! An event is content-addressed: its `id` is the SHA-256 of a canonical
//! serialization of `[author, created_at, kind, tags, content]`. Events are
//! never mutated after signing; a deletion is just another event that
//! references the target.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Integer event kind. The integers are opaque labels owned by the
/// transport layer; the engine only relies on the semantics below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKind(pub u16);

impl EventKind {
    /// Free-form content published by an agent or human.
    pub const NOTE: EventKind = EventKind(1);
    /// Title / summary / phase-log metadata.
    pub const METADATA: EventKind = EventKind(2);
    /// Learned-knowledge record persisted by tools.
    pub const LESSON: EventKind = EventKind(3);
    /// Tool-execution telemetry.
    pub const TOOL_STATUS: EventKind = EventKind(4);
    /// Addresses the agent set of a project.
    pub const PROJECT_DEFINITION: EventKind = EventKind(5);
    /// Addresses a single agent's parameters.
    pub const AGENT_DEFINITION: EventKind = EventKind(6);
    /// Periodic agent-alive signal.
    pub const STATUS: EventKind = EventKind(7);
    /// Partial streamed content from a live reasoning loop. Telemetry:
    /// never enters conversation history.
    pub const STREAM_CHUNK: EventKind = EventKind(8);

    /// Kinds that carry telemetry rather than conversation content.
    pub fn is_telemetry(&self) -> bool {
        matches!(
            *self,
            EventKind::TOOL_STATUS | EventKind::STATUS | EventKind::STREAM_CHUNK
        )
    }
}

impl Default for EventKind {
    fn default() -> Self {
        EventKind::NOTE
    }
}

/// An ordered sequence of strings; the first element is the tag name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    pub fn value(&self) -> &str {
        self.0.get(1).map(String::as_str).unwrap_or("")
    }

    /// Optional marker slot on `e` tags (`root` / `reply` / `mention`).
    pub fn marker(&self) -> Option<&str> {
        self.0.get(3).map(String::as_str)
    }

    // ── Constructors for the tag vocabulary the engine uses ─────────

    pub fn event(id: impl Into<String>) -> Self {
        Tag(vec!["e".into(), id.into()])
    }

    pub fn event_marked(id: impl Into<String>, marker: &str) -> Self {
        Tag(vec!["e".into(), id.into(), String::new(), marker.into()])
    }

    pub fn pubkey(pk: impl Into<String>) -> Self {
        Tag(vec!["p".into(), pk.into()])
    }

    pub fn address(addr: impl Into<String>) -> Self {
        Tag(vec!["a".into(), addr.into()])
    }

    pub fn conversation(root_id: impl Into<String>) -> Self {
        Tag(vec!["E".into(), root_id.into()])
    }

    pub fn phase(name: impl Into<String>) -> Self {
        Tag(vec!["phase".into(), name.into()])
    }

    pub fn delegation(parent_conversation: impl Into<String>) -> Self {
        Tag(vec!["delegation".into(), parent_conversation.into()])
    }

    pub fn title(title: impl Into<String>) -> Self {
        Tag(vec!["title".into(), title.into()])
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Tag(vec!["tool".into(), name.into()])
    }

    pub fn tool_status(status: impl Into<String>) -> Self {
        Tag(vec!["tool-status".into(), status.into()])
    }

    pub fn tool_duration(millis: u64) -> Self {
        Tag(vec!["tool-duration".into(), millis.to_string()])
    }

    pub fn execution_time(millis: u64) -> Self {
        Tag(vec!["execution-time".into(), millis.to_string()])
    }

    pub fn ask() -> Self {
        Tag(vec!["ask".into(), String::new()])
    }
}

/// The opaque signing identity. Implementations live outside this crate;
/// the engine only ever sees the public identifier and the signature.
pub trait Signer: Send + Sync {
    /// The public identifier events are attributed to.
    fn pubkey(&self) -> String;
    /// Sign an event id, producing an opaque signature string.
    fn sign(&self, event_id: &str) -> String;
}

/// An immutable, signed record carrying content and tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub author: String,
    pub kind: EventKind,
    pub created_at: i64,
    pub content: String,
    pub tags: Vec<Tag>,
    pub sig: String,
}

impl Event {
    /// Canonical id: SHA-256 over the JSON array
    /// `[author, created_at, kind, tags, content]`.
    pub fn compute_id(
        author: &str,
        created_at: i64,
        kind: EventKind,
        tags: &[Tag],
        content: &str,
    ) -> String {
        let preimage = serde_json::json!([author, created_at, kind.0, tags, content]);
        let mut hasher = Sha256::new();
        hasher.update(preimage.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored id matches the content-addressed hash.
    pub fn id_is_valid(&self) -> bool {
        self.id == Self::compute_id(&self.author, self.created_at, self.kind, &self.tags, &self.content)
    }

    fn e_tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter().filter(|t| t.name() == "e")
    }

    /// The event this one replies to.
    ///
    /// Prefers the `e` tag marked `reply`; otherwise the last unmarked or
    /// `root`-marked `e` tag (a direct reply to the root carries only the
    /// root reference).
    pub fn parent_id(&self) -> Option<&str> {
        if let Some(t) = self.e_tags().find(|t| t.marker() == Some("reply")) {
            return Some(t.value());
        }
        self.e_tags()
            .filter(|t| t.marker() != Some("mention"))
            .last()
            .map(Tag::value)
    }

    /// The `e` tag explicitly marked `root`, when present.
    pub fn root_ref(&self) -> Option<&str> {
        self.e_tags()
            .find(|t| t.marker() == Some("root"))
            .map(Tag::value)
    }

    /// The earliest `E`/`conversation` tag value, when present.
    pub fn conversation_ref(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == "E" || t.name() == "conversation")
            .map(Tag::value)
    }

    /// All `p`-tagged pubkeys, in tag order.
    pub fn mentioned_pubkeys(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.name() == "p")
            .map(Tag::value)
            .collect()
    }

    /// The `phase` tag, lowercased for comparison.
    pub fn phase_tag(&self) -> Option<String> {
        self.tag_value("phase").map(|v| v.to_ascii_lowercase())
    }

    /// The parent conversation id of a delegation request.
    pub fn delegation_parent(&self) -> Option<&str> {
        self.tag_value("delegation")
    }

    pub fn is_delegation_request(&self) -> bool {
        self.has_tag("delegation")
    }

    pub fn is_ask(&self) -> bool {
        self.has_tag("ask") || self.has_tag("question")
    }

    /// First value of a tag by name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.name() == name).map(Tag::value)
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name() == name)
    }
}

/// Builder for unsigned event drafts. `sign` seals the draft: it computes
/// the content-addressed id and attaches the author and signature.
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    kind: EventKind,
    content: String,
    tags: Vec<Tag>,
    created_at: Option<i64>,
}

impl EventBuilder {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Pin the timestamp. When unset, `sign` stamps the current time.
    pub fn created_at(mut self, unix_seconds: i64) -> Self {
        self.created_at = Some(unix_seconds);
        self
    }

    pub fn sign(self, signer: &dyn Signer) -> Event {
        let author = signer.pubkey();
        let created_at = self
            .created_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let id = Event::compute_id(&author, created_at, self.kind, &self.tags, &self.content);
        let sig = signer.sign(&id);
        Event {
            id,
            author,
            kind: self.kind,
            created_at,
            content: self.content,
            tags: self.tags,
            sig,
        }
    }
}
