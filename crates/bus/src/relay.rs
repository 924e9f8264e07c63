//! The relay pool abstraction and its in-memory implementation.
//!
//! A relay pool is the transport: publish signed events, subscribe by
//! filter, get an infinite stream back. The in-memory pool is the test
//! double and the default for single-process deployments; it replays
//! stored history on subscribe and then follows live traffic, so delivery
//! is at-least-once (the bus dedupes).

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use cv_domain::error::{Error, Result};
use cv_domain::event::{Event, EventKind};
use cv_domain::stream::BoxStream;

/// Subscription filter. All populated dimensions must match.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub kinds: Option<Vec<EventKind>>,
    pub authors: Option<Vec<String>>,
    /// `p`-tag mentions.
    pub mentions: Option<Vec<String>>,
    pub since: Option<i64>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn mentions(mut self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.mentions = Some(pubkeys.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, unix_seconds: i64) -> Self {
        self.since = Some(unix_seconds);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.author) {
                return false;
            }
        }
        if let Some(mentions) = &self.mentions {
            let tagged = event.mentioned_pubkeys();
            if !mentions.iter().any(|m| tagged.contains(&m.as_str())) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}

/// The transport interface. Implementations decide their own delivery
/// guarantees; the engine only assumes at-least-once on subscriptions.
#[async_trait]
pub trait RelayPool: Send + Sync {
    /// Publish an event. Returns the ids of the relays that acknowledged.
    /// Errors with `Transport` when no relay accepted the event.
    async fn publish(&self, event: &Event) -> Result<Vec<String>>;

    /// Subscribe to events matching `filter`. The stream is infinite;
    /// stored history is replayed first on a best-effort basis.
    async fn subscribe(&self, filter: Filter) -> Result<BoxStream<'static, Event>>;

    /// Stop all subscriptions and release resources.
    async fn close(&self);
}

/// Single-process relay pool backed by a broadcast channel.
pub struct InMemoryRelayPool {
    stored: Mutex<Vec<Event>>,
    live: broadcast::Sender<Event>,
    /// Fail the next N publishes (test hook for retry behaviour).
    fail_next: AtomicU32,
}

impl Default for InMemoryRelayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelayPool {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            stored: Mutex::new(Vec::new()),
            live,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make the next `n` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Snapshot of everything stored, in publish order.
    pub fn stored(&self) -> Vec<Event> {
        self.stored.lock().clone()
    }

    /// Inject an event as if a remote party had published it.
    pub fn inject(&self, event: Event) {
        self.stored.lock().push(event.clone());
        let _ = self.live.send(event);
    }
}

#[async_trait]
impl RelayPool for InMemoryRelayPool {
    async fn publish(&self, event: &Event) -> Result<Vec<String>> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transport("relay unreachable".into()));
        }

        self.stored.lock().push(event.clone());
        // No receivers is fine; history replay covers late subscribers.
        let _ = self.live.send(event.clone());
        Ok(vec!["memory".into()])
    }

    async fn subscribe(&self, filter: Filter) -> Result<BoxStream<'static, Event>> {
        let replay: Vec<Event> = self
            .stored
            .lock()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        let mut live = self.live.subscribe();

        let stream = async_stream::stream! {
            for event in replay {
                yield event;
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if filter.matches(&event) {
                            yield event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscription lagged; events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        // Dropping the sender ends live streams; stored history stays.
    }
}
