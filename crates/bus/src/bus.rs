//! The deduplicating event bus.
//!
//! Wraps a [`RelayPool`] with the three guarantees the engine relies on:
//! publishes retry transient transport failures with capped exponential
//! backoff, received events that fail verification are dropped (with a
//! telemetry count, never an error to the caller), and a durable seen
//! marker survives restarts so replayed events are not routed twice.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;

use cv_domain::config::PublishConfig;
use cv_domain::error::{Error, Result};
use cv_domain::event::Event;
use cv_domain::stream::BoxStream;

use crate::relay::{Filter, RelayPool};
use crate::signer::Keyring;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SeenStore — durable event-id dedup set
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable set of event ids that have already been routed.
///
/// Backed by an append-only line file so a crash between mark and flush
/// loses at most the tail (replays are idempotent downstream anyway).
pub struct SeenStore {
    path: Option<PathBuf>,
    seen: RwLock<HashSet<String>>,
}

impl SeenStore {
    /// Open the store at `dir/processed_events`, loading prior state.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        let path = dir.join("processed_events");
        let seen = if path.exists() {
            std::fs::read_to_string(&path)
                .map_err(Error::Io)?
                .lines()
                .map(str::to_owned)
                .collect()
        } else {
            HashSet::new()
        };
        Ok(Self {
            path: Some(path),
            seen: RwLock::new(seen),
        })
    }

    /// Volatile store for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            seen: RwLock::new(HashSet::new()),
        }
    }

    pub fn has_seen(&self, event_id: &str) -> bool {
        self.seen.read().contains(event_id)
    }

    /// Mark an id as routed. Returns `false` when it was already marked.
    pub fn mark_seen(&self, event_id: &str) -> bool {
        let inserted = self.seen.write().insert(event_id.to_owned());
        if inserted {
            if let Some(path) = &self.path {
                use std::io::Write;
                let appended = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut f| writeln!(f, "{event_id}"));
                if let Err(e) = appended {
                    tracing::warn!(error = %e, "failed to persist seen marker");
                }
            }
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventBus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventBus {
    pool: Arc<dyn RelayPool>,
    keyring: Arc<Keyring>,
    seen: SeenStore,
    publish_cfg: PublishConfig,
    /// Telemetry: events dropped for failed verification.
    dropped_signatures: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(
        pool: Arc<dyn RelayPool>,
        keyring: Arc<Keyring>,
        seen: SeenStore,
        publish_cfg: PublishConfig,
    ) -> Self {
        Self {
            pool,
            keyring,
            seen,
            publish_cfg,
            dropped_signatures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event, retrying transient transport failures.
    ///
    /// Returns the acknowledging relay ids. Errors with `Transport` only
    /// after the retry budget is exhausted.
    pub async fn publish(&self, event: &Event) -> Result<Vec<String>> {
        let mut backoff = Duration::from_millis(self.publish_cfg.backoff_ms);
        let cap = backoff * 8;
        let mut last_err = None;

        for attempt in 0..=self.publish_cfg.max_retries {
            match self.pool.publish(event).await {
                Ok(acked) => return Ok(acked),
                Err(e @ Error::Transport(_)) => {
                    tracing::warn!(
                        attempt,
                        event_id = %event.id,
                        error = %e,
                        "publish failed; backing off"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(cap);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Transport("publish failed".into())))
    }

    /// Subscribe to verified events matching `filter`.
    ///
    /// Events that fail verification are dropped silently (counted, never
    /// surfaced). The stream is infinite; reconnects happen upstream.
    pub async fn subscribe(&self, filter: Filter) -> Result<BoxStream<'static, Event>> {
        let upstream = self.pool.subscribe(filter).await?;
        let keyring = self.keyring.clone();
        let dropped = self.dropped_signatures.clone();

        let stream = async_stream::stream! {
            futures_util::pin_mut!(upstream);
            while let Some(event) = upstream.next().await {
                match keyring.verify(&event) {
                    Ok(()) => yield event,
                    Err(e) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(event_id = %event.id, error = %e, "dropped unverified event");
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    pub fn has_seen(&self, event_id: &str) -> bool {
        self.seen.has_seen(event_id)
    }

    /// Durably mark an event id as routed. Returns `false` on duplicates.
    pub fn mark_seen(&self, event_id: &str) -> bool {
        self.seen.mark_seen(event_id)
    }

    pub fn dropped_signature_count(&self) -> u64 {
        self.dropped_signatures.load(Ordering::Relaxed)
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// Stop subscriptions and release the transport.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
