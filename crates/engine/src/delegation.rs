//! The delegation coordinator.
//!
//! Parents park their loops here after publishing a delegation request;
//! the coordinator watches routed events for qualifying replies,
//! aggregates them per recipient, and wakes the parent exactly once:
//! when everyone has replied, or the deadline fires. Cancelled parents
//! abandon their delegations; late replies are ignored on arrival.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use cv_agents::AgentRegistry;
use cv_domain::delegation::{
    DelegationRecord, DelegationReplies, DelegationReply, DelegationStatus,
};
use cv_domain::event::Event;

struct Pending {
    record: DelegationRecord,
    waker: Option<oneshot::Sender<DelegationReplies>>,
}

pub struct DelegationCoordinator {
    agents: Arc<AgentRegistry>,
    pending: Mutex<HashMap<String, Pending>>,
    /// Persistence root; records are written as `delegations/<id>.json`.
    base_dir: Option<PathBuf>,
}

impl DelegationCoordinator {
    pub fn new(agents: Arc<AgentRegistry>, base_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &base_dir {
            if let Err(e) = std::fs::create_dir_all(dir.join("delegations")) {
                tracing::warn!(error = %e, "failed to create delegations dir");
            }
        }
        Self {
            agents,
            pending: Mutex::new(HashMap::new()),
            base_dir,
        }
    }

    /// Register a delegation whose request event is already published.
    /// Returns the receiver the parked parent selects on. The deadline,
    /// when set on the record, is armed here.
    pub fn register(
        self: &Arc<Self>,
        record: DelegationRecord,
    ) -> oneshot::Receiver<DelegationReplies> {
        let (tx, rx) = oneshot::channel();
        let id = record.id.clone();
        let deadline_at = record.deadline_at;

        self.persist(&record);
        self.pending.lock().insert(
            id.clone(),
            Pending {
                record,
                waker: Some(tx),
            },
        );

        if let Some(at) = deadline_at {
            let coordinator = Arc::clone(self);
            let delegation_id = id.clone();
            tokio::spawn(async move {
                let wait = (at - chrono::Utc::now())
                    .to_std()
                    .unwrap_or_default();
                tokio::time::sleep(wait).await;
                coordinator.expire(&delegation_id);
            });
        }

        tracing::debug!(delegation = %id, "delegation registered");
        rx
    }

    /// Inspect a routed event. Returns `true` when the event was a reply
    /// to a known delegation (including abandoned ones, whose replies are
    /// dropped); consumed events must not trigger fresh agent loops.
    pub fn on_event(&self, event: &Event) -> bool {
        let Some(delegation_parent) = event.delegation_parent() else {
            return false;
        };
        let Some(parent_event) = event.parent_id() else {
            return false;
        };

        let completed = {
            let mut pending = self.pending.lock();
            let matching_id = pending
                .iter()
                .find(|(_, p)| {
                    p.record.parent_conversation_id == delegation_parent
                        && p.record.request_event_id == parent_event
                        && qualifies(&self.agents, &p.record, &event.author)
                })
                .map(|(id, _)| id.clone());

            let Some(id) = matching_id else {
                return false;
            };

            {
                let p = pending.get_mut(&id).expect("record just found");
                if p.record.status != DelegationStatus::Pending {
                    tracing::debug!(
                        delegation = %id,
                        event = %event.id,
                        "dropping reply to abandoned delegation"
                    );
                    return true;
                }

                let slot = p.record.replies.entry(event.author.clone()).or_default();
                if slot.is_some() {
                    // One reply per recipient; later ones are ignored.
                    return true;
                }
                *slot = Some(event.clone());

                if !p.record.is_complete() {
                    return true;
                }
                p.record.status = DelegationStatus::Completed;
            }

            let (parent_conv, parent_ral) = {
                let p = &pending[&id];
                (p.record.parent_conversation_id.clone(), p.record.parent_ral)
            };
            let others_pending = pending.values().any(|q| {
                q.record.id != id
                    && q.record.parent_conversation_id == parent_conv
                    && q.record.parent_ral == parent_ral
                    && q.record.status == DelegationStatus::Pending
            });

            let p = pending.get_mut(&id).expect("record still present");
            p.waker
                .take()
                .map(|waker| (build_replies(&p.record, others_pending), waker))
        };

        if let Some((replies, waker)) = completed {
            self.persist_by_id(&replies.delegation_id);
            if waker.send(replies).is_err() {
                tracing::debug!("parent loop gone before delegation completion");
            }
        }
        true
    }

    /// Deadline fired: wake the parent with whatever arrived.
    fn expire(&self, delegation_id: &str) {
        let completed = {
            let mut pending = self.pending.lock();
            let Some(p) = pending.get_mut(delegation_id) else {
                return;
            };
            if p.record.status != DelegationStatus::Pending {
                return;
            }
            p.record.status = DelegationStatus::Completed;
            let others = pending_siblings_excluding(
                &pending,
                delegation_id,
            );
            let p = pending.get_mut(delegation_id).expect("record still present");
            p.waker.take().map(|waker| {
                let mut replies = build_replies(&p.record, others);
                replies.timed_out = true;
                (replies, waker)
            })
        };

        if let Some((replies, waker)) = completed {
            tracing::info!(delegation = delegation_id, "delegation deadline fired");
            self.persist_by_id(delegation_id);
            let _ = waker.send(replies);
        }
    }

    /// Abandon every outstanding delegation of a cancelled parent loop.
    pub fn cancel_for(&self, parent_conversation_id: &str, parent_ral: u64) {
        let mut pending = self.pending.lock();
        for p in pending.values_mut() {
            if p.record.parent_conversation_id == parent_conversation_id
                && p.record.parent_ral == parent_ral
                && p.record.status == DelegationStatus::Pending
            {
                p.record.status = DelegationStatus::Cancelled;
                p.waker = None;
                tracing::debug!(delegation = %p.record.id, "delegation abandoned");
            }
        }
    }

    /// Whether a parent loop still has pending delegations.
    pub fn has_pending(&self, parent_conversation_id: &str, parent_ral: u64) -> bool {
        self.pending.lock().values().any(|p| {
            p.record.parent_conversation_id == parent_conversation_id
                && p.record.parent_ral == parent_ral
                && p.record.status == DelegationStatus::Pending
        })
    }

    pub fn record(&self, delegation_id: &str) -> Option<DelegationRecord> {
        self.pending
            .lock()
            .get(delegation_id)
            .map(|p| p.record.clone())
    }

    fn persist(&self, record: &DelegationRecord) {
        let Some(dir) = &self.base_dir else {
            return;
        };
        let path = dir.join("delegations").join(format!("{}.json", record.id));
        match serde_json::to_string_pretty(record) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(error = %e, "failed to persist delegation record");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize delegation record"),
        }
    }

    fn persist_by_id(&self, delegation_id: &str) {
        if let Some(record) = self.record(delegation_id) {
            self.persist(&record);
        }
    }
}

fn qualifies(agents: &AgentRegistry, record: &DelegationRecord, author: &str) -> bool {
    if record.is_ask {
        // Any non-agent pubkey counts as the human.
        !agents.is_agent_pubkey(author)
    } else {
        record.recipients.iter().any(|r| r == author)
    }
}

fn pending_siblings_excluding(pending: &HashMap<String, Pending>, delegation_id: &str) -> bool {
    let Some(this) = pending.get(delegation_id) else {
        return false;
    };
    pending.values().any(|p| {
        p.record.id != delegation_id
            && p.record.parent_conversation_id == this.record.parent_conversation_id
            && p.record.parent_ral == this.record.parent_ral
            && p.record.status == DelegationStatus::Pending
    })
}

fn build_replies(record: &DelegationRecord, others_pending: bool) -> DelegationReplies {
    let mut events: Vec<(&String, &Event)> = record
        .replies
        .iter()
        .filter_map(|(recipient, event)| event.as_ref().map(|e| (recipient, e)))
        .collect();
    // Ascending time order, ties by id.
    events.sort_by(|(_, a), (_, b)| {
        (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str()))
    });

    DelegationReplies {
        delegation_id: record.id.clone(),
        replies: events
            .into_iter()
            .map(|(recipient, event)| DelegationReply {
                recipient: recipient.clone(),
                content: event.content.clone(),
                event_id: event.id.clone(),
            })
            .collect(),
        timed_out: false,
        others_pending,
    }
}
