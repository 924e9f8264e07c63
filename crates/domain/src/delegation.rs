//! Delegation records: one agent parking its loop on other agents'
//! (or a human's) replies.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::phase::Phase;

/// What a delegation-class tool asks for. Carried inside a [`StopSignal`].
#[derive(Debug, Clone)]
pub struct DelegationSpec {
    /// The request text published to the recipients.
    pub request: String,
    /// Recipient pubkeys. For an ask this may be empty (any human replies).
    pub recipients: Vec<String>,
    /// Waiting on a human rather than agents.
    pub is_ask: bool,
    /// Delegate into a new phase (the child conversation starts there).
    pub target_phase: Option<Phase>,
    /// Give up after this long. `None` = wait indefinitely.
    pub deadline: Option<Duration>,
}

/// A tool result that parks the calling loop instead of continuing it.
#[derive(Debug, Clone)]
pub struct StopSignal {
    pub delegation: DelegationSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Pending,
    Completed,
    Cancelled,
}

/// Tracked state of one registered delegation.
///
/// Shared between the parent loop and the coordinator; only the
/// coordinator mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub id: String,
    pub parent_conversation_id: String,
    /// Number of the parked parent loop within its conversation.
    pub parent_ral: u64,
    /// Conversation the delegated work happens in (the request event's
    /// conversation; a phase delegation roots a new one).
    pub child_conversation_id: String,
    /// Id of the published delegation request event.
    pub request_event_id: String,
    pub recipients: Vec<String>,
    /// Reply per recipient; `None` while pending. Ordered by recipient so
    /// serialization is stable.
    pub replies: BTreeMap<String, Option<Event>>,
    pub phase_at_start: Phase,
    pub is_ask: bool,
    pub deadline_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: DelegationStatus,
}

impl DelegationRecord {
    /// All recipients accounted for?
    pub fn is_complete(&self) -> bool {
        if self.is_ask {
            // Any single human reply completes an ask.
            self.replies.values().any(Option::is_some)
        } else {
            !self.replies.is_empty() && self.replies.values().all(Option::is_some)
        }
    }
}

/// One aggregated reply, in the order it arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationReply {
    pub recipient: String,
    pub content: String,
    pub event_id: String,
}

/// Payload delivered to a parked loop when its delegation resolves.
#[derive(Debug, Clone)]
pub struct DelegationReplies {
    pub delegation_id: String,
    /// Replies in ascending arrival-time order.
    pub replies: Vec<DelegationReply>,
    /// The deadline fired before all recipients replied.
    pub timed_out: bool,
    /// The parent still has other delegations outstanding.
    pub others_pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, EventKind, Signer};

    struct FakeSigner(&'static str);

    impl Signer for FakeSigner {
        fn pubkey(&self) -> String {
            self.0.into()
        }
        fn sign(&self, event_id: &str) -> String {
            format!("sig:{event_id}")
        }
    }

    fn record(recipients: &[&str], is_ask: bool) -> DelegationRecord {
        DelegationRecord {
            id: "d1".into(),
            parent_conversation_id: "conv".into(),
            parent_ral: 1,
            child_conversation_id: "conv".into(),
            request_event_id: "req".into(),
            recipients: recipients.iter().map(|s| s.to_string()).collect(),
            replies: recipients.iter().map(|s| (s.to_string(), None)).collect(),
            phase_at_start: Phase::Chat,
            is_ask,
            deadline_at: None,
            status: DelegationStatus::Pending,
        }
    }

    fn reply_event(author: &'static str) -> Event {
        EventBuilder::new(EventKind::NOTE)
            .content("done")
            .created_at(1)
            .sign(&FakeSigner(author))
    }

    #[test]
    fn incomplete_until_all_recipients_reply() {
        let mut rec = record(&["pk-b", "pk-c"], false);
        assert!(!rec.is_complete());

        rec.replies.insert("pk-b".into(), Some(reply_event("pk-b")));
        assert!(!rec.is_complete());

        rec.replies.insert("pk-c".into(), Some(reply_event("pk-c")));
        assert!(rec.is_complete());
    }

    #[test]
    fn ask_completes_on_first_reply() {
        let mut rec = record(&["pk-human"], true);
        assert!(!rec.is_complete());
        rec.replies
            .insert("pk-human".into(), Some(reply_event("pk-human")));
        assert!(rec.is_complete());
    }
}
