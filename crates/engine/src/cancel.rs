//! Cancellation registry for reasoning loops, with group fan-out.
//!
//! Each live RAL registers a token under its `(conversation, agent)` key.
//! Cancelling a key also cancels all children registered in its group,
//! used when a parent loop with in-flight delegations is stopped.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use cv_domain::cancel::CancelToken;

/// Key for a loop: `<conversation_id>:<agent_slug>`.
pub fn ral_key(conversation_id: &str, agent_slug: &str) -> String {
    format!("{conversation_id}:{agent_slug}")
}

/// Tracks active cancellation tokens per RAL key, with group support for
/// cascading parent→child cancellation.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    /// group key (parent RAL) → child RAL keys.
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new cancel token for a key.
    pub fn register(&self, key: &str) -> CancelToken {
        let token = CancelToken::new();
        self.insert(key, token.clone());
        token
    }

    /// Register an existing token (when the caller created it first).
    pub fn insert(&self, key: &str, token: CancelToken) {
        self.tokens.lock().insert(key.to_owned(), token);
    }

    /// Cancel a running loop. Also cancels all children in the key's
    /// group. Returns true if a token was found.
    pub fn cancel(&self, key: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(key) {
            token.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.lock().get(key) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(token) = tokens.get(child) {
                    token.cancel();
                }
            }
        }

        found
    }

    /// Remove the token for a key (called when a loop terminates).
    pub fn remove(&self, key: &str) {
        self.tokens.lock().remove(key);
        self.groups.lock().remove(key);
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tokens.lock().contains_key(key)
    }

    /// Register a child in a parent's cancel group.
    pub fn add_to_group(&self, parent: &str, child: &str) {
        self.groups
            .lock()
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
    }

    pub fn remove_from_group(&self, parent: &str, child: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                groups.remove(parent);
            }
        }
    }

    /// Cancel everything (shutdown path).
    pub fn cancel_all(&self) {
        for token in self.tokens.lock().values() {
            token.cancel();
        }
    }
}
