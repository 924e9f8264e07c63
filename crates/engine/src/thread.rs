//! Thread reconstruction for prompt composition.
//!
//! Given a target event, rebuild the chain from the conversation root
//! plus the sibling replies a reader would have seen along the way.

use std::collections::HashSet;

use cv_domain::event::Event;
use cv_store::Conversation;

/// Reconstruct the thread ending at `target_id`.
///
/// The parent chain is walked root→target; after each chain node its
/// direct children are interleaved in timestamp order, but only those
/// occurring before the next chain node. The target is always the final
/// element. A direct reply to the root takes the fast path: root plus
/// every root-level reply in timestamp order (target last).
///
/// Cycles in the parent chain are detected with a visited set; the walk
/// truncates rather than looping.
pub fn thread_to(conversation: &Conversation, target_id: &str) -> Vec<Event> {
    let Some(target) = conversation.find(target_id) else {
        return Vec::new();
    };

    // Parent chain, target-first; reversed to root-first below.
    let mut chain: Vec<&Event> = vec![target];
    let mut visited: HashSet<&str> = HashSet::from([target_id]);
    let mut cursor = target;
    while let Some(parent_id) = cursor.parent_id() {
        if !visited.insert(parent_id) {
            tracing::warn!(
                conversation = %conversation.id,
                event = parent_id,
                "cycle in parent chain; truncating thread"
            );
            break;
        }
        match conversation.find(parent_id) {
            Some(parent) => {
                chain.push(parent);
                cursor = parent;
            }
            // Parent not (yet) in history: the chain stops here.
            None => break,
        }
    }
    chain.reverse();

    if chain.len() == 1 {
        return vec![target.clone()];
    }

    let chain_ids: HashSet<&str> = chain.iter().map(|e| e.id.as_str()).collect();

    // Fast path: a direct reply to the root sees every root-level reply.
    if chain.len() == 2 && chain[0].id == conversation.root_event_id {
        let root = chain[0];
        let mut result = vec![root.clone()];
        for event in conversation.children_of(&root.id) {
            if event.id != target_id {
                result.push(event.clone());
            }
        }
        result.push(target.clone());
        return result;
    }

    let mut result: Vec<Event> = Vec::new();
    for (i, node) in chain.iter().enumerate().take(chain.len() - 1) {
        result.push((*node).clone());
        let next = chain[i + 1];
        let next_key = (next.created_at, next.id.as_str());
        for child in conversation.children_of(&node.id) {
            if chain_ids.contains(child.id.as_str()) {
                continue;
            }
            if (child.created_at, child.id.as_str()) < next_key {
                result.push(child.clone());
            }
        }
    }
    result.push(target.clone());
    result
}
