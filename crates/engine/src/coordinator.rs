//! Per-conversation registry of concurrent reasoning loops.
//!
//! Assigns monotonic RAL numbers, tracks status and action history for
//! sibling context, and hands out advisory FIFO leases for shared
//! resources. Leases are reentrant for the holder and released on drop
//! and on loop termination.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use cv_domain::phase::Phase;

/// Lifecycle states of one reasoning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RalStatus {
    Running,
    AwaitingDelegation,
    Completed,
    Cancelled,
    Errored,
}

impl RalStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, RalStatus::Running | RalStatus::AwaitingDelegation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RalStatus::Running => "running",
            RalStatus::AwaitingDelegation => "awaiting-delegation",
            RalStatus::Completed => "completed",
            RalStatus::Cancelled => "cancelled",
            RalStatus::Errored => "errored",
        }
    }
}

/// One recorded tool invocation, previews only.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub tool: String,
    pub input_preview: String,
    pub output_preview: String,
    pub is_error: bool,
}

/// Registry view of one loop.
#[derive(Debug, Clone)]
pub struct RalInfo {
    pub ral_number: u64,
    pub agent_slug: String,
    pub phase: Phase,
    pub status: RalStatus,
    pub triggering_event_id: String,
    pub actions: Vec<ActionRecord>,
}

struct LeaseState {
    holder: Option<u64>,
    depth: u32,
    queue: VecDeque<(u64, oneshot::Sender<()>)>,
}

/// The per-conversation coordinator.
pub struct ConcurrentRalCoordinator {
    next_number: AtomicU64,
    rals: Mutex<HashMap<u64, RalInfo>>,
    leases: Mutex<HashMap<String, LeaseState>>,
}

impl Default for ConcurrentRalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentRalCoordinator {
    pub fn new() -> Self {
        Self {
            next_number: AtomicU64::new(1),
            rals: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new loop; returns its monotonic number.
    pub fn register(&self, agent_slug: &str, triggering_event_id: &str, phase: Phase) -> u64 {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        self.rals.lock().insert(
            number,
            RalInfo {
                ral_number: number,
                agent_slug: agent_slug.to_owned(),
                phase,
                status: RalStatus::Running,
                triggering_event_id: triggering_event_id.to_owned(),
                actions: Vec::new(),
            },
        );
        number
    }

    pub fn set_status(&self, ral_number: u64, status: RalStatus) {
        if let Some(info) = self.rals.lock().get_mut(&ral_number) {
            info.status = status;
        }
        if !status.is_live() {
            self.release_all(ral_number);
        }
    }

    pub fn record_action(&self, ral_number: u64, action: ActionRecord) {
        if let Some(info) = self.rals.lock().get_mut(&ral_number) {
            info.actions.push(action);
        }
    }

    pub fn info(&self, ral_number: u64) -> Option<RalInfo> {
        self.rals.lock().get(&ral_number).cloned()
    }

    /// Live sibling loops, ordered by number, excluding the caller.
    pub fn other_rals(&self, self_number: u64) -> Vec<RalInfo> {
        let rals = self.rals.lock();
        let mut others: Vec<RalInfo> = rals
            .values()
            .filter(|info| info.ral_number != self_number && info.status.is_live())
            .cloned()
            .collect();
        others.sort_by_key(|info| info.ral_number);
        others
    }

    pub fn live_count(&self) -> usize {
        self.rals.lock().values().filter(|i| i.status.is_live()).count()
    }

    /// Acquire an advisory lease on a shared resource.
    ///
    /// Reentrant for the current holder; everyone else queues FIFO.
    pub async fn resource_lease(self: Arc<Self>, ral_number: u64, resource_key: &str) -> Lease {
        let waiter = {
            let mut leases = self.leases.lock();
            let state = leases
                .entry(resource_key.to_owned())
                .or_insert_with(|| LeaseState {
                    holder: None,
                    depth: 0,
                    queue: VecDeque::new(),
                });

            match state.holder {
                None => {
                    state.holder = Some(ral_number);
                    state.depth = 1;
                    None
                }
                Some(holder) if holder == ral_number => {
                    state.depth += 1;
                    None
                }
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back((ral_number, tx));
                    Some(rx)
                }
            }
        };

        if let Some(rx) = waiter {
            // Sender dropped means the queue entry was purged (loop
            // terminated); treat as acquired-and-released.
            let _ = rx.await;
        }

        Lease {
            coordinator: self,
            resource_key: resource_key.to_owned(),
            ral_number,
        }
    }

    fn release(&self, ral_number: u64, resource_key: &str) {
        let mut leases = self.leases.lock();
        let Some(state) = leases.get_mut(resource_key) else {
            return;
        };
        if state.holder != Some(ral_number) {
            return;
        }
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 {
            return;
        }
        state.holder = None;
        while let Some((next, tx)) = state.queue.pop_front() {
            if tx.send(()).is_ok() {
                state.holder = Some(next);
                state.depth = 1;
                break;
            }
        }
        if state.holder.is_none() && state.queue.is_empty() {
            leases.remove(resource_key);
        }
    }

    /// Drop every lease and queue entry a loop holds (termination path).
    fn release_all(&self, ral_number: u64) {
        let keys: Vec<String> = {
            let leases = self.leases.lock();
            leases.keys().cloned().collect()
        };
        for key in keys {
            {
                let mut leases = self.leases.lock();
                if let Some(state) = leases.get_mut(&key) {
                    state.queue.retain(|(n, _)| *n != ral_number);
                    if state.holder == Some(ral_number) {
                        state.depth = 1; // force full release below
                    }
                }
            }
            self.release(ral_number, &key);
        }
    }
}

/// Held lease; releases on drop.
pub struct Lease {
    coordinator: Arc<ConcurrentRalCoordinator>,
    resource_key: String,
    ral_number: u64,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.coordinator.release(self.ral_number, &self.resource_key);
    }
}

/// Map of conversation id → coordinator, created on first use.
#[derive(Default)]
pub struct RalCoordinators {
    map: Mutex<HashMap<String, Arc<ConcurrentRalCoordinator>>>,
}

impl RalCoordinators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_conversation(&self, conversation_id: &str) -> Arc<ConcurrentRalCoordinator> {
        self.map
            .lock()
            .entry(conversation_id.to_owned())
            .or_insert_with(|| Arc::new(ConcurrentRalCoordinator::new()))
            .clone()
    }
}
