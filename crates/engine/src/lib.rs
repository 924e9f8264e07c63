//! The Conclave core engine.
//!
//! Events flow: bus → [`router::Router`] → conversation store update →
//! RAL spawn → [`composer`] → LLM stream → tool dispatch → published
//! events back onto the bus. Delegations park a RAL until the
//! [`delegation::DelegationCoordinator`] wakes it; sibling RALs in the
//! same conversation coordinate through the
//! [`coordinator::ConcurrentRalCoordinator`].

pub mod cancel;
pub mod composer;
pub mod coordinator;
pub mod delegation;
pub mod engine;
pub mod phase_machine;
pub mod ral;
pub mod router;
pub mod state;
pub mod thread;

pub use engine::Engine;
pub use state::EngineState;
