//! Agent identity management: loading definitions, holding signers, and
//! the per-agent home directories agents may always write to.

pub mod home;
pub mod registry;

pub use home::AgentHome;
pub use registry::{AgentHandle, AgentRegistry};
