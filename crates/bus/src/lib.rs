//! Pub/sub plumbing for Conclave: signing identities, the relay pool
//! abstraction with an in-memory implementation, and the deduplicating
//! [`EventBus`] the engine consumes events through.

pub mod bus;
pub mod relay;
pub mod signer;

pub use bus::{EventBus, SeenStore};
pub use relay::{Filter, InMemoryRelayPool, RelayPool};
pub use signer::{HmacSigner, Keyring};
