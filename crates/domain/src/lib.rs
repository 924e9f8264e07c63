//! Shared domain types for Conclave.
//!
//! Everything here is plain data: events and tags, conversation phases,
//! agent definitions, delegation records, provider-agnostic messages and
//! stream events, the error taxonomy, and the engine configuration.
//! No I/O happens in this crate.

pub mod agent;
pub mod cancel;
pub mod config;
pub mod delegation;
pub mod error;
pub mod event;
pub mod message;
pub mod phase;
pub mod stream;

pub use error::{Error, Result};
pub use event::{Event, EventBuilder, EventKind, Signer, Tag};
pub use phase::Phase;
