//! The LLM seam: a provider-agnostic service trait, a registry resolving
//! config names to services, and the deterministic scripted service used
//! by tests and offline runs.

pub mod registry;
pub mod scripted;
pub mod service;

pub use registry::LlmRegistry;
pub use scripted::ScriptedLlm;
pub use service::{ChatOptions, ChatRequest, LlmService};
