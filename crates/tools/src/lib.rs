//! The tool layer: typed input schemas, filesystem scope enforcement,
//! the built-in tool set, and the [`ToolRuntime`] that validates and
//! dispatches calls on behalf of a reasoning loop.

pub mod delegate;
pub mod fs;
pub mod memory;
pub mod phase;
pub mod runtime;
pub mod schema;
pub mod scope;
pub mod shell;

#[cfg(test)]
pub(crate) mod testutil;

pub use runtime::{
    EventPublisher, PhaseGate, RecipientResolver, Tool, ToolContext, ToolExecution, ToolOutcome,
    ToolRuntime,
};
pub use schema::{FieldSpec, FieldType, InputSchema};
