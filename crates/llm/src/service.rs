//! The provider-agnostic LLM service interface.

use std::path::PathBuf;

use async_trait::async_trait;

use cv_domain::cancel::CancelToken;
use cv_domain::error::Result;
use cv_domain::message::{Message, ToolDefinition};
use cv_domain::stream::{BoxStream, StreamEvent};

/// Recognized per-call options. Everything is optional; providers apply
/// their own defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Correlation id for the calling loop.
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub working_directory: Option<PathBuf>,
    /// MCP server descriptors the caller wants mounted, when the
    /// provider supports them.
    pub mcp_servers: Vec<String>,
    /// Providers that can abort mid-stream should honor this token;
    /// consumers stop reading at the next chunk boundary regardless.
    pub abort: Option<CancelToken>,
}

/// One streaming completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub options: ChatOptions,
}

/// The LLM seam. Concrete providers live outside the engine; the engine
/// only consumes this trait.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Stream a completion. Items are tokens, tool calls, and a final
    /// `Done`; stream-level failures arrive as `Err` items.
    async fn stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// One-shot structured generation against a JSON schema.
    async fn generate_object(
        &self,
        messages: Vec<Message>,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value>;
}
