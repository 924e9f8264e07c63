//! The tool runtime validates arguments, enforces the allow list,
//! executes tools with a deadline, formats results, and publishes
//! tool-status telemetry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use cv_domain::agent::{AgentCategory, ToolPolicy};
use cv_domain::cancel::CancelToken;
use cv_domain::delegation::StopSignal;
use cv_domain::error::{Error, Result};
use cv_domain::event::{EventKind, Tag};
use cv_domain::message::ToolDefinition;
use cv_domain::phase::Phase;
use cv_store::ConversationStore;

use crate::schema::InputSchema;
use crate::scope::Sandbox;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborator seams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Publishes an event signed as the acting agent. Implemented by the
/// engine over the event bus; tools never touch transport directly.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns the published event's id.
    async fn publish(&self, kind: EventKind, content: String, tags: Vec<Tag>) -> Result<String>;
}

/// Phase transitions on behalf of a tool. Implemented by the engine's
/// phase machine, which owns the policy.
pub trait PhaseGate: Send + Sync {
    fn request_transition(
        &self,
        conversation_id: &str,
        agent_slug: &str,
        to: Phase,
        message: Option<String>,
    ) -> Result<Phase>;
}

/// Resolves a delegation recipient (slug, name or pubkey) to a pubkey.
pub trait RecipientResolver: Send + Sync {
    fn resolve_pubkey(&self, recipient: &str) -> Option<String>;
    /// Whether a pubkey belongs to a registered agent (asks address
    /// humans, i.e. everyone else).
    fn is_agent(&self, pubkey: &str) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a tool may touch during one call.
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub agent_slug: String,
    pub agent_pubkey: String,
    pub agent_category: AgentCategory,
    /// `a`-tag address of the project this agent belongs to.
    pub project_address: String,
    pub phase: Phase,
    pub sandbox: Sandbox,
    pub store: Arc<ConversationStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub phases: Arc<dyn PhaseGate>,
    pub recipients: Arc<dyn RecipientResolver>,
    pub cancel: CancelToken,
}

impl ToolContext {
    pub fn working_dir(&self) -> PathBuf {
        self.sandbox.working_dir().to_path_buf()
    }
}

/// What a tool call produced.
#[derive(Debug)]
pub enum ToolOutcome {
    /// Scalar string result, passed through verbatim.
    Text(String),
    /// Structured result, JSON-encoded for the LLM.
    Value(Value),
    /// Binary payload, reduced to a descriptor.
    Binary { len: usize, mime: String },
    /// Soft failure the LLM sees and may recover from.
    ErrorText(String),
    /// Park the calling loop (delegation-class tools).
    Stop(StopSignal),
}

/// A named, schema-validated, sandboxed action the LLM can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> InputSchema;

    /// Execute with validated arguments. Returning `Err` terminates the
    /// calling loop; prefer [`ToolOutcome::ErrorText`] for anything the
    /// LLM could retry.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome>;
}

/// Formatted result of one dispatched call.
#[derive(Debug)]
pub struct ToolExecution {
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
    pub stop: Option<StopSignal>,
    pub duration_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolRuntime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolRuntime {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Per-call deadline.
    tool_deadline: Duration,
}

impl ToolRuntime {
    pub fn new(tool_deadline: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            tool_deadline,
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.write().insert(tool.name().to_owned(), tool);
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions exposed to the LLM, filtered by policy and
    /// sorted by name for deterministic prompts.
    pub fn definitions(&self, policy: &ToolPolicy) -> Vec<ToolDefinition> {
        let tools = self.tools.read();
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .filter(|t| policy.allows(t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                parameters: t.schema().to_json_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Dispatch one call: allow list, schema validation, deadline,
    /// formatting, and status telemetry. Never returns `Err` for
    /// anything the LLM should see; those become error text.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: &Value,
        policy: &ToolPolicy,
        ctx: &ToolContext,
    ) -> Result<ToolExecution> {
        let started = std::time::Instant::now();

        // Denied tools are never dispatched; the LLM learns its options.
        if !policy.allows(tool_name) {
            let allowed = if policy.allow.is_empty() {
                self.tool_names().join(", ")
            } else {
                policy.allow.join(", ")
            };
            let content = format!(
                "tool '{tool_name}' is not permitted for this agent; allowed tools: [{allowed}]"
            );
            self.emit_status(ctx, tool_name, "failed", Some(0)).await;
            return Ok(failed(tool_name, content, started));
        }

        let Some(tool) = self.tools.read().get(tool_name).cloned() else {
            let content = format!(
                "unknown tool '{tool_name}'; available tools: [{}]",
                self.tool_names().join(", ")
            );
            self.emit_status(ctx, tool_name, "failed", Some(0)).await;
            return Ok(failed(tool_name, content, started));
        };

        if let Err(problems) = tool.schema().validate(args) {
            let content = format!("invalid arguments for '{tool_name}': {problems}");
            self.emit_status(ctx, tool_name, "failed", Some(0)).await;
            return Ok(failed(tool_name, content, started));
        }

        self.emit_status(ctx, tool_name, "starting", None).await;

        let outcome = match tokio::time::timeout(
            self.tool_deadline,
            tool.execute(args.clone(), ctx),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_soft() => ToolOutcome::ErrorText(e.to_string()),
            Ok(Err(e)) => {
                // Hard failure: status is published, then the error
                // propagates and terminates the loop.
                self.emit_status(
                    ctx,
                    tool_name,
                    "failed",
                    Some(started.elapsed().as_millis() as u64),
                )
                .await;
                return Err(e);
            }
            Err(_) => ToolOutcome::ErrorText(format!(
                "tool '{tool_name}' exceeded its deadline of {:?}",
                self.tool_deadline
            )),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let execution = match outcome {
            ToolOutcome::Text(content) => ToolExecution {
                tool_name: tool_name.to_owned(),
                content,
                is_error: false,
                stop: None,
                duration_ms,
            },
            ToolOutcome::Value(value) => ToolExecution {
                tool_name: tool_name.to_owned(),
                content: match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
                is_error: false,
                stop: None,
                duration_ms,
            },
            ToolOutcome::Binary { len, mime } => ToolExecution {
                tool_name: tool_name.to_owned(),
                content: format!("[binary, {len} bytes, mime={mime}]"),
                is_error: false,
                stop: None,
                duration_ms,
            },
            ToolOutcome::ErrorText(content) => ToolExecution {
                tool_name: tool_name.to_owned(),
                content,
                is_error: true,
                stop: None,
                duration_ms,
            },
            ToolOutcome::Stop(signal) => ToolExecution {
                tool_name: tool_name.to_owned(),
                content: String::new(),
                is_error: false,
                stop: Some(signal),
                duration_ms,
            },
        };

        let status = if execution.is_error { "failed" } else { "completed" };
        self.emit_status(ctx, tool_name, status, Some(duration_ms)).await;

        tracing::debug!(
            tool = tool_name,
            agent = %ctx.agent_slug,
            duration_ms,
            is_error = execution.is_error,
            "tool call finished"
        );
        Ok(execution)
    }

    async fn emit_status(
        &self,
        ctx: &ToolContext,
        tool_name: &str,
        status: &str,
        duration_ms: Option<u64>,
    ) {
        let mut tags = vec![
            Tag::conversation(&ctx.conversation_id),
            Tag::tool(tool_name),
            Tag::tool_status(status),
        ];
        if let Some(ms) = duration_ms {
            tags.push(Tag::tool_duration(ms));
        }
        if let Err(e) = ctx
            .publisher
            .publish(EventKind::TOOL_STATUS, String::new(), tags)
            .await
        {
            tracing::warn!(tool = tool_name, error = %e, "failed to publish tool status");
        }
    }
}

fn failed(tool_name: &str, content: String, started: std::time::Instant) -> ToolExecution {
    ToolExecution {
        tool_name: tool_name.to_owned(),
        content,
        is_error: true,
        stop: None,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// UTF-8-safe prefix truncation for previews.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::testutil::{noop_context, CapturingPublisher};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back."
        }
        fn schema(&self) -> InputSchema {
            InputSchema::new().required("text", FieldType::String, "text to echo")
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutcome> {
            Ok(ToolOutcome::Text(
                args["text"].as_str().unwrap_or_default().to_owned(),
            ))
        }
    }

    struct ExplodingTool;

    #[async_trait]
    impl Tool for ExplodingTool {
        fn name(&self) -> &str {
            "explode"
        }
        fn description(&self) -> &str {
            "Always fails hard."
        }
        fn schema(&self) -> InputSchema {
            InputSchema::new()
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutcome> {
            Err(Error::Execution("boom".into()))
        }
    }

    fn runtime() -> ToolRuntime {
        let rt = ToolRuntime::new(Duration::from_secs(5));
        rt.register(Arc::new(EchoTool));
        rt.register(Arc::new(ExplodingTool));
        rt
    }

    #[tokio::test]
    async fn denied_tool_reports_allow_list_and_is_not_run() {
        let rt = runtime();
        let publisher = Arc::new(CapturingPublisher::default());
        let ctx = noop_context(publisher.clone());
        let policy = ToolPolicy {
            allow: vec!["fs_read".into()],
            deny: vec![],
        };

        let exec = rt
            .execute("echo", &serde_json::json!({"text": "hi"}), &policy, &ctx)
            .await
            .unwrap();
        assert!(exec.is_error);
        assert!(exec.content.contains("not permitted"));
        assert!(exec.content.contains("fs_read"));

        // A failed tool-status event was published.
        let statuses = publisher.statuses();
        assert_eq!(statuses, vec!["failed".to_string()]);
    }

    #[tokio::test]
    async fn unknown_tool_is_soft_error() {
        let rt = runtime();
        let ctx = noop_context(Arc::new(CapturingPublisher::default()));
        let exec = rt
            .execute("nope", &serde_json::json!({}), &ToolPolicy::default(), &ctx)
            .await
            .unwrap();
        assert!(exec.is_error);
        assert!(exec.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_soft_errors() {
        let rt = runtime();
        let ctx = noop_context(Arc::new(CapturingPublisher::default()));
        let exec = rt
            .execute("echo", &serde_json::json!({}), &ToolPolicy::default(), &ctx)
            .await
            .unwrap();
        assert!(exec.is_error);
        assert!(exec.content.contains("missing required field 'text'"));
    }

    #[tokio::test]
    async fn success_emits_start_and_completed_statuses() {
        let rt = runtime();
        let publisher = Arc::new(CapturingPublisher::default());
        let ctx = noop_context(publisher.clone());

        let exec = rt
            .execute(
                "echo",
                &serde_json::json!({"text": "hello"}),
                &ToolPolicy::default(),
                &ctx,
            )
            .await
            .unwrap();
        assert!(!exec.is_error);
        assert_eq!(exec.content, "hello");
        assert_eq!(
            publisher.statuses(),
            vec!["starting".to_string(), "completed".to_string()]
        );
    }

    #[tokio::test]
    async fn hard_tool_errors_propagate() {
        let rt = runtime();
        let ctx = noop_context(Arc::new(CapturingPublisher::default()));
        let err = rt
            .execute("explode", &serde_json::json!({}), &ToolPolicy::default(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[test]
    fn truncate_is_utf8_safe() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
        assert_eq!(truncate_str("h\u{00e9}llo", 2), "h...");
    }
}
