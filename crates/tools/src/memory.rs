//! Agent memory tools: per-conversation scratch KV plus durable lessons.
//!
//! `remember`/`recall` work against the agent's own KV namespace in the
//! conversation store (single-writer, any-reader). `learn` additionally
//! publishes a lesson event addressed to the project so the knowledge
//! survives the conversation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use cv_domain::error::Result;
use cv_domain::event::{EventKind, Tag};

use crate::runtime::{Tool, ToolContext, ToolOutcome};
use crate::schema::{FieldType, InputSchema};

#[derive(Debug, Deserialize)]
struct RememberArgs {
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct RecallArgs {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LearnArgs {
    title: String,
    lesson: String,
}

/// Store a fact in the agent's conversation-scoped scratch space.
pub struct Remember;

#[async_trait]
impl Tool for Remember {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Store a value under a key in your conversation-scoped memory. \
         Only you can write it; anyone can read it."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required("key", FieldType::String, "Key to store under")
            .required("value", FieldType::Object, "Value to store")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: RememberArgs = serde_json::from_value(args)?;
        match ctx.store.kv_set(
            &ctx.conversation_id,
            &ctx.agent_slug,
            &ctx.agent_slug,
            &req.key,
            req.value,
        ) {
            Ok(()) => Ok(ToolOutcome::Value(serde_json::json!({
                "stored": req.key,
            }))),
            Err(e) => Ok(ToolOutcome::ErrorText(e.to_string())),
        }
    }
}

/// Read back stored facts: one key or the whole namespace listing.
pub struct Recall;

#[async_trait]
impl Tool for Recall {
    fn name(&self) -> &str {
        "recall"
    }

    fn description(&self) -> &str {
        "Recall a value from your conversation-scoped memory, or list all \
         stored keys when no key is given."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new().optional("key", FieldType::String, "Key to look up")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: RecallArgs = serde_json::from_value(args)?;

        match req.key {
            Some(key) => match ctx.store.kv_get(&ctx.conversation_id, &ctx.agent_slug, &key) {
                Some(value) => Ok(ToolOutcome::Value(serde_json::json!({
                    "key": key,
                    "value": value,
                }))),
                None => Ok(ToolOutcome::ErrorText(format!("no value stored under '{key}'"))),
            },
            None => {
                let keys = ctx.store.kv_keys(&ctx.conversation_id, &ctx.agent_slug);
                Ok(ToolOutcome::Value(serde_json::json!({ "keys": keys })))
            }
        }
    }
}

/// Persist a learned-knowledge record as a lesson event addressed to
/// the project, and remember it in the agent's KV.
pub struct Learn;

#[async_trait]
impl Tool for Learn {
    fn name(&self) -> &str {
        "learn"
    }

    fn description(&self) -> &str {
        "Record a lesson worth keeping beyond this conversation. Published \
         as a durable lesson event and kept in your memory."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required("title", FieldType::String, "Short lesson title")
            .required("lesson", FieldType::String, "The lesson itself")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: LearnArgs = serde_json::from_value(args)?;

        let event_id = ctx
            .publisher
            .publish(
                EventKind::LESSON,
                req.lesson.clone(),
                vec![
                    Tag::address(&ctx.project_address),
                    Tag::conversation(&ctx.conversation_id),
                    Tag::title(&req.title),
                ],
            )
            .await?;

        // Also keep the lesson in the agent's own scratch space so later
        // turns can recall it without searching the event log.
        if let Err(e) = ctx.store.kv_set(
            &ctx.conversation_id,
            &ctx.agent_slug,
            &ctx.agent_slug,
            &format!("lesson:{}", req.title),
            serde_json::json!(req.lesson),
        ) {
            return Ok(ToolOutcome::ErrorText(e.to_string()));
        }

        Ok(ToolOutcome::Value(serde_json::json!({
            "recorded": req.title,
            "event_id": event_id,
        })))
    }
}
