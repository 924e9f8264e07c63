//! Delegation-class tools.
//!
//! These never complete work themselves: they validate the request,
//! resolve recipients, and return a [`StopSignal`] that parks the calling
//! loop until the delegation coordinator wakes it with replies.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use cv_domain::delegation::{DelegationSpec, StopSignal};
use cv_domain::error::Result;
use cv_domain::phase::Phase;

use crate::runtime::{Tool, ToolContext, ToolOutcome};
use crate::schema::{FieldType, InputSchema};

#[derive(Debug, Deserialize)]
struct DelegateArgs {
    recipients: Vec<String>,
    request: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AskArgs {
    question: String,
    #[serde(default)]
    suggestions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DelegatePhaseArgs {
    phase: String,
    recipients: Vec<String>,
    request: String,
}

fn resolve_recipients(ctx: &ToolContext, names: &[String]) -> std::result::Result<Vec<String>, String> {
    if names.is_empty() {
        return Err("at least one recipient is required".into());
    }
    let mut pubkeys = Vec::new();
    for name in names {
        match ctx.recipients.resolve_pubkey(name) {
            Some(pk) if pk != ctx.agent_pubkey => pubkeys.push(pk),
            Some(_) => return Err(format!("cannot delegate to yourself ('{name}')")),
            None => return Err(format!("unknown recipient '{name}'")),
        }
    }
    pubkeys.dedup();
    Ok(pubkeys)
}

/// Hand a task to one or more other agents and wait for their replies.
pub struct Delegate;

#[async_trait]
impl Tool for Delegate {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Delegate a task to one or more agents. Your turn pauses until every \
         recipient has replied (or the timeout fires)."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required(
                "recipients",
                FieldType::Array(Box::new(FieldType::String)),
                "Agent slugs, names or pubkeys to delegate to",
            )
            .required("request", FieldType::String, "What you need from them")
            .optional("timeout_secs", FieldType::Integer, "Give up after this many seconds")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: DelegateArgs = serde_json::from_value(args)?;
        let recipients = match resolve_recipients(ctx, &req.recipients) {
            Ok(pks) => pks,
            Err(msg) => return Ok(ToolOutcome::ErrorText(msg)),
        };

        Ok(ToolOutcome::Stop(StopSignal {
            delegation: DelegationSpec {
                request: req.request,
                recipients,
                is_ask: false,
                target_phase: None,
                deadline: req.timeout_secs.map(Duration::from_secs),
            },
        }))
    }
}

/// Ask the human a question and wait for a free-form answer.
pub struct Ask;

#[async_trait]
impl Tool for Ask {
    fn name(&self) -> &str {
        "ask"
    }

    fn description(&self) -> &str {
        "Ask the project's human a question. Your turn pauses until anyone \
         who is not an agent answers."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required("question", FieldType::String, "The question to ask")
            .optional(
                "suggestions",
                FieldType::Array(Box::new(FieldType::String)),
                "Suggested answers to offer",
            )
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: AskArgs = serde_json::from_value(args)?;
        if req.question.trim().is_empty() {
            return Ok(ToolOutcome::ErrorText("question must not be empty".into()));
        }

        let mut request = req.question;
        if !req.suggestions.is_empty() {
            request.push_str("\nSuggestions: ");
            request.push_str(&req.suggestions.join(" | "));
        }

        Ok(ToolOutcome::Stop(StopSignal {
            delegation: DelegationSpec {
                request,
                recipients: Vec::new(),
                is_ask: true,
                target_phase: None,
                deadline: None,
            },
        }))
    }
}

/// Delegate into a different phase: the recipients work the request in
/// the target phase.
pub struct DelegatePhase;

#[async_trait]
impl Tool for DelegatePhase {
    fn name(&self) -> &str {
        "delegate_phase"
    }

    fn description(&self) -> &str {
        "Delegate a task to agents in a specific phase (e.g. hand a plan to \
         executors). Your turn pauses until they reply."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required("phase", FieldType::String, "Target phase for the delegated work")
            .required(
                "recipients",
                FieldType::Array(Box::new(FieldType::String)),
                "Agent slugs, names or pubkeys to delegate to",
            )
            .required("request", FieldType::String, "What you need from them")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: DelegatePhaseArgs = serde_json::from_value(args)?;

        let Some(phase) = Phase::parse(&req.phase) else {
            let known = Phase::ALL.map(|p| p.as_str()).join(", ");
            return Ok(ToolOutcome::ErrorText(format!(
                "unknown phase '{}'; valid phases: {known}",
                req.phase
            )));
        };

        let recipients = match resolve_recipients(ctx, &req.recipients) {
            Ok(pks) => pks,
            Err(msg) => return Ok(ToolOutcome::ErrorText(msg)),
        };

        Ok(ToolOutcome::Stop(StopSignal {
            delegation: DelegationSpec {
                request: req.request,
                recipients,
                is_ask: false,
                target_phase: Some(phase),
                deadline: None,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{noop_context, CapturingPublisher};
    use std::sync::Arc;

    #[tokio::test]
    async fn delegate_resolves_slugs_to_pubkeys() {
        let ctx = noop_context(Arc::new(CapturingPublisher::default()));
        let outcome = Delegate
            .execute(
                serde_json::json!({"recipients": ["bob"], "request": "design X"}),
                &ctx,
            )
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Stop(signal) => {
                assert_eq!(signal.delegation.recipients, vec!["pk-bob"]);
                assert_eq!(signal.delegation.request, "design X");
                assert!(!signal.delegation.is_ask);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_recipient_is_soft_error() {
        let ctx = noop_context(Arc::new(CapturingPublisher::default()));
        let outcome = Delegate
            .execute(
                serde_json::json!({"recipients": ["ghost"], "request": "?"}),
                &ctx,
            )
            .await
            .unwrap();
        match outcome {
            ToolOutcome::ErrorText(msg) => assert!(msg.contains("unknown recipient")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn ask_parks_with_is_ask() {
        let ctx = noop_context(Arc::new(CapturingPublisher::default()));
        let outcome = Ask
            .execute(
                serde_json::json!({"question": "ship it?", "suggestions": ["yes", "no"]}),
                &ctx,
            )
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Stop(signal) => {
                assert!(signal.delegation.is_ask);
                assert!(signal.delegation.request.contains("ship it?"));
                assert!(signal.delegation.request.contains("yes | no"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn delegate_phase_carries_target_phase() {
        let ctx = noop_context(Arc::new(CapturingPublisher::default()));
        let outcome = DelegatePhase
            .execute(
                serde_json::json!({
                    "phase": "Execute",
                    "recipients": ["bob"],
                    "request": "build it",
                }),
                &ctx,
            )
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Stop(signal) => {
                assert_eq!(signal.delegation.target_phase, Some(Phase::Execute));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn bogus_phase_is_soft_error() {
        let ctx = noop_context(Arc::new(CapturingPublisher::default()));
        let outcome = DelegatePhase
            .execute(
                serde_json::json!({
                    "phase": "warp",
                    "recipients": ["bob"],
                    "request": "x",
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ToolOutcome::ErrorText(_)));
    }
}
