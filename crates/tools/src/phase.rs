//! The phase transition tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use cv_domain::error::{Error, Result};
use cv_domain::phase::Phase;

use crate::runtime::{Tool, ToolContext, ToolOutcome};
use crate::schema::{FieldType, InputSchema};

#[derive(Debug, Deserialize)]
struct SwitchPhaseArgs {
    phase: String,
    #[serde(default)]
    message: Option<String>,
}

/// Propose a phase transition. The phase machine enforces the policy;
/// rejected transitions come back as error text and the turn continues.
pub struct SwitchPhase;

#[async_trait]
impl Tool for SwitchPhase {
    fn name(&self) -> &str {
        "switch_phase"
    }

    fn description(&self) -> &str {
        "Move the conversation to another phase. Workers may only advance to \
         the immediate next phase or fall back to chat."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required("phase", FieldType::String, "Target phase name")
            .optional("message", FieldType::String, "Why the phase is changing")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: SwitchPhaseArgs = serde_json::from_value(args)?;

        let Some(phase) = Phase::parse(&req.phase) else {
            let known = Phase::ALL.map(|p| p.as_str()).join(", ");
            return Ok(ToolOutcome::ErrorText(format!(
                "unknown phase '{}'; valid phases: {known}",
                req.phase
            )));
        };

        match ctx.phases.request_transition(
            &ctx.conversation_id,
            &ctx.agent_slug,
            phase,
            req.message,
        ) {
            Ok(now) => Ok(ToolOutcome::Value(serde_json::json!({
                "phase": now.as_str(),
            }))),
            Err(Error::Validation(msg)) => Ok(ToolOutcome::ErrorText(msg)),
            Err(e) => Err(e),
        }
    }
}
