//! Shell execution with guard rails.
//!
//! Commands matching the configured denied patterns are refused before
//! anything runs. Execution happens in the conversation working
//! directory, honors the loop's cancellation token, and is bounded by a
//! per-invocation timeout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use cv_domain::error::{Error, Result};

use crate::runtime::{Tool, ToolContext, ToolOutcome};
use crate::schema::{FieldType, InputSchema};

const MAX_CAPTURED_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

pub struct ShellTool {
    denied: Arc<regex::RegexSet>,
    default_timeout: Duration,
}

impl ShellTool {
    pub fn new(denied: Arc<regex::RegexSet>, default_timeout: Duration) -> Self {
        Self {
            denied,
            default_timeout,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the conversation working directory and return \
         its output and exit code."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required("command", FieldType::String, "Shell command to execute")
            .optional("timeout_secs", FieldType::Integer, "Hard timeout in seconds")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: ShellArgs = serde_json::from_value(args)?;

        if self.denied.is_match(&req.command) {
            return Ok(ToolOutcome::ErrorText(format!(
                "command refused by policy: '{}'",
                req.command
            )));
        }

        let timeout = req
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let child = Command::new("sh")
            .arg("-c")
            .arg(&req.command)
            .current_dir(ctx.sandbox.working_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to spawn shell: {e}")))?;

        let cancel = ctx.cancel.clone();
        let watch_cancel = async {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        // kill_on_drop reaps the child on the cancel and timeout branches.
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output
                    .map_err(|e| Error::Execution(format!("failed to wait on shell: {e}")))?;
                Ok(ToolOutcome::Value(serde_json::json!({
                    "command": req.command,
                    "exit_code": output.status.code(),
                    "stdout": clip(&output.stdout),
                    "stderr": clip(&output.stderr),
                })))
            }
            _ = watch_cancel => {
                Err(Error::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                Ok(ToolOutcome::ErrorText(format!(
                    "command timed out after {}s: '{}'",
                    timeout.as_secs(),
                    req.command
                )))
            }
        }
    }
}

fn clip(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_CAPTURED_BYTES {
        text.into_owned()
    } else {
        let mut end = MAX_CAPTURED_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}\n[output truncated]", &text[..end])
    }
}
