//! File I/O tools, constrained by the per-call sandbox.
//!
//! `fs_write` is atomic: content goes to a uniquely-named `.tmp` sibling
//! which is then renamed into place.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use cv_domain::error::{Error, Result};

use crate::runtime::{Tool, ToolContext, ToolOutcome};
use crate::schema::{FieldType, InputSchema};

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default, rename = "allowOutsideWorkingDirectory")]
    allow_outside: bool,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
    #[serde(default, rename = "allowOutsideWorkingDirectory")]
    allow_outside: bool,
}

/// Read a file with optional line offset and limit.
pub struct FsRead;

#[async_trait]
impl Tool for FsRead {
    fn name(&self) -> &str {
        "fs_read"
    }

    fn description(&self) -> &str {
        "Read a file. Paths are relative to the conversation working directory."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required("path", FieldType::String, "File path to read")
            .optional("offset", FieldType::Integer, "Line number to start from (0-indexed)")
            .optional("limit", FieldType::Integer, "Maximum number of lines to return")
            .optional(
                "allowOutsideWorkingDirectory",
                FieldType::Boolean,
                "Allow an absolute path outside the working directory",
            )
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: ReadArgs = serde_json::from_value(args)?;
        let path = match ctx.sandbox.resolve(&req.path, req.allow_outside) {
            Ok(p) => p,
            Err(Error::ScopeViolation(msg)) => return Ok(ToolOutcome::ErrorText(msg)),
            Err(e) => return Err(e),
        };

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(ToolOutcome::ErrorText(format!(
                    "failed to read '{}': {e}",
                    req.path
                )))
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let offset = req.offset.unwrap_or(0);
        let limit = req.limit.unwrap_or(total_lines.saturating_sub(offset));
        let selected: Vec<&str> = lines.into_iter().skip(offset).take(limit).collect();

        Ok(ToolOutcome::Value(serde_json::json!({
            "path": req.path,
            "content": selected.join("\n"),
            "total_lines": total_lines,
            "offset": offset,
            "lines_returned": selected.len(),
        })))
    }
}

/// Create or overwrite a file atomically.
pub struct FsWrite;

#[async_trait]
impl Tool for FsWrite {
    fn name(&self) -> &str {
        "fs_write"
    }

    fn description(&self) -> &str {
        "Write a file atomically. Writes outside the working directory require \
         allowOutsideWorkingDirectory=true and an absolute path; the agent home \
         is always writable."
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .required("path", FieldType::String, "File path to write")
            .required("content", FieldType::String, "Content to write")
            .optional(
                "allowOutsideWorkingDirectory",
                FieldType::Boolean,
                "Allow an absolute path outside the working directory",
            )
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let req: WriteArgs = serde_json::from_value(args)?;
        let path = match ctx.sandbox.resolve(&req.path, req.allow_outside) {
            Ok(p) => p,
            Err(Error::ScopeViolation(msg)) => return Ok(ToolOutcome::ErrorText(msg)),
            Err(e) => return Err(e),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Execution(format!("failed to create parent directory: {e}")))?;
        }

        let tmp_name = format!(
            ".{}.{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy(),
            uuid::Uuid::new_v4().as_simple()
        );
        let tmp_path = path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| Error::Execution(format!("failed to create temp file: {e}")))?;
        file.write_all(req.content.as_bytes())
            .await
            .map_err(|e| Error::Execution(format!("failed to write temp file: {e}")))?;
        file.flush()
            .await
            .map_err(|e| Error::Execution(format!("failed to flush temp file: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| Error::Execution(format!("failed to sync temp file: {e}")))?;

        fs::rename(&tmp_path, &path).await.map_err(|e| {
            let tmp = tmp_path.clone();
            tokio::spawn(async move {
                let _ = fs::remove_file(&tmp).await;
            });
            Error::Execution(format!("failed to rename temp file into place: {e}"))
        })?;

        Ok(ToolOutcome::Value(serde_json::json!({
            "path": req.path,
            "bytes_written": req.content.len(),
            "success": true,
        })))
    }
}
