//! Edit tool: replace a unique string in a file

use super::{resolve_path, snapshot_file, Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;

/// Edit a file by exact-string replacement. The old string must occur
/// exactly once so the edit site is unambiguous.
pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact string with new content. Include enough surrounding context that old_string occurs exactly once in the file."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to edit, relative to the project root"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact text to replace, including whitespace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement text"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    fn permission_action(&self) -> Option<&str> {
        Some("edit file")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let raw = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("path is required"))?;
        let old_string = args["old_string"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("old_string is required"))?;
        let new_string = args["new_string"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("new_string is required"))?;
        let path = resolve_path(&ctx.root, raw)?;

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {raw}"))?;

        let count = content.matches(old_string).count();
        if count == 0 {
            return Ok(ToolOutput::error(
                "old_string not found in file. Make sure it matches exactly, including whitespace.",
            ));
        }
        if count > 1 {
            return Ok(ToolOutput::error(format!(
                "old_string found {count} times. Include more context to uniquely identify the location."
            )));
        }

        let new_content = content.replacen(old_string, new_string, 1);
        snapshot_file(ctx, &path, Some(&new_content)).await?;
        fs::write(&path, &new_content)
            .await
            .with_context(|| format!("Failed to write {raw}"))?;

        let removed = old_string.lines().count();
        let added = new_string.lines().count();
        Ok(ToolOutput::text(format!(
            "Edited {raw}: -{removed} +{added} lines"
        )))
    }
}
