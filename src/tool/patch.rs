//! Patch tool: apply a unified diff to one file

use super::{resolve_path, snapshot_file, Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;

/// Apply a unified diff to a file. Hunks are located by exact context
/// match against the current content.
pub struct PatchTool;

struct Hunk {
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

fn parse_hunks(patch: &str) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;

    for line in patch.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") {
            continue;
        }
        if line.starts_with("@@") {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            current = Some(Hunk {
                old_lines: Vec::new(),
                new_lines: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = current.as_mut() else { continue };
        if let Some(removed) = line.strip_prefix('-') {
            hunk.old_lines.push(removed.to_string());
        } else if let Some(added) = line.strip_prefix('+') {
            hunk.new_lines.push(added.to_string());
        } else {
            let content = line.strip_prefix(' ').unwrap_or(line);
            hunk.old_lines.push(content.to_string());
            hunk.new_lines.push(content.to_string());
        }
    }
    if let Some(hunk) = current {
        hunks.push(hunk);
    }
    hunks
}

fn apply_hunk(content: &str, hunk: &Hunk) -> Result<String> {
    let lines: Vec<&str> = content.lines().collect();

    if hunk.old_lines.is_empty() {
        // Pure insertion into an empty or new file.
        let mut result: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        result.extend(hunk.new_lines.clone());
        return Ok(result.join("\n"));
    }

    let mut found = None;
    for start in 0..=lines.len().saturating_sub(hunk.old_lines.len()) {
        let matches = hunk
            .old_lines
            .iter()
            .enumerate()
            .all(|(i, old)| lines.get(start + i).map(|l| *l == old).unwrap_or(false));
        if matches {
            found = Some(start);
            break;
        }
    }
    let start = found.ok_or_else(|| {
        anyhow::anyhow!("hunk context does not match the current file content")
    })?;

    let mut result: Vec<String> = lines[..start].iter().map(|s| s.to_string()).collect();
    result.extend(hunk.new_lines.clone());
    result.extend(lines[start + hunk.old_lines.len()..].iter().map(|s| s.to_string()));
    Ok(result.join("\n"))
}

#[async_trait]
impl Tool for PatchTool {
    fn name(&self) -> &str {
        "patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to a file. Use for multi-site edits; context lines must match the current file exactly."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to patch, relative to the project root"
                },
                "patch": {
                    "type": "string",
                    "description": "Unified diff content with @@ hunk headers"
                }
            },
            "required": ["path", "patch"]
        })
    }

    fn permission_action(&self) -> Option<&str> {
        Some("patch file")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let raw = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("path is required"))?;
        let patch = args["patch"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("patch is required"))?;
        let path = resolve_path(&ctx.root, raw)?;

        let hunks = parse_hunks(patch);
        if hunks.is_empty() {
            return Ok(ToolOutput::error(
                "no hunks found in patch; expected unified diff format with @@ headers",
            ));
        }

        let had_trailing_newline;
        let mut content = if path.exists() {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {raw}"))?;
            had_trailing_newline = text.ends_with('\n');
            text
        } else {
            had_trailing_newline = true;
            String::new()
        };

        for (i, hunk) in hunks.iter().enumerate() {
            match apply_hunk(&content, hunk) {
                Ok(new_content) => content = new_content,
                Err(err) => {
                    return Ok(ToolOutput::error(format!(
                        "failed to apply hunk {} of {}: {err}",
                        i + 1,
                        hunks.len()
                    )));
                }
            }
        }
        if had_trailing_newline && !content.ends_with('\n') {
            content.push('\n');
        }

        snapshot_file(ctx, &path, Some(&content)).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &content)
            .await
            .with_context(|| format!("Failed to write {raw}"))?;

        Ok(ToolOutput::text(format!(
            "Applied {} hunk(s) to {raw}",
            hunks.len()
        )))
    }
}
