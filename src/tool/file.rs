//! File tools: list, view, glob, write

use super::{resolve_path, snapshot_file, Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ignore::WalkBuilder;
use serde_json::{json, Value};
use tokio::fs;

const LIST_LIMIT: usize = 500;
const GLOB_LIMIT: usize = 200;

/// Formatted tree listing of a directory.
pub struct ListTool;

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List files and directories under a path as an indented tree. Respects .gitignore."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, relative to the project root (default: the root)"
                },
                "ignore": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Glob patterns to exclude from the listing"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let raw = args["path"].as_str().unwrap_or(".");
        let dir = resolve_path(&ctx.root, raw)?;
        let ignores: Vec<glob::Pattern> = args["ignore"]
            .as_array()
            .map(|patterns| {
                patterns
                    .iter()
                    .filter_map(|p| p.as_str())
                    .filter_map(|p| glob::Pattern::new(p).ok())
                    .collect()
            })
            .unwrap_or_default();

        let mut lines = Vec::new();
        let walker = WalkBuilder::new(&dir).hidden(false).git_ignore(true).build();
        for entry in walker {
            if lines.len() >= LIST_LIMIT {
                break;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            if path == dir.as_path() {
                continue;
            }
            let rel = path.strip_prefix(&dir).unwrap_or(path);
            if ignores.iter().any(|p| p.matches_path(rel)) {
                continue;
            }
            let depth = rel.components().count().saturating_sub(1);
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let suffix = if is_dir { "/" } else { "" };
            lines.push(format!("{}{}{}", "  ".repeat(depth), name, suffix));
        }

        let truncated = lines.len() >= LIST_LIMIT;
        let count = lines.len();
        Ok(ToolOutput::text(lines.join("\n"))
            .with_metadata(json!({ "count": count, "truncated": truncated })))
    }
}

/// Read file contents with line numbers.
pub struct ViewTool;

#[async_trait]
impl Tool for ViewTool {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "Read a file. Output is numbered lines; use offset and limit for large files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to read, relative to the project root"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let raw = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("path is required"))?;
        let path = resolve_path(&ctx.root, raw)?;
        let offset = args["offset"].as_u64().map(|n| n as usize);
        let limit = args["limit"].as_u64().map(|n| n as usize);

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {raw}"))?;
        snapshot_file(ctx, &path, None).await?;

        let lines: Vec<&str> = content.lines().collect();
        let start = offset.map(|o| o.saturating_sub(1)).unwrap_or(0).min(lines.len());
        let end = limit
            .map(|l| (start + l).min(lines.len()))
            .unwrap_or(lines.len());

        let numbered: String = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:4} | {}", start + i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput::text(numbered)
            .with_metadata(json!({ "total_lines": lines.len(), "read_lines": end - start })))
    }
}

/// Find files matching a glob pattern, newest first.
pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern (e.g. **/*.rs). Results are ordered by modification time, newest first."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The glob pattern to match"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search under (default: the project root)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let pattern = args["pattern"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("pattern is required"))?;
        let base = resolve_path(&ctx.root, args["path"].as_str().unwrap_or("."))?;

        let full_pattern = base.join(pattern).display().to_string();
        let mut matches: Vec<(std::time::SystemTime, String)> = Vec::new();
        for entry in glob::glob(&full_pattern).context("Invalid glob pattern")? {
            let Ok(path) = entry else { continue };
            let mtime = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            let rel = path
                .strip_prefix(&ctx.root)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| path.display().to_string());
            matches.push((mtime, rel));
            if matches.len() >= GLOB_LIMIT * 4 {
                break;
            }
        }
        matches.sort_by(|a, b| b.0.cmp(&a.0));
        matches.truncate(GLOB_LIMIT);

        let count = matches.len();
        let output = matches
            .into_iter()
            .map(|(_, path)| path)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutput::text(output).with_metadata(json!({ "count": count })))
    }
}

/// Write content to a file, recording before/after versions.
pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it doesn't exist, or overwrites it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to write, relative to the project root"
                },
                "content": {
                    "type": "string",
                    "description": "The full content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn permission_action(&self) -> Option<&str> {
        Some("write file")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let raw = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("path is required"))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("content is required"))?;
        let path = resolve_path(&ctx.root, raw)?;

        snapshot_file(ctx, &path, Some(content)).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {raw}"))?;

        Ok(ToolOutput::text(format!("Wrote {} bytes to {raw}", content.len())))
    }
}
