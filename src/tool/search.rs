//! Search tools: grep

use super::{resolve_path, Tool, ToolContext, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use serde_json::{json, Value};

const MATCH_LIMIT: usize = 100;

/// Search file contents for a pattern.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search for a regex pattern in files. Returns matches as file:line: text. Respects .gitignore."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory or file to search under (default: the project root)"
                },
                "include": {
                    "type": "string",
                    "description": "Glob pattern to restrict which files are searched (e.g. *.rs)"
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
        let include = args["include"]
            .as_str()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| anyhow::anyhow!("bad include pattern: {e}"))?;

        let regex = Regex::new(pattern).map_err(|e| anyhow::anyhow!("bad pattern: {e}"))?;

        let mut results = Vec::new();
        let walker = WalkBuilder::new(&base).hidden(false).git_ignore(true).build();
        'outer: for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            if let Some(include) = &include {
                let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                if !include.matches(&name) && !include.matches_path(path) {
                    continue;
                }
            }
            let Ok(content) = tokio::fs::read_to_string(path).await else {
                continue;
            };
            let rel = path.strip_prefix(&ctx.root).unwrap_or(path);
            for (line_num, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    results.push(format!("{}:{}: {}", rel.display(), line_num + 1, line.trim()));
                    if results.len() >= MATCH_LIMIT {
                        break 'outer;
                    }
                }
            }
        }

        let truncated = results.len() >= MATCH_LIMIT;
        let count = results.len();
        Ok(ToolOutput::text(results.join("\n"))
            .with_metadata(json!({ "count": count, "truncated": truncated })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::test_support::context;

    #[tokio::test]
    async fn grep_reports_file_line_matches() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "fn main() {}\nlet x = 1;\n").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "fn not_rust\n").unwrap();
        let ctx = context(tmp.path()).await;

        let out = GrepTool
            .execute(json!({"pattern": "fn \\w+", "include": "*.rs"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.content, "a.rs:1: fn main() {}");
    }

    #[tokio::test]
    async fn grep_rejects_invalid_regex() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path()).await;
        let result = GrepTool.execute(json!({"pattern": "(unclosed"}), &ctx).await;
        assert!(result.is_err());
    }
}
