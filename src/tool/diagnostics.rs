//! Diagnostics tool
//!
//! Surfaces language-server diagnostics to the model. The language-server
//! clients themselves are external collaborators: the tool consumes
//! whatever [`DiagnosticsSource`] it is wired with, and a null source is
//! used when none is available.

use super::{resolve_path, Tool, ToolContext, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Hint,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Hint => "hint",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub path: String,
    pub line: u32,
    pub severity: Severity,
    pub message: String,
}

/// Where diagnostics come from. Wired at startup; the core never talks
/// to a language server directly.
#[async_trait]
pub trait DiagnosticsSource: Send + Sync {
    async fn diagnostics(&self, path: &Path) -> Result<Vec<Diagnostic>>;
}

/// Source used when no language server integration is configured.
pub struct NullDiagnostics;

#[async_trait]
impl DiagnosticsSource for NullDiagnostics {
    async fn diagnostics(&self, _path: &Path) -> Result<Vec<Diagnostic>> {
        Ok(Vec::new())
    }
}

pub struct DiagnosticsTool {
    source: Arc<dyn DiagnosticsSource>,
}

impl DiagnosticsTool {
    pub fn new(source: Arc<dyn DiagnosticsSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for DiagnosticsTool {
    fn name(&self) -> &str {
        "diagnostics"
    }

    fn description(&self) -> &str {
        "Report language-server errors and warnings for a file or directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File or directory to check, relative to the project root"
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

        let diagnostics = self.source.diagnostics(&path).await?;
        if diagnostics.is_empty() {
            return Ok(ToolOutput::text("no diagnostics reported"));
        }
        let errors = diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count();
        let lines: Vec<String> = diagnostics
            .iter()
            .map(|d| format!("{}:{}: {}: {}", d.path, d.line, d.severity.label(), d.message))
            .collect();
        Ok(ToolOutput::text(lines.join("\n"))
            .with_metadata(json!({ "count": diagnostics.len(), "errors": errors })))
    }
}
