//! Tool system
//!
//! Tools are the executable capabilities the model can invoke. The
//! registry owns the semantics every call shares: permission gating,
//! the hard deadline, output truncation, and the unknown-tool /
//! bad-arguments fallbacks. Individual tools only implement their own
//! behaviour.

pub mod bash;
pub mod delegate;
pub mod diagnostics;
pub mod edit;
pub mod fetch;
pub mod file;
pub mod patch;
pub mod search;

use crate::config::Limits;
use crate::db::Store;
use crate::message::ToolInvocation;
use crate::permission::PermissionGate;
use crate::provider::ToolDefinition;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a tool execution may touch: the session it acts for, the
/// session root all paths are resolved against, the run's cancellation
/// token, the permission gate, and the store for file-version snapshots.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub root: PathBuf,
    pub cancel: CancellationToken,
    pub gate: Arc<PermissionGate>,
    pub store: Arc<Store>,
    /// Delegation depth of the run this tool executes in.
    pub depth: u8,
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub metadata: Option<Value>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: None,
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: None,
            is_error: true,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name, lowercase with underscores.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the parameters.
    fn parameters(&self) -> Value;

    /// Action label when the tool mutates external state and must pass
    /// the permission gate; `None` for read-only tools.
    fn permission_action(&self) -> Option<&str> {
        None
    }

    /// The subject recorded with an approval, usually the target path.
    fn permission_subject(&self, args: &Value) -> Option<String> {
        args["path"].as_str().map(|s| s.to_string())
    }

    /// Hard deadline for one call.
    fn timeout(&self, limits: &Limits) -> Duration {
        Duration::from_secs(limits.tool_timeout_secs)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Name-keyed tool map plus the shared call semantics.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    limits: Limits,
}

impl ToolRegistry {
    pub fn new(limits: Limits) -> Self {
        Self {
            tools: Vec::new(),
            limits,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool descriptors for the provider request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Execute one declared tool call under the shared semantics.
    /// Never fails: every failure mode becomes an `is_error` output fed
    /// back to the model.
    pub async fn dispatch(&self, call: &ToolInvocation, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.get(&call.name) else {
            tracing::warn!(tool = %call.name, "Model requested unknown tool");
            return ToolOutput::error(format!(
                "unknown tool: {}. Available tools: {}",
                call.name,
                self.names().join(", ")
            ));
        };

        let args: Value = match serde_json::from_str(&call.input) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "Bad tool arguments");
                return ToolOutput::error(format!("bad arguments: {err}"));
            }
        };

        if let Some(action) = tool.permission_action() {
            let subject = tool.permission_subject(&args);
            let decision = ctx
                .gate
                .request(
                    &ctx.session_id,
                    tool.name(),
                    action,
                    args.clone(),
                    subject,
                    &ctx.cancel,
                )
                .await;
            match decision {
                Ok(d) if d.allowed() => {}
                Ok(_) => return ToolOutput::error("permission denied"),
                Err(err) => return ToolOutput::error(format!("permission check failed: {err}")),
            }
        }

        let deadline = tool.timeout(&self.limits);
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return ToolOutput::error("request cancelled"),
            result = tokio::time::timeout(deadline, tool.execute(args, ctx)) => result,
        };

        let mut output = match result {
            Err(_) => ToolOutput::error("timeout"),
            Ok(Err(err)) => ToolOutput::error(err.to_string()),
            Ok(Ok(output)) => output,
        };
        truncate_in_place(&mut output.content, self.limits.tool_output_limit);
        output
    }
}

/// Resolve a model-supplied path against the session root, rejecting
/// anything that escapes it. Purely lexical so targets need not exist.
pub fn resolve_path(root: &Path, raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    anyhow::bail!("path escapes session root: {raw}");
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if !normalized.starts_with(root) {
        anyhow::bail!("path escapes session root: {raw}");
    }
    Ok(normalized)
}

const TRUNCATION_MARKER: &str = "\n[output truncated]";

fn truncate_in_place(content: &mut String, limit: usize) {
    if content.len() <= limit {
        return;
    }
    let mut end = limit;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    content.truncate(end);
    content.push_str(TRUNCATION_MARKER);
}

/// Record a file-version snapshot, capturing the pre-existing on-disk
/// content as the `initial` version the first time a session touches a
/// path.
pub(crate) async fn snapshot_file(
    ctx: &ToolContext,
    path: &Path,
    new_content: Option<&str>,
) -> Result<()> {
    let key = path.display().to_string();
    if !ctx.store.has_file_version(&ctx.session_id, &key).await? {
        let on_disk = tokio::fs::read_to_string(path).await.unwrap_or_default();
        ctx.store
            .create_file_version(&ctx.session_id, &key, &on_disk)
            .await?;
    }
    if let Some(content) = new_content {
        ctx.store
            .create_file_version(&ctx.session_id, &key, content)
            .await?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_keeps_children_of_root() {
        let root = Path::new("/work/project");
        assert_eq!(
            resolve_path(root, "src/main.rs").unwrap(),
            PathBuf::from("/work/project/src/main.rs")
        );
        assert_eq!(
            resolve_path(root, "./src/../src/lib.rs").unwrap(),
            PathBuf::from("/work/project/src/lib.rs")
        );
    }

    #[test]
    fn resolve_path_rejects_escapes() {
        let root = Path::new("/work/project");
        assert!(resolve_path(root, "../secrets").is_err());
        assert!(resolve_path(root, "/etc/passwd").is_err());
        assert!(resolve_path(root, "src/../../other").is_err());
    }

    #[test]
    fn truncation_appends_marker() {
        let mut s = "x".repeat(100);
        truncate_in_place(&mut s, 10);
        assert!(s.starts_with("xxxxxxxxxx"));
        assert!(s.ends_with(TRUNCATION_MARKER));

        let mut short = "hello".to_string();
        truncate_in_place(&mut short, 10);
        assert_eq!(short, "hello");
    }

    #[tokio::test]
    async fn dispatch_reports_unknown_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_support::context(tmp.path()).await;
        let registry = ToolRegistry::new(Limits::default());
        let call = ToolInvocation {
            id: "T1".into(),
            name: "does_not_exist".into(),
            input: "{}".into(),
            finished: true,
            is_error: false,
        };
        let output = registry.dispatch(&call, &ctx).await;
        assert!(output.is_error);
        assert!(output.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn dispatch_reports_bad_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_support::context(tmp.path()).await;
        let mut registry = ToolRegistry::new(Limits::default());
        registry.register(Arc::new(file::ListTool));
        let call = ToolInvocation {
            id: "T1".into(),
            name: "list".into(),
            input: "{\"path\": tru".into(),
            finished: true,
            is_error: false,
        };
        let output = registry.dispatch(&call, &ctx).await;
        assert!(output.is_error);
        assert!(output.content.contains("bad arguments"));
    }
}
