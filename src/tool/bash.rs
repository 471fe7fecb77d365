//! Shell tool: execute commands in the session's working directory

use super::{Tool, ToolContext, ToolOutput};
use crate::config::Limits;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Execute shell commands. Runs `bash -c` in the session root with a
/// non-interactive environment; prompts for credentials fail fast
/// instead of hanging the run.
pub struct ShellTool {
    /// Per-call time limit when the model does not pass `timeout_ms`,
    /// from `limits.shell_timeout_secs`.
    default_timeout_secs: u64,
}

impl ShellTool {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout_secs,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the project root. Returns stdout and stderr with the exit code."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Per-call time limit in milliseconds (defaults to the configured shell timeout)"
                }
            },
            "required": ["command"]
        })
    }

    fn permission_action(&self) -> Option<&str> {
        Some("run command")
    }

    /// Approvals are keyed by the program being run, so "allow for
    /// session" covers repeated invocations of the same binary.
    fn permission_subject(&self, args: &Value) -> Option<String> {
        args["command"]
            .as_str()
            .and_then(|c| c.split_whitespace().next())
            .map(|s| s.to_string())
    }

    fn timeout(&self, limits: &Limits) -> Duration {
        // The per-call limit below governs; the outer deadline is a
        // backstop for pathological cases.
        Duration::from_secs(limits.tool_timeout_secs)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("command is required"))?;
        let limit = args["timeout_ms"]
            .as_u64()
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(self.default_timeout_secs));

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&ctx.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("SUDO_ASKPASS", "/bin/false")
            .env("SSH_ASKPASS", "/bin/false");

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(ToolOutput::error("request cancelled")),
            result = timeout(limit, cmd.output()) => result,
        };

        match result {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);

                let combined = if stderr.is_empty() {
                    stdout.to_string()
                } else if stdout.is_empty() {
                    stderr.to_string()
                } else {
                    format!("{stdout}\n--- stderr ---\n{stderr}")
                };

                Ok(ToolOutput {
                    content: combined,
                    metadata: Some(json!({ "exit_code": exit_code })),
                    is_error: !output.status.success(),
                })
            }
            Ok(Err(err)) => Ok(ToolOutput::error(format!("failed to execute: {err}"))),
            Err(_) => Ok(ToolOutput::error("timeout")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::test_support::context;

    #[tokio::test]
    async fn shell_captures_output_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path()).await;
        let out = ShellTool::new(30)
            .execute(json!({"command": "echo hello"}), &ctx)
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("hello"));
        assert_eq!(out.metadata.unwrap()["exit_code"], 0);
    }

    #[tokio::test]
    async fn shell_runs_in_session_root() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("marker.txt"), "").unwrap();
        let ctx = context(tmp.path()).await;
        let out = ShellTool::new(30)
            .execute(json!({"command": "ls"}), &ctx)
            .await
            .unwrap();
        assert!(out.content.contains("marker.txt"));
    }

    #[tokio::test]
    async fn shell_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path()).await;
        let out = ShellTool::new(30)
            .execute(json!({"command": "sleep 5", "timeout_ms": 50}), &ctx)
            .await
            .unwrap();
        assert!(out.is_error);
        assert_eq!(out.content, "timeout");
    }

    #[tokio::test]
    async fn shell_uses_configured_default_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path()).await;
        let out = ShellTool::new(1)
            .execute(json!({"command": "sleep 5"}), &ctx)
            .await
            .unwrap();
        assert!(out.is_error);
        assert_eq!(out.content, "timeout");
    }

    #[tokio::test]
    async fn shell_honours_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path()).await;
        ctx.cancel.cancel();
        let out = ShellTool::new(30)
            .execute(json!({"command": "sleep 5"}), &ctx)
            .await
            .unwrap();
        assert!(out.is_error);
        assert_eq!(out.content, "request cancelled");
    }

    #[test]
    fn permission_subject_is_the_program() {
        let subject =
            ShellTool::new(30).permission_subject(&json!({"command": "cargo build --release"}));
        assert_eq!(subject.as_deref(), Some("cargo"));
    }
}
