//! Delegation tool: run a sub-agent as a tool call
//!
//! Execution spawns a bounded inference loop in a child session with a
//! read-only tool catalogue (no shell, no mutation, no further
//! delegation) and returns the child's final assistant text. The child's
//! cancellation token derives from the parent run's, and its usage is
//! added to the parent session's counters on completion.

use super::{Tool, ToolContext, ToolOutput};
use crate::agent::{AgentCore, AgentRole};
use crate::message::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Delegation is capped at one level: a delegated run may not delegate
/// again.
const MAX_DEPTH: u8 = 1;

pub struct DelegateTool {
    core: Arc<AgentCore>,
}

impl DelegateTool {
    pub fn new(core: Arc<AgentCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Hand a self-contained research task to a read-only sub-agent and get its findings back. Use for broad searches that would clutter the main conversation."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "A complete description of the subtask, including what to report back"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let task = args["task"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("task is required"))?;
        if ctx.depth >= MAX_DEPTH {
            return Ok(ToolOutput::error("delegation depth exceeded"));
        }

        let child = self
            .core
            .store
            .create_session(Some(&ctx.session_id))
            .await
            .context("Failed to create child session")?;
        tracing::info!(parent = %ctx.session_id, child = %child.id, "Delegating subtask");

        self.core
            .store
            .create_message(&Message::user(&child.id, task))
            .await?;

        let registry = self.core.registry_for(AgentRole::Delegated);
        let result = self
            .core
            .run_loop(&child.id, AgentRole::Delegated, &registry, ctx.cancel.child_token())
            .await;

        // Whatever happened, roll the child's usage into the parent.
        if let Some(child_session) = self.core.store.get_session(&child.id).await? {
            self.core
                .store
                .add_usage(
                    &ctx.session_id,
                    child_session.prompt_tokens,
                    child_session.completion_tokens,
                    child_session.cost,
                )
                .await?;
        }

        match result {
            Ok(message) => Ok(ToolOutput::text(message.text())
                .with_metadata(json!({ "session_id": child.id }))),
            Err(err) => Ok(ToolOutput::error(format!("subtask failed: {err}"))),
        }
    }
}
