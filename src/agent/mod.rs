//! Agent orchestrator
//!
//! Turns a user message into a completed assistant response: persists the
//! user turn, streams from the provider, persists assistant deltas as
//! they arrive, dispatches tool calls concurrently through the permission
//! gate, and loops until the model stops asking for tools. At most one
//! run is active per session; cancellation is cooperative and leaves the
//! message history well-formed.

pub mod prompt;

pub use prompt::AgentRole;

use crate::bus::Bus;
use crate::config::Config;
use crate::db::Store;
use crate::message::{ContentPart, FinishReason, Message};
use crate::permission::PermissionGate;
use crate::provider::{
    ErrorKind, ProviderError, ProviderRequest, ProviderSource, StopReason, StreamEvent,
};
use crate::tool::diagnostics::{DiagnosticsSource, NullDiagnostics};
use crate::tool::{self, ToolContext, ToolOutput, ToolRegistry};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal outcome of a run, delivered on the event stream.
#[derive(Debug)]
pub enum AgentEvent {
    Response(Message),
    Error(AgentError),
}

#[derive(Debug)]
pub enum AgentError {
    Busy(String),
    SessionNotFound(String),
    Canceled,
    LoopLimit(u32),
    Provider(ProviderError),
    Store(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Busy(id) => write!(f, "session {id} already has a run in flight"),
            AgentError::SessionNotFound(id) => write!(f, "session {id} not found"),
            AgentError::Canceled => write!(f, "request cancelled"),
            AgentError::LoopLimit(n) => write!(f, "exceeded maximum iterations ({n})"),
            AgentError::Provider(e) => write!(f, "provider error: {e}"),
            AgentError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Store(err.to_string())
    }
}

/// A binary attachment on a user turn, passed to vision-capable models.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub mime_type: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

/// Shared state of the orchestrator. The public [`Agent`] and the
/// delegation tool both drive loops through this.
pub struct AgentCore {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub bus: Arc<Bus>,
    pub gate: Arc<PermissionGate>,
    pub providers: Arc<dyn ProviderSource>,
    pub diagnostics: Arc<dyn DiagnosticsSource>,
    /// Session working directory; tools resolve all paths against it.
    pub root: PathBuf,
    active: Mutex<HashMap<String, CancellationToken>>,
}

pub struct Agent {
    core: Arc<AgentCore>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        bus: Arc<Bus>,
        gate: Arc<PermissionGate>,
        providers: Arc<dyn ProviderSource>,
        diagnostics: Option<Arc<dyn DiagnosticsSource>>,
        root: PathBuf,
    ) -> Self {
        Self {
            core: Arc::new(AgentCore {
                config,
                store,
                bus,
                gate,
                providers,
                diagnostics: diagnostics.unwrap_or_else(|| Arc::new(NullDiagnostics)),
                root,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.core.active.lock().contains_key(session_id)
    }

    /// Request cooperative cancellation of any in-flight run.
    pub fn cancel(&self, session_id: &str) {
        if let Some(token) = self.core.active.lock().get(session_id) {
            tracing::info!(session_id, "Cancelling run");
            token.cancel();
        }
    }

    /// Begin inference for a user turn. Returns a finite event stream
    /// terminating in Response or Error. Rejected when the session is
    /// already busy.
    pub fn run(
        &self,
        session_id: &str,
        text: String,
        attachments: Vec<Attachment>,
    ) -> Result<mpsc::Receiver<AgentEvent>, AgentError> {
        let token = {
            let mut active = self.core.active.lock();
            if active.contains_key(session_id) {
                return Err(AgentError::Busy(session_id.to_string()));
            }
            let token = CancellationToken::new();
            active.insert(session_id.to_string(), token.clone());
            token
        };

        let (tx, rx) = mpsc::channel(4);
        let core = self.core.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let result = core
                .run_user_turn(&session_id, text, attachments, token)
                .await;
            core.active.lock().remove(&session_id);
            core.gate.deny_session(&session_id);
            let event = match result {
                Ok(message) => AgentEvent::Response(message),
                Err(err) => {
                    if !matches!(err, AgentError::Canceled) {
                        tracing::error!(session_id = %session_id, error = %err, "Run failed");
                    }
                    AgentEvent::Error(err)
                }
            };
            let _ = tx.send(event).await;
        });
        Ok(rx)
    }
}

/// What one provider stream produced.
struct StreamOutcome {
    stop: Option<StopReason>,
    usage: Option<(u64, u64)>,
    error: Option<ProviderError>,
    canceled: bool,
}

impl AgentCore {
    async fn run_user_turn(
        self: &Arc<Self>,
        session_id: &str,
        text: String,
        attachments: Vec<Attachment>,
        cancel: CancellationToken,
    ) -> Result<Message, AgentError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        let first_turn = session.message_count == 0;

        let mut user = Message::user(session_id, &text);
        for att in attachments {
            user.push_part(ContentPart::Binary {
                mime_type: att.mime_type,
                filename: att.filename,
                data: att.data,
            });
        }
        self.store.create_message(&user).await?;

        if first_turn {
            self.spawn_title_task(session_id, &text);
        }

        let registry = self.registry_for(AgentRole::Primary);
        self.run_loop(session_id, AgentRole::Primary, &registry, cancel)
            .await
    }

    /// Build the tool catalogue for a role. Delegated runs get the
    /// read-only subset: no mutation, no shell, no further delegation.
    pub fn registry_for(self: &Arc<Self>, role: AgentRole) -> ToolRegistry {
        let mut registry = ToolRegistry::new(self.config.limits.clone());
        registry.register(Arc::new(tool::file::ListTool));
        registry.register(Arc::new(tool::file::ViewTool));
        registry.register(Arc::new(tool::search::GrepTool));
        registry.register(Arc::new(tool::file::GlobTool));
        registry.register(Arc::new(tool::diagnostics::DiagnosticsTool::new(
            self.diagnostics.clone(),
        )));
        if role == AgentRole::Primary {
            registry.register(Arc::new(tool::file::WriteTool));
            registry.register(Arc::new(tool::edit::EditTool));
            registry.register(Arc::new(tool::patch::PatchTool));
            registry.register(Arc::new(tool::bash::ShellTool::new(
                self.config.limits.shell_timeout_secs,
            )));
            registry.register(Arc::new(tool::fetch::FetchTool));
            registry.register(Arc::new(tool::delegate::DelegateTool::new(self.clone())));
        }
        registry
    }

    /// The inference loop: provider call, streamed persistence, tool
    /// dispatch, repeat until the model stops asking for tools.
    pub async fn run_loop(
        self: &Arc<Self>,
        session_id: &str,
        role: AgentRole,
        registry: &ToolRegistry,
        cancel: CancellationToken,
    ) -> Result<Message, AgentError> {
        let role_cfg = match role {
            AgentRole::Primary => &self.config.agents.primary,
            AgentRole::Delegated => &self.config.agents.delegated,
        };
        let provider = self
            .providers
            .resolve(&role_cfg.model)
            .map_err(AgentError::Provider)?;
        let model = provider.model().clone();
        let ctx = ToolContext {
            session_id: session_id.to_string(),
            root: self.root.clone(),
            cancel: cancel.clone(),
            gate: self.gate.clone(),
            store: self.store.clone(),
            depth: match role {
                AgentRole::Primary => 0,
                AgentRole::Delegated => 1,
            },
        };

        for iteration in 0..self.config.limits.max_iterations {
            if cancel.is_cancelled() {
                self.write_canceled_stub(session_id, &model.id).await?;
                return Err(AgentError::Canceled);
            }

            let history = self.store.list_messages(session_id).await?;
            let request = ProviderRequest {
                system: prompt::system_prompt(role, &self.root),
                messages: history,
                tools: registry.definitions(),
                max_tokens: role_cfg.max_tokens,
                reasoning_effort: role_cfg.reasoning_effort.clone(),
            };

            tracing::debug!(session_id, iteration, model = %model.id, "Provider call");
            let mut events = match provider.stream(request, cancel.child_token()).await {
                Ok(events) => events,
                Err(err) => {
                    self.write_provider_failure(session_id, &model.id, &err).await?;
                    return Err(AgentError::Provider(err));
                }
            };

            let mut assistant = Message::assistant(session_id, &model.id);
            self.store.create_message(&assistant).await?;

            let outcome = self
                .consume_stream(&mut events, &mut assistant, &cancel)
                .await;

            if let Some((prompt_tokens, completion_tokens)) = outcome.usage {
                self.store
                    .add_usage(
                        session_id,
                        prompt_tokens as i64,
                        completion_tokens as i64,
                        model.cost(prompt_tokens, completion_tokens),
                    )
                    .await?;
            }

            if outcome.canceled {
                self.finalize_canceled(&mut assistant).await?;
                return Err(AgentError::Canceled);
            }

            if let Some(err) = outcome.error {
                assistant.poison_unfinished_tool_calls();
                assistant.append_text(&human_error_text(&err));
                assistant.finish(FinishReason::Error);
                self.store.update_message(&assistant).await?;
                self.write_result_stubs(&assistant, "request failed").await?;
                return Err(AgentError::Provider(err));
            }

            let stop = outcome.stop.unwrap_or_else(|| {
                tracing::warn!(session_id, "Stream ended without a finish reason");
                StopReason::EndTurn
            });

            match stop {
                StopReason::EndTurn | StopReason::MaxTokens => {
                    assistant.poison_unfinished_tool_calls();
                    assistant.finish(match stop {
                        StopReason::MaxTokens => FinishReason::MaxTokens,
                        _ => FinishReason::EndTurn,
                    });
                    self.store.update_message(&assistant).await?;
                    self.write_result_stubs(&assistant, "tool call was aborted").await?;
                    return Ok(assistant);
                }
                StopReason::ToolUse => {
                    assistant.poison_unfinished_tool_calls();
                    let calls = assistant.tool_calls();
                    if calls.is_empty() {
                        tracing::warn!(session_id, "tool_use finish with zero tool calls");
                        assistant.finish(FinishReason::EndTurn);
                        self.store.update_message(&assistant).await?;
                        return Ok(assistant);
                    }
                    assistant.finish(FinishReason::ToolUse);
                    self.store.update_message(&assistant).await?;

                    // One task per call; join_all keeps declaration order.
                    let outputs = futures::future::join_all(calls.iter().map(|call| {
                        let ctx = &ctx;
                        async move {
                            if call.is_error || !call.finished {
                                ToolOutput::error("tool call was aborted")
                            } else {
                                registry.dispatch(call, ctx).await
                            }
                        }
                    }))
                    .await;

                    let mut tool_msg = Message::tool(session_id);
                    for (call, output) in calls.iter().zip(outputs) {
                        tool_msg.push_part(ContentPart::ToolResult {
                            tool_call_id: call.id.clone(),
                            content: output.content,
                            metadata: output.metadata,
                            is_error: output.is_error,
                        });
                    }
                    tool_msg.finished_at = Some(Utc::now());
                    self.store.create_message(&tool_msg).await?;
                }
            }
        }

        let limit = self.config.limits.max_iterations;
        let mut msg = Message::assistant(session_id, &model.id);
        msg.append_text(&format!(
            "Stopped: reached the maximum of {limit} inference iterations without completing."
        ));
        msg.finish(FinishReason::Error);
        self.store.create_message(&msg).await?;
        Err(AgentError::LoopLimit(limit))
    }

    /// Drain the provider event channel into the growing assistant
    /// message, staging a streaming write after every append.
    async fn consume_stream(
        &self,
        events: &mut mpsc::Receiver<StreamEvent>,
        assistant: &mut Message,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let mut outcome = StreamOutcome {
            stop: None,
            usage: None,
            error: None,
            canceled: false,
        };
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.canceled = true;
                    return outcome;
                }
                event = events.recv() => event,
            };
            match event {
                None => return outcome,
                Some(StreamEvent::TextDelta(delta)) => {
                    assistant.append_text(&delta);
                    self.store.write_message_streaming(assistant);
                }
                Some(StreamEvent::ReasoningDelta(delta)) => {
                    assistant.append_reasoning(&delta);
                    self.store.write_message_streaming(assistant);
                }
                Some(StreamEvent::ToolCallStart { id, name }) => {
                    assistant.begin_tool_call(id, name);
                    self.store.write_message_streaming(assistant);
                }
                Some(StreamEvent::ToolCallDelta { id, fragment }) => {
                    assistant.append_tool_input(&id, &fragment);
                    self.store.write_message_streaming(assistant);
                }
                Some(StreamEvent::ToolCallEnd { id }) => {
                    assistant.end_tool_call(&id);
                    self.store.write_message_streaming(assistant);
                }
                Some(StreamEvent::Usage {
                    prompt_tokens,
                    completion_tokens,
                }) => {
                    outcome.usage = Some((prompt_tokens, completion_tokens));
                }
                Some(StreamEvent::Finish(stop)) => {
                    outcome.stop = Some(stop);
                    return outcome;
                }
                Some(StreamEvent::Error(err)) => {
                    outcome.error = Some(err);
                    return outcome;
                }
            }
        }
    }

    /// Preserve what streamed, mark it canceled, and keep the history
    /// well-formed with synthetic tool results plus a final assistant
    /// stub when tool calls were already declared.
    async fn finalize_canceled(&self, assistant: &mut Message) -> Result<(), AgentError> {
        assistant.poison_unfinished_tool_calls();
        assistant.finish(FinishReason::Canceled);
        self.store.update_message(assistant).await?;
        let had_calls = !assistant.tool_calls().is_empty();
        self.write_result_stubs(assistant, "request cancelled").await?;
        if had_calls {
            self.write_canceled_stub(&assistant.session_id, assistant.model.as_deref().unwrap_or(""))
                .await?;
        }
        Ok(())
    }

    /// Write a tool-role message carrying one synthetic error result per
    /// declared tool call, so every call id pairs with a result even
    /// when nothing ran.
    async fn write_result_stubs(
        &self,
        assistant: &Message,
        content: &str,
    ) -> Result<(), AgentError> {
        let calls = assistant.tool_calls();
        if calls.is_empty() {
            return Ok(());
        }
        let mut tool_msg = Message::tool(&assistant.session_id);
        for call in calls {
            tool_msg.push_part(ContentPart::ToolResult {
                tool_call_id: call.id,
                content: content.to_string(),
                metadata: None,
                is_error: true,
            });
        }
        tool_msg.finished_at = Some(Utc::now());
        self.store.create_message(&tool_msg).await?;
        Ok(())
    }

    /// Terminal assistant message for a cancelled run, keeping the
    /// user -> (assistant -> tool)* -> assistant alternation valid.
    async fn write_canceled_stub(&self, session_id: &str, model: &str) -> Result<(), AgentError> {
        let mut stub = Message::assistant(session_id, model);
        stub.finish(FinishReason::Canceled);
        self.store.create_message(&stub).await?;
        Ok(())
    }

    async fn write_provider_failure(
        &self,
        session_id: &str,
        model: &str,
        err: &ProviderError,
    ) -> Result<(), AgentError> {
        let mut msg = Message::assistant(session_id, model);
        msg.append_text(&human_error_text(err));
        msg.finish(FinishReason::Error);
        self.store.create_message(&msg).await?;
        Ok(())
    }

    /// Fire-and-forget title generation on the first user message.
    /// Failure leaves the title unchanged and never disturbs the run.
    fn spawn_title_task(self: &Arc<Self>, session_id: &str, text: &str) {
        let core = self.clone();
        let session_id = session_id.to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(err) = core.generate_title(&session_id, &text).await {
                tracing::debug!(session_id = %session_id, error = %err, "Title generation failed");
            }
        });
    }

    async fn generate_title(&self, session_id: &str, text: &str) -> anyhow::Result<()> {
        let cfg = &self.config.agents.title;
        let provider = self
            .providers
            .resolve(&cfg.model)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let request = ProviderRequest {
            system: prompt::TITLE_PROMPT.to_string(),
            messages: vec![Message::user(session_id, text)],
            tools: Vec::new(),
            max_tokens: cfg.max_tokens,
            reasoning_effort: None,
        };
        let reply = provider
            .send(request)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let title = tidy_title(&reply.text());
        if !title.is_empty() {
            self.store.update_session_title(session_id, &title).await?;
        }
        Ok(())
    }
}

fn tidy_title(raw: &str) -> String {
    let flat = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut title: String = flat.chars().take(50).collect();
    if flat.chars().count() > 50 {
        title.push('…');
    }
    title
}

fn human_error_text(err: &ProviderError) -> String {
    match err.kind {
        ErrorKind::Auth => {
            "The provider rejected the configured credentials. Check your API key.".to_string()
        }
        ErrorKind::ContextOverflow => {
            "The conversation no longer fits the model's context window. Start a fresh session."
                .to_string()
        }
        ErrorKind::NotFound => format!("The requested model is not available: {}", err.message),
        _ => format!("The provider request failed: {}", err.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tidy_title_flattens_and_caps() {
        assert_eq!(tidy_title("  Fix \n the   bug "), "Fix the bug");
        let long = "a".repeat(80);
        let tidied = tidy_title(&long);
        assert_eq!(tidied.chars().count(), 51);
        assert!(tidied.ends_with('…'));
    }

    #[test]
    fn human_error_text_is_actionable() {
        let auth = ProviderError::new(ErrorKind::Auth, "401");
        assert!(human_error_text(&auth).contains("API key"));
        let overflow = ProviderError::new(ErrorKind::ContextOverflow, "too long");
        assert!(human_error_text(&overflow).contains("fresh session"));
    }
}
