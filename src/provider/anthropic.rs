//! Anthropic provider using the native Messages API
//!
//! Uses the vendor's own wire format, not an OpenAI-compatible shim:
//! system prompt as a top-level field, tool results inside user messages,
//! thinking blocks replayed on later turns.
//! Reference: https://docs.anthropic.com/en/api/messages

use super::{
    classify_status, preview, with_retry, Model, Provider, ProviderError, ProviderRequest,
    StopReason, StreamEvent,
};
use crate::message::{ContentPart, Message, Role};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: Model,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api_key", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .field("model", &self.model.id)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>, model: Model) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model,
        }
    }

    /// Transcode canonical messages into the Messages API shape.
    /// Consecutive same-role messages are merged because the API requires
    /// strict user/assistant alternation.
    fn convert_messages(&self, messages: &[Message]) -> Vec<Value> {
        let mut api_messages: Vec<(String, Vec<Value>)> = Vec::new();

        for msg in messages {
            let (role, blocks) = match msg.role {
                Role::System => continue,
                Role::User => ("user", self.user_blocks(msg)),
                Role::Assistant => ("assistant", self.assistant_blocks(msg)),
                Role::Tool => ("user", tool_result_blocks(msg)),
            };
            if blocks.is_empty() {
                continue;
            }
            match api_messages.last_mut() {
                Some((last_role, last_blocks)) if last_role.as_str() == role => {
                    last_blocks.extend(blocks);
                }
                _ => api_messages.push((role.to_string(), blocks)),
            }
        }

        api_messages
            .into_iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect()
    }

    fn user_blocks(&self, msg: &Message) -> Vec<Value> {
        let mut blocks = Vec::new();
        for part in &msg.parts {
            match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                ContentPart::Binary {
                    mime_type,
                    filename,
                    data,
                } => {
                    if self.model.supports_vision && mime_type.starts_with("image/") {
                        blocks.push(json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": mime_type,
                                "data": BASE64.encode(data),
                            }
                        }));
                    } else {
                        blocks.push(json!({
                            "type": "text",
                            "text": attachment_placeholder(filename.as_deref(), mime_type),
                        }));
                    }
                }
                _ => {}
            }
        }
        blocks
    }

    fn assistant_blocks(&self, msg: &Message) -> Vec<Value> {
        let mut blocks = Vec::new();
        for part in &msg.parts {
            match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                ContentPart::Reasoning { text }
                    if self.model.replay_reasoning && !text.is_empty() =>
                {
                    blocks.push(json!({ "type": "thinking", "thinking": text }));
                }
                ContentPart::ToolCall {
                    id,
                    name,
                    input,
                    is_error: false,
                    ..
                } => {
                    let parsed: Value =
                        serde_json::from_str(input).unwrap_or_else(|_| json!({ "raw": input }));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": parsed,
                    }));
                }
                _ => {}
            }
        }
        blocks
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model.id,
            "max_tokens": request.max_tokens.unwrap_or(self.model.default_max_tokens),
            "messages": self.convert_messages(&request.messages),
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        if self.model.supports_reasoning {
            if let Some(effort) = request.reasoning_effort.as_deref() {
                body["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": thinking_budget(effort),
                });
            }
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }
        Ok(response)
    }
}

fn tool_result_blocks(msg: &Message) -> Vec<Value> {
    msg.parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content,
                "is_error": is_error,
            })),
            _ => None,
        })
        .collect()
}

fn attachment_placeholder(filename: Option<&str>, mime_type: &str) -> String {
    match filename {
        Some(name) => format!("[attachment omitted: {name}]"),
        None => format!("[attachment omitted: {mime_type}]"),
    }
}

fn thinking_budget(effort: &str) -> u32 {
    match effort {
        "low" => 2_048,
        "high" => 16_384,
        _ => 8_192,
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Incremental decoder for the Messages streaming protocol. Fed one SSE
/// `data:` payload at a time; returns the canonical events it yields.
#[derive(Default)]
struct StreamDecoder {
    blocks: HashMap<u64, (BlockKind, String)>,
    stop_reason: Option<StopReason>,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl StreamDecoder {
    fn handle_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        match value["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(n) = value["message"]["usage"]["input_tokens"].as_u64() {
                    self.prompt_tokens = n;
                }
            }
            "content_block_start" => {
                let index = value["index"].as_u64().unwrap_or(0);
                let block = &value["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "tool_use" => {
                        let id = block["id"].as_str().unwrap_or("").to_string();
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        self.blocks.insert(index, (BlockKind::ToolUse, id.clone()));
                        events.push(StreamEvent::ToolCallStart { id, name });
                    }
                    "thinking" => {
                        self.blocks.insert(index, (BlockKind::Thinking, String::new()));
                    }
                    _ => {
                        self.blocks.insert(index, (BlockKind::Text, String::new()));
                    }
                }
            }
            "content_block_delta" => {
                let index = value["index"].as_u64().unwrap_or(0);
                let delta = &value["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            events.push(StreamEvent::TextDelta(text.to_string()));
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta["thinking"].as_str() {
                            events.push(StreamEvent::ReasoningDelta(text.to_string()));
                        }
                    }
                    "input_json_delta" => {
                        if let Some((BlockKind::ToolUse, id)) = self.blocks.get(&index) {
                            if let Some(fragment) = delta["partial_json"].as_str() {
                                events.push(StreamEvent::ToolCallDelta {
                                    id: id.clone(),
                                    fragment: fragment.to_string(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = value["index"].as_u64().unwrap_or(0);
                if let Some((BlockKind::ToolUse, id)) = self.blocks.remove(&index) {
                    events.push(StreamEvent::ToolCallEnd { id });
                }
            }
            "message_delta" => {
                if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(map_stop_reason(reason));
                }
                if let Some(n) = value["usage"]["output_tokens"].as_u64() {
                    self.completion_tokens = n;
                }
            }
            "message_stop" => {
                events.push(StreamEvent::Usage {
                    prompt_tokens: self.prompt_tokens,
                    completion_tokens: self.completion_tokens,
                });
                events.push(StreamEvent::Finish(
                    self.stop_reason.unwrap_or(StopReason::EndTurn),
                ));
            }
            "error" => {
                let message = value["error"]["message"].as_str().unwrap_or("stream error");
                let kind = value["error"]["type"].as_str().unwrap_or("");
                let err = if kind == "overloaded_error" {
                    ProviderError::transport(message)
                } else {
                    ProviderError::new(super::ErrorKind::Api, message)
                };
                events.push(StreamEvent::Error(err));
            }
            _ => {}
        }
        events
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn model(&self) -> &Model {
        &self.model
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let body = self.build_body(&request, true);
        tracing::debug!(model = %self.model.id, messages = request.messages.len(), "Anthropic streaming request");

        let response = with_retry("anthropic.stream", || self.post(&body)).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut decoder = StreamDecoder::default();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = byte_stream.next() => chunk,
                };
                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(StreamEvent::Error(ProviderError::transport(e.to_string())))
                            .await;
                        break;
                    }
                    None => break,
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    for event in decoder.handle_data(data) {
                        let fatal = matches!(event, StreamEvent::Error(_));
                        if tx.send(event).await.is_err() || fatal {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, request: ProviderRequest) -> Result<Message, ProviderError> {
        let body = self.build_body(&request, false);
        tracing::debug!(model = %self.model.id, "Anthropic request");

        let response = with_retry("anthropic.send", || self.post(&body)).await?;
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;
        let value: Value = serde_json::from_str(&text).map_err(|_| {
            ProviderError::new(
                super::ErrorKind::Api,
                format!("Unparseable response: {}", preview(&text, 200)),
            )
        })?;

        let session_id = request
            .messages
            .first()
            .map(|m| m.session_id.clone())
            .unwrap_or_default();
        let mut message = Message::assistant(session_id, &self.model.id);
        if let Some(blocks) = value["content"].as_array() {
            for block in blocks {
                match block["type"].as_str().unwrap_or("") {
                    "text" => {
                        if let Some(t) = block["text"].as_str() {
                            message.append_text(t);
                        }
                    }
                    "thinking" => {
                        if let Some(t) = block["thinking"].as_str() {
                            message.append_reasoning(t);
                        }
                    }
                    "tool_use" => {
                        let id = block["id"].as_str().unwrap_or("").to_string();
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        message.begin_tool_call(&id, name);
                        message.append_tool_input(
                            &id,
                            &serde_json::to_string(&block["input"]).unwrap_or_default(),
                        );
                        message.end_tool_call(&id);
                    }
                    _ => {}
                }
            }
        }
        Ok(message)
    }
}
