//! OpenAI provider using the Chat Completions API
//!
//! Also serves OpenAI-compatible vendors through the base-url override.
//! Tool-call arguments stream as fragments keyed by choice index; the
//! decoder maps indices back to call ids and leaves assembly to the core.

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

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: Model,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api_key", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .field("model", &self.model.id)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>, model: Model) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model,
        }
    }

    fn convert_messages(&self, system: &str, messages: &[Message]) -> Vec<Value> {
        let mut result = Vec::new();
        if !system.is_empty() {
            result.push(json!({ "role": "system", "content": system }));
        }
        for msg in messages {
            match msg.role {
                Role::System => {
                    let text = msg.text();
                    if !text.is_empty() {
                        result.push(json!({ "role": "system", "content": text }));
                    }
                }
                Role::User => result.push(self.user_message(msg)),
                Role::Assistant => {
                    if let Some(converted) = self.assistant_message(msg) {
                        result.push(converted);
                    }
                }
                Role::Tool => {
                    for part in &msg.parts {
                        if let ContentPart::ToolResult {
                            tool_call_id,
                            content,
                            ..
                        } = part
                        {
                            result.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id,
                                "content": content,
                            }));
                        }
                    }
                }
            }
        }
        result
    }

    fn user_message(&self, msg: &Message) -> Value {
        let has_image = msg.parts.iter().any(|p| {
            matches!(p, ContentPart::Binary { mime_type, .. } if mime_type.starts_with("image/"))
        });
        if !has_image || !self.model.supports_vision {
            let mut text = msg.text();
            for part in &msg.parts {
                if let ContentPart::Binary {
                    filename, mime_type, ..
                } = part
                {
                    let placeholder = match filename.as_deref() {
                        Some(name) => format!("[attachment omitted: {name}]"),
                        None => format!("[attachment omitted: {mime_type}]"),
                    };
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&placeholder);
                }
            }
            return json!({ "role": "user", "content": text });
        }

        let mut blocks = Vec::new();
        for part in &msg.parts {
            match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                ContentPart::Binary {
                    mime_type, data, ..
                } if mime_type.starts_with("image/") => {
                    blocks.push(json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", mime_type, BASE64.encode(data)),
                        }
                    }));
                }
                _ => {}
            }
        }
        json!({ "role": "user", "content": blocks })
    }

    fn assistant_message(&self, msg: &Message) -> Option<Value> {
        let text = msg.text();
        let tool_calls: Vec<Value> = msg
            .tool_calls()
            .into_iter()
            .filter(|c| !c.is_error)
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.input },
                })
            })
            .collect();

        if text.is_empty() && tool_calls.is_empty() {
            return None;
        }
        let mut message = json!({ "role": "assistant" });
        if !text.is_empty() {
            message["content"] = json!(text);
        }
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }
        Some(message)
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model.id,
            "messages": self.convert_messages(&request.system, &request.messages),
        });
        if let Some(max) = request.max_tokens {
            body["max_completion_tokens"] = json!(max);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if self.model.supports_reasoning {
            if let Some(effort) = request.reasoning_effort.as_deref() {
                body["reasoning_effort"] = json!(effort);
            }
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
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

/// Incremental decoder for the Chat Completions streaming protocol.
#[derive(Default)]
struct StreamDecoder {
    /// Tool-call ids keyed by the vendor's per-message call index.
    call_ids: HashMap<u64, String>,
    open_calls: Vec<String>,
    stop_reason: Option<StopReason>,
    prompt_tokens: u64,
    completion_tokens: u64,
    done: bool,
}

impl StreamDecoder {
    fn handle_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if data == "[DONE]" {
            if !self.done {
                self.done = true;
                events.push(StreamEvent::Usage {
                    prompt_tokens: self.prompt_tokens,
                    completion_tokens: self.completion_tokens,
                });
                events.push(StreamEvent::Finish(
                    self.stop_reason.unwrap_or(StopReason::EndTurn),
                ));
            }
            return events;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return events;
        };

        if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
            if let Some(n) = usage["prompt_tokens"].as_u64() {
                self.prompt_tokens = n;
            }
            if let Some(n) = usage["completion_tokens"].as_u64() {
                self.completion_tokens = n;
            }
        }

        let Some(choice) = value["choices"].get(0) else {
            return events;
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["reasoning_content"].as_str() {
            if !text.is_empty() {
                events.push(StreamEvent::ReasoningDelta(text.to_string()));
            }
        }
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text.to_string()));
            }
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                if let Some(id) = call["id"].as_str().filter(|s| !s.is_empty()) {
                    let name = call["function"]["name"].as_str().unwrap_or("").to_string();
                    self.call_ids.insert(index, id.to_string());
                    self.open_calls.push(id.to_string());
                    events.push(StreamEvent::ToolCallStart {
                        id: id.to_string(),
                        name,
                    });
                }
                if let Some(fragment) = call["function"]["arguments"].as_str() {
                    if !fragment.is_empty() {
                        if let Some(id) = self.call_ids.get(&index) {
                            events.push(StreamEvent::ToolCallDelta {
                                id: id.clone(),
                                fragment: fragment.to_string(),
                            });
                        }
                    }
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.stop_reason = Some(match reason {
                "length" => StopReason::MaxTokens,
                "tool_calls" => StopReason::ToolUse,
                _ => StopReason::EndTurn,
            });
            for id in self.open_calls.drain(..) {
                events.push(StreamEvent::ToolCallEnd { id });
            }
        }
        events
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn model(&self) -> &Model {
        &self.model
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let body = self.build_body(&request, true);
        tracing::debug!(model = %self.model.id, messages = request.messages.len(), "OpenAI streaming request");

        let response = with_retry("openai.stream", || self.post(&body)).await?;

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
                        if tx.send(event).await.is_err() {
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
        tracing::debug!(model = %self.model.id, "OpenAI request");

        let response = with_retry("openai.send", || self.post(&body)).await?;
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
        let choice = &value["choices"][0]["message"];
        if let Some(text) = choice["content"].as_str() {
            if !text.is_empty() {
                message.append_text(text);
            }
        }
        if let Some(calls) = choice["tool_calls"].as_array() {
            for call in calls {
                let id = call["id"].as_str().unwrap_or("").to_string();
                let name = call["function"]["name"].as_str().unwrap_or("");
                let args = call["function"]["arguments"].as_str().unwrap_or("{}");
                message.begin_tool_call(&id, name);
                message.append_tool_input(&id, args);
                message.end_tool_call(&id);
            }
        }
        Ok(message)
    }
}
