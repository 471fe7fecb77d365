//! Canonical message model
//!
//! Messages and their content parts are the shared currency between the
//! agent loop, the provider adapters, and the store. The store persists
//! the parts list as one opaque JSON blob; everything else works on the
//! typed model defined here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Why an assistant message stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Canceled,
    Error,
    PermissionDenied,
}

/// A typed fragment of a message's content.
///
/// Assistant text and reasoning grow by append while the provider streams;
/// tool-call input is the verbatim concatenation of the JSON fragments the
/// provider emitted, parsed only once `finished` flips true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        input: String,
        #[serde(default)]
        finished: bool,
        #[serde(default)]
        is_error: bool,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        #[serde(default)]
        is_error: bool,
    },
    Binary {
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Finish {
        reason: FinishReason,
    },
}

/// A message in a session. `finished_at` is set exactly once, when the
/// streaming producer declares the message complete; parts are append-only
/// before that and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// An owned view of one tool-call part, in declaration order.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: String,
    pub finished: bool,
    pub is_error: bool,
}

impl Message {
    fn new(session_id: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            parts: Vec::new(),
            model: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut msg = Self::new(session_id, Role::User);
        msg.parts.push(ContentPart::Text { text: text.into() });
        msg.finished_at = Some(msg.created_at);
        msg
    }

    pub fn assistant(session_id: impl Into<String>, model: impl Into<String>) -> Self {
        let mut msg = Self::new(session_id, Role::Assistant);
        msg.model = Some(model.into());
        msg
    }

    pub fn tool(session_id: impl Into<String>) -> Self {
        Self::new(session_id, Role::Tool)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Append streamed text, growing the trailing text part if there is one.
    pub fn append_text(&mut self, delta: &str) {
        self.updated_at = Utc::now();
        if let Some(ContentPart::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
            return;
        }
        self.parts.push(ContentPart::Text {
            text: delta.to_string(),
        });
    }

    /// Append streamed reasoning, growing the trailing reasoning part.
    pub fn append_reasoning(&mut self, delta: &str) {
        self.updated_at = Utc::now();
        if let Some(ContentPart::Reasoning { text }) = self.parts.last_mut() {
            text.push_str(delta);
            return;
        }
        self.parts.push(ContentPart::Reasoning {
            text: delta.to_string(),
        });
    }

    pub fn begin_tool_call(&mut self, id: impl Into<String>, name: impl Into<String>) {
        self.updated_at = Utc::now();
        self.parts.push(ContentPart::ToolCall {
            id: id.into(),
            name: name.into(),
            input: String::new(),
            finished: false,
            is_error: false,
        });
    }

    /// Accumulate a verbatim JSON fragment onto an open tool call.
    pub fn append_tool_input(&mut self, call_id: &str, fragment: &str) {
        self.updated_at = Utc::now();
        for part in self.parts.iter_mut().rev() {
            if let ContentPart::ToolCall { id, input, finished, .. } = part {
                if id == call_id && !*finished {
                    input.push_str(fragment);
                    return;
                }
            }
        }
    }

    /// Close a tool call. Returns false when no open call matched.
    pub fn end_tool_call(&mut self, call_id: &str) -> bool {
        self.updated_at = Utc::now();
        for part in self.parts.iter_mut().rev() {
            if let ContentPart::ToolCall { id, finished, .. } = part {
                if id == call_id && !*finished {
                    *finished = true;
                    return true;
                }
            }
        }
        false
    }

    /// Flag every tool call that never received its end-of-call signal.
    /// Such calls are never dispatched.
    pub fn poison_unfinished_tool_calls(&mut self) {
        for part in self.parts.iter_mut() {
            if let ContentPart::ToolCall { finished, is_error, .. } = part {
                if !*finished {
                    *is_error = true;
                }
            }
        }
    }

    /// Declare the message complete. Appends the terminal finish-reason
    /// part and stamps `finished_at`; both happen at most once.
    pub fn finish(&mut self, reason: FinishReason) {
        if self.finished_at.is_some() {
            return;
        }
        let now = Utc::now();
        self.parts.push(ContentPart::Finish { reason });
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().rev().find_map(|p| match p {
            ContentPart::Finish { reason } => Some(*reason),
            _ => None,
        })
    }

    /// Tool-call parts in declaration order.
    pub fn tool_calls(&self) -> Vec<ToolInvocation> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall {
                    id,
                    name,
                    input,
                    finished,
                    is_error,
                } => Some(ToolInvocation {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    finished: *finished,
                    is_error: *is_error,
                }),
                _ => None,
            })
            .collect()
    }

    /// Concatenated plain text of the message.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn push_part(&mut self, part: ContentPart) {
        self.updated_at = Utc::now();
        self.parts.push(part);
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
