//! LLM provider abstraction
//!
//! One adapter per vendor behind a single trait. Adapters transcode the
//! canonical message model into their vendor's wire schema, decode the
//! vendor's streaming protocol into the canonical event set, and classify
//! errors into the retry taxonomy. The core is vendor-agnostic: adding a
//! vendor means an adapter plus catalogue entries in `models`.

pub mod anthropic;
pub mod models;
pub mod openai;

use crate::config::Config;
use crate::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Tool descriptor sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

/// A fully shaped request: system prompt, canonical history, tool
/// catalogue, and model parameters.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
}

/// Why the provider stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
}

/// Canonical streaming events, shared by every adapter.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart { id: String, name: String },
    /// A verbatim fragment of the call's argument JSON. Fragments are
    /// accumulated byte-for-byte and parsed only at ToolCallEnd.
    ToolCallDelta { id: String, fragment: String },
    ToolCallEnd { id: String },
    Usage { prompt_tokens: u64, completion_tokens: u64 },
    Finish(StopReason),
    Error(ProviderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure or vendor-indicated transient error; retried.
    Transport,
    /// Credentials invalid; never retried.
    Auth,
    /// Model or endpoint unknown; never retried.
    NotFound,
    /// Request exceeded the model's context window; never retried.
    ContextOverflow,
    /// Vendor rejected the request shape; never retried.
    BadRequest,
    /// Anything else the vendor reported.
    Api,
}

impl ErrorKind {
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Transport)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Classify an HTTP status (plus response body) into the error taxonomy.
pub(crate) fn classify_status(status: u16, body: &str) -> ProviderError {
    let kind = match status {
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::NotFound,
        408 | 429 => ErrorKind::Transport,
        s if s >= 500 => ErrorKind::Transport,
        400 | 413 | 422 => {
            let lower = body.to_ascii_lowercase();
            if lower.contains("context")
                && (lower.contains("length") || lower.contains("window") || lower.contains("too long"))
                || lower.contains("context_length_exceeded")
                || lower.contains("prompt is too long")
            {
                ErrorKind::ContextOverflow
            } else {
                ErrorKind::BadRequest
            }
        }
        _ => ErrorKind::Api,
    };
    ProviderError::new(kind, format!("HTTP {status}: {}", preview(body, 300)))
}

pub(crate) fn preview(text: &str, max: usize) -> &str {
    let mut end = text.len().min(max);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// A model in the catalogue, with the metadata request shaping needs.
#[derive(Debug, Clone)]
pub struct Model {
    pub id: String,
    pub display_name: String,
    pub vendor: Vendor,
    pub context_window: u32,
    pub default_max_tokens: u32,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub supports_reasoning: bool,
    /// Whether prior-turn reasoning parts are echoed back in requests.
    pub replay_reasoning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Anthropic,
    OpenAi,
}

impl Model {
    /// Monetary cost of the given usage, in dollars.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1_000_000.0 * self.input_cost_per_million
            + completion_tokens as f64 / 1_000_000.0 * self.output_cost_per_million
    }
}

/// One LLM vendor binding, fixed to a single model.
#[async_trait]
pub trait Provider: Send + Sync {
    fn model(&self) -> &Model;

    /// Start a streaming completion. Events arrive on the returned
    /// channel; the transport closes when the token is cancelled.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError>;

    /// Non-streaming completion, used by short side-tasks such as title
    /// generation.
    async fn send(&self, request: ProviderRequest) -> Result<Message, ProviderError>;
}

/// Resolves a model identifier to a ready adapter.
pub trait ProviderSource: Send + Sync {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn Provider>, ProviderError>;
}

/// The default source: the static catalogue plus configured credentials.
pub struct ProviderRegistry {
    config: Arc<Config>,
    cache: Mutex<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl ProviderSource for ProviderRegistry {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(provider) = self.cache.lock().get(model_id) {
            return Ok(provider.clone());
        }
        let model = models::lookup(model_id).ok_or_else(|| {
            ProviderError::new(ErrorKind::NotFound, format!("Unknown model: {model_id}"))
        })?;
        let provider: Arc<dyn Provider> = match model.vendor {
            Vendor::Anthropic => {
                let cfg = self.config.provider("anthropic");
                let api_key = cfg.and_then(|c| c.api_key.clone()).ok_or_else(|| {
                    ProviderError::new(ErrorKind::Auth, "No Anthropic API key configured")
                })?;
                let base_url = cfg.and_then(|c| c.base_url.clone());
                Arc::new(anthropic::AnthropicProvider::new(api_key, base_url, model))
            }
            Vendor::OpenAi => {
                let cfg = self.config.provider("openai");
                let api_key = cfg.and_then(|c| c.api_key.clone()).ok_or_else(|| {
                    ProviderError::new(ErrorKind::Auth, "No OpenAI API key configured")
                })?;
                let base_url = cfg.and_then(|c| c.base_url.clone());
                Arc::new(openai::OpenAiProvider::new(api_key, base_url, model))
            }
        };
        self.cache
            .lock()
            .insert(model_id.to_string(), provider.clone());
        Ok(provider)
    }
}

const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(2);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);
const RETRY_MAX_ATTEMPTS: u32 = 8;

/// Run an operation with exponential backoff and full jitter on
/// transport-class errors. Auth, context-overflow, and malformed-request
/// errors surface immediately.
pub(crate) async fn with_retry<T, Fut>(
    what: &str,
    mut attempt_fn: impl FnMut() -> Fut,
) -> Result<T, ProviderError>
where
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut delay = RETRY_INITIAL_DELAY;
    let mut attempt = 1;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind.retryable() && attempt < RETRY_MAX_ATTEMPTS => {
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
                tracing::warn!(
                    what,
                    attempt,
                    delay_ms = jitter_ms,
                    error = %err,
                    "Transient provider error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn status_classification_matches_taxonomy() {
        assert_eq!(classify_status(401, "").kind, ErrorKind::Auth);
        assert_eq!(classify_status(403, "").kind, ErrorKind::Auth);
        assert_eq!(classify_status(404, "").kind, ErrorKind::NotFound);
        assert_eq!(classify_status(429, "").kind, ErrorKind::Transport);
        assert_eq!(classify_status(503, "").kind, ErrorKind::Transport);
        assert_eq!(
            classify_status(400, "context_length_exceeded").kind,
            ErrorKind::ContextOverflow
        );
        assert_eq!(
            classify_status(400, "prompt is too long: 250000 tokens").kind,
            ErrorKind::ContextOverflow
        );
        assert_eq!(classify_status(400, "bad tool schema").kind, ErrorKind::BadRequest);
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(ErrorKind::Transport.retryable());
        assert!(!ErrorKind::Auth.retryable());
        assert!(!ErrorKind::ContextOverflow.retryable());
        assert!(!ErrorKind::BadRequest.retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::transport("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_auth_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::new(ErrorKind::Auth, "bad key")) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Auth);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn model_cost_uses_per_million_pricing() {
        let model = models::lookup("claude-sonnet-4-20250514").unwrap();
        let cost = model.cost(1_000_000, 1_000_000);
        assert!((cost - (model.input_cost_per_million + model.output_cost_per_million)).abs() < 1e-9);
    }
}
