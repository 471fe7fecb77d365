//! HTTP fetch tool

use super::{Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Responses are read up to this many bytes; the registry's output cap
/// truncates further for the model.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Fetch a URL on the model's behalf.
pub struct FetchTool;

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S). Supports method, headers, and a request body; returns the response body."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "PUT", "DELETE", "HEAD", "PATCH"],
                    "description": "HTTP method (default: GET)"
                },
                "body": {
                    "type": "string",
                    "description": "Request body"
                },
                "headers": {
                    "type": "object",
                    "description": "Request headers as a string-to-string map"
                }
            },
            "required": ["url"]
        })
    }

    fn permission_action(&self) -> Option<&str> {
        Some("fetch url")
    }

    /// Approvals are keyed by host.
    fn permission_subject(&self, args: &Value) -> Option<String> {
        args["url"]
            .as_str()
            .and_then(|u| u.parse::<reqwest::Url>().ok())
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let url_str = args["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("url is required"))?;
        let url = url_str.parse::<reqwest::Url>().context("Invalid URL")?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Ok(ToolOutput::error("only http and https URLs are supported"));
        }
        let method = args["method"].as_str().unwrap_or("GET").to_uppercase();
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| anyhow::anyhow!("unsupported method"))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("coil/0.4")
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to build HTTP client")?;

        let mut request = client.request(method, url);
        if let Some(headers) = args["headers"].as_object() {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = args["body"].as_str() {
            request = request.body(body.to_string());
        }

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(ToolOutput::error("request cancelled")),
            response = request.send() => response,
        };
        let response = match response {
            Ok(r) => r,
            Err(err) => return Ok(ToolOutput::error(format!("request failed: {err}"))),
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let body = if body.len() > MAX_BODY_BYTES {
            let mut end = MAX_BODY_BYTES;
            while end > 0 && !body.is_char_boundary(end) {
                end -= 1;
            }
            body[..end].to_string()
        } else {
            body
        };

        Ok(ToolOutput {
            content: body,
            metadata: Some(json!({ "status": status })),
            is_error: status >= 400,
        })
    }
}
