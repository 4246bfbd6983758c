//! Upstream forwarder
//!
//! Proxies chat-completion payloads to an OpenAI-compatible endpoint.
//! Non-streaming requests return the upstream JSON; streaming requests
//! expose the raw SSE byte stream for byte-for-byte passthrough. Upstream
//! failures surface with their original status and body. Dropping the
//! stream (client disconnect) cancels the upstream request.

use std::time::Duration;

use crate::error::{RecallError, Result};

/// Upstream requests time out after this long.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Build the shared upstream HTTP client.
pub fn upstream_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .unwrap_or_default()
}

fn completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

async fn send(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    payload: &serde_json::Value,
) -> Result<reqwest::Response> {
    let mut request = client.post(completions_url(base_url)).json(payload);
    if let Some(key) = api_key {
        request = request.header("Authorization", format!("Bearer {key}"));
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RecallError::Upstream {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Forward a non-streaming request and return the upstream JSON body.
pub async fn forward_json(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    payload: &serde_json::Value,
) -> Result<serde_json::Value> {
    let response = send(client, base_url, api_key, payload).await?;
    Ok(response.json().await?)
}

/// Open a streaming request. The returned response's byte stream carries
/// the upstream SSE frames verbatim; a non-2xx status is surfaced as an
/// `Upstream` error before any bytes flow.
pub async fn forward_stream(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    payload: &serde_json::Value,
) -> Result<reqwest::Response> {
    send(client, base_url, api_key, payload).await
}

/// Render the single SSE error frame emitted when a stream cannot start
/// or dies mid-flight.
pub fn sse_error_frame(message: &str) -> String {
    let body = serde_json::json!({ "error": message });
    format!("data: {body}\n\n")
}

/// Pull the assistant content out of a chat-completion response body.
pub fn extract_assistant_content(response: &serde_json::Value) -> Option<String> {
    response["choices"][0]["message"]["content"]
        .as_str()
        .map(String::from)
}

/// Accumulates assistant text from streamed SSE chunks so the memory
/// write path can run after the stream closes.
#[derive(Debug, Default)]
pub struct SseContentAccumulator {
    buffer: String,
    content: String,
}

impl SseContentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes as they are forwarded; parses complete `data:` lines
    /// and collects `choices[0].delta.content` fragments.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            if let Ok(chunk) = serde_json::from_str::<serde_json::Value>(data) {
                if let Some(delta) = chunk["choices"][0]["delta"]["content"].as_str() {
                    self.content.push_str(delta);
                }
            }
        }
    }

    /// The assistant content collected so far.
    pub fn content(&self) -> Option<&str> {
        if self.content.is_empty() {
            None
        } else {
            Some(&self.content)
        }
    }
}
