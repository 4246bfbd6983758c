//! One-shot LLM client
//!
//! Small OpenAI-compatible chat client used by the reconciler and the
//! summarizer for internal completions (fact extraction, decisions,
//! summary updates). The gateway's passthrough path lives in `proxy`.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{RecallError, Result};
use crate::types::Message;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// OpenAI-compatible completion client
#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a non-streaming completion and return the assistant content.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": false,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&payload);
        if let Some(key) = &self.api_key {
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

        let data: serde_json::Value = response.json().await?;
        Ok(data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    /// Run a completion and parse the output as JSON of type `T`.
    /// Code fences and surrounding prose are tolerated.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        model: &str,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<T> {
        let content = self
            .complete(model, messages, temperature, max_tokens)
            .await?;
        parse_json_output(&content)
    }
}

/// Extract and deserialize the JSON payload from model output.
pub fn parse_json_output<T: DeserializeOwned>(content: &str) -> Result<T> {
    let candidate = extract_json_str(content)
        .ok_or_else(|| RecallError::Decision(format!("no JSON found in output: {content:?}")))?;
    serde_json::from_str(candidate)
        .map_err(|e| RecallError::Decision(format!("unparseable JSON output: {e}")))
}

/// Locate the JSON body in the output: strip code fences, then take the
/// outermost bracket or brace span.
fn extract_json_str(content: &str) -> Option<&str> {
    let trimmed = content.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest)
    } else {
        trimmed
    };
    let inner = inner.trim();

    let open = inner.find(['[', '{'])?;
    let close_char = if inner.as_bytes()[open] == b'[' { ']' } else { '}' };
    let close = inner.rfind(close_char)?;
    if close <= open {
        return None;
    }
    Some(&inner[open..=close])
}
