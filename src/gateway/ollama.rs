//! Ollama adapter for local text generation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use super::error::ProviderError;
use super::types::ProviderKind;
use super::{http_client, read_body, CompletionProvider};

const PROVIDER: &str = "ollama";

/// Output budget requested from the local model.
const MAX_TOKENS: u32 = 512;

/// Self-hosted Ollama endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: Option<String>,
    model: String,
}

impl OllamaClient {
    /// Create a client. `base_url = None` yields a client that always
    /// reports `Unavailable`.
    pub fn with_config(
        base_url: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client: http_client(timeout, headers)?,
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            model: model.into(),
        })
    }

    fn generate_url(&self, base_url: &str) -> String {
        format!("{base_url}/v1/generate")
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    stream: bool,
}

/// Pull completion text out of the shapes Ollama-compatible servers return.
///
/// Accepts `output` (string or list of `{content}` parts), `response`,
/// `choices[].text` / `choices[].message.content`, and finally falls back to
/// the whole JSON document so the parser can still search it.
pub(crate) fn extract_text(value: &Value) -> String {
    match value.get("output") {
        Some(Value::String(s)) if !s.is_empty() => return s.clone(),
        Some(Value::Array(parts)) => {
            let joined: String = parts
                .iter()
                .filter_map(|p| p.get("content").and_then(Value::as_str))
                .collect();
            if !joined.is_empty() {
                return joined;
            }
        }
        _ => {}
    }

    if let Some(s) = value.get("response").and_then(Value::as_str) {
        if !s.is_empty() {
            return s.to_string();
        }
    }

    if let Some(choices) = value.get("choices").and_then(Value::as_array) {
        let joined: String = choices
            .iter()
            .filter_map(|c| {
                c.get("text")
                    .and_then(Value::as_str)
                    .or_else(|| c.pointer("/message/content").and_then(Value::as_str))
            })
            .collect();
        if !joined.is_empty() {
            return joined;
        }
    }

    value.to_string()
}

#[async_trait]
impl CompletionProvider for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, model: &str) -> Result<String, ProviderError> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or_else(|| ProviderError::unavailable(PROVIDER, "OLLAMA_URL not configured"))?;

        let body = GenerateRequest {
            model,
            prompt,
            max_tokens: MAX_TOKENS,
            stream: false,
        };

        let response = self
            .client
            .post(self.generate_url(base_url))
            .json(&body)
            .send()
            .await?;

        let raw = read_body(PROVIDER, response).await?;
        if !raw.is_success() {
            return Err(raw.into_status_error(PROVIDER));
        }

        match serde_json::from_str::<Value>(&raw.body) {
            Ok(value) => Ok(extract_text(&value)),
            // Some local servers answer with plain text; hand it to the parser as-is.
            Err(_) => Ok(raw.body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_text_prefers_output_string() {
        let v = json!({ "output": "[1]", "response": "ignored" });
        assert_eq!(extract_text(&v), "[1]");
    }

    #[test]
    fn extract_text_joins_output_parts() {
        let v = json!({ "output": [{ "content": "[{\"skill\":" }, { "content": "\"Go\"}]" }] });
        assert_eq!(extract_text(&v), "[{\"skill\":\"Go\"}]");
    }

    #[test]
    fn extract_text_reads_choices() {
        let v = json!({ "choices": [{ "message": { "content": "hello" } }] });
        assert_eq!(extract_text(&v), "hello");
    }

    #[test]
    fn extract_text_falls_back_to_document() {
        let v = json!({ "unexpected": true });
        assert_eq!(extract_text(&v), v.to_string());
    }

    #[tokio::test]
    async fn unconfigured_client_is_unavailable() {
        let client = OllamaClient::with_config(None, "llama3", Duration::from_secs(1)).unwrap();
        let err = client.complete("hi", "llama3").await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
