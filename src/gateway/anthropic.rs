//! Anthropic adapter (Messages API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::types::ProviderKind;
use super::{http_client, read_body, CompletionProvider};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1_000;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API client.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Option<reqwest::Client>,
    base_url: String,
    model: String,
}

impl AnthropicClient {
    /// Create a client. `api_key = None` yields a client that always
    /// reports `Unavailable`.
    pub fn with_config(
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = match api_key.filter(|k| !k.trim().is_empty()) {
            Some(key) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
                let key_value = HeaderValue::from_str(&key)
                    .map_err(|_| ProviderError::config("Invalid ANTHROPIC_API_KEY format"))?;
                headers.insert("x-api-key", key_value);
                Some(http_client(timeout, headers)?)
            }
            None => None,
        };

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [ApiMessage<'a>; 1],
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    /// Legacy text-completions field.
    #[serde(default)]
    completion: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: Option<String>,
    text: Option<String>,
}

#[async_trait]
impl CompletionProvider for AnthropicClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, model: &str) -> Result<String, ProviderError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ProviderError::unavailable(PROVIDER, "ANTHROPIC_API_KEY not configured"))?;

        let body = MessagesRequest {
            model,
            max_tokens: MAX_TOKENS,
            messages: [ApiMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = client.post(self.messages_url()).json(&body).send().await?;
        let raw = read_body(PROVIDER, response).await?;
        if !raw.is_success() {
            return Err(raw.into_status_error(PROVIDER));
        }

        let parsed: MessagesResponse = serde_json::from_str(&raw.body)
            .map_err(|e| ProviderError::malformed(PROVIDER, format!("Invalid JSON: {e}")))?;

        let text: String = parsed
            .content
            .into_iter()
            .filter(|b| b.block_type.as_deref().map_or(true, |t| t == "text"))
            .filter_map(|b| b.text)
            .collect();

        if !text.is_empty() {
            return Ok(text);
        }
        Ok(parsed.completion.unwrap_or_default())
    }
}
