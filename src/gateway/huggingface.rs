//! Hugging Face inference API adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use super::error::ProviderError;
use super::types::ProviderKind;
use super::{http_client, read_body, CompletionProvider};

const PROVIDER: &str = "huggingface";

pub const DEFAULT_BASE_URL: &str = "https://api-inference.huggingface.co";

/// Hugging Face hosted inference client.
#[derive(Debug, Clone)]
pub struct HuggingFaceClient {
    client: Option<reqwest::Client>,
    base_url: String,
    model: String,
}

impl HuggingFaceClient {
    /// Create a client. `token = None` yields a client that always
    /// reports `Unavailable`.
    pub fn with_config(
        token: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = match token.filter(|t| !t.trim().is_empty()) {
            Some(token) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| ProviderError::config("Invalid HF_TOKEN format"))?;
                headers.insert(AUTHORIZATION, auth_value);
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

    fn model_url(&self, model: &str) -> String {
        format!("{}/models/{}", self.base_url, model)
    }
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    parameters: InferenceParameters,
}

#[derive(Serialize)]
struct InferenceParameters {
    max_new_tokens: u32,
    temperature: f32,
}

/// HF returns either `[{"generated_text": ...}]` or `{"generated_text": ...}`.
fn generated_text(value: &Value) -> Option<&str> {
    match value {
        Value::Array(items) => items
            .first()
            .and_then(|v| v.get("generated_text"))
            .and_then(Value::as_str),
        other => other.get("generated_text").and_then(Value::as_str),
    }
}

#[async_trait]
impl CompletionProvider for HuggingFaceClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HuggingFace
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, model: &str) -> Result<String, ProviderError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ProviderError::unavailable(PROVIDER, "HF_TOKEN not configured"))?;

        let body = InferenceRequest {
            inputs: prompt,
            parameters: InferenceParameters {
                max_new_tokens: 512,
                temperature: 0.7,
            },
        };

        let response = client.post(self.model_url(model)).json(&body).send().await?;
        let raw = read_body(PROVIDER, response).await?;
        if !raw.is_success() {
            return Err(raw.into_status_error(PROVIDER));
        }

        let parsed: Value = serde_json::from_str(&raw.body)
            .map_err(|e| ProviderError::malformed(PROVIDER, format!("Invalid JSON: {e}")))?;

        Ok(generated_text(&parsed).unwrap_or_default().to_string())
    }
}
