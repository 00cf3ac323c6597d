//! Provider gateway: interchangeable text-completion clients plus metering.
//!
//! Each client maps `(prompt, model) -> raw text`. The [`ProviderGateway`]
//! wraps a call with a timeout, estimates tokens, prices the attempt and
//! reports it to a [`UsageSink`] whether it succeeded or not.

pub mod anthropic;
pub mod error;
pub mod huggingface;
pub mod ollama;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::config::ProviderSettings;

pub use anthropic::AnthropicClient;
pub use error::{ErrorContext, ProviderError};
pub use huggingface::HuggingFaceClient;
pub use ollama::OllamaClient;
pub use pricing::*;
pub use types::*;
pub use usage::{CallStatus, CostLogEntry, NoopUsageSink, UsageSink};

/// Maximum allowed response body length (1MB).
pub(crate) const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

// =============================================================================
// TRAIT
// =============================================================================

/// Uniform contract for a text-completion provider.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Which provider this client talks to.
    fn kind(&self) -> ProviderKind;

    /// Model used when no experiment variant overrides it.
    fn default_model(&self) -> &str;

    /// Send `prompt` to `model` and return the raw completion text.
    ///
    /// Fails with [`ProviderError::Unavailable`] when the client has no
    /// endpoint or key configured, and [`ProviderError::Status`] on non-2xx.
    async fn complete(&self, prompt: &str, model: &str) -> Result<String, ProviderError>;
}

/// Build the fallback chain in priority order from settings.
///
/// Every provider is present even when unconfigured; an unconfigured client
/// reports `Unavailable` so the attempt still shows up in the cost log.
pub fn build_chain(
    settings: &ProviderSettings,
) -> Result<Vec<Arc<dyn CompletionProvider>>, ProviderError> {
    let mut chain: Vec<Arc<dyn CompletionProvider>> = Vec::with_capacity(3);
    for kind in ProviderKind::PRIORITY {
        let client: Arc<dyn CompletionProvider> = match kind {
            ProviderKind::Ollama => Arc::new(OllamaClient::with_config(
                settings.ollama_url.clone(),
                settings.ollama_model.clone(),
                settings.timeout,
            )?),
            ProviderKind::Anthropic => Arc::new(AnthropicClient::with_config(
                settings.anthropic_api_key.clone(),
                settings.anthropic_base_url.clone(),
                settings.anthropic_model.clone(),
                settings.timeout,
            )?),
            ProviderKind::HuggingFace => Arc::new(HuggingFaceClient::with_config(
                settings.hf_token.clone(),
                settings.hf_base_url.clone(),
                settings.hf_model.clone(),
                settings.timeout,
            )?),
        };
        chain.push(client);
    }
    Ok(chain)
}

// =============================================================================
// METERED GATEWAY
// =============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on a single provider call, including body transfer.
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

/// Runs single provider calls with a timeout and meters every attempt.
pub struct ProviderGateway<U: UsageSink> {
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn new(usage_sink: Arc<U>) -> Self {
        Self::with_config(usage_sink, GatewayConfig::default())
    }

    pub fn with_config(usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self { usage_sink, config }
    }

    pub fn usage_sink(&self) -> &Arc<U> {
        &self.usage_sink
    }

    /// Call one provider once. No retries: the caller owns fallback.
    pub async fn complete(
        &self,
        provider: &dyn CompletionProvider,
        req: &CompletionRequest,
    ) -> Result<Completion, ProviderError> {
        let kind = provider.kind();
        let input_tokens = estimate_tokens(&req.prompt);
        let start = Instant::now();

        let result =
            match tokio::time::timeout(self.config.timeout, provider.complete(&req.prompt, &req.model))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(kind.as_str(), self.config.timeout)),
            };

        let latency = start.elapsed();
        let entry = CostLogEntry::new(kind, &req.model, req.operation, req.attribution.caller)
            .owner(req.attribution.owner_id.clone())
            .content(req.attribution.content_id.clone())
            .job(req.attribution.job_id.clone())
            .duration_ms(latency.as_millis() as u64);

        match result {
            Ok(text) => {
                let output_tokens = estimate_tokens(&text);
                let cost = attempt_cost(kind, &req.model, input_tokens, output_tokens);
                debug!(
                    provider = kind.as_str(),
                    model = %req.model,
                    input_tokens,
                    output_tokens,
                    latency_ms = latency.as_millis() as u64,
                    "provider call succeeded"
                );
                self.usage_sink
                    .record(entry.tokens(input_tokens, output_tokens).cost(cost))
                    .await;
                Ok(Completion {
                    provider: kind,
                    model: req.model.clone(),
                    text,
                    input_tokens,
                    output_tokens,
                    cost_nanodollars: cost,
                    latency,
                })
            }
            Err(err) => {
                let status = match &err {
                    ProviderError::Unavailable { .. } => CallStatus::Unavailable,
                    ProviderError::Timeout { .. } => CallStatus::Timeout,
                    ProviderError::Http(e) if e.is_timeout() => CallStatus::Timeout,
                    _ => CallStatus::Error,
                };
                debug!(
                    provider = kind.as_str(),
                    model = %req.model,
                    code = err.code(),
                    "provider call failed"
                );
                self.usage_sink
                    .record(
                        entry
                            .tokens(input_tokens, 0)
                            .failed(status, err.to_string()),
                    )
                    .await;
                Err(err)
            }
        }
    }
}

// =============================================================================
// HTTP HELPERS
// =============================================================================

/// Raw provider response after size-limited body read.
pub(crate) struct RawResponse {
    pub status: u16,
    pub body: String,
    pub request_id: Option<String>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into a status error carrying its context.
    pub fn into_status_error(self, provider: &'static str) -> ProviderError {
        let ctx = ErrorContext::new().with_status(self.status);
        let ctx = match &self.request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };
        ProviderError::status(provider, self.status, &self.body, Some(ctx))
    }
}

/// Stream a response body, enforcing [`MAX_RESPONSE_LEN`].
pub(crate) async fn read_body(
    provider: &'static str,
    mut response: reqwest::Response,
) -> Result<RawResponse, ProviderError> {
    let status = response.status().as_u16();
    let request_id = response
        .headers()
        .get("x-request-id")
        .or_else(|| response.headers().get("request-id"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::malformed(
                provider,
                format!("Response too large: {new_len} bytes"),
            ));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(RawResponse {
        status,
        body: String::from_utf8_lossy(&bytes).to_string(),
        request_id,
    })
}

/// Build a reqwest client with the shared timeout.
pub(crate) fn http_client(
    timeout: Duration,
    headers: reqwest::header::HeaderMap,
) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .gzip(true)
        .build()
        .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))
}
