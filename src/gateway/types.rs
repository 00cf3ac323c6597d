//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// =============================================================================
// PROVIDERS
// =============================================================================

/// The closed set of completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Self-hosted Ollama endpoint (zero marginal cost).
    Ollama,
    /// Anthropic hosted API.
    Anthropic,
    /// Hugging Face inference API.
    HuggingFace,
}

impl ProviderKind {
    /// Fallback priority: local inference first, then the hosted vendors.
    pub const PRIORITY: [ProviderKind; 3] = [
        ProviderKind::Ollama,
        ProviderKind::Anthropic,
        ProviderKind::HuggingFace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::HuggingFace => "huggingface",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ollama" => Some(ProviderKind::Ollama),
            "anthropic" => Some(ProviderKind::Anthropic),
            "huggingface" => Some(ProviderKind::HuggingFace),
            _ => None,
        }
    }

    /// Whether calls to this provider cost nothing per token.
    pub fn is_self_hosted(&self) -> bool {
        matches!(self, ProviderKind::Ollama)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for cost tracking and debugging.
///
/// Every request through the gateway carries attribution so the cost log knows
/// whose budget a call counts against and which job triggered it.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Owner of the content being analyzed (budgets are per owner).
    pub owner_id: Option<String>,
    /// Content being analyzed.
    pub content_id: Option<String>,
    /// Analysis job driving the call, if any.
    pub job_id: Option<String>,
    /// Which code path made this call, e.g. "orchestrator::extract".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_content(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

// =============================================================================
// COMPLETION TYPES
// =============================================================================

/// A single text-completion request routed to one provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Prompt text sent verbatim.
    pub prompt: String,
    /// Provider-specific model id.
    pub model: String,
    /// Logical operation for the cost log, e.g. "skill-extraction".
    pub operation: &'static str,
    /// Attribution for cost tracking.
    pub attribution: Attribution,
}

impl CompletionRequest {
    pub fn new(
        prompt: impl Into<String>,
        model: impl Into<String>,
        operation: &'static str,
        attribution: Attribution,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            operation,
            attribution,
        }
    }
}

/// Metered result of a successful provider call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Provider that produced the text.
    pub provider: ProviderKind,
    /// Model that produced the text.
    pub model: String,
    /// Raw completion text, unparsed.
    pub text: String,
    /// Estimated input tokens (chars / 4).
    pub input_tokens: u32,
    /// Estimated output tokens (chars / 4).
    pub output_tokens: u32,
    /// Estimated cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    /// Wall-clock time of the call.
    pub latency: Duration,
}
