//! Model pricing registry.
//!
//! Centralized pricing data for all supported provider/model pairs.
//! Costs are in nanodollars (1e-9 USD) per token, plus an optional flat
//! per-request charge for providers that bill by call.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::types::ProviderKind;

/// Nanodollars per US dollar.
pub const NANOS_PER_USD: f64 = 1_000_000_000.0;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
    /// Flat cost per request in nanodollars.
    pub per_request_nanos: i64,
}

impl ModelPricing {
    const fn per_token(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
            per_request_nanos: 0,
        }
    }

    const fn per_request(nanos: i64) -> Self {
        Self {
            input_nanos_per_token: 0,
            output_nanos_per_token: 0,
            per_request_nanos: nanos,
        }
    }

    /// Self-hosted models price at zero.
    pub const FREE: ModelPricing = ModelPricing::per_token(0, 0);

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
            + self.per_request_nanos
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// Anthropic (per 1K tokens)
// claude-3-opus:   $0.015 input,  $0.075 output
// claude-3-sonnet: $0.003 input,  $0.015 output
// claude-3-haiku:  $0.00025 input, $0.00125 output

const CLAUDE_3_OPUS: ModelPricing = ModelPricing::per_token(15_000, 75_000);
const CLAUDE_3_SONNET: ModelPricing = ModelPricing::per_token(3_000, 15_000);
const CLAUDE_3_HAIKU: ModelPricing = ModelPricing::per_token(250, 1_250);

// Hugging Face inference bills per request.
// distilbert: $0.00001, bart-large-cnn: $0.00005
const HF_SMALL: ModelPricing = ModelPricing::per_request(10_000);
const HF_LARGE: ModelPricing = ModelPricing::per_request(50_000);

static PRICING_MAP: OnceLock<HashMap<(ProviderKind, &'static str), ModelPricing>> =
    OnceLock::new();

fn init_pricing() -> HashMap<(ProviderKind, &'static str), ModelPricing> {
    use ProviderKind::*;

    let mut map = HashMap::new();

    map.insert((Anthropic, "claude-3-opus"), CLAUDE_3_OPUS);
    map.insert((Anthropic, "claude-3-opus-20240229"), CLAUDE_3_OPUS);
    map.insert((Anthropic, "claude-3-sonnet"), CLAUDE_3_SONNET);
    map.insert((Anthropic, "claude-3-sonnet-20240229"), CLAUDE_3_SONNET);
    map.insert((Anthropic, "claude-3-haiku"), CLAUDE_3_HAIKU);
    map.insert((Anthropic, "claude-3-haiku-20240307"), CLAUDE_3_HAIKU);

    map.insert((HuggingFace, "distilbert"), HF_SMALL);
    map.insert((HuggingFace, "microsoft/DialoGPT-medium"), HF_SMALL);
    map.insert((HuggingFace, "bart-large-cnn"), HF_LARGE);
    map.insert((HuggingFace, "facebook/bart-large-cnn"), HF_LARGE);

    map
}

/// Get pricing for a provider/model pair.
///
/// Self-hosted providers always price at zero, whatever the model.
pub fn get_pricing(provider: ProviderKind, model_id: &str) -> Option<ModelPricing> {
    if provider.is_self_hosted() {
        return Some(ModelPricing::FREE);
    }
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(&(provider, model_id)).copied()
}

/// Pricing used when a hosted model is missing from the table.
fn provider_default(provider: ProviderKind) -> ModelPricing {
    match provider {
        ProviderKind::Ollama => ModelPricing::FREE,
        // Mid-range default so unknown models are not billed as free.
        ProviderKind::Anthropic => CLAUDE_3_SONNET,
        ProviderKind::HuggingFace => HF_SMALL,
    }
}

/// Estimate cost of one call in nanodollars.
pub fn attempt_cost(
    provider: ProviderKind,
    model_id: &str,
    input_tokens: u32,
    output_tokens: u32,
) -> i64 {
    get_pricing(provider, model_id)
        .unwrap_or_else(|| provider_default(provider))
        .calculate_cost(input_tokens, output_tokens)
}

/// Estimate token count from text: one token per four characters, rounded up.
///
/// Exact tokenization is not needed for budgeting, only consistent estimation.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(4).min(u32::MAX as usize) as u32
}

pub fn nanos_to_usd(nanos: i64) -> f64 {
    nanos as f64 / NANOS_PER_USD
}

pub fn usd_to_nanos(usd: f64) -> i64 {
    (usd * NANOS_PER_USD).round() as i64
}
